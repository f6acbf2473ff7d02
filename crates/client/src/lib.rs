//! # PushConn Client
//!
//! Client side of a PushConn connection.
//!
//! [`ClientConn`] dials a server, then exchanges messages with it and drives
//! the server's per-connection state with commands:
//!
//! - [`ClientConn::config`] changes the digest and compression thresholds
//! - [`ClientConn::set_visibility`] declares presence
//! - [`ClientConn::request_message`] and [`ClientConn::request_all_cached`]
//!   fetch cached messages
//! - [`ClientConn::forward_request`] relays a message to another identity
//! - [`ClientConn::subscribe`] and [`ClientConn::unsubscribe`] manage topics
//!
//! Digests the server sends in place of large messages are delivered to the
//! channel installed with [`ClientConn::set_digest_channel`]. A typical client
//! answers each digest with [`ClientConn::request_message`].

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use protocol::{
    dial, Command, CommandProcessor, Connection, Digest, Header, Message, ProtocolError, Result,
    ServerPublicKey,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

/// A connection to a PushConn server.
pub struct ClientConn {
    conn: Connection,
    digest_tx: RwLock<Option<mpsc::Sender<Digest>>>,
}

impl ClientConn {
    /// Runs key exchange and authentication over `stream`.
    ///
    /// A rejected attempt fails with [`ProtocolError::AuthenticationFailed`].
    pub async fn dial<S>(
        stream: S,
        server: &ServerPublicKey,
        service: &str,
        username: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = dial(stream, server, service, username, token, timeout).await?;
        Ok(Self::new(conn))
    }

    /// Connects over TCP and dials.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        server: &ServerPublicKey,
        service: &str,
        username: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout("connect deadline exceeded".to_string()))??;
        stream.set_nodelay(true)?;
        Self::dial(stream, server, service, username, token, timeout).await
    }

    /// Wraps an already authenticated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            digest_tx: RwLock::new(None),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn service(&self) -> &str {
        self.conn.service()
    }

    pub fn username(&self) -> &str {
        self.conn.username()
    }

    /// Delivers digests received while reading to `tx`.
    ///
    /// Without a channel digests are dropped.
    pub fn set_digest_channel(&self, tx: mpsc::Sender<Digest>) {
        *self
            .digest_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    /// Sends a message to the server.
    pub async fn send_message(&self, msg: &Message, compress: bool) -> Result<()> {
        self.conn.write_message(msg, compress).await
    }

    /// Reads the next message, handing digests to the digest channel.
    pub async fn read_message(&self) -> Result<Message> {
        self.conn.read_message_with(self).await
    }

    /// Changes this connection's delivery settings on the server.
    ///
    /// `None` leaves a threshold unchanged. `digest_fields` replaces the list
    /// of header fields copied into digests when it is non-empty.
    pub async fn config(
        &self,
        digest_threshold: Option<i32>,
        compress_threshold: Option<i32>,
        digest_fields: Option<Vec<String>>,
    ) -> Result<()> {
        self.send_command(Command::Setting {
            digest_threshold,
            compress_threshold,
            digest_fields,
        })
        .await
    }

    pub async fn set_visibility(&self, visible: bool) -> Result<()> {
        self.send_command(Command::SetVisibility {
            visible: Some(visible),
        })
        .await
    }

    /// Asks for the cached message `id`.
    ///
    /// The answer arrives through [`ClientConn::read_message`] as a message
    /// carrying `id`; it is empty if nothing is cached under that id.
    pub async fn request_message(&self, id: &str) -> Result<()> {
        self.send_command(Command::MessageRetrieve { id: id.to_string() })
            .await
    }

    /// Asks for every cached message except those in `excludes`.
    pub async fn request_all_cached(&self, excludes: &[String]) -> Result<()> {
        self.send_command(Command::RequestAllCached {
            excludes: excludes.to_vec(),
        })
        .await
    }

    /// Asks the server to relay `msg` to `receiver`.
    ///
    /// `receiver_service` defaults to this connection's service when `None`
    /// or empty. `ttl` bounds how long the message waits for an offline
    /// receiver; zero means no limit.
    pub async fn forward_request(
        &self,
        receiver: &str,
        receiver_service: Option<&str>,
        msg: Message,
        ttl: Duration,
    ) -> Result<()> {
        self.send_command(Command::ForwardRequest {
            ttl,
            receiver: receiver.to_string(),
            receiver_service: receiver_service
                .filter(|service| !service.is_empty())
                .map(str::to_string),
            message: msg,
        })
        .await
    }

    pub async fn subscribe(&self, params: Header) -> Result<()> {
        self.subscription(true, params).await
    }

    pub async fn unsubscribe(&self, params: Header) -> Result<()> {
        self.subscription(false, params).await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }

    async fn subscription(&self, subscribe: bool, params: Header) -> Result<()> {
        if params.is_empty() {
            return Err(ProtocolError::MalformedCommand(
                "subscription parameters must not be empty".to_string(),
            ));
        }
        self.send_command(Command::Subscription {
            subscribe: Some(subscribe),
            params,
        })
        .await
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        self.conn.write_command(&cmd, false).await
    }
}

#[async_trait]
impl CommandProcessor for ClientConn {
    async fn process_command(&self, cmd: Command) -> Result<Option<Message>> {
        match cmd {
            Command::Digest(digest) => {
                let tx = self
                    .digest_tx
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match tx {
                    Some(tx) => tx
                        .send(digest)
                        .await
                        .map_err(|_| ProtocolError::SinkClosed("digests".to_string()))?,
                    None => {
                        tracing::debug!(
                            msg_id = %digest.msg_id,
                            "no digest channel, dropping digest"
                        );
                    }
                }
            }
            other => {
                tracing::debug!(command = other.kind().name(), "ignoring command sent by server");
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}
