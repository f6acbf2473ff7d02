//! Server side of a client connection.
//!
//! [`ServerConn`] wraps an authenticated [`Connection`] and adds what the
//! server needs on top of plain message I/O:
//!
//! - deciding per message whether to send it in full or as a digest, and
//!   whether to compress it
//! - reacting to the client's commands: settings, visibility, retrieval of
//!   cached messages, forwarding and subscription requests
//!
//! Forward and subscription requests are pushed into bounded queues supplied
//! by the embedding server. A full queue stalls the connection's command
//! processing until the consumer catches up.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use msgcache::MessageCache;
use protocol::{
    Command, CommandProcessor, Connection, Digest, Header, Message, ProtocolError, Result,
};
use tokio::sync::mpsc;

use crate::requests::{ForwardRequest, SubscribeRequest};
use crate::settings::ConnSettings;

/// A client connection as seen by the server.
pub struct ServerConn {
    conn: Connection,
    settings: ConnSettings,
    cache: RwLock<Option<Arc<dyn MessageCache>>>,
    forward_tx: RwLock<Option<mpsc::Sender<ForwardRequest>>>,
    subscribe_tx: RwLock<Option<mpsc::Sender<SubscribeRequest>>>,
}

fn read_slot<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_slot<T>(slot: &RwLock<Option<T>>, value: T) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
}

impl ServerConn {
    /// Wraps an authenticated connection with default settings.
    pub fn new(conn: Connection) -> Self {
        Self::with_settings(conn, ConnSettings::default())
    }

    pub fn with_settings(conn: Connection, settings: ConnSettings) -> Self {
        Self {
            conn,
            settings,
            cache: RwLock::new(None),
            forward_tx: RwLock::new(None),
            subscribe_tx: RwLock::new(None),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn service(&self) -> &str {
        self.conn.service()
    }

    pub fn username(&self) -> &str {
        self.conn.username()
    }

    pub fn settings(&self) -> &ConnSettings {
        &self.settings
    }

    /// Whether the client currently declares itself present.
    pub fn visible(&self) -> bool {
        self.settings.visible()
    }

    /// Sets the cache used to answer retrieval commands.
    pub fn set_message_cache(&self, cache: Arc<dyn MessageCache>) {
        write_slot(&self.cache, cache);
    }

    /// Sets the queue receiving this connection's forward requests.
    ///
    /// Without one, forward requests are dropped.
    pub fn set_forward_request_channel(&self, tx: mpsc::Sender<ForwardRequest>) {
        write_slot(&self.forward_tx, tx);
    }

    /// Sets the queue receiving this connection's subscription requests.
    ///
    /// Without one, subscription requests are dropped.
    pub fn set_subscribe_request_channel(&self, tx: mpsc::Sender<SubscribeRequest>) {
        write_slot(&self.subscribe_tx, tx);
    }

    /// Delivers a message to the client.
    ///
    /// `id` is the id the message is cached under. If the message is larger
    /// than the digest threshold only a digest is sent and the client is
    /// expected to retrieve the message by id. `extra` contributes header
    /// fields to the digest without being part of the message. `ttl` is how
    /// long the cached copy lives.
    pub async fn send_message(
        &self,
        msg: &Message,
        extra: Option<&Header>,
        ttl: Duration,
        id: &str,
    ) -> Result<()> {
        let size = msg.size();
        if self.settings.should_digest(size) {
            tracing::trace!(
                service = self.service(),
                username = self.username(),
                id,
                size,
                ttl_secs = ttl.as_secs(),
                "sending digest"
            );
            return self.write_digest(msg, extra, size, id).await;
        }
        let mut msg = msg.clone();
        msg.id = id.to_string();
        self.write_auto_compress(&msg, size).await
    }

    /// Reads the next message from the client, processing commands on the way.
    pub async fn read_message(&self) -> Result<Message> {
        self.conn.read_message_with(self).await
    }

    /// Writes a message as is, with explicit compression.
    pub async fn write_message(&self, msg: &Message, compress: bool) -> Result<()> {
        self.conn.write_message(msg, compress).await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }

    async fn write_auto_compress(&self, msg: &Message, size: usize) -> Result<()> {
        let compress = self.settings.should_compress(size);
        self.conn.write_message(msg, compress).await
    }

    /// True if `msg` was not sent by some other identity.
    fn originated_here(&self, msg: &Message) -> bool {
        msg.sender.is_empty()
            || (msg.sender == self.username()
                && (msg.sender_service.is_empty() || msg.sender_service == self.service()))
    }

    async fn write_digest(
        &self,
        msg: &Message,
        extra: Option<&Header>,
        size: usize,
        id: &str,
    ) -> Result<()> {
        let (sender, sender_service) = if self.originated_here(msg) {
            (String::new(), String::new())
        } else {
            (msg.sender.clone(), msg.sender_service.clone())
        };
        let digest = Command::Digest(Digest {
            msg_id: id.to_string(),
            size,
            sender,
            sender_service,
            info: self.settings.digest_info(&msg.header, extra),
        });
        let compress = self.settings.should_compress(size);
        self.conn.write_command(&digest, compress).await
    }

    async fn send_all_cached(&self, cache: &dyn MessageCache, excludes: &[String]) -> Result<()> {
        let msgs = cache
            .get_cached_messages(self.service(), self.username(), excludes)
            .await?;
        tracing::debug!(
            service = self.service(),
            username = self.username(),
            count = msgs.len(),
            excluded = excludes.len(),
            "sending cached messages"
        );
        for msg in msgs {
            let size = msg.size();
            if self.settings.should_digest(size) {
                self.write_digest(&msg, None, size, &msg.id).await?;
            } else {
                self.write_auto_compress(&msg, size).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandProcessor for ServerConn {
    async fn process_command(&self, cmd: Command) -> Result<Option<Message>> {
        match cmd {
            Command::Subscription { subscribe, params } => {
                let Some(tx) = read_slot(&self.subscribe_tx) else {
                    return Ok(None);
                };
                let Some(subscribe) = subscribe else {
                    tracing::debug!("ignoring subscription with unrecognized flag");
                    return Ok(None);
                };
                let req = SubscribeRequest {
                    subscribe,
                    service: self.service().to_string(),
                    username: self.username().to_string(),
                    params,
                };
                tx.send(req)
                    .await
                    .map_err(|_| ProtocolError::SinkClosed("subscription requests".to_string()))?;
            }
            Command::SetVisibility { visible } => {
                if let Some(visible) = visible {
                    self.settings.set_visible(visible);
                }
            }
            Command::ForwardRequest {
                ttl,
                receiver,
                receiver_service,
                mut message,
            } => {
                let Some(tx) = read_slot(&self.forward_tx) else {
                    return Ok(None);
                };
                message.sender = self.username().to_string();
                message.sender_service = self.service().to_string();
                message.id.clear();
                let req = ForwardRequest {
                    receiver,
                    receiver_service: receiver_service
                        .unwrap_or_else(|| self.service().to_string()),
                    ttl,
                    message,
                };
                tx.send(req)
                    .await
                    .map_err(|_| ProtocolError::SinkClosed("forward requests".to_string()))?;
            }
            Command::Setting {
                digest_threshold,
                compress_threshold,
                digest_fields,
            } => {
                if let Some(threshold) = digest_threshold {
                    self.settings.set_digest_threshold(threshold);
                }
                if let Some(threshold) = compress_threshold {
                    self.settings.set_compress_threshold(threshold);
                }
                if let Some(fields) = digest_fields {
                    self.settings.set_digest_fields(fields);
                }
            }
            Command::MessageRetrieve { id } => {
                let cached = match read_slot(&self.cache) {
                    Some(cache) => cache.get(self.service(), self.username(), &id).await?,
                    None => None,
                };
                let mut msg = cached.unwrap_or_default();
                msg.id = id;
                let size = msg.size();
                self.write_auto_compress(&msg, size).await?;
            }
            Command::RequestAllCached { excludes } => {
                if let Some(cache) = read_slot(&self.cache) {
                    self.send_all_cached(cache.as_ref(), &excludes).await?;
                }
            }
            Command::Digest(_) => {
                tracing::debug!(
                    service = self.service(),
                    username = self.username(),
                    "ignoring digest sent by client"
                );
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConn")
            .field("conn", &self.conn)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    use msgcache::CacheError;
    use protocol::framing::FrameHeader;
    use protocol::{accept, dial, FrameTag, ServerKey, FRAME_HEADER_SIZE};
    use serde::Serialize;
    use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    use crate::auth::StaticTokenAuthenticator;
    use crate::settings::{DEFAULT_COMPRESS_THRESHOLD, DEFAULT_DIGEST_THRESHOLD};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Server-side stream that records every byte written to it.
    struct Tap {
        inner: DuplexStream,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncRead for Tap {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Tap {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
            if let Poll::Ready(Ok(n)) = &poll {
                self.written.lock().unwrap().extend_from_slice(&buf[..*n]);
            }
            poll
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    struct Pair {
        server: ServerConn,
        client: Connection,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Pair {
        async fn new() -> Self {
            let key = ServerKey::generate().unwrap();
            let public = key.public_key();
            let auth = StaticTokenAuthenticator::new("token");
            let (client_io, server_io) = duplex(256 * 1024);
            let written = Arc::new(Mutex::new(Vec::new()));
            let tap = Tap {
                inner: server_io,
                written: Arc::clone(&written),
            };
            let (server, client) = tokio::join!(
                accept(tap, &key, &auth, TIMEOUT),
                dial(client_io, &public, "chat", "alice", "token", TIMEOUT),
            );
            // Drop the handshake bytes.
            written.lock().unwrap().clear();
            Self {
                server: ServerConn::new(server.unwrap()),
                client: client.unwrap(),
                written,
            }
        }

        /// Header of the first frame the server wrote since the last call.
        fn take_frame_header(&self) -> FrameHeader {
            let mut written = self.written.lock().unwrap();
            let bytes: [u8; FRAME_HEADER_SIZE] =
                written[..FRAME_HEADER_SIZE].try_into().unwrap();
            written.clear();
            FrameHeader::from_bytes(&bytes).unwrap()
        }

        fn nothing_written(&self) -> bool {
            self.written.lock().unwrap().is_empty()
        }

        /// Sends `cmd` followed by a marker message and lets the server read up
        /// to the marker.
        async fn run(&self, cmd: Command) -> Result<Message> {
            self.client.write_command(&cmd, false).await.unwrap();
            self.client
                .write_message(&Message::with_body(b"marker".to_vec()), false)
                .await
                .unwrap();
            self.server.read_message().await
        }
    }

    fn unavailable() -> CacheError {
        CacheError::Store("store unreachable".to_string())
    }

    struct FailingCache;

    #[async_trait]
    impl MessageCache for FailingCache {
        async fn cache_message(
            &self,
            _service: &str,
            _username: &str,
            _msg: &Message,
            _ttl: Duration,
        ) -> msgcache::Result<String> {
            Err(unavailable())
        }

        async fn get(
            &self,
            _service: &str,
            _username: &str,
            _id: &str,
        ) -> msgcache::Result<Option<Message>> {
            Err(unavailable())
        }

        async fn get_then_del(
            &self,
            _service: &str,
            _username: &str,
            _id: &str,
        ) -> msgcache::Result<Option<Message>> {
            Err(unavailable())
        }

        async fn get_all_ids(
            &self,
            _service: &str,
            _username: &str,
        ) -> msgcache::Result<Vec<String>> {
            Err(unavailable())
        }

        async fn get_cached_messages(
            &self,
            _service: &str,
            _username: &str,
            _excludes: &[String],
        ) -> msgcache::Result<Vec<Message>> {
            Err(unavailable())
        }
    }

    fn forward_request() -> Command {
        Command::ForwardRequest {
            ttl: Duration::ZERO,
            receiver: "bob".to_string(),
            receiver_service: None,
            message: Message::with_body(b"hi bob".to_vec()),
        }
    }

    #[tokio::test]
    async fn test_compression_threshold_is_strict() {
        let pair = Pair::new().await;
        let threshold = DEFAULT_COMPRESS_THRESHOLD as usize;

        let at = Message::with_body(vec![b'a'; threshold]);
        assert_eq!(at.size(), threshold);
        pair.server
            .send_message(&at, None, Duration::ZERO, "m1")
            .await
            .unwrap();
        let header = pair.take_frame_header();
        assert_eq!(header.tag, FrameTag::Message);
        assert!(!header.flags.is_compressed());

        let over = Message::with_body(vec![b'a'; threshold + 1]);
        pair.server
            .send_message(&over, None, Duration::ZERO, "m2")
            .await
            .unwrap();
        assert!(pair.take_frame_header().flags.is_compressed());

        let first = pair.client.read_message().await.unwrap();
        assert_eq!(first.id, "m1");
        assert!(first.eq_content(&at));
        let second = pair.client.read_message().await.unwrap();
        assert_eq!(second.id, "m2");
        assert!(second.eq_content(&over));
    }

    #[tokio::test]
    async fn test_cache_error_on_retrieve_closes_connection() {
        let pair = Pair::new().await;
        pair.server.set_message_cache(Arc::new(FailingCache));

        let err = pair
            .run(Command::MessageRetrieve {
                id: "m1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Cache(_)));
        assert!(pair.server.connection().is_closed());
    }

    #[tokio::test]
    async fn test_cache_error_on_request_all_closes_connection() {
        let pair = Pair::new().await;
        pair.server.set_message_cache(Arc::new(FailingCache));

        let err = pair
            .run(Command::RequestAllCached {
                excludes: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Cache(_)));
        assert!(pair.server.connection().is_closed());
    }

    #[tokio::test]
    async fn test_non_numeric_threshold_is_fatal() {
        #[derive(Serialize)]
        struct RawSetting {
            kind: u8,
            params: Vec<String>,
        }

        let pair = Pair::new().await;
        let raw = RawSetting {
            kind: protocol::CommandType::Setting as u8,
            params: vec!["lots".to_string(), String::new()],
        };
        let payload = rmp_serde::to_vec_named(&raw).unwrap();
        pair.client
            .write_frame(FrameTag::Command, &payload, false)
            .await
            .unwrap();

        let err = pair.server.read_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedCommand(_)));
        assert!(pair.server.connection().is_closed());
        assert_eq!(pair.server.settings().digest_threshold(), DEFAULT_DIGEST_THRESHOLD);
    }

    #[tokio::test]
    async fn test_unrecognized_visibility_is_ignored() {
        let pair = Pair::new().await;
        assert!(pair.server.visible());

        pair.run(Command::SetVisibility { visible: None })
            .await
            .unwrap();
        assert!(pair.server.visible());

        pair.run(Command::SetVisibility {
            visible: Some(false),
        })
        .await
        .unwrap();
        assert!(!pair.server.visible());

        pair.run(Command::SetVisibility { visible: None })
            .await
            .unwrap();
        assert!(!pair.server.visible());
    }

    #[tokio::test]
    async fn test_requests_without_sinks_are_dropped() {
        let pair = Pair::new().await;

        let marker = pair.run(forward_request()).await.unwrap();
        assert_eq!(marker.body, b"marker");

        let mut params = Header::new();
        params.insert("topic".to_string(), "news".to_string());
        pair.run(Command::Subscription {
            subscribe: Some(true),
            params,
        })
        .await
        .unwrap();

        pair.run(Command::RequestAllCached {
            excludes: Vec::new(),
        })
        .await
        .unwrap();

        assert!(!pair.server.connection().is_closed());
        assert!(pair.nothing_written());
    }

    #[tokio::test]
    async fn test_closed_forward_queue_is_sink_closed() {
        let pair = Pair::new().await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        pair.server.set_forward_request_channel(tx);

        let err = pair.run(forward_request()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::SinkClosed(_)));
        assert!(pair.server.connection().is_closed());
    }

    #[tokio::test]
    async fn test_forward_request_is_stamped() {
        let pair = Pair::new().await;
        let (tx, mut rx) = mpsc::channel(1);
        pair.server.set_forward_request_channel(tx);

        pair.run(forward_request()).await.unwrap();
        let req = rx.try_recv().unwrap();
        assert_eq!(req.receiver, "bob");
        assert_eq!(req.receiver_service, "chat");
        assert_eq!(req.message.sender, "alice");
        assert_eq!(req.message.sender_service, "chat");
        assert_eq!(req.message.body, b"hi bob");
    }
}
