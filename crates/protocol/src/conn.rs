//! Authenticated connections.
//!
//! A [`Connection`] is what both ends hold once key exchange and
//! authentication have succeeded. It carries the peer's identity, which is
//! fixed for the life of the connection, and reads and writes whole messages
//! and commands over a secure channel.
//!
//! Reading and writing are independent: one task may sit in
//! [`Connection::read_message_with`] while others write. Writes are
//! serialized with respect to each other.
//!
//! Commands that arrive while reading are handed to a [`CommandProcessor`].
//! The processor may answer with a message, which is then returned to the
//! reader as if it had arrived on the wire.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{BoxedReader, BoxedWriter, SecureReader, SecureWriter};
use crate::command::Command;
use crate::error::{ProtocolError, Result};
use crate::framing::{Frame, FrameTag};
use crate::keyex::Role;
use crate::message::Message;

/// Handles commands received while reading messages.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Processes one command.
    ///
    /// Returning `Ok(Some(msg))` delivers `msg` to the reader. Returning an
    /// error aborts the read and closes the connection.
    async fn process_command(&self, cmd: Command) -> Result<Option<Message>>;
}

/// Processor that logs and drops every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreCommands;

#[async_trait]
impl CommandProcessor for IgnoreCommands {
    async fn process_command(&self, cmd: Command) -> Result<Option<Message>> {
        tracing::debug!(command = cmd.kind().name(), "ignoring command");
        Ok(None)
    }
}

/// An authenticated, encrypted connection.
pub struct Connection {
    service: String,
    username: String,
    role: Role,
    reader: Mutex<SecureReader<BoxedReader>>,
    writer: Mutex<SecureWriter<BoxedWriter>>,
    closed: CancellationToken,
    failed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        reader: SecureReader<BoxedReader>,
        writer: SecureWriter<BoxedWriter>,
        role: Role,
        service: String,
        username: String,
    ) -> Self {
        Self {
            service,
            username,
            role,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
            failed: AtomicBool::new(false),
        }
    }

    /// Service the connection authenticated as.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Username the connection authenticated as.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Which end of the connection this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns true once the connection was closed or hit a fatal error.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Writes a message frame.
    pub async fn write_message(&self, msg: &Message, compress: bool) -> Result<()> {
        let payload = msg.to_msgpack()?;
        self.write_frame(FrameTag::Message, &payload, compress).await
    }

    /// Writes a command frame.
    pub async fn write_command(&self, cmd: &Command, compress: bool) -> Result<()> {
        let payload = cmd.to_bytes()?;
        self.write_frame(FrameTag::Command, &payload, compress).await
    }

    /// Writes one frame with an already encoded payload.
    ///
    /// The payload is not validated; the typed writers above are preferred.
    pub async fn write_frame(&self, tag: FrameTag, payload: &[u8], compress: bool) -> Result<()> {
        self.ensure_open()?;
        let mut writer = tokio::select! {
            _ = self.closed.cancelled() => return Err(closed_error()),
            writer = self.writer.lock() => writer,
        };
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            result = writer.write_frame(tag, payload, compress) => result,
        };
        match result {
            Err(ProtocolError::FrameTooLarge { .. }) => result,
            Err(e) => Err(self.fail(e)),
            Ok(()) => Ok(()),
        }
    }

    /// Reads the next frame.
    pub(crate) async fn read_frame(&self) -> Result<Frame> {
        self.ensure_open()?;
        let mut reader = tokio::select! {
            _ = self.closed.cancelled() => return Err(closed_error()),
            reader = self.reader.lock() => reader,
        };
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            result = reader.read_frame() => result,
        };
        result.map_err(|e| self.fail(e))
    }

    /// Reads the next message, ignoring any commands that arrive first.
    pub async fn read_message(&self) -> Result<Message> {
        self.read_message_with(&IgnoreCommands).await
    }

    /// Reads the next message, dispatching commands to `processor`.
    ///
    /// Commands are processed in wire order, before any later frame is read.
    pub async fn read_message_with(&self, processor: &dyn CommandProcessor) -> Result<Message> {
        loop {
            let frame = self.read_frame().await?;
            match frame.tag {
                FrameTag::Message => {
                    return Message::from_msgpack(&frame.payload).map_err(|e| self.fail(e));
                }
                FrameTag::Command => {
                    let cmd = Command::from_bytes(&frame.payload).map_err(|e| self.fail(e))?;
                    tracing::trace!(
                        service = %self.service,
                        username = %self.username,
                        command = cmd.kind().name(),
                        "command received"
                    );
                    match processor.process_command(cmd).await {
                        Ok(Some(msg)) => return Ok(msg),
                        Ok(None) => continue,
                        Err(e) => return Err(self.fail(e)),
                    }
                }
                FrameTag::Auth => {
                    return Err(self.fail(ProtocolError::MalformedCommand(
                        "unexpected auth frame on open connection".to_string(),
                    )));
                }
            }
        }
    }

    /// Closes the connection.
    ///
    /// Pending and future reads and writes fail with
    /// [`ProtocolError::ConnectionClosed`]. Closing twice is harmless.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "error shutting down connection");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        Ok(())
    }

    /// Marks the connection unusable after a fatal error.
    fn fail(&self, err: ProtocolError) -> ProtocolError {
        if !self.failed.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                service = %self.service,
                username = %self.username,
                error = %err,
                "connection failed"
            );
        }
        self.closed.cancel();
        err
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.service)
            .field("username", &self.username)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> ProtocolError {
    ProtocolError::ConnectionClosed("connection is closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::secure_split;
    use crate::keyex::KeySet;
    use crate::message::Header;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn pair() -> (Connection, Connection) {
        let keys = KeySet::derive(&[1u8; 32], &[2u8; 32]).unwrap();
        let (a, b) = duplex(64 * 1024);
        let (r, w) = secure_split(a, &keys, Role::Client);
        let client = Connection::new(r, w, Role::Client, "chat".into(), "alice".into());
        let (r, w) = secure_split(b, &keys, Role::Server);
        let server = Connection::new(r, w, Role::Server, "chat".into(), "alice".into());
        (client, server)
    }

    fn message() -> Message {
        let mut header = Header::new();
        header.insert("title".to_string(), "hello".to_string());
        Message::new(header, vec![0, 159, 146, 150, 255])
    }

    struct Recorder(std::sync::Mutex<Vec<Command>>);

    #[async_trait]
    impl CommandProcessor for Recorder {
        async fn process_command(&self, cmd: Command) -> Result<Option<Message>> {
            self.0.lock().unwrap().push(cmd);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (client, server) = pair();
        let msg = message();

        client.write_message(&msg, false).await.unwrap();
        client.write_message(&msg, true).await.unwrap();

        assert!(server.read_message().await.unwrap().eq_content(&msg));
        assert!(server.read_message().await.unwrap().eq_content(&msg));
    }

    #[tokio::test]
    async fn test_identity_accessors() {
        let (client, server) = pair();
        assert_eq!(server.service(), "chat");
        assert_eq!(server.username(), "alice");
        assert_eq!(server.role(), Role::Server);
        assert_eq!(client.role(), Role::Client);
    }

    #[tokio::test]
    async fn test_commands_reach_processor_in_order() {
        let (client, server) = pair();
        let recorder = Recorder(std::sync::Mutex::new(Vec::new()));

        let first = Command::SetVisibility {
            visible: Some(false),
        };
        let second = Command::MessageRetrieve {
            id: "m1".to_string(),
        };
        client.write_command(&first, false).await.unwrap();
        client.write_command(&second, false).await.unwrap();
        client.write_message(&message(), false).await.unwrap();

        let msg = server.read_message_with(&recorder).await.unwrap();
        assert!(msg.eq_content(&message()));
        assert_eq!(*recorder.0.lock().unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_processor_reply_is_returned() {
        struct Echo;

        #[async_trait]
        impl CommandProcessor for Echo {
            async fn process_command(&self, cmd: Command) -> Result<Option<Message>> {
                match cmd {
                    Command::MessageRetrieve { id } => Ok(Some(Message::with_body(id))),
                    _ => Ok(None),
                }
            }
        }

        let (client, server) = pair();
        client
            .write_command(
                &Command::MessageRetrieve {
                    id: "abc".to_string(),
                },
                false,
            )
            .await
            .unwrap();
        let msg = server.read_message_with(&Echo).await.unwrap();
        assert_eq!(msg.body, b"abc");
    }

    #[tokio::test]
    async fn test_processor_error_closes_connection() {
        struct Failing;

        #[async_trait]
        impl CommandProcessor for Failing {
            async fn process_command(&self, _cmd: Command) -> Result<Option<Message>> {
                Err(ProtocolError::Cache("store unreachable".to_string()))
            }
        }

        let (client, server) = pair();
        client
            .write_command(&Command::SetVisibility { visible: None }, false)
            .await
            .unwrap();

        let err = server.read_message_with(&Failing).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Cache(_)));
        assert!(server.is_closed());
        assert!(matches!(
            server.write_message(&message(), false).await,
            Err(ProtocolError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_ends_reads() {
        let (client, server) = pair();
        client.close().await;

        let err = server.read_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
        assert!(client.write_message(&message(), false).await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (_client, server) = pair();
        let server = Arc::new(server);

        let reader = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.read_message().await })
        };
        tokio::task::yield_now().await;
        server.close().await;

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let (client, server) = pair();
        let client = Arc::new(client);

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client
                    .write_message(&Message::with_body(vec![i; 100]), i % 2 == 0)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(server.read_message().await.unwrap().body[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8u8).collect::<Vec<_>>());
    }
}
