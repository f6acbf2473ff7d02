//! Connection setup: key exchange followed by authentication.
//!
//! After the key exchange the client sends one `Auth` frame carrying its
//! service, username and token. The server asks its [`Authenticator`] and, on
//! success, answers with an empty `Auth` frame. On any failure the server
//! closes the stream without saying why, so a client cannot tell a bad token
//! from an unknown user.
//!
//! The whole sequence runs under a single deadline. Once it completes the
//! connection has no implicit timeouts.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::secure_split;
use crate::conn::Connection;
use crate::error::{ProtocolError, Result};
use crate::framing::FrameTag;
use crate::keyex::{client_exchange, server_exchange, Role, ServerKey, ServerPublicKey};

/// Character that may not appear in a service or username.
pub const IDENTITY_DELIMITER: char = ':';

/// Decides whether a client may connect.
///
/// Returning `Ok(false)` and returning an error both reject the client; the
/// error is only logged.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, service: &str, username: &str, token: &str)
        -> anyhow::Result<bool>;
}

#[derive(Serialize, Deserialize)]
struct AuthRequest {
    service: String,
    username: String,
    token: String,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("service", &self.service)
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Returns true if `name` can be used as a service or username.
pub fn is_valid_identity(name: &str) -> bool {
    !name.is_empty() && !name.contains(IDENTITY_DELIMITER) && !name.contains('\0')
}

/// Accepts a connection on the server side.
///
/// Runs the key exchange, reads the client's credentials and checks them
/// with `auth`, all within `timeout`.
pub async fn accept<S>(
    stream: S,
    key: &ServerKey,
    auth: &dyn Authenticator,
    timeout: Duration,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::time::timeout(timeout, accept_inner(stream, key, auth))
        .await
        .map_err(|_| ProtocolError::Timeout("handshake deadline exceeded".to_string()))?
}

async fn accept_inner<S>(
    mut stream: S,
    key: &ServerKey,
    auth: &dyn Authenticator,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let keys = server_exchange(key, &mut stream).await?;
    let (mut reader, mut writer) = secure_split(stream, &keys, Role::Server);

    let frame = reader.read_frame().await?;
    let request: Option<AuthRequest> = match frame.tag {
        FrameTag::Auth => rmp_serde::from_slice(&frame.payload).ok(),
        _ => None,
    };

    let accepted = match &request {
        Some(req) if is_valid_identity(&req.service) && is_valid_identity(&req.username) => {
            match auth
                .authenticate(&req.service, &req.username, &req.token)
                .await
            {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!(
                        service = %req.service,
                        username = %req.username,
                        error = %e,
                        "authenticator failed"
                    );
                    false
                }
            }
        }
        _ => false,
    };

    let Some(req) = request.filter(|_| accepted) else {
        tracing::debug!("rejecting unauthenticated connection");
        let _ = writer.shutdown().await;
        return Err(ProtocolError::AuthenticationFailed);
    };

    writer.write_frame(FrameTag::Auth, &[], false).await?;
    tracing::debug!(service = %req.service, username = %req.username, "connection authenticated");
    Ok(Connection::new(
        reader,
        writer,
        Role::Server,
        req.service,
        req.username,
    ))
}

/// Opens a connection on the client side.
///
/// Fails with [`ProtocolError::AuthenticationFailed`] if the server closes
/// the stream instead of acknowledging the credentials.
pub async fn dial<S>(
    stream: S,
    server: &ServerPublicKey,
    service: &str,
    username: &str,
    token: &str,
    timeout: Duration,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::time::timeout(timeout, dial_inner(stream, server, service, username, token))
        .await
        .map_err(|_| ProtocolError::Timeout("handshake deadline exceeded".to_string()))?
}

async fn dial_inner<S>(
    mut stream: S,
    server: &ServerPublicKey,
    service: &str,
    username: &str,
    token: &str,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let keys = client_exchange(server, &mut stream).await?;
    let (mut reader, mut writer) = secure_split(stream, &keys, Role::Client);

    let request = AuthRequest {
        service: service.to_string(),
        username: username.to_string(),
        token: token.to_string(),
    };
    let payload = rmp_serde::to_vec_named(&request)?;
    writer.write_frame(FrameTag::Auth, &payload, false).await?;

    let frame = match reader.read_frame().await {
        Ok(frame) => frame,
        Err(ProtocolError::ConnectionClosed(_)) => return Err(ProtocolError::AuthenticationFailed),
        Err(e) => return Err(e),
    };
    if frame.tag != FrameTag::Auth {
        return Err(ProtocolError::HandshakeFailed(format!(
            "expected auth acknowledgement, got {:?} frame",
            frame.tag
        )));
    }

    tracing::debug!(service, username, "connected");
    Ok(Connection::new(
        reader,
        writer,
        Role::Client,
        service.to_string(),
        username.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tokio::io::duplex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct StaticAuth;

    #[async_trait]
    impl Authenticator for StaticAuth {
        async fn authenticate(
            &self,
            service: &str,
            username: &str,
            token: &str,
        ) -> anyhow::Result<bool> {
            Ok(service == "chat" && username == "alice" && token == "secret")
        }
    }

    struct BrokenAuth;

    #[async_trait]
    impl Authenticator for BrokenAuth {
        async fn authenticate(&self, _: &str, _: &str, _: &str) -> anyhow::Result<bool> {
            anyhow::bail!("backend down")
        }
    }

    async fn connect(
        auth: &dyn Authenticator,
        service: &str,
        username: &str,
        token: &str,
    ) -> (Result<Connection>, Result<Connection>) {
        let key = ServerKey::generate().unwrap();
        let public = key.public_key();
        let (c, s) = duplex(64 * 1024);
        tokio::join!(
            dial(c, &public, service, username, token, TIMEOUT),
            accept(s, &key, auth, TIMEOUT)
        )
    }

    #[tokio::test]
    async fn test_successful_setup() {
        let (client, server) = connect(&StaticAuth, "chat", "alice", "secret").await;
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(server.service(), "chat");
        assert_eq!(server.username(), "alice");
        assert_eq!(client.username(), "alice");

        let msg = Message::with_body(b"hi".to_vec());
        client.write_message(&msg, false).await.unwrap();
        assert!(server.read_message().await.unwrap().eq_content(&msg));
    }

    #[tokio::test]
    async fn test_rejections_are_uniform() {
        for (service, username, token) in [
            ("chat", "alice", "wrong"),
            ("chat", "bob", "secret"),
            ("mail", "alice", "secret"),
        ] {
            let (client, server) = connect(&StaticAuth, service, username, token).await;
            assert!(matches!(client, Err(ProtocolError::AuthenticationFailed)));
            assert!(matches!(server, Err(ProtocolError::AuthenticationFailed)));
        }
    }

    #[tokio::test]
    async fn test_authenticator_error_rejects() {
        let (client, server) = connect(&BrokenAuth, "chat", "alice", "secret").await;
        assert!(matches!(client, Err(ProtocolError::AuthenticationFailed)));
        assert!(matches!(server, Err(ProtocolError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_delimiter_in_identity_rejects() {
        let (client, server) = connect(&StaticAuth, "chat", "ali:ce", "secret").await;
        assert!(matches!(client, Err(ProtocolError::AuthenticationFailed)));
        assert!(matches!(server, Err(ProtocolError::AuthenticationFailed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let key = ServerKey::generate().unwrap();
        let (_client, server) = duplex(1024);
        let result = accept(server, &key, &StaticAuth, Duration::from_secs(10)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_does_not_outlive_setup() {
        let (client, server) = connect(&StaticAuth, "chat", "alice", "secret").await;
        let client = client.unwrap();
        let server = server.unwrap();

        tokio::time::sleep(TIMEOUT * 3).await;

        client
            .write_message(&Message::with_body(b"late".to_vec()), false)
            .await
            .unwrap();
        assert_eq!(server.read_message().await.unwrap().body, b"late");
    }

    #[test]
    fn test_identity_validation() {
        assert!(is_valid_identity("alice"));
        assert!(!is_valid_identity(""));
        assert!(!is_valid_identity("a:b"));
        assert!(!is_valid_identity("a\0b"));
    }

    #[test]
    fn test_auth_request_debug_hides_token() {
        let req = AuthRequest {
            service: "chat".to_string(),
            username: "alice".to_string(),
            token: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", req).contains("hunter2"));
    }
}
