//! Authenticators shipped with the server.

use async_trait::async_trait;
use protocol::Authenticator;
use subtle::ConstantTimeEq;

/// Environment variable holding the shared token for [`StaticTokenAuthenticator`].
pub const TOKEN_ENV_VAR: &str = "PUSHCONN_TOKEN";

/// Accepts any identity that presents one shared token.
///
/// Meant for development and single-tenant deployments.
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Reads the token from [`TOKEN_ENV_VAR`].
    ///
    /// Returns `None` if the variable is unset or empty.
    pub fn from_env() -> Option<Self> {
        std::env::var(TOKEN_ENV_VAR)
            .ok()
            .filter(|token| !token.is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(
        &self,
        _service: &str,
        _username: &str,
        token: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.token.as_bytes().ct_eq(token.as_bytes()).into())
    }
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn test_accepts_only_matching_token() {
        let auth = StaticTokenAuthenticator::new("s3cret");
        assert!(auth.authenticate("chat", "alice", "s3cret").await.unwrap());
        assert!(!auth.authenticate("chat", "alice", "s3cre").await.unwrap());
        assert!(!auth.authenticate("chat", "alice", "").await.unwrap());
    }

    #[test]
    fn test_debug_redacts_token() {
        let auth = StaticTokenAuthenticator::new("s3cret");
        assert!(!format!("{:?}", auth).contains("s3cret"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(TOKEN_ENV_VAR, "");
        assert!(StaticTokenAuthenticator::from_env().is_none());

        std::env::set_var(TOKEN_ENV_VAR, "tok");
        assert!(StaticTokenAuthenticator::from_env().is_some());

        std::env::remove_var(TOKEN_ENV_VAR);
        assert!(StaticTokenAuthenticator::from_env().is_none());
    }
}
