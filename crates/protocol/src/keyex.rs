//! Key exchange over a raw byte stream.
//!
//! The server owns a long-lived Curve25519 key pair whose public half is
//! distributed to clients out of band. For each connection the client draws a
//! fresh 32-byte session secret and transports it to the server inside a
//! one-way Noise `N` handshake message:
//!
//! ```text
//! <- s
//! ...
//! -> e, es   (payload: session secret)
//! ```
//!
//! Both sides then run HKDF-SHA256 over the session secret, salted with the
//! Noise handshake hash, to derive the four keys of a [`KeySet`].
//!
//! There is no ephemeral key from the server, so a compromised server private
//! key exposes every session secret ever sent to it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use snow::Builder;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ProtocolError, Result};

/// Noise parameters for the key transport handshake.
const NOISE_PATTERN: &str = "Noise_N_25519_ChaChaPoly_BLAKE2s";

/// Length of every key in this module.
pub const KEY_LENGTH: usize = 32;

/// Length of the client's session secret.
const SESSION_SECRET_LENGTH: usize = 32;

/// Exact length of the handshake message: ephemeral key, secret, AEAD tag.
const HANDSHAKE_MESSAGE_LENGTH: usize = 32 + SESSION_SECRET_LENGTH + 16;

/// HKDF labels, one per derived key.
const LABEL_CLIENT_ENCRYPTION: &[u8] = b"pushconn client encryption";
const LABEL_CLIENT_INTEGRITY: &[u8] = b"pushconn client integrity";
const LABEL_SERVER_ENCRYPTION: &[u8] = b"pushconn server encryption";
const LABEL_SERVER_INTEGRITY: &[u8] = b"pushconn server integrity";

fn noise_builder<'a>() -> Result<Builder<'a>> {
    let params = NOISE_PATTERN
        .parse()
        .map_err(|e| ProtocolError::HandshakeFailed(format!("invalid noise pattern: {}", e)))?;
    Ok(Builder::new(params))
}

fn key_from_slice(bytes: &[u8], what: &str) -> Result<[u8; KEY_LENGTH]> {
    bytes.try_into().map_err(|_| {
        ProtocolError::InvalidKey(format!(
            "{} must be {} bytes, got {}",
            what,
            KEY_LENGTH,
            bytes.len()
        ))
    })
}

/// The server's long-lived key pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ServerKey {
    private: [u8; KEY_LENGTH],
    public: [u8; KEY_LENGTH],
}

impl ServerKey {
    /// Generates a new random key pair.
    pub fn generate() -> Result<Self> {
        let keypair = noise_builder()?
            .generate_keypair()
            .map_err(|e| ProtocolError::InvalidKey(format!("key generation failed: {}", e)))?;
        Ok(Self {
            private: key_from_slice(&keypair.private, "private key")?,
            public: key_from_slice(&keypair.public, "public key")?,
        })
    }

    /// Builds a key pair from its raw halves.
    pub fn from_parts(private: [u8; KEY_LENGTH], public: [u8; KEY_LENGTH]) -> Self {
        Self { private, public }
    }

    /// Returns the public half, which clients need to connect.
    pub fn public_key(&self) -> ServerPublicKey {
        ServerPublicKey(self.public)
    }

    /// Encodes the key pair as base64 of `private || public`.
    pub fn to_base64(&self) -> String {
        let mut raw = Zeroizing::new([0u8; KEY_LENGTH * 2]);
        raw[..KEY_LENGTH].copy_from_slice(&self.private);
        raw[KEY_LENGTH..].copy_from_slice(&self.public);
        BASE64.encode(&raw[..])
    }

    /// Decodes a key pair produced by [`ServerKey::to_base64`].
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| ProtocolError::InvalidKey(format!("invalid base64: {}", e)))?,
        );
        if raw.len() != KEY_LENGTH * 2 {
            return Err(ProtocolError::InvalidKey(format!(
                "server key must be {} bytes, got {}",
                KEY_LENGTH * 2,
                raw.len()
            )));
        }
        Ok(Self {
            private: key_from_slice(&raw[..KEY_LENGTH], "private key")?,
            public: key_from_slice(&raw[KEY_LENGTH..], "public key")?,
        })
    }

    fn private_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.private
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("public", &self.public_key())
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// The server's public key as known to clients.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerPublicKey([u8; KEY_LENGTH]);

impl ServerPublicKey {
    /// Creates a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::InvalidKey(format!("invalid base64: {}", e)))?;
        Ok(Self(key_from_slice(&raw, "public key")?))
    }
}

impl std::fmt::Debug for ServerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerPublicKey({})", self.to_base64())
    }
}

impl std::fmt::Display for ServerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Which end of a connection a party is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Encryption and integrity keys for one direction of traffic.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    pub(crate) encryption: [u8; KEY_LENGTH],
    pub(crate) integrity: [u8; KEY_LENGTH],
}

/// Symmetric keys derived by a handshake.
///
/// Both ends derive an identical set; each direction of traffic uses its own
/// encryption and integrity key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    client_encryption: [u8; KEY_LENGTH],
    client_integrity: [u8; KEY_LENGTH],
    server_encryption: [u8; KEY_LENGTH],
    server_integrity: [u8; KEY_LENGTH],
}

impl KeySet {
    /// Derives the key set from a session secret and the handshake hash.
    pub fn derive(session_secret: &[u8], handshake_hash: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(handshake_hash), session_secret);
        let expand = |label: &[u8]| -> Result<[u8; KEY_LENGTH]> {
            let mut okm = [0u8; KEY_LENGTH];
            hk.expand(label, &mut okm)
                .map_err(|e| ProtocolError::HandshakeFailed(format!("key derivation: {}", e)))?;
            Ok(okm)
        };
        Ok(Self {
            client_encryption: expand(LABEL_CLIENT_ENCRYPTION)?,
            client_integrity: expand(LABEL_CLIENT_INTEGRITY)?,
            server_encryption: expand(LABEL_SERVER_ENCRYPTION)?,
            server_integrity: expand(LABEL_SERVER_INTEGRITY)?,
        })
    }

    /// Splits the set into `(inbound, outbound)` keys for the given role.
    pub fn split(&self, role: Role) -> (DirectionKeys, DirectionKeys) {
        let client = DirectionKeys {
            encryption: self.client_encryption,
            integrity: self.client_integrity,
        };
        let server = DirectionKeys {
            encryption: self.server_encryption,
            integrity: self.server_integrity,
        };
        match role {
            Role::Client => (server, client),
            Role::Server => (client, server),
        }
    }
}

impl PartialEq for KeySet {
    fn eq(&self, other: &Self) -> bool {
        let eq = self.client_encryption.ct_eq(&other.client_encryption)
            & self.client_integrity.ct_eq(&other.client_integrity)
            & self.server_encryption.ct_eq(&other.server_encryption)
            & self.server_integrity.ct_eq(&other.server_integrity);
        eq.into()
    }
}

impl Eq for KeySet {}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySet([REDACTED])")
    }
}

/// Runs the server side of the key exchange.
///
/// Reads the client's handshake message, recovers the session secret with
/// the server private key and derives the key set.
pub async fn server_exchange<S>(key: &ServerKey, stream: &mut S) -> Result<KeySet>
where
    S: AsyncRead + Unpin,
{
    let mut handshake = noise_builder()?
        .local_private_key(key.private_bytes())
        .build_responder()?;

    let len = stream.read_u16().await? as usize;
    if len != HANDSHAKE_MESSAGE_LENGTH {
        return Err(ProtocolError::HandshakeFailed(format!(
            "unexpected handshake message length {}",
            len
        )));
    }
    let mut message = [0u8; HANDSHAKE_MESSAGE_LENGTH];
    stream.read_exact(&mut message).await?;

    let mut secret = Zeroizing::new([0u8; HANDSHAKE_MESSAGE_LENGTH]);
    let n = handshake.read_message(&message, &mut secret[..])?;
    if n != SESSION_SECRET_LENGTH {
        return Err(ProtocolError::HandshakeFailed(format!(
            "session secret has {} bytes",
            n
        )));
    }

    let keys = KeySet::derive(&secret[..n], handshake.get_handshake_hash())?;
    tracing::trace!("server key exchange complete");
    Ok(keys)
}

/// Runs the client side of the key exchange.
///
/// Draws a fresh session secret, sends it encrypted to the server's public
/// key and derives the key set.
pub async fn client_exchange<S>(server: &ServerPublicKey, stream: &mut S) -> Result<KeySet>
where
    S: AsyncWrite + Unpin,
{
    let mut handshake = noise_builder()?
        .remote_public_key(server.as_bytes())
        .build_initiator()?;

    let mut secret = Zeroizing::new([0u8; SESSION_SECRET_LENGTH]);
    OsRng.fill_bytes(&mut secret[..]);

    let mut message = [0u8; HANDSHAKE_MESSAGE_LENGTH];
    let n = handshake.write_message(&secret[..], &mut message)?;
    if n != HANDSHAKE_MESSAGE_LENGTH {
        return Err(ProtocolError::HandshakeFailed(format!(
            "handshake message has {} bytes",
            n
        )));
    }

    stream.write_u16(n as u16).await?;
    stream.write_all(&message[..n]).await?;
    stream.flush().await?;

    let keys = KeySet::derive(&secret[..], handshake.get_handshake_hash())?;
    tracing::trace!("client key exchange complete");
    Ok(keys)
}
