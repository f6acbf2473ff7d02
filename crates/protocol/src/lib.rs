//! # PushConn Protocol Library
//!
//! This crate implements the PushConn wire protocol: a secure, persistent
//! connection between a push server and its clients, carrying application
//! messages and control commands.
//!
//! ## Overview
//!
//! - **Key Exchange**: the client transports a fresh session secret to the
//!   server's long-lived public key; both sides derive the same [`KeySet`]
//! - **Secure Channel**: tagged frames, optionally LZ4 compressed, encrypted
//!   with ChaCha20-Poly1305 and authenticated with HMAC-SHA256
//! - **Authentication**: one credentials frame checked by an [`Authenticator`]
//!   under a handshake deadline
//! - **Connection**: identity-bound message and command I/O, with incoming
//!   commands dispatched to a [`CommandProcessor`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Messages and Commands            │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │           Secure Channel                │  ChaCha20-Poly1305 + HMAC
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Tagged, length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │     Key Exchange (once per stream)      │  Noise N + HKDF-SHA256
//! ├─────────────────────────────────────────┤
//! │     Transport (any ordered byte stream) │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`]: application messages
//! - [`command`]: protocol commands
//! - [`keyex`]: server keys, key exchange and key sets
//! - [`framing`]: frame header and compression
//! - [`channel`]: encrypted frame reader and writer
//! - [`conn`]: authenticated connections
//! - [`auth`]: connection setup on both ends
//! - [`error`]: error types

pub mod auth;
pub mod channel;
pub mod command;
pub mod conn;
pub mod error;
pub mod framing;
pub mod keyex;
pub mod message;

pub use auth::{accept, dial, is_valid_identity, Authenticator, IDENTITY_DELIMITER};
pub use command::{decode_id_list, encode_id_list, Command, CommandType, Digest};
pub use conn::{CommandProcessor, Connection, IgnoreCommands};
pub use error::{ProtocolError, Result};
pub use framing::{FrameFlags, FrameTag, FRAME_HEADER_SIZE, MAC_SIZE, MAX_FRAME_SIZE};
pub use keyex::{client_exchange, server_exchange, KeySet, Role, ServerKey, ServerPublicKey};
pub use message::{Header, Message};

/// Re-exported so implementors of the async traits need no direct dependency.
pub use async_trait::async_trait;
