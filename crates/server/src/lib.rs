//! # PushConn Server Library
//!
//! Server side of the PushConn protocol: what happens on a connection after
//! it has been authenticated.
//!
//! ## Overview
//!
//! - **Per-connection state machine**: [`ServerConn`] decides how each
//!   message is delivered (in full or as a digest, compressed or not) and
//!   reacts to the commands a client sends
//! - **Forwarding**: [`ForwardRouter`] caches forwarded messages for their
//!   receiver and pushes them to the receiver's live connections
//! - **Subscriptions**: [`SubscriptionRegistry`] records topic subscriptions
//! - **Assembly**: [`Server`] accepts streams and wires all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          Server                           │
//! ├───────────────────────────────────────────────────────────┤
//! │   ServerConn ──┐                                          │
//! │   ServerConn ──┼── forward queue ──▶ ForwardRouter ──┐    │
//! │   ServerConn ──┘                                     │    │
//! │        │      └── subscribe queue ─▶ Subscriptions   │    │
//! │        │                                             ▼    │
//! │        └────────── retrieve ───────────────▶ MessageCache │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`conn`]: The per-connection command state machine
//! - [`settings`]: Per-connection delivery settings
//! - [`requests`]: Requests handed from connections to the server
//! - [`router`]: Delivery to online connections
//! - [`subscriptions`]: Topic subscriptions
//! - [`server`]: Accept loop and connection lifecycle
//! - [`auth`]: Bundled authenticators
//! - [`keyfile`]: Server key persistence

pub mod auth;
pub mod config;
pub mod conn;
pub mod keyfile;
pub mod requests;
pub mod router;
pub mod server;
pub mod settings;
pub mod subscriptions;

// Re-export the library crates for convenience
pub use msgcache;
pub use protocol;

pub use auth::StaticTokenAuthenticator;
pub use config::{Config, ConfigError};
pub use conn::ServerConn;
pub use requests::{ForwardRequest, IncomingMessage, SubscribeRequest};
pub use router::{Delivery, ForwardRouter};
pub use server::{Server, ServerOptions};
pub use settings::{ConnSettings, DEFAULT_COMPRESS_THRESHOLD, DEFAULT_DIGEST_THRESHOLD};
pub use subscriptions::SubscriptionRegistry;
