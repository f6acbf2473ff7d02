//! # PushConn Message Cache
//!
//! Offline storage for messages that could not be delivered right away.
//!
//! Entries are addressed by `(service, username, id)`, may carry a TTL, and
//! can be taken exactly once with [`MessageCache::get_then_del`].
//!
//! ## Modules
//!
//! - [`cache`]: the [`MessageCache`] contract and [`StoreMessageCache`]
//! - [`store`]: the [`KvStore`] primitives and the in-process [`MemoryStore`]
//! - [`error`]: error types

pub mod cache;
pub mod error;
pub mod store;

pub use cache::{entry_key, MessageCache, StoreMessageCache, KEY_DELIMITER, KEY_PREFIX};
pub use error::{CacheError, Result};
pub use store::{KvStore, MemoryStore};

/// A [`StoreMessageCache`] over a [`MemoryStore`].
pub type MemoryMessageCache = StoreMessageCache<std::sync::Arc<MemoryStore>>;
