//! Key-value stores backing the message cache.
//!
//! [`KvStore`] is the small set of primitives a cache needs: string keys
//! holding byte values with an optional TTL, an atomic get-and-delete, and
//! string sets used as per-identity indexes. Set members carry a TTL of their
//! own so an index never outlives the values it points at.
//!
//! [`MemoryStore`] keeps everything in process memory. Expired values and set
//! members are invisible as soon as their deadline passes and are physically
//! removed either when touched or by [`MemoryStore::purge_expired`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Primitive operations of a TTL-capable key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// `None` means the value never expires.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Returns the live value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns and removes the live value under `key` in one atomic step.
    ///
    /// Of any number of concurrent callers at most one observes the value.
    async fn get_del(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes `key`. Returns true if a live value was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Adds `member` to the set under `key`.
    ///
    /// The member drops out of the set once `ttl` has passed; `None` keeps it
    /// until removed.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<()>;

    /// Lists the live members of the set under `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Removes `member` from the set under `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn get_del(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get_del(key).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        (**self).del(key).await
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).set_add(key, member, ttl).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        (**self).set_members(key).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        (**self).set_remove(key, member).await
    }
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        is_live(self.expires_at, now)
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |deadline| now < deadline)
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

/// Set members mapped to their expiry deadline.
type Members = HashMap<String, Option<Instant>>;

/// In-process [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, Entry>,
    sets: DashMap<String, Members>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of set members, including expired ones not yet purged.
    pub fn member_count(&self) -> usize {
        self.sets.iter().map(|set| set.len()).sum()
    }

    /// Removes every expired value and set member, then drops sets left
    /// empty. Returns how many values were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.values.len();
        self.values.retain(|_, entry| entry.is_live(now));
        self.sets.retain(|_, members| {
            members.retain(|_, expires_at| is_live(*expires_at, now));
            !members.is_empty()
        });
        before.saturating_sub(self.values.len())
    }

    /// Spawns a task that purges expired values every `interval` until
    /// `shutdown` is cancelled.
    pub fn spawn_purger(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "purged expired cache entries");
                        }
                    }
                }
            }
            tracing::debug!("cache purger stopped");
        })
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = deadline(ttl);
        self.values
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(entry) = self.values.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.values.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn get_del(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self
            .values
            .remove(key)
            .and_then(|(_, entry)| entry.is_live(now).then_some(entry.value)))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .values
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), deadline(ttl));
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, expires_at)| is_live(**expires_at, now))
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(())
    }
}
