//! The message cache contract and its store-backed implementation.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use protocol::Message;

use crate::error::{CacheError, Result};
use crate::store::KvStore;

/// Namespace prefix of every cache key.
pub const KEY_PREFIX: &str = "mcache";

/// Separator between key components. Never valid inside a service or username.
pub const KEY_DELIMITER: char = ':';

/// Prefix of the per-identity id index keys.
const INDEX_PREFIX: &str = "mcache.ids";

/// Storage for messages waiting to be delivered, keyed by
/// `(service, username, id)`.
///
/// Absent or expired entries are reported as `Ok(None)` or left out of
/// listings, never as errors.
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Stores `msg` under a freshly generated id and returns the id.
    ///
    /// A zero `ttl` means the entry never expires.
    async fn cache_message(
        &self,
        service: &str,
        username: &str,
        msg: &Message,
        ttl: Duration,
    ) -> Result<String>;

    /// Reads an entry without removing it.
    async fn get(&self, service: &str, username: &str, id: &str) -> Result<Option<Message>>;

    /// Reads and removes an entry in one atomic step.
    ///
    /// However many callers race on the same id, at most one receives the
    /// message.
    async fn get_then_del(
        &self,
        service: &str,
        username: &str,
        id: &str,
    ) -> Result<Option<Message>>;

    /// Lists the ids of every live entry of an identity, in no particular order.
    async fn get_all_ids(&self, service: &str, username: &str) -> Result<Vec<String>>;

    /// Returns every live entry of an identity except those in `excludes`.
    async fn get_cached_messages(
        &self,
        service: &str,
        username: &str,
        excludes: &[String],
    ) -> Result<Vec<Message>>;
}

/// [`MessageCache`] on top of any [`KvStore`].
///
/// Each message is stored as JSON under `mcache:{service}:{username}:{id}`.
/// The ids of an identity are also kept in a set under
/// `mcache.ids:{service}:{username}` with the same TTL as the entry, so the
/// store expires both together. Ids whose entry is gone are also pruned from
/// that set whenever it is read.
#[derive(Debug)]
pub struct StoreMessageCache<S> {
    store: S,
}

impl<S: KvStore> StoreMessageCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn load(&self, key: &str, id: &str) -> Result<Option<Message>> {
        match self.store.get(key).await? {
            Some(bytes) => decode(&bytes, id).map(Some),
            None => Ok(None),
        }
    }
}

/// Builds the key of one cache entry.
pub fn entry_key(service: &str, username: &str, id: &str) -> Result<String> {
    check_component(service)?;
    check_component(username)?;
    Ok(format!(
        "{KEY_PREFIX}{KEY_DELIMITER}{service}{KEY_DELIMITER}{username}{KEY_DELIMITER}{id}"
    ))
}

fn index_key(service: &str, username: &str) -> Result<String> {
    check_component(service)?;
    check_component(username)?;
    Ok(format!(
        "{INDEX_PREFIX}{KEY_DELIMITER}{service}{KEY_DELIMITER}{username}"
    ))
}

fn check_component(part: &str) -> Result<()> {
    if part.is_empty() || part.contains(KEY_DELIMITER) {
        return Err(CacheError::InvalidKey(part.to_string()));
    }
    Ok(())
}

/// Ids are generated without the delimiter, so one containing it cannot exist.
fn is_possible_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(KEY_DELIMITER)
}

fn decode(bytes: &[u8], id: &str) -> Result<Message> {
    let mut msg: Message = serde_json::from_slice(bytes)?;
    msg.id = id.to_string();
    Ok(msg)
}

#[async_trait]
impl<S: KvStore> MessageCache for StoreMessageCache<S> {
    async fn cache_message(
        &self,
        service: &str,
        username: &str,
        msg: &Message,
        ttl: Duration,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let key = entry_key(service, username, &id)?;
        let index = index_key(service, username)?;

        let mut stored = msg.clone();
        stored.id.clear();
        let value = serde_json::to_vec(&stored)?;

        let ttl = (!ttl.is_zero()).then_some(ttl);
        self.store.set(&key, value, ttl).await?;
        self.store.set_add(&index, &id, ttl).await?;

        tracing::trace!(service, username, id = %id, ?ttl, "message cached");
        Ok(id)
    }

    async fn get(&self, service: &str, username: &str, id: &str) -> Result<Option<Message>> {
        let key = entry_key(service, username, id)?;
        if !is_possible_id(id) {
            return Ok(None);
        }
        self.load(&key, id).await
    }

    async fn get_then_del(
        &self,
        service: &str,
        username: &str,
        id: &str,
    ) -> Result<Option<Message>> {
        let key = entry_key(service, username, id)?;
        let index = index_key(service, username)?;
        if !is_possible_id(id) {
            return Ok(None);
        }
        let Some(bytes) = self.store.get_del(&key).await? else {
            return Ok(None);
        };
        // The entry is already gone; a stale index member is pruned on the next listing.
        if let Err(err) = self.store.set_remove(&index, id).await {
            tracing::warn!(service, username, id, error = %err, "failed to update cache index");
        }
        decode(&bytes, id).map(Some)
    }

    async fn get_all_ids(&self, service: &str, username: &str) -> Result<Vec<String>> {
        let index = index_key(service, username)?;
        let mut live = Vec::new();
        for id in self.store.set_members(&index).await? {
            let key = entry_key(service, username, &id)?;
            if self.store.get(&key).await?.is_some() {
                live.push(id);
            } else {
                self.store.set_remove(&index, &id).await?;
            }
        }
        Ok(live)
    }

    async fn get_cached_messages(
        &self,
        service: &str,
        username: &str,
        excludes: &[String],
    ) -> Result<Vec<Message>> {
        let excluded: HashSet<&str> = excludes.iter().map(String::as_str).collect();
        let mut messages = Vec::new();
        for id in self.get_all_ids(service, username).await? {
            if excluded.contains(id.as_str()) {
                continue;
            }
            let key = entry_key(service, username, &id)?;
            // May have expired or been taken since the id was listed.
            if let Some(msg) = self.load(&key, &id).await? {
                messages.push(msg);
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use protocol::Header;

    fn cache() -> StoreMessageCache<MemoryStore> {
        StoreMessageCache::new(MemoryStore::new())
    }

    fn message(body: &str) -> Message {
        let mut header = Header::new();
        header.insert("title".to_string(), body.to_uppercase());
        Message::new(header, body.as_bytes().to_vec())
    }

    #[test]
    fn test_entry_key_layout() {
        assert_eq!(
            entry_key("chat", "alice", "42").unwrap(),
            "mcache:chat:alice:42"
        );
    }

    #[test]
    fn test_entry_key_rejects_delimiter() {
        assert!(matches!(
            entry_key("ch:at", "alice", "1"),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(entry_key("chat", "ali:ce", "1").is_err());
        assert!(entry_key("", "alice", "1").is_err());
    }

    #[tokio::test]
    async fn test_cached_message_is_returned_with_its_id() {
        let cache = cache();
        let msg = message("hello");
        let id = cache
            .cache_message("chat", "alice", &msg, Duration::ZERO)
            .await
            .unwrap();

        let got = cache.get("chat", "alice", &id).await.unwrap().unwrap();
        assert!(got.eq_content(&msg));
        assert_eq!(got.id, id);
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let cache = cache();
        let id = cache
            .cache_message("chat", "alice", &message("a"), Duration::ZERO)
            .await
            .unwrap();

        assert!(cache.get("chat", "bob", &id).await.unwrap().is_none());
        assert!(cache.get("mail", "alice", &id).await.unwrap().is_none());
        assert!(cache.get_all_ids("chat", "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_and_impossible_ids_are_none() {
        let cache = cache();
        assert!(cache.get("chat", "alice", "nope").await.unwrap().is_none());
        assert!(cache.get("chat", "alice", "a:b").await.unwrap().is_none());
        assert!(cache
            .get_then_del("chat", "alice", "")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_get_then_del_prunes_index() {
        let cache = cache();
        let id = cache
            .cache_message("chat", "alice", &message("a"), Duration::ZERO)
            .await
            .unwrap();
        assert!(cache
            .get_then_del("chat", "alice", &id)
            .await
            .unwrap()
            .is_some());
        assert!(cache.get_all_ids("chat", "alice").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_empties_index_of_expired_messages() {
        let cache = cache();
        for i in 0..1000 {
            cache
                .cache_message("chat", "ghost", &message(&i.to_string()), Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert_eq!(cache.store().member_count(), 1000);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.store().purge_expired(), 1000);
        assert!(cache.store().is_empty());
        assert_eq!(cache.store().member_count(), 0);
        assert!(cache.get_all_ids("chat", "ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_then_del_survives_index_failure() {
        let cache = StoreMessageCache::new(BrokenIndex(MemoryStore::new()));
        let id = cache
            .cache_message("chat", "alice", &message("a"), Duration::ZERO)
            .await
            .unwrap();

        let got = cache.get_then_del("chat", "alice", &id).await.unwrap();
        assert!(got.unwrap().eq_content(&message("a")));
        assert!(cache.get_then_del("chat", "alice", &id).await.unwrap().is_none());
    }

    /// A store whose explicit index removals fail.
    struct BrokenIndex(MemoryStore);

    #[async_trait]
    impl KvStore for BrokenIndex {
        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            self.0.set(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key).await
        }

        async fn get_del(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get_del(key).await
        }

        async fn del(&self, key: &str) -> Result<bool> {
            self.0.del(key).await
        }

        async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<()> {
            self.0.set_add(key, member, ttl).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>> {
            self.0.set_members(key).await
        }

        async fn set_remove(&self, _key: &str, _member: &str) -> Result<()> {
            Err(CacheError::Store("index unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_stored_value_is_json() {
        let cache = cache();
        let id = cache
            .cache_message("chat", "alice", &message("a"), Duration::ZERO)
            .await
            .unwrap();
        let key = entry_key("chat", "alice", &id).unwrap();
        let raw = cache.store().get(&key).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["header"]["title"], "A");
    }
}
