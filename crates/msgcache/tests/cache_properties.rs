//! Behavioural tests of the store-backed message cache.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use msgcache::{MemoryMessageCache, MemoryStore, MessageCache, StoreMessageCache};
use protocol::{Header, Message};

const SERVICE: &str = "srv";
const USER: &str = "usr";

fn new_cache() -> Arc<MemoryMessageCache> {
    Arc::new(StoreMessageCache::new(Arc::new(MemoryStore::new())))
}

fn messages(n: usize) -> Vec<Message> {
    (0..n)
        .map(|i| {
            let mut header = Header::new();
            header.insert("seq".to_string(), i.to_string());
            header.insert("kind".to_string(), "test".to_string());
            Message::new(header, vec![i as u8, 0, 255, (i * 7) as u8])
        })
        .collect()
}

async fn cache_all(cache: &MemoryMessageCache, msgs: &[Message], ttl: Duration) -> Vec<String> {
    let mut ids = Vec::new();
    for msg in msgs {
        ids.push(cache.cache_message(SERVICE, USER, msg, ttl).await.unwrap());
    }
    ids
}

#[tokio::test]
async fn get_then_del_returns_each_message_once() {
    let cache = new_cache();
    let msgs = messages(10);
    let ids = cache_all(&cache, &msgs, Duration::ZERO).await;

    for (msg, id) in msgs.iter().zip(&ids) {
        let got = cache.get_then_del(SERVICE, USER, id).await.unwrap();
        assert!(got.expect("first take").eq_content(msg));

        let again = cache.get_then_del(SERVICE, USER, id).await.unwrap();
        assert!(again.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_takers_see_a_message_at_most_once() {
    let cache = new_cache();
    let msgs = messages(5);
    let ids = cache_all(&cache, &msgs, Duration::ZERO).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let ids = ids.clone();
        handles.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            for id in &ids {
                if cache.get_then_del(SERVICE, USER, id).await.unwrap().is_some() {
                    taken.push(id.clone());
                }
            }
            taken
        }));
    }

    let mut all_taken = Vec::new();
    for handle in handles {
        all_taken.extend(handle.await.unwrap());
    }
    all_taken.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(all_taken, expected);
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_ttl() {
    let cache = new_cache();
    let msgs = messages(3);
    let ids = cache_all(&cache, &msgs, Duration::from_secs(1)).await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    for id in &ids {
        assert!(cache.get_then_del(SERVICE, USER, id).await.unwrap().is_none());
    }
    assert!(cache.get_all_ids(SERVICE, USER).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_ttl_never_expires() {
    let cache = new_cache();
    let ids = cache_all(&cache, &messages(1), Duration::ZERO).await;

    tokio::time::sleep(Duration::from_secs(365 * 24 * 3600)).await;

    assert!(cache.get(SERVICE, USER, &ids[0]).await.unwrap().is_some());
}

#[tokio::test]
async fn get_all_ids_lists_every_cached_id() {
    let cache = new_cache();
    let ids = cache_all(&cache, &messages(10), Duration::ZERO).await;

    let listed: HashSet<String> = cache
        .get_all_ids(SERVICE, USER)
        .await
        .unwrap()
        .into_iter()
        .collect();
    let expected: HashSet<String> = ids.into_iter().collect();
    assert_eq!(listed, expected);
}

#[tokio::test]
async fn get_cached_messages_honours_excludes() {
    let cache = new_cache();
    let msgs = messages(10);
    let ids = cache_all(&cache, &msgs, Duration::ZERO).await;

    let excludes: Vec<String> = ids.iter().step_by(3).cloned().collect();
    let got = cache
        .get_cached_messages(SERVICE, USER, &excludes)
        .await
        .unwrap();

    let expected: Vec<(&String, &Message)> = ids
        .iter()
        .zip(&msgs)
        .filter(|(id, _)| !excludes.contains(*id))
        .collect();
    assert_eq!(got.len(), expected.len());
    for (id, msg) in expected {
        let found = got
            .iter()
            .find(|m| &m.id == id)
            .expect("non-excluded message returned");
        assert!(found.eq_content(msg));
    }

    // Listing does not consume.
    assert_eq!(cache.get_all_ids(SERVICE, USER).await.unwrap().len(), 10);
}

#[tokio::test]
async fn get_cached_messages_without_excludes_returns_all() {
    let cache = new_cache();
    cache_all(&cache, &messages(4), Duration::ZERO).await;

    let got = cache.get_cached_messages(SERVICE, USER, &[]).await.unwrap();
    assert_eq!(got.len(), 4);
}
