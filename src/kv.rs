//! Key-value store façade.
//!
//! The auth pipeline needs four primitives from its backing store: atomic
//! set-if-absent with a TTL (replay cache), atomic delete-if-equals (lock
//! release style cleanup), and set add/membership (revoked tokens). Anything
//! providing those — Redis, a sharded cache, the in-memory store below — can
//! sit behind this trait.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically stores `value` under `key` only if the key is absent.
    /// Returns true on first write, false when the key already exists.
    /// A `ttl` of zero means no expiry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Atomically deletes `key` only if it currently holds `value`.
    /// Returns true when the entry was deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Adds `member` to the set named `set`.
    async fn set_add(&self, set: &str, member: &str) -> Result<(), KvError>;

    /// Tests membership of `member` in the set named `set`.
    async fn set_contains(&self, set: &str, member: &str) -> Result<bool, KvError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory store for tests and single-process deployments. Expired
/// entries are dropped lazily when the key is next touched.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
    sets: DashMap<String, DashSet<String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let expires_at = (!ttl.is_zero()).then(|| now + ttl);
        // The entry API holds the shard lock across the check-and-insert,
        // which is what makes this atomic.
        let mut inserted = false;
        self.entries
            .entry(key.to_string())
            .and_modify(|existing| {
                if existing.expired(now) {
                    *existing = Entry { value: value.to_string(), expires_at };
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                Entry { value: value.to_string(), expires_at }
            });
        Ok(inserted)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, entry| !entry.expired(now) && entry.value == value);
        Ok(removed.is_some())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), KvError> {
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_contains(&self, set: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .sets
            .get(set)
            .is_some_and(|members| members.contains(member)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_first_writer_wins() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("k", "a", Duration::ZERO).await.unwrap());
        assert!(!kv.set_if_absent("k", "b", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_can_be_rewritten() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_if_absent("k", "a", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!kv
            .set_if_absent("k", "b", Duration::from_millis(20))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv
            .set_if_absent("k", "c", Duration::from_millis(20))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_checks_the_value() {
        let kv = MemoryKv::new();
        kv.set_if_absent("lock", "owner-1", Duration::ZERO).await.unwrap();

        assert!(!kv.delete_if_equals("lock", "owner-2").await.unwrap());
        assert!(kv.delete_if_equals("lock", "owner-1").await.unwrap());
        // Gone now; the slot is free again.
        assert!(kv.set_if_absent("lock", "owner-2", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn set_membership() {
        let kv = MemoryKv::new();
        assert!(!kv.set_contains("revoked_tokens", "t1").await.unwrap());
        kv.set_add("revoked_tokens", "t1").await.unwrap();
        assert!(kv.set_contains("revoked_tokens", "t1").await.unwrap());
        assert!(!kv.set_contains("revoked_tokens", "t2").await.unwrap());
        assert!(!kv.set_contains("other_set", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_has_one_winner() {
        use std::sync::Arc;
        let kv = Arc::new(MemoryKv::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let kv = kv.clone();
            tasks.push(tokio::spawn(async move {
                kv.set_if_absent("nonce", &i.to_string(), Duration::from_secs(300))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
