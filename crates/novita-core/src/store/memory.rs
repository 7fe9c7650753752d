// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Non-durable in-memory [`Store`] used as a startup fallback.

use super::{Store, StoreOp, StoreOpResult, StoreValue};
use crate::error::CoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: StoreValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store backed by [`DashMap`] for scalars and a [`Mutex`]-guarded
/// [`BTreeMap`] per key for sorted sets. No data survives a process restart.
#[derive(Default)]
pub struct MemoryStore {
    scalars: DashMap<String, Entry>,
    sorted_sets: DashMap<String, Mutex<Vec<(f64, String)>>>,
    sets: DashMap<String, Mutex<HashSet<String>>>,
}

impl MemoryStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoreValue>, CoreError> {
        if let Some(entry) = self.scalars.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.scalars.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.scalars.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CoreError> {
        self.scalars.remove(key);
        self.sorted_sets.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        use dashmap::mapref::entry::Entry as DashEntry;
        match self.scalars.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) if occ.get().is_expired() => {
                occ.insert(Entry {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
            DashEntry::Occupied(_) => Ok(false),
            DashEntry::Vacant(vac) => {
                vac.insert(Entry {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        let mut keys: Vec<String> = self
            .scalars
            .iter()
            .filter(|kv| !kv.value().is_expired() && kv.key().starts_with(prefix))
            .map(|kv| kv.key().clone())
            .collect();
        keys.extend(
            self.sorted_sets
                .iter()
                .filter(|kv| kv.key().starts_with(prefix))
                .map(|kv| kv.key().clone()),
        );
        keys.extend(
            self.sets
                .iter()
                .filter(|kv| kv.key().starts_with(prefix))
                .map(|kv| kv.key().clone()),
        );
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CoreError> {
        if score.is_nan() {
            return Err(CoreError::Store {
                operation: "zadd".to_string(),
                details: "score must not be NaN".to_string(),
            });
        }
        let set = self
            .sorted_sets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()));
        let mut guard = set.lock().unwrap();
        guard.retain(|(_, m)| m != member);
        let idx = guard
            .partition_point(|(s, _)| s.total_cmp(&score) == std::cmp::Ordering::Less);
        guard.insert(idx, (score, member.to_string()));
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64, CoreError> {
        Ok(self
            .sorted_sets
            .get(key)
            .map(|set| set.lock().unwrap().len() as u64)
            .unwrap_or(0))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CoreError> {
        let Some(set) = self.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let members: Vec<String> = set
            .lock()
            .unwrap()
            .iter()
            .map(|(_, member)| member.clone())
            .collect();
        Ok(slice_range(&members, start, stop))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), CoreError> {
        let set = self.sets.entry(key.to_string()).or_insert_with(|| Mutex::new(HashSet::new()));
        set.lock().unwrap().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), CoreError> {
        if let Some(set) = self.sets.get(key) {
            set.lock().unwrap().remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.lock().unwrap().iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreOpResult>, CoreError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                StoreOp::Set { key, value, ttl } => self.set(&key, value, ttl).await,
                StoreOp::Del { key } => self.del(&key).await,
            };
            results.push(match result {
                Ok(()) => StoreOpResult::Ok,
                Err(err) => StoreOpResult::Err(err.to_string()),
            });
        }
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Redis-style `ZRANGE` index semantics: negative indices count from the
/// end, inclusive on both ends.
fn slice_range(items: &[String], start: i64, stop: i64) -> Vec<String> {
    let len = items.len() as i64;
    if len == 0 {
        return Vec::new();
    }
    let norm = |i: i64| -> i64 {
        if i < 0 { (len + i).max(0) } else { i.min(len - 1).max(0) }
    };
    let start = norm(start);
    let stop = norm(stop);
    if start > stop {
        return Vec::new();
    }
    items[start as usize..=stop as usize].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();
        store
            .set("k", StoreValue::Bytes(b"v".to_vec()), None)
            .await
            .unwrap();
        let got = store.get("k").await.unwrap().unwrap();
        assert_eq!(got.as_bytes(), b"v");
    }

    #[tokio::test]
    async fn set_if_absent_only_acquires_once() {
        let store = MemoryStore::new();
        let first = store
            .set_if_absent("lock", StoreValue::Bytes(vec![]), Duration::from_secs(5))
            .await
            .unwrap();
        let second = store
            .set_if_absent("lock", StoreValue::Bytes(vec![]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let store = MemoryStore::new();
        store
            .set(
                "k",
                StoreValue::Bytes(b"v".to_vec()),
                Some(Duration::from_millis(1)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zrange_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", "c", 3.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();
        let all = store.zrange("z", 0, -1).await.unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);
        assert_eq!(store.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn set_add_remove_and_members_round_trip() {
        let store = MemoryStore::new();
        store.set_add("jobs:pending", "job-1").await.unwrap();
        store.set_add("jobs:pending", "job-2").await.unwrap();
        store.set_add("jobs:pending", "job-1").await.unwrap();
        let mut members = store.set_members("jobs:pending").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["job-1".to_string(), "job-2".to_string()]);

        store.set_remove("jobs:pending", "job-1").await.unwrap();
        assert_eq!(store.set_members("jobs:pending").await.unwrap(), vec!["job-2".to_string()]);
    }

    #[tokio::test]
    async fn scan_filters_by_prefix_and_skips_expired() {
        let store = MemoryStore::new();
        store
            .set("cache:instance:1", StoreValue::Bytes(vec![]), None)
            .await
            .unwrap();
        store
            .set("jobs:pending", StoreValue::Bytes(vec![]), None)
            .await
            .unwrap();
        let keys = store.scan("cache:").await.unwrap();
        assert_eq!(keys, vec!["cache:instance:1".to_string()]);
    }
}
