// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The key/value store abstraction consumed by [`crate::cache`] and
//! [`crate::queue`].
//!
//! Two implementations exist: [`redis::RedisStore`] backed by a
//! Redis-compatible service, and [`memory::MemoryStore`], a non-durable
//! fallback used when the external service is unreachable at startup and
//! fallback is enabled. Both speak the same [`Store`] trait so the rest of
//! the core never branches on which backend is active.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::error::CoreError;
use async_trait::async_trait;
use std::time::Duration;

/// A raw value as stored: either an opaque byte string or a member of a
/// sorted set. Namespace owners (cache, queue) are responsible for encoding
/// their own JSON payloads into [`StoreValue::Bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    /// An opaque byte string (typically JSON).
    Bytes(Vec<u8>),
}

impl StoreValue {
    /// Construct a value from anything that serializes to JSON.
    pub fn json(value: &impl serde::Serialize) -> Result<Self, CoreError> {
        Ok(StoreValue::Bytes(serde_json::to_vec(value)?))
    }

    /// Decode this value as JSON.
    pub fn into_json<T: serde::de::DeserializeOwned>(self) -> Result<T, CoreError> {
        match self {
            StoreValue::Bytes(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }

    /// The raw bytes, regardless of variant.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StoreValue::Bytes(b) => b,
        }
    }
}

/// A single queued operation for [`Store::pipeline`].
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// `set(key, value, ttl)`.
    Set {
        /// Key.
        key: String,
        /// Value.
        value: StoreValue,
        /// Optional expiry.
        ttl: Option<Duration>,
    },
    /// `del(key)`.
    Del {
        /// Key.
        key: String,
    },
}

/// Result of one queued operation.
#[derive(Debug, Clone)]
pub enum StoreOpResult {
    /// The operation completed.
    Ok,
    /// The operation failed; the pipeline continues with remaining ops.
    Err(String),
}

/// Abstract persistent key/value store. Implementations must be safe for
/// concurrent use: the store is a shared field on [`crate::app::AppContext`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a value, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<StoreValue>, CoreError>;

    /// Idempotent overwrite, with an optional expiry.
    async fn set(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Option<Duration>,
    ) -> Result<(), CoreError>;

    /// Delete a key. No error if it doesn't exist.
    async fn del(&self, key: &str) -> Result<(), CoreError>;

    /// Set only if the key is absent, atomically. Returns whether this call
    /// acquired it. Used for distributed locks (e.g. `sync:lock`).
    async fn set_if_absent(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Lazily enumerate keys under a prefix. May return extraneous keys;
    /// callers must filter defensively (see the WRONGTYPE defense in
    /// [`crate::cache`]).
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CoreError>;

    /// Add a member with a score to the sorted set at `key`. Reserved for
    /// the job queue's completed-jobs index — every other multi-member
    /// index (e.g. pending/processing job membership) uses
    /// [`Store::set_add`]/[`Store::set_members`] instead.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), CoreError>;

    /// Cardinality of the sorted set at `key`.
    async fn zcard(&self, key: &str) -> Result<u64, CoreError>;

    /// Range query over the sorted set at `key` by rank, ascending score.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CoreError>;

    /// Add a member to the unordered set at `key`. A no-op if already
    /// present.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), CoreError>;

    /// Remove a member from the set at `key`. No error if absent.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), CoreError>;

    /// All members of the set at `key`, in unspecified order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, CoreError>;

    /// Execute a batch of operations. Implementations may run them serially;
    /// callers must not assume cross-op atomicity.
    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreOpResult>, CoreError>;

    /// Human-readable backend name, surfaced in the health summary.
    fn backend_name(&self) -> &'static str;
}
