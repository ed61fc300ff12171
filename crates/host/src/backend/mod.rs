//! Collaborators the host API calls through.
//!
//! The runtime only depends on these traits. Durable implementations live
//! with the persistence layer; in-process ones are provided here.

mod events;
mod memory;
mod redis_cache;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use events::{Audience, BroadcastBus, BusEvent, EVENT_PREFIX};
pub use memory::{MemoryKvStore, MemoryTtlCache, StaticAccounts, StaticConfig};
pub use redis_cache::RedisTtlCache;

/// Default expiry for cache writes without a TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Longest expiry a cache write may ask for.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key `{0}` already exists")]
    Conflict(String),
    #[error("key `{0}` does not exist")]
    Missing(String),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn status(&self) -> u16 {
        match self {
            StoreError::Conflict(_) => 409,
            StoreError::Missing(_) => 404,
            StoreError::Backend(_) => 500,
        }
    }
}

/// One durable storage row. `value` is JSON text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KvRecord {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Namespace-scoped durable key/value storage; unique on `(namespace, key)`.
pub trait KvStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// All records in `namespace`, newest first, optionally only `key`.
    fn find(&self, namespace: &str, key: Option<&str>) -> Result<Vec<KvRecord>, StoreError>;

    /// Insert or overwrite.
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Conflict`] when the key exists.
    fn insert(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Missing`] when the key does not exist.
    fn update(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    fn del(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;
}

/// Expiring key/value cache. Keys arrive already namespaced.
pub trait TtlCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    fn del(&self, key: &str) -> Result<(), StoreError>;
}

pub trait EventBus: Send + Sync {
    fn publish(&self, audience: Audience, event: &str, payload: serde_json::Value);
}

/// The persisted configuration document.
pub trait ConfigSource: Send + Sync {
    fn document(&self) -> Result<serde_json::Value, StoreError>;
}

/// Minimal projection of the site owner account.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAccount {
    pub id: String,
    pub username: String,
    pub name: String,
    pub avatar: Option<String>,
    pub introduce: Option<String>,
    pub mail: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub trait AccountSource: Send + Sync {
    /// The first-created account, if any.
    fn master(&self) -> Result<Option<MasterAccount>, StoreError>;
}
