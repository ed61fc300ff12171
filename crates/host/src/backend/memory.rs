use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::{
    AccountSource, ConfigSource, KvRecord, KvStore, MAX_CACHE_TTL, MasterAccount, StoreError,
    TtlCache,
};

/// In-process TTL cache used when no redis url is configured.
///
/// Expired entries are dropped when read, and swept from the whole map once
/// it grows past the last sweep's high-water mark.
#[derive(Default)]
pub struct MemoryTtlCache {
    state: Mutex<TtlState>,
}

#[derive(Default)]
struct TtlState {
    entries: HashMap<String, (Instant, String)>,
    sweep_at: usize,
}

const SWEEP_FLOOR: usize = 64;

impl TtlState {
    fn sweep_if_due(&mut self, now: Instant) {
        if self.entries.len() < self.sweep_at.max(SWEEP_FLOOR) {
            return;
        }
        self.entries.retain(|_, (expires_at, _)| *expires_at > now);
        self.sweep_at = self.entries.len() * 2;
    }
}

impl MemoryTtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TtlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TtlCache for MemoryTtlCache {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state();
        match state.entries.get(key) {
            Some((expires_at, value)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let expires_at = now + ttl.min(MAX_CACHE_TTL);
        let mut state = self.state();
        state.sweep_if_due(now);
        state.entries.insert(key.to_string(), (expires_at, value.to_string()));
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.state().entries.remove(key);
        Ok(())
    }
}

/// In-process durable-store stand-in, mostly for tests and embedding.
#[derive(Default)]
pub struct MemoryKvStore {
    rows: Mutex<Vec<(String, KvRecord)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .find(|(ns, record)| ns == namespace && record.key == key)
            .map(|(_, record)| record.value.clone()))
    }

    fn find(&self, namespace: &str, key: Option<&str>) -> Result<Vec<KvRecord>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .rev()
            .filter(|(ns, record)| ns == namespace && key.is_none_or(|key| record.key == key))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        match rows
            .iter_mut()
            .find(|(ns, record)| ns == namespace && record.key == key)
        {
            Some((_, record)) => record.value = value.to_string(),
            None => rows.push((
                namespace.to_string(),
                KvRecord {
                    key: key.to_string(),
                    value: value.to_string(),
                    created_at: Utc::now(),
                },
            )),
        }
        Ok(())
    }

    fn insert(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        if rows.iter().any(|(ns, record)| ns == namespace && record.key == key) {
            return Err(StoreError::Conflict(key.to_string()));
        }
        rows.push((
            namespace.to_string(),
            KvRecord {
                key: key.to_string(),
                value: value.to_string(),
                created_at: Utc::now(),
            },
        ));
        Ok(())
    }

    fn update(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let record = rows
            .iter_mut()
            .find(|(ns, record)| ns == namespace && record.key == key)
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        record.1.value = value.to_string();
        Ok(())
    }

    fn del(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let before = rows.len();
        rows.retain(|(ns, record)| !(ns == namespace && record.key == key));
        Ok(rows.len() != before)
    }
}

/// Fixed configuration document.
#[derive(Default)]
pub struct StaticConfig(pub serde_json::Value);

impl ConfigSource for StaticConfig {
    fn document(&self) -> Result<serde_json::Value, StoreError> {
        Ok(self.0.clone())
    }
}

/// Fixed master account.
#[derive(Default)]
pub struct StaticAccounts(pub Option<MasterAccount>);

impl AccountSource for StaticAccounts {
    fn master(&self) -> Result<Option<MasterAccount>, StoreError> {
        Ok(self.0.clone())
    }
}
