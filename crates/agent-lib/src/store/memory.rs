//! In-process coordination store with per-key atomic claims

use super::{CoordinationStore, StoreError, StoredEntry};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Coordination store held in memory
///
/// Each claim runs under the shard lock of its key, so concurrent claims on
/// the same key serialize and exactly one of them observes the key absent.
/// Expired entries are treated as absent and removed lazily.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Synchronous form of [`CoordinationStore::claim`]
    pub fn try_claim(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl);
        }

        let now = Instant::now();
        let slot = Slot {
            value: value.to_string(),
            expires_at: now + ttl,
        };

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(slot);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    pub fn entry(&self, key: &str) -> Option<StoredEntry> {
        let now = Instant::now();
        let live = self.slots.get(key).and_then(|slot| {
            slot.is_live(now).then(|| StoredEntry {
                key: key.to_string(),
                value: slot.value.clone(),
                ttl_ms: slot.expires_at.saturating_duration_since(now).as_millis() as u64,
            })
        });

        if live.is_none() {
            self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        }
        live
    }

    pub fn live_keys(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.key().starts_with(prefix) && slot.value().is_live(now))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        self.slots
            .remove(key)
            .map(|(_, slot)| slot.is_live(now))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn claim(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.try_claim(key, value, ttl)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        Ok(self.entry(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.live_keys(prefix))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.remove(key))
    }
}
