//! Shared coordination store
//!
//! The only mutable state shared between stage processes. Safety
//! properties (cooldown claims, dedup claims) are established with a single
//! conditional write, [`CoordinationStore::claim`], never with a
//! read-then-write pair.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("invalid ttl: must be greater than zero")]
    InvalidTtl,
    #[error("store value encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A live (unexpired) store entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    pub value: String,
    /// Remaining time to live in milliseconds
    pub ttl_ms: u64,
}

impl StoredEntry {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Trait for coordination store implementations
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically write `value` under `key` with expiry `ttl`, only if no
    /// unexpired entry exists for `key`. Returns whether this call won.
    async fn claim(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Read an unexpired entry
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    /// List unexpired keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove a key; returns whether an unexpired entry was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Key namespaces used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyNamespace {
    Cooldown,
    Dedup,
}

impl KeyNamespace {
    pub const ALL: [KeyNamespace; 2] = [KeyNamespace::Cooldown, KeyNamespace::Dedup];

    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Cooldown => "cooldown:",
            KeyNamespace::Dedup => "dedup:",
        }
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix(), id)
    }
}

impl std::fmt::Display for KeyNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyNamespace::Cooldown => write!(f, "cooldown"),
            KeyNamespace::Dedup => write!(f, "dedup"),
        }
    }
}

/// Cooldown record key for a target
pub fn cooldown_key(target_id: &str) -> String {
    KeyNamespace::Cooldown.key(target_id)
}
