//! Coordinator service: one bus and one store shared over HTTP
//!
//! Stage processes on different hosts reach the same [`InMemoryBus`] and
//! [`MemoryStore`] through this service. Every store claim is served by a
//! single atomic [`MemoryStore`] operation, so the claim guarantee holds
//! across processes.
//!
//! [`InMemoryBus`]: crate::bus::InMemoryBus
//! [`MemoryStore`]: crate::store::MemoryStore

mod client;
mod server;

pub use client::RemoteCoordinator;
pub use server::{router, CoordinatorState};

use crate::events::Channel;
use serde::{Deserialize, Serialize};

/// Longest long-poll the server will hold open
pub const MAX_POLL_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub subscription_id: String,
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollParams {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub key: String,
    pub value: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub claimed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysParams {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyList {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
