//! Publish/subscribe event bus
//!
//! Delivery is at-least-once per subscriber with no ordering across
//! channels. `publish` hands the envelope to the transport and returns; it
//! never waits for subscribers to process it.

mod memory;

pub use memory::{InMemoryBus, MemorySubscription};

use crate::events::{Channel, Envelope};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Bus transport errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("subscription to {0} closed")]
    Closed(Channel),
    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Trait for bus transports
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hand an envelope to the transport without waiting for subscribers
    async fn publish(&self, channel: Channel, envelope: Envelope) -> Result<(), BusError>;

    /// Open a new subscription to a channel
    async fn subscribe(&self, channel: Channel) -> Result<Box<dyn Subscription>, BusError>;
}

/// A single subscriber's view of one channel
#[async_trait]
pub trait Subscription: Send {
    fn channel(&self) -> Channel;

    /// Wait at most `timeout` for the next envelope
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing delivered.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope>, BusError>;
}
