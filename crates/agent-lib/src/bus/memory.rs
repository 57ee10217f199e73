//! In-process bus backed by tokio broadcast channels

use super::{BusError, EventBus, Subscription};
use crate::events::{Channel, Envelope};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default per-channel buffer
const DEFAULT_CAPACITY: usize = 1024;

/// In-memory bus; every subscriber gets its own copy of each envelope
pub struct InMemoryBus {
    channels: DashMap<Channel, broadcast::Sender<Envelope>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose channels buffer up to `capacity` envelopes per
    /// subscriber before the slowest subscriber starts losing messages
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: Channel) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.channels
            .get(&channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, channel: Channel, envelope: Envelope) -> Result<(), BusError> {
        if self.sender(channel).send(envelope).is_err() {
            debug!(channel = %channel, "Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<Box<dyn Subscription>, BusError> {
        Ok(Box::new(MemorySubscription {
            channel,
            rx: self.sender(channel).subscribe(),
        }))
    }
}

/// Subscription handle returned by [`InMemoryBus`]
pub struct MemorySubscription {
    channel: Channel,
    rx: broadcast::Receiver<Envelope>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Ok(envelope)) => return Ok(Some(envelope)),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(channel = %self.channel, skipped, "Subscriber lagged, messages skipped");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(BusError::Closed(self.channel))
                }
                Err(_) => return Ok(None),
            }
        }
    }
}
