//! Generic stage event loop
//!
//! A [`StageRunner`] owns the bus subscriptions of one stage and feeds every
//! decoded event to an injected [`StageHandler`]. Handler errors and panics
//! are logged and the message is dropped; the loop itself only ends when
//! the shutdown flag is raised.

use crate::bus::{BusError, EventBus, Subscription};
use crate::events::{Channel, DecodeError, Envelope, Event, Inbound};
use crate::observability::PipelineMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default bound on a single wait for the next message
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Lower bound for one subscription's share of the poll timeout
const MIN_POLL_SLICE: Duration = Duration::from_millis(10);

/// Stage-specific logic plugged into the runner
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    /// Stage name used in logs and metric labels
    fn name(&self) -> &'static str;

    /// Channels this stage consumes
    fn channels(&self) -> Vec<Channel>;

    /// Process one delivered event, publishing any outputs via `emitter`
    ///
    /// Must be idempotent: the bus may deliver the same event more than once.
    async fn handle(&self, inbound: Inbound, emitter: &Emitter) -> Result<()>;

    /// Offered every envelope whose payload failed to decode
    ///
    /// Returns `true` when the handler dealt with it; the default declines
    /// and the runner counts a fault.
    async fn handle_undecodable(
        &self,
        _envelope: &Envelope,
        _error: &DecodeError,
        _emitter: &Emitter,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Publishing handle given to handlers
#[derive(Clone)]
pub struct Emitter {
    bus: Arc<dyn EventBus>,
    metrics: PipelineMetrics,
}

impl Emitter {
    pub fn new(bus: Arc<dyn EventBus>, metrics: PipelineMetrics) -> Self {
        Self { bus, metrics }
    }

    /// Publish `event` stamped with the current time
    pub async fn emit(&self, event: Event) -> Result<(), BusError> {
        self.emit_at(event, Utc::now()).await
    }

    pub async fn emit_at(&self, event: Event, timestamp: DateTime<Utc>) -> Result<(), BusError> {
        let channel = event.channel();
        let envelope = event
            .to_envelope(timestamp)
            .map_err(|e| BusError::Transport(e.to_string()))?;
        self.bus.publish(channel, envelope).await?;
        self.metrics.inc_published(channel);
        debug!(channel = %channel, target_id = %event.target().id, "Published event");
        Ok(())
    }
}

/// Counters returned when a runner stops
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunnerStats {
    pub received: u64,
    pub handled: u64,
    pub faults: u64,
}

/// Event loop for one stage
pub struct StageRunner<H: StageHandler> {
    handler: Arc<H>,
    bus: Arc<dyn EventBus>,
    poll_timeout: Duration,
    metrics: PipelineMetrics,
}

impl<H: StageHandler> StageRunner<H> {
    pub fn new(handler: Arc<H>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            handler,
            bus,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Bound on one wait for the next message; zero is raised to the minimum
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout.max(MIN_POLL_SLICE);
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Subscribe to every channel the handler consumes
    ///
    /// Failing here is a transport fault; callers treat it as fatal at
    /// startup since nothing has been consumed yet.
    pub async fn subscribe(self) -> Result<SubscribedRunner<H>> {
        let stage = self.handler.name();
        let channels = self.handler.channels();
        if channels.is_empty() {
            anyhow::bail!("Stage {} consumes no channels", stage);
        }

        let mut subscriptions = Vec::with_capacity(channels.len());
        for channel in &channels {
            let sub = self
                .bus
                .subscribe(*channel)
                .await
                .with_context(|| format!("Failed to subscribe {} to {}", stage, channel))?;
            subscriptions.push(sub);
        }

        Ok(SubscribedRunner {
            runner: self,
            channels,
            subscriptions,
        })
    }

    /// Subscribe, then run until `shutdown` reads `true`
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<RunnerStats> {
        Ok(self.subscribe().await?.run(shutdown).await)
    }
}

/// A runner whose subscriptions are in place
pub struct SubscribedRunner<H: StageHandler> {
    runner: StageRunner<H>,
    channels: Vec<Channel>,
    subscriptions: Vec<Box<dyn Subscription>>,
}

impl<H: StageHandler> SubscribedRunner<H> {
    /// Run until `shutdown` reads `true`
    ///
    /// The in-flight handler always completes before the loop observes the
    /// flag.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> RunnerStats {
        let SubscribedRunner {
            runner,
            channels,
            mut subscriptions,
        } = self;
        let stage = runner.handler.name();

        info!(
            stage = %stage,
            channels = ?channels,
            poll_timeout_ms = runner.poll_timeout.as_millis() as u64,
            "Starting stage loop"
        );

        let emitter = Emitter::new(runner.bus.clone(), runner.metrics.clone());
        let slice = (runner.poll_timeout / subscriptions.len() as u32).max(MIN_POLL_SLICE);
        let started = Instant::now();
        let mut stats = RunnerStats::default();

        'outer: loop {
            for idx in 0..subscriptions.len() {
                if *shutdown.borrow() {
                    break 'outer;
                }
                runner
                    .metrics
                    .set_stage_uptime(stage, started.elapsed().as_secs_f64());

                match subscriptions[idx].recv(slice).await {
                    Ok(Some(envelope)) => {
                        stats.received += 1;
                        let inbound = match Inbound::decode(&envelope) {
                            Ok(inbound) => inbound,
                            Err(e) => {
                                if runner.recover(&envelope, &e, &emitter).await {
                                    stats.handled += 1;
                                } else {
                                    stats.faults += 1;
                                    runner.metrics.inc_handler_faults(stage);
                                }
                                continue;
                            }
                        };
                        if runner.dispatch(inbound, &emitter).await {
                            stats.handled += 1;
                        } else {
                            stats.faults += 1;
                            runner.metrics.inc_handler_faults(stage);
                        }
                    }
                    Ok(None) => {}
                    Err(BusError::Closed(channel)) => {
                        warn!(stage = %stage, channel = %channel, "Subscription closed, resubscribing");
                        match runner.bus.subscribe(channel).await {
                            Ok(sub) => subscriptions[idx] = sub,
                            Err(e) => {
                                error!(stage = %stage, channel = %channel, error = %e, "Resubscribe failed");
                                tokio::time::sleep(slice).await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(stage = %stage, error = %e, "Bus receive failed");
                        tokio::time::sleep(slice).await;
                    }
                }
            }
        }

        info!(
            stage = %stage,
            received = stats.received,
            handled = stats.handled,
            faults = stats.faults,
            "Stage loop stopped"
        );
        stats
    }
}

impl<H: StageHandler> StageRunner<H> {
    /// Offer an undecodable envelope to the handler; `false` drops it
    async fn recover(&self, envelope: &Envelope, error: &DecodeError, emitter: &Emitter) -> bool {
        let stage = self.handler.name();
        match self.handler.handle_undecodable(envelope, error, emitter).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    stage = %stage,
                    event_type = %envelope.event_type,
                    error = %error,
                    "Dropping undecodable event"
                );
                false
            }
            Err(e) => {
                warn!(
                    stage = %stage,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Undecodable event handling failed"
                );
                false
            }
        }
    }

    /// Run the handler on its own task so a panic is contained
    async fn dispatch(&self, inbound: Inbound, emitter: &Emitter) -> bool {
        let stage = self.handler.name();
        let channel = inbound.event.channel();
        let target_id = inbound.event.target().id.clone();
        let handler = self.handler.clone();
        let emitter = emitter.clone();

        let joined = tokio::spawn(async move { handler.handle(inbound, &emitter).await }).await;
        match joined {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    stage = %stage,
                    channel = %channel,
                    target_id = %target_id,
                    error = %e,
                    "Handler failed, dropping message"
                );
                false
            }
            Err(e) => {
                error!(
                    stage = %stage,
                    channel = %channel,
                    target_id = %target_id,
                    panicked = e.is_panic(),
                    "Handler aborted, dropping message"
                );
                false
            }
        }
    }
}
