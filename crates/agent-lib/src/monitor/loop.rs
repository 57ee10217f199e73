//! Monitor sampling loop
//!
//! Samples every known target on a fixed interval (plus jitter), runs the
//! classifier and publishes one health alert per target with anomalies.

use super::{AnomalyClassifier, MetricsSource, ThresholdClassifier};
use crate::events::{Event, HealthAlert};
use crate::models::TargetRef;
use crate::observability::EventLogger;
use crate::runner::Emitter;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the monitor loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling interval (default: 10 seconds)
    pub interval: Duration,
    /// Maximum jitter added to each interval (default: 1 second)
    pub jitter: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            jitter: Duration::from_secs(1),
        }
    }
}

/// Outcome of one sampling tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub sampled: usize,
    pub failed: usize,
    pub alerts: usize,
}

pub struct MonitorLoop {
    source: Arc<dyn MetricsSource>,
    classifier: Box<dyn AnomalyClassifier>,
    emitter: Emitter,
    config: MonitorConfig,
    logger: EventLogger,
}

impl MonitorLoop {
    /// Sample and classify every target once
    ///
    /// Only a failure to list targets is an error; a failing target is
    /// counted and retried on the next tick.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let targets = self
            .source
            .list_targets()
            .await
            .context("Failed to list targets")?;
        self.classifier.retain_targets(&targets);

        let mut report = TickReport::default();
        for target in &targets {
            match self.sample_target(target).await {
                Ok(published) => {
                    report.sampled += 1;
                    if published {
                        report.alerts += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(target_id = %target.id, error = %e, "Failed to sample target");
                }
            }
        }
        Ok(report)
    }

    async fn sample_target(&mut self, target: &TargetRef) -> Result<bool> {
        let mut snapshot = self.source.sample(target).await?.normalized();
        if snapshot.timestamp == 0 {
            snapshot.timestamp = Utc::now().timestamp();
        }

        let anomalies = self.classifier.classify(target, &snapshot);
        if anomalies.is_empty() {
            return Ok(false);
        }
        for anomaly in &anomalies {
            self.logger.log_anomaly(&target.id, &target.name, anomaly);
        }

        let alert = HealthAlert {
            target: target.clone(),
            snapshot,
            anomalies,
        };
        self.emitter
            .emit(Event::HealthAlert(alert))
            .await
            .context("Failed to publish health alert")?;
        Ok(true)
    }

    /// Run until `shutdown` reads `true`
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting monitor loop"
        );
        let mut tick_count = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let start = Instant::now();
            match self.tick().await {
                Ok(report) => {
                    tick_count += 1;
                    // Log tick stats periodically
                    if tick_count % 6 == 0 || report.failed > 0 {
                        debug!(
                            sampled = report.sampled,
                            failed = report.failed,
                            alerts = report.alerts,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Monitor tick complete"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Monitor tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Shutting down monitor loop");
    }

    fn next_delay(&self) -> Duration {
        // Jitter spreads replicas apart
        let jitter_ms = rand_jitter(self.config.jitter.as_millis() as u64);
        self.config.interval + Duration::from_millis(jitter_ms)
    }
}

/// Pseudo-random value in `0..max_ms`
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    now % max_ms
}

/// Builder for the monitor loop
pub struct MonitorLoopBuilder {
    source: Option<Arc<dyn MetricsSource>>,
    classifier: Option<Box<dyn AnomalyClassifier>>,
    emitter: Option<Emitter>,
    config: MonitorConfig,
    node_name: String,
}

impl MonitorLoopBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            classifier: None,
            emitter: None,
            config: MonitorConfig::default(),
            node_name: "local".to_string(),
        }
    }

    pub fn source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the default threshold classifier
    pub fn classifier(mut self, classifier: Box<dyn AnomalyClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn build(self) -> Result<MonitorLoop> {
        let source = self.source.context("Metrics source is required")?;
        let emitter = self.emitter.context("Emitter is required")?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Monitor interval must be positive");
        }

        Ok(MonitorLoop {
            source,
            classifier: self
                .classifier
                .unwrap_or_else(|| Box::new(ThresholdClassifier::default())),
            emitter,
            config: self.config,
            logger: EventLogger::new(self.node_name),
        })
    }
}

impl Default for MonitorLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, InMemoryBus};
    use crate::events::Channel;
    use crate::models::{AnomalyType, MetricSnapshot};
    use crate::monitor::{StaticSource, Thresholds};
    use crate::observability::PipelineMetrics;

    fn build(source: Arc<StaticSource>, bus: Arc<InMemoryBus>) -> MonitorLoop {
        MonitorLoopBuilder::new()
            .source(source)
            .classifier(Box::new(ThresholdClassifier::new(Thresholds {
                cpu_consecutive_samples: 1,
                ..Default::default()
            })))
            .emitter(Emitter::new(bus, PipelineMetrics::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_publishes_only_anomalous_targets() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = bus.subscribe(Channel::HealthAlert).await.unwrap();
        let source = Arc::new(StaticSource::new());
        source.set(
            TargetRef::new("c-1", "db-1"),
            MetricSnapshot {
                timestamp: 100,
                cpu_percent: 99.0,
                ..Default::default()
            },
        );
        source.set(
            TargetRef::new("c-2", "api-2"),
            MetricSnapshot {
                timestamp: 100,
                cpu_percent: 5.0,
                ..Default::default()
            },
        );

        let mut monitor = build(source, bus);
        let report = monitor.tick().await.unwrap();
        assert_eq!(
            report,
            TickReport {
                sampled: 2,
                failed: 0,
                alerts: 1
            }
        );

        let envelope = sub.recv(Duration::from_millis(100)).await.unwrap().unwrap();
        let Event::HealthAlert(alert) = Event::decode(&envelope).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(alert.target.name, "db-1");
        assert_eq!(alert.anomalies[0].anomaly_type, AnomalyType::HighCpu);
        assert!(sub.recv(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_target_does_not_stop_others() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = bus.subscribe(Channel::HealthAlert).await.unwrap();
        let source = Arc::new(StaticSource::new());
        source.fail(TargetRef::new("c-0", "broken"));
        source.set(
            TargetRef::new("c-1", "db-1"),
            MetricSnapshot {
                memory_percent: 99.0,
                ..Default::default()
            },
        );

        let mut monitor = build(source, bus);
        let report = monitor.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.alerts, 1);

        let envelope = sub.recv(Duration::from_millis(100)).await.unwrap().unwrap();
        let Event::HealthAlert(alert) = Event::decode(&envelope).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(alert.target.id, "c-1");
        // Missing timestamps are stamped at sampling time
        assert!(alert.snapshot.timestamp > 0);
    }

    #[test]
    fn test_builder_requires_source() {
        let bus = Arc::new(InMemoryBus::new());
        let result = MonitorLoopBuilder::new()
            .emitter(Emitter::new(bus, PipelineMetrics::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rand_jitter_bounds() {
        assert_eq!(rand_jitter(0), 0);
        assert!(rand_jitter(100) < 100);
    }
}
