//! Monitor stage: sample targets, classify anomalies, publish health alerts
//!
//! Sampling is delegated to a [`MetricsSource`] (the container runtime
//! poller) and classification to an [`AnomalyClassifier`]. A tick with no
//! anomalies for a target publishes nothing; silence is the healthy signal.

mod classifier;
mod r#loop;
mod source;

pub use classifier::{RollingStats, ThresholdClassifier, Thresholds};
pub use r#loop::{MonitorConfig, MonitorLoop, MonitorLoopBuilder, TickReport};
pub use source::{JsonFileSource, StaticSource};

use crate::models::{Anomaly, MetricSnapshot, TargetRef};
use anyhow::Result;
use async_trait::async_trait;

/// Producer of raw per-target readings
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Targets currently known to the runtime
    async fn list_targets(&self) -> Result<Vec<TargetRef>>;

    /// Take one reading for `target`
    async fn sample(&self, target: &TargetRef) -> Result<MetricSnapshot>;
}

/// Turns successive snapshots of a target into anomalies
///
/// Implementations keep per-target history, so calls for one target must
/// arrive in sampling order.
pub trait AnomalyClassifier: Send {
    fn classify(&mut self, target: &TargetRef, snapshot: &MetricSnapshot) -> Vec<Anomaly>;

    /// Drop history for targets no longer reported by the source
    fn retain_targets(&mut self, live: &[TargetRef]);
}
