//! Observability for the remediation pipeline
//!
//! Provides:
//! - Prometheus metrics aggregated from every bus channel
//! - The observability stage handler (read-only sink of all channels)
//! - Structured JSON logging of significant pipeline events

use crate::events::{
    AlertOutcome, AnalysisResult, Channel, Event, HealthAlert, Inbound, RemediationOutcome,
    RemediationStatus,
};
use crate::runner::{Emitter, StageHandler};
use crate::models::Anomaly;
use async_trait::async_trait;
use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, GaugeVec, Histogram, HistogramVec, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

const ANALYSIS_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

const CONFIDENCE_BUCKETS: &[f64] = &[0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

const REMEDIATION_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    container_cpu_percent: GaugeVec,
    container_memory_percent: GaugeVec,
    container_memory_bytes: GaugeVec,
    container_restart_count: GaugeVec,
    health_alerts: IntCounterVec,
    anomalies_detected: IntCounterVec,
    analysis_results: IntCounterVec,
    analysis_duration_seconds: Histogram,
    analysis_confidence: HistogramVec,
    remediation_attempts: IntCounterVec,
    remediation_duration_seconds: HistogramVec,
    remediation_cooldown_expiry: GaugeVec,
    alerts_sent: IntCounterVec,
    alerts_deduped: IntCounter,
    events_published: IntCounterVec,
    handler_faults: IntCounterVec,
    stage_uptime_seconds: GaugeVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        let target_labels = &["target_id", "target_name"];
        Self {
            container_cpu_percent: register_gauge_vec!(
                "remedy_container_cpu_percent",
                "Container CPU usage percentage at the last health alert",
                target_labels
            )
            .expect("Failed to register container_cpu_percent"),

            container_memory_percent: register_gauge_vec!(
                "remedy_container_memory_percent",
                "Container memory usage percentage at the last health alert",
                target_labels
            )
            .expect("Failed to register container_memory_percent"),

            container_memory_bytes: register_gauge_vec!(
                "remedy_container_memory_bytes",
                "Container memory usage in bytes at the last health alert",
                target_labels
            )
            .expect("Failed to register container_memory_bytes"),

            container_restart_count: register_gauge_vec!(
                "remedy_container_restart_count",
                "Container restart count at the last health alert",
                target_labels
            )
            .expect("Failed to register container_restart_count"),

            health_alerts: register_int_counter_vec!(
                "remedy_health_alerts_total",
                "Health alerts by target and highest anomaly severity",
                &["target_name", "severity"]
            )
            .expect("Failed to register health_alerts"),

            anomalies_detected: register_int_counter_vec!(
                "remedy_anomalies_detected_total",
                "Anomalies detected by target and type",
                &["target_name", "anomaly_type"]
            )
            .expect("Failed to register anomalies_detected"),

            analysis_results: register_int_counter_vec!(
                "remedy_analysis_results_total",
                "Analysis results by result type",
                &["result_type"]
            )
            .expect("Failed to register analysis_results"),

            analysis_duration_seconds: register_histogram!(
                "remedy_analysis_duration_seconds",
                "Time spent in the scoring function",
                ANALYSIS_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register analysis_duration_seconds"),

            analysis_confidence: register_histogram_vec!(
                "remedy_analysis_confidence",
                "Analysis confidence score",
                &["result_type"],
                CONFIDENCE_BUCKETS.to_vec()
            )
            .expect("Failed to register analysis_confidence"),

            remediation_attempts: register_int_counter_vec!(
                "remedy_remediation_attempts_total",
                "Remediation outcomes by target, action and status",
                &["target_name", "action", "status"]
            )
            .expect("Failed to register remediation_attempts"),

            remediation_duration_seconds: register_histogram_vec!(
                "remedy_remediation_duration_seconds",
                "Remediation action execution time",
                &["action"],
                REMEDIATION_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register remediation_duration_seconds"),

            remediation_cooldown_expiry: register_gauge_vec!(
                "remedy_remediation_cooldown_expiry_timestamp_seconds",
                "Unix time at which the target's current cooldown window ends",
                &["target_id"]
            )
            .expect("Failed to register remediation_cooldown_expiry"),

            alerts_sent: register_int_counter_vec!(
                "remedy_alerts_sent_total",
                "Notification attempts by channel and status",
                &["channel", "status"]
            )
            .expect("Failed to register alerts_sent"),

            alerts_deduped: register_int_counter!(
                "remedy_alerts_deduped_total",
                "Notifications suppressed by the dedup gate"
            )
            .expect("Failed to register alerts_deduped"),

            events_published: register_int_counter_vec!(
                "remedy_events_published_total",
                "Events published by this process",
                &["channel"]
            )
            .expect("Failed to register events_published"),

            handler_faults: register_int_counter_vec!(
                "remedy_handler_faults_total",
                "Messages dropped because the stage handler failed",
                &["stage"]
            )
            .expect("Failed to register handler_faults"),

            stage_uptime_seconds: register_gauge_vec!(
                "remedy_stage_uptime_seconds",
                "Seconds since the stage loop started",
                &["stage"]
            )
            .expect("Failed to register stage_uptime_seconds"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn record_health_alert(&self, alert: &HealthAlert) {
        let m = self.inner();
        let target = [alert.target.id.as_str(), alert.target.name.as_str()];
        let snapshot = &alert.snapshot;
        m.container_cpu_percent
            .with_label_values(&target)
            .set(snapshot.cpu_percent);
        m.container_memory_percent
            .with_label_values(&target)
            .set(snapshot.memory_percent);
        m.container_memory_bytes
            .with_label_values(&target)
            .set(snapshot.memory_bytes as f64);
        m.container_restart_count
            .with_label_values(&target)
            .set(snapshot.restart_count as f64);

        if let Some(severity) = alert.highest_severity() {
            m.health_alerts
                .with_label_values(&[alert.target.name.as_str(), severity.as_str()])
                .inc();
        }
        for anomaly in &alert.anomalies {
            m.anomalies_detected
                .with_label_values(&[alert.target.name.as_str(), anomaly.anomaly_type.as_str()])
                .inc();
        }
    }

    pub fn record_analysis(&self, result: &AnalysisResult) {
        let m = self.inner();
        let result_type = result.result_type.as_str();
        m.analysis_results.with_label_values(&[result_type]).inc();
        m.analysis_duration_seconds.observe(result.analysis_duration);
        m.analysis_confidence
            .with_label_values(&[result_type])
            .observe(result.confidence);
    }

    pub fn record_remediation(&self, outcome: &RemediationOutcome, observed_at: i64) {
        let m = self.inner();
        m.remediation_attempts
            .with_label_values(&[
                outcome.target.name.as_str(),
                outcome.action.as_str(),
                outcome.status.as_str(),
            ])
            .inc();

        match outcome.status {
            RemediationStatus::Started => {
                if let Some(cooldown) = outcome.cooldown_secs {
                    m.remediation_cooldown_expiry
                        .with_label_values(&[outcome.target.id.as_str()])
                        .set((observed_at + cooldown as i64) as f64);
                }
            }
            RemediationStatus::Succeeded | RemediationStatus::Failed if outcome.duration > 0.0 => {
                m.remediation_duration_seconds
                    .with_label_values(&[outcome.action.as_str()])
                    .observe(outcome.duration);
            }
            _ => {}
        }
    }

    pub fn record_alert(&self, outcome: &AlertOutcome) {
        let m = self.inner();
        m.alerts_sent
            .with_label_values(&[outcome.channel.as_str(), outcome.status.as_str()])
            .inc();
        if outcome.deduped {
            m.alerts_deduped.inc();
        }
    }

    pub fn inc_published(&self, channel: Channel) {
        self.inner()
            .events_published
            .with_label_values(&[channel.as_str()])
            .inc();
    }

    pub fn inc_handler_faults(&self, stage: &str) {
        self.inner().handler_faults.with_label_values(&[stage]).inc();
    }

    pub fn set_stage_uptime(&self, stage: &str, seconds: f64) {
        self.inner()
            .stage_uptime_seconds
            .with_label_values(&[stage])
            .set(seconds);
    }
}

/// Read-only sink of every channel
///
/// Never writes the coordination store and never emits events.
pub struct ObservabilityHandler {
    metrics: PipelineMetrics,
}

impl ObservabilityHandler {
    pub fn new(metrics: PipelineMetrics) -> Self {
        Self { metrics }
    }

    pub fn observe(&self, inbound: &Inbound) {
        match &inbound.event {
            Event::HealthAlert(alert) => self.metrics.record_health_alert(alert),
            Event::AnalysisResult(result) => self.metrics.record_analysis(result),
            Event::RemediationOutcome(outcome) => self
                .metrics
                .record_remediation(outcome, inbound.timestamp.timestamp()),
            Event::AlertOutcome(outcome) => self.metrics.record_alert(outcome),
        }
    }
}

#[async_trait]
impl StageHandler for ObservabilityHandler {
    fn name(&self) -> &'static str {
        "observability"
    }

    fn channels(&self) -> Vec<Channel> {
        Channel::ALL.to_vec()
    }

    async fn handle(&self, inbound: Inbound, _emitter: &Emitter) -> anyhow::Result<()> {
        self.observe(&inbound);
        Ok(())
    }
}

/// Structured logger for pipeline events
///
/// Every line carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct EventLogger {
    node_name: String,
}

impl EventLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, stage: &str, version: &str) {
        info!(
            event = "stage_started",
            node = %self.node_name,
            stage = %stage,
            version = %version,
            "Stage started"
        );
    }

    pub fn log_shutdown(&self, stage: &str, reason: &str) {
        info!(
            event = "stage_shutdown",
            node = %self.node_name,
            stage = %stage,
            reason = %reason,
            "Stage shutting down"
        );
    }

    pub fn log_anomaly(&self, target_id: &str, target_name: &str, anomaly: &Anomaly) {
        info!(
            event = "anomaly_detected",
            node = %self.node_name,
            target_id = %target_id,
            target_name = %target_name,
            anomaly_type = %anomaly.anomaly_type,
            severity = %anomaly.severity,
            details = %anomaly.details,
            "Anomaly detected"
        );
    }

    pub fn log_remediation(&self, outcome: &RemediationOutcome) {
        match outcome.status {
            RemediationStatus::Failed | RemediationStatus::Rejected => {
                warn!(
                    event = "remediation_outcome",
                    node = %self.node_name,
                    target_id = %outcome.target.id,
                    target_name = %outcome.target.name,
                    action = %outcome.action,
                    status = %outcome.status,
                    duration_secs = outcome.duration,
                    message = %outcome.message,
                    "Remediation did not succeed"
                );
            }
            _ => {
                info!(
                    event = "remediation_outcome",
                    node = %self.node_name,
                    target_id = %outcome.target.id,
                    target_name = %outcome.target.name,
                    action = %outcome.action,
                    status = %outcome.status,
                    duration_secs = outcome.duration,
                    "Remediation outcome"
                );
            }
        }
    }

    pub fn log_alert(&self, outcome: &AlertOutcome) {
        info!(
            event = "alert_outcome",
            node = %self.node_name,
            target_id = %outcome.target.id,
            category = %outcome.category,
            channel = %outcome.channel,
            status = %outcome.status,
            deduped = outcome.deduped,
            "Alert decision"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertStatus, ResultType};
    use crate::models::{AnomalyType, MetricSnapshot, Severity, TargetRef};
    use chrono::Utc;

    fn counter_value(name: &str, labels: &[(&str, &str)]) -> f64 {
        prometheus::gather()
            .into_iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().to_vec())
            .filter(|metric| {
                labels.iter().all(|(k, v)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|l| l.get_name() == *k && l.get_value() == *v)
                })
            })
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }

    #[test]
    fn test_observer_counts_health_alert_anomalies() {
        let handler = ObservabilityHandler::new(PipelineMetrics::new());
        let alert = HealthAlert {
            target: TargetRef::new("obs-1", "obs-target"),
            snapshot: MetricSnapshot::default(),
            anomalies: vec![
                Anomaly::new(AnomalyType::HighCpu, Severity::High, 0, ""),
                Anomaly::new(AnomalyType::RestartLoop, Severity::Critical, 0, ""),
            ],
        };

        handler.observe(&Inbound {
            timestamp: Utc::now(),
            event: Event::HealthAlert(alert),
        });

        assert_eq!(
            counter_value(
                "remedy_anomalies_detected_total",
                &[("target_name", "obs-target"), ("anomaly_type", "restart_loop")]
            ),
            1.0
        );
        assert_eq!(
            counter_value(
                "remedy_health_alerts_total",
                &[("target_name", "obs-target"), ("severity", "critical")]
            ),
            1.0
        );
    }

    #[test]
    fn test_observer_counts_deduped_alerts_per_channel() {
        let handler = ObservabilityHandler::new(PipelineMetrics::new());
        let outcome = AlertOutcome {
            target: TargetRef::new("obs-2", "obs-target-2"),
            category: "health:high_cpu".to_string(),
            channel: "obs-test-channel".to_string(),
            status: AlertStatus::Suppressed,
            deduped: true,
        };

        handler.observe(&Inbound {
            timestamp: Utc::now(),
            event: Event::AlertOutcome(outcome),
        });

        assert_eq!(
            counter_value(
                "remedy_alerts_sent_total",
                &[("channel", "obs-test-channel"), ("status", "suppressed")]
            ),
            1.0
        );
    }

    #[test]
    fn test_metrics_accept_every_event_kind() {
        let metrics = PipelineMetrics::new();
        metrics.record_analysis(&AnalysisResult {
            result_type: ResultType::RootCauseFound,
            confidence: 0.8,
            analysis_duration: 0.01,
            ..Default::default()
        });
        metrics.record_remediation(
            &RemediationOutcome {
                target: TargetRef::new("obs-3", "obs-target-3"),
                action: "restart".to_string(),
                status: RemediationStatus::Started,
                cooldown_secs: Some(60),
                ..Default::default()
            },
            1_700_000_000,
        );
        metrics.inc_published(Channel::HealthAlert);
        metrics.inc_handler_faults("test");
        metrics.set_stage_uptime("test", 1.5);
    }

    #[test]
    fn test_event_logger_creation() {
        let logger = EventLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
