//! Alert stage: the notification dedup gate
//!
//! Each notification-worthy event maps to a category. The dedup key hashes
//! (target id, category, time bucket) and is claimed atomically in the
//! coordination store, so across any number of replicas only one decision
//! per bucket sends. The claim lives until one window past the end of its
//! bucket; deliveries arriving later than that are stale and suppressed.
//! Channels are attempted independently and each reports its own outcome.

mod notifier;

pub use notifier::{LogNotifier, Notification, Notifier, WebhookNotifier};

use crate::events::{
    AlertOutcome, AlertStatus, AnalysisResult, Channel, Event, HealthAlert, Inbound,
    RemediationOutcome, RemediationStatus, ResultType,
};
use crate::models::Severity;
use crate::observability::EventLogger;
use crate::runner::{Emitter, StageHandler};
use crate::store::{CoordinationStore, KeyNamespace};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default dedup window (10 minutes)
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default per-channel send timeout
const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Dedup identity of one (target, category, bucket) triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub target_id: String,
    pub category: String,
    pub bucket: i64,
    pub window_secs: i64,
}

impl DedupKey {
    /// Bucket the event time into fixed windows
    pub fn new(
        target_id: &str,
        category: &str,
        event_time: DateTime<Utc>,
        window: Duration,
    ) -> Self {
        let window_secs = window.as_secs().max(1) as i64;
        Self {
            target_id: target_id.to_string(),
            category: category.to_string(),
            bucket: event_time.timestamp().div_euclid(window_secs),
            window_secs,
        }
    }

    /// Unix second at which the bucket closes
    pub fn bucket_end(&self) -> i64 {
        (self.bucket + 1).saturating_mul(self.window_secs)
    }

    /// How long the claim must live when taken at `now`
    ///
    /// `None` once `now` is a full window past the bucket's end.
    pub fn claim_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until_end = self.bucket_end().saturating_sub(now.timestamp());
        let ttl = until_end.max(0) + self.window_secs;
        if until_end + self.window_secs <= 0 {
            return None;
        }
        Some(Duration::from_secs(ttl as u64))
    }

    /// SHA-256 hex digest of the triple
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.target_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.category.as_bytes());
        hasher.update(b"|");
        hasher.update(self.bucket.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn store_key(&self) -> String {
        KeyNamespace::Dedup.key(&self.digest())
    }
}

/// Source of the current time for staleness checks
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Category, severity and summary of a notification
type Rendered = (String, Option<Severity>, String);

fn health_notification(alert: &HealthAlert, min_severity: Severity) -> Option<Rendered> {
    let primary = alert.primary_anomaly()?;
    if primary.severity < min_severity {
        return None;
    }
    let types: Vec<&str> = alert
        .anomalies
        .iter()
        .map(|a| a.anomaly_type.as_str())
        .collect();
    Some((
        format!("health:{}", primary.anomaly_type),
        Some(primary.severity),
        format!("{} anomalies: {}", types.len(), types.join(", ")),
    ))
}

fn analysis_notification(result: &AnalysisResult) -> Option<Rendered> {
    match result.result_type {
        ResultType::RootCauseFound => Some((
            format!("analysis:{}", result.result_type),
            None,
            match &result.recommended_action {
                Some(action) => format!(
                    "{} (confidence {:.2}), recommending {}",
                    result.root_cause, result.confidence, action
                ),
                None => format!("{} (confidence {:.2})", result.root_cause, result.confidence),
            },
        )),
        ResultType::Error => Some((
            format!("analysis:{}", result.result_type),
            None,
            result.root_cause.clone(),
        )),
        ResultType::Inconclusive => None,
    }
}

fn remediation_notification(outcome: &RemediationOutcome) -> Option<Rendered> {
    let severity = match outcome.status {
        RemediationStatus::Succeeded => Severity::Low,
        RemediationStatus::Failed => Severity::High,
        RemediationStatus::Rejected => Severity::Medium,
        RemediationStatus::Started | RemediationStatus::SkippedCooldown => return None,
    };
    Some((
        format!("remediation:{}", outcome.status),
        Some(severity),
        format!("{}: {}", outcome.action, outcome.message),
    ))
}

/// Map an event to the notification it warrants, if any
pub fn notification_for(inbound: &Inbound, min_severity: Severity) -> Option<Notification> {
    let (category, severity, summary) = match &inbound.event {
        Event::HealthAlert(alert) => health_notification(alert, min_severity)?,
        Event::AnalysisResult(result) => analysis_notification(result)?,
        Event::RemediationOutcome(outcome) => remediation_notification(outcome)?,
        Event::AlertOutcome(_) => return None,
    };
    Some(Notification {
        target: inbound.event.target().clone(),
        category,
        severity,
        summary,
        timestamp: inbound.timestamp,
    })
}

pub struct AlertHandler {
    store: Arc<dyn CoordinationStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
    dedup_window: Duration,
    min_severity: Severity,
    notify_timeout: Duration,
    logger: EventLogger,
    clock: Clock,
}

impl AlertHandler {
    pub fn new(store: Arc<dyn CoordinationStore>, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            store,
            notifiers,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            min_severity: Severity::Medium,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            logger: EventLogger::new("local"),
            clock: Arc::new(Utc::now),
        }
    }

    /// Set the dedup window; zero is raised to one second
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window.max(Duration::from_secs(1));
        self
    }

    /// Lowest health-alert severity that notifies
    pub fn with_min_severity(mut self, min_severity: Severity) -> Self {
        self.min_severity = min_severity;
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn with_logger(mut self, logger: EventLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Apply the dedup gate and fan out; returns one outcome per channel
    pub async fn process(&self, inbound: &Inbound) -> Result<Vec<AlertOutcome>> {
        let Some(notification) = notification_for(inbound, self.min_severity) else {
            return Ok(Vec::new());
        };

        let key = DedupKey::new(
            &notification.target.id,
            &notification.category,
            notification.timestamp,
            self.dedup_window,
        );
        let marker = json!({
            "target_id": key.target_id,
            "category": key.category,
            "bucket": key.bucket,
        })
        .to_string();

        let Some(ttl) = key.claim_ttl((self.clock)()) else {
            warn!(
                target_id = %notification.target.id,
                category = %notification.category,
                bucket = key.bucket,
                "Stale notification suppressed"
            );
            return Ok(self.suppressed(&notification));
        };
        let first = self
            .store
            .claim(&key.store_key(), &marker, ttl)
            .await
            .context("Dedup claim failed")?;

        if !first {
            debug!(
                target_id = %notification.target.id,
                category = %notification.category,
                bucket = key.bucket,
                "Duplicate notification suppressed"
            );
            return Ok(self.suppressed(&notification));
        }

        Ok(self.fan_out(notification).await)
    }

    fn suppressed(&self, notification: &Notification) -> Vec<AlertOutcome> {
        self.notifiers
            .iter()
            .map(|n| self.outcome(notification, n.channel(), AlertStatus::Suppressed, true))
            .collect()
    }

    async fn fan_out(&self, notification: Notification) -> Vec<AlertOutcome> {
        let shared = Arc::new(notification);
        let handles: Vec<_> = self
            .notifiers
            .iter()
            .map(|notifier| {
                let notifier = notifier.clone();
                let notification = shared.clone();
                let timeout = self.notify_timeout;
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, notifier.send(&notification)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
                    }
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (notifier, handle) in self.notifiers.iter().zip(handles) {
            let status = match handle.await {
                Ok(Ok(())) => AlertStatus::Sent,
                Ok(Err(e)) => {
                    warn!(channel = %notifier.channel(), error = %e, "Notification failed");
                    AlertStatus::Failed
                }
                Err(e) => {
                    warn!(channel = %notifier.channel(), panicked = e.is_panic(), "Notifier aborted");
                    AlertStatus::Failed
                }
            };
            outcomes.push(self.outcome(&shared, notifier.channel(), status, false));
        }
        outcomes
    }

    fn outcome(
        &self,
        notification: &Notification,
        channel: &str,
        status: AlertStatus,
        deduped: bool,
    ) -> AlertOutcome {
        AlertOutcome {
            target: notification.target.clone(),
            category: notification.category.clone(),
            channel: channel.to_string(),
            status,
            deduped,
        }
    }
}

#[async_trait]
impl StageHandler for AlertHandler {
    fn name(&self) -> &'static str {
        "alert"
    }

    fn channels(&self) -> Vec<Channel> {
        vec![
            Channel::HealthAlert,
            Channel::AnalysisResult,
            Channel::RemediationOutcome,
        ]
    }

    async fn handle(&self, inbound: Inbound, emitter: &Emitter) -> Result<()> {
        for outcome in self.process(&inbound).await? {
            self.logger.log_alert(&outcome);
            emitter.emit(Event::AlertOutcome(outcome)).await?;
        }
        Ok(())
    }
}
