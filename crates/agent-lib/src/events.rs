//! Event contracts between pipeline stages
//!
//! Every message on the bus is an [`Envelope`] `{type, timestamp, data}`.
//! `data` is decoded at the bus boundary into the typed payload of its
//! channel. Missing fields are filled from the payload's defaults and the
//! defaulted field names are logged; nothing is coerced silently.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{clamp_unit, Anomaly, MetricSnapshot, Severity, TargetRef};

/// Named bus channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    HealthAlert,
    AnalysisResult,
    RemediationOutcome,
    AlertOutcome,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::HealthAlert,
        Channel::AnalysisResult,
        Channel::RemediationOutcome,
        Channel::AlertOutcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::HealthAlert => "health_alert",
            Channel::AnalysisResult => "analysis_result",
            Channel::RemediationOutcome => "remediation_outcome",
            Channel::AlertOutcome => "alert_outcome",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

/// Errors raised while decoding an envelope at the bus boundary
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("event data for {0} is not a JSON object")]
    NotAnObject(Channel),
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire envelope shared by every channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Envelope {
    pub fn new(channel: Channel, timestamp: DateTime<Utc>, data: Value) -> Self {
        Self {
            event_type: channel.as_str().to_string(),
            timestamp,
            data,
        }
    }
}

/// A typed channel payload
pub trait Payload: Serialize + DeserializeOwned + Default {
    const CHANNEL: Channel;

    /// Bring decoded values back into their declared ranges
    fn normalize(&mut self) {}
}

/// Monitor output: one per target with at least one anomaly per tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub target: TargetRef,
    pub snapshot: MetricSnapshot,
    pub anomalies: Vec<Anomaly>,
}

impl HealthAlert {
    pub fn highest_severity(&self) -> Option<Severity> {
        self.anomalies.iter().map(|a| a.severity).max()
    }

    /// The most severe anomaly; the earliest one wins ties
    pub fn primary_anomaly(&self) -> Option<&Anomaly> {
        self.anomalies
            .iter()
            .fold(None, |best: Option<&Anomaly>, a| match best {
                Some(b) if b.severity >= a.severity => Some(b),
                _ => Some(a),
            })
    }
}

impl Payload for HealthAlert {
    const CHANNEL: Channel = Channel::HealthAlert;

    fn normalize(&mut self) {
        self.snapshot.normalize();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    RootCauseFound,
    Inconclusive,
    #[default]
    Error,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::RootCauseFound => "root_cause_found",
            ResultType::Inconclusive => "inconclusive",
            ResultType::Error => "error",
        }
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analyzer output: exactly one per consumed health alert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub target: TargetRef,
    pub result_type: ResultType,
    /// Always within [0.0, 1.0]
    pub confidence: f64,
    pub root_cause: String,
    pub recommended_action: Option<String>,
    /// Seconds spent in the scoring function
    pub analysis_duration: f64,
    /// Snapshot timestamp of the alert this result answers
    pub source_timestamp: i64,
}

impl Payload for AnalysisResult {
    const CHANNEL: Channel = Channel::AnalysisResult;

    fn normalize(&mut self) {
        self.confidence = clamp_unit(self.confidence);
        if !self.analysis_duration.is_finite() || self.analysis_duration < 0.0 {
            self.analysis_duration = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Started,
    Succeeded,
    #[default]
    Failed,
    SkippedCooldown,
    Rejected,
}

impl RemediationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationStatus::Started => "started",
            RemediationStatus::Succeeded => "succeeded",
            RemediationStatus::Failed => "failed",
            RemediationStatus::SkippedCooldown => "skipped_cooldown",
            RemediationStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Responder output: one per remediation attempt, skip or rejection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub target: TargetRef,
    pub action: String,
    pub status: RemediationStatus,
    /// Seconds spent executing the action (0 unless finished)
    pub duration: f64,
    /// Cooldown window claimed by a `started` outcome
    pub cooldown_secs: Option<u64>,
    pub message: String,
}

impl Payload for RemediationOutcome {
    const CHANNEL: Channel = Channel::RemediationOutcome;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Sent,
    #[default]
    Failed,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
            AlertStatus::Suppressed => "suppressed",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert output: one per notification channel per decision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertOutcome {
    pub target: TargetRef,
    pub category: String,
    pub channel: String,
    pub status: AlertStatus,
    pub deduped: bool,
}

impl Payload for AlertOutcome {
    const CHANNEL: Channel = Channel::AlertOutcome;
}

/// A decoded payload of any channel
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    HealthAlert(HealthAlert),
    AnalysisResult(AnalysisResult),
    RemediationOutcome(RemediationOutcome),
    AlertOutcome(AlertOutcome),
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::HealthAlert(_) => Channel::HealthAlert,
            Event::AnalysisResult(_) => Channel::AnalysisResult,
            Event::RemediationOutcome(_) => Channel::RemediationOutcome,
            Event::AlertOutcome(_) => Channel::AlertOutcome,
        }
    }

    pub fn target(&self) -> &TargetRef {
        match self {
            Event::HealthAlert(e) => &e.target,
            Event::AnalysisResult(e) => &e.target,
            Event::RemediationOutcome(e) => &e.target,
            Event::AlertOutcome(e) => &e.target,
        }
    }

    /// Wrap the payload in an envelope stamped with `timestamp`
    pub fn to_envelope(&self, timestamp: DateTime<Utc>) -> Result<Envelope, DecodeError> {
        let data = match self {
            Event::HealthAlert(e) => serde_json::to_value(e)?,
            Event::AnalysisResult(e) => serde_json::to_value(e)?,
            Event::RemediationOutcome(e) => serde_json::to_value(e)?,
            Event::AlertOutcome(e) => serde_json::to_value(e)?,
        };
        Ok(Envelope::new(self.channel(), timestamp, data))
    }

    pub fn decode(envelope: &Envelope) -> Result<Self, DecodeError> {
        let channel: Channel = envelope.event_type.parse()?;
        let event = match channel {
            Channel::HealthAlert => Event::HealthAlert(decode_payload(&envelope.data)?),
            Channel::AnalysisResult => Event::AnalysisResult(decode_payload(&envelope.data)?),
            Channel::RemediationOutcome => {
                Event::RemediationOutcome(decode_payload(&envelope.data)?)
            }
            Channel::AlertOutcome => Event::AlertOutcome(decode_payload(&envelope.data)?),
        };
        Ok(event)
    }
}

/// A decoded event together with its envelope timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl Inbound {
    pub fn decode(envelope: &Envelope) -> Result<Self, DecodeError> {
        Ok(Self {
            timestamp: envelope.timestamp,
            event: Event::decode(envelope)?,
        })
    }
}

/// Decode `data` into `P`, defaulting (and logging) absent fields
pub fn decode_payload<P: Payload>(data: &Value) -> Result<P, DecodeError> {
    let Value::Object(provided) = data else {
        return Err(DecodeError::NotAnObject(P::CHANNEL));
    };
    let Value::Object(defaults) = serde_json::to_value(P::default())? else {
        return Err(DecodeError::NotAnObject(P::CHANNEL));
    };

    let defaulted: Vec<&str> = defaults
        .iter()
        .filter(|(k, v)| !v.is_null() && !provided.contains_key(*k))
        .map(|(k, _)| k.as_str())
        .collect();
    if !defaulted.is_empty() {
        warn!(channel = %P::CHANNEL, fields = ?defaulted, "Defaulted missing event fields");
    }

    let ignored: Vec<&str> = provided
        .keys()
        .filter(|k| !defaults.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !ignored.is_empty() {
        debug!(channel = %P::CHANNEL, fields = ?ignored, "Ignoring unknown event fields");
    }

    let mut merged = Map::with_capacity(defaults.len());
    for (key, default) in &defaults {
        let value = provided.get(key).unwrap_or(default).clone();
        merged.insert(key.clone(), value);
    }

    let mut payload: P = serde_json::from_value(Value::Object(merged))?;
    payload.normalize();
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnomalyType;
    use serde_json::json;

    fn sample_alert() -> HealthAlert {
        HealthAlert {
            target: TargetRef::new("c-1", "web-1"),
            snapshot: MetricSnapshot {
                timestamp: 1_700_000_000,
                cpu_percent: 91.0,
                memory_percent: 40.0,
                ..Default::default()
            },
            anomalies: vec![
                Anomaly::new(AnomalyType::HighCpu, Severity::High, 1_700_000_000, "cpu"),
                Anomaly::new(AnomalyType::RestartLoop, Severity::High, 1_700_000_000, "r"),
            ],
        }
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!(
            "remediation_outcome".parse::<Channel>().unwrap(),
            Channel::RemediationOutcome
        );
        assert!("health-alert".parse::<Channel>().is_err());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let event = Event::HealthAlert(sample_alert());
        let envelope = event.to_envelope(Utc::now()).unwrap();
        let wire = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["type"], "health_alert");
        assert!(wire["timestamp"].is_string());
        assert_eq!(wire["data"]["target"]["name"], "web-1");
        assert_eq!(wire["data"]["anomalies"][0]["type"], "high_cpu");
    }

    #[test]
    fn test_decode_defaults_missing_fields() {
        let envelope = Envelope::new(
            Channel::AnalysisResult,
            Utc::now(),
            json!({
                "target": {"id": "c-9", "name": "db-9"},
                "confidence": 0.7,
                "unexpected": true
            }),
        );

        let Event::AnalysisResult(result) = Event::decode(&envelope).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(result.target.id, "c-9");
        assert_eq!(result.result_type, ResultType::Error);
        assert_eq!(result.recommended_action, None);
        assert_eq!(result.analysis_duration, 0.0);
    }

    #[test]
    fn test_decode_clamps_confidence() {
        let envelope = Envelope::new(
            Channel::AnalysisResult,
            Utc::now(),
            json!({"result_type": "root_cause_found", "confidence": 4.2}),
        );

        let Event::AnalysisResult(result) = Event::decode(&envelope).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_decode_rejects_non_object_data() {
        let envelope = Envelope::new(Channel::AlertOutcome, Utc::now(), json!([1, 2, 3]));
        assert!(matches!(
            Event::decode(&envelope),
            Err(DecodeError::NotAnObject(Channel::AlertOutcome))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let envelope = Envelope {
            event_type: "heartbeat".to_string(),
            timestamp: Utc::now(),
            data: json!({}),
        };
        assert!(matches!(
            Event::decode(&envelope),
            Err(DecodeError::UnknownType(_))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_field_type() {
        let envelope = Envelope::new(
            Channel::AlertOutcome,
            Utc::now(),
            json!({"deduped": "maybe"}),
        );
        assert!(matches!(Event::decode(&envelope), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_primary_anomaly_prefers_earliest_on_tie() {
        let alert = sample_alert();
        let primary = alert.primary_anomaly().unwrap();
        assert_eq!(primary.anomaly_type, AnomalyType::HighCpu);
        assert_eq!(alert.highest_severity(), Some(Severity::High));
    }

    #[test]
    fn test_health_alert_decode_clamps_snapshot() {
        let envelope = Envelope::new(
            Channel::HealthAlert,
            Utc::now(),
            json!({
                "target": {"id": "c-1", "name": "web-1"},
                "snapshot": {"cpu_percent": 180.0},
                "anomalies": []
            }),
        );
        let Event::HealthAlert(alert) = Event::decode(&envelope).unwrap() else {
            panic!("wrong event kind");
        };
        assert_eq!(alert.snapshot.cpu_percent, 100.0);
    }
}
