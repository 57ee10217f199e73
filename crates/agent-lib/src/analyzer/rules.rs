//! Rule-based default scorer
//!
//! The most severe anomaly names the root cause and picks the action.
//! Confidence comes from the severity weight, plus a small bonus for each
//! corroborating anomaly.

use super::{Scorer, Verdict};
use crate::events::{HealthAlert, ResultType};
use crate::models::{AnomalyType, Severity};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Bonus per additional anomaly in the same alert
const CORROBORATION_BONUS: f64 = 0.05;

/// Confidence assigned to each severity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            low: 0.3,
            medium: 0.55,
            high: 0.75,
            critical: 0.9,
        }
    }
}

impl SeverityWeights {
    pub fn weight(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleScorer {
    weights: SeverityWeights,
    min_confidence: f64,
}

impl RuleScorer {
    pub fn new(weights: SeverityWeights, min_confidence: f64) -> Self {
        Self {
            weights,
            min_confidence,
        }
    }

    /// Reject input no sane runtime reading could produce
    fn validate(alert: &HealthAlert) -> Result<()> {
        let s = &alert.snapshot;
        if alert.anomalies.is_empty() {
            bail!("health alert carries no anomalies");
        }
        if !s.cpu_percent.is_finite() || !s.memory_percent.is_finite() {
            bail!("snapshot has non-finite percentages");
        }
        if s.memory_limit_bytes > 0 && s.memory_bytes > s.memory_limit_bytes {
            bail!(
                "snapshot memory {} exceeds limit {}",
                s.memory_bytes,
                s.memory_limit_bytes
            );
        }
        Ok(())
    }

    fn action_for(anomaly_type: AnomalyType, severity: Severity) -> Option<&'static str> {
        match anomaly_type {
            AnomalyType::HighMemory | AnomalyType::MemoryGrowth => Some("restart"),
            AnomalyType::RestartLoop if severity == Severity::Critical => Some("restart"),
            AnomalyType::HighCpu => Some("scale"),
            AnomalyType::NetworkSpike | AnomalyType::DiskIoSpike
                if severity == Severity::Critical =>
            {
                Some("isolate")
            }
            _ => None,
        }
    }
}

impl Default for RuleScorer {
    fn default() -> Self {
        Self::new(SeverityWeights::default(), 0.5)
    }
}

impl Scorer for RuleScorer {
    fn score(&self, alert: &HealthAlert) -> Result<Verdict> {
        Self::validate(alert)?;
        let Some(primary) = alert.primary_anomaly() else {
            bail!("health alert carries no anomalies");
        };

        let corroborating = alert.anomalies.len().saturating_sub(1) as f64;
        let confidence =
            (self.weights.weight(primary.severity) + corroborating * CORROBORATION_BONUS).min(1.0);
        let root_cause = if primary.details.is_empty() {
            format!("{} ({})", primary.anomaly_type, primary.severity)
        } else {
            format!(
                "{} ({}): {}",
                primary.anomaly_type, primary.severity, primary.details
            )
        };

        if confidence < self.min_confidence {
            return Ok(Verdict {
                result_type: ResultType::Inconclusive,
                confidence,
                root_cause,
                recommended_action: None,
            });
        }

        Ok(Verdict {
            result_type: ResultType::RootCauseFound,
            confidence,
            root_cause,
            recommended_action: Self::action_for(primary.anomaly_type, primary.severity)
                .map(str::to_string),
        })
    }
}
