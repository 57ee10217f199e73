//! Analyzer stage: one analysis result per health alert
//!
//! The scoring function is pluggable ([`Scorer`]). Whatever it returns is
//! forced into range, and a scorer that errors or panics yields an `error`
//! result with zero confidence instead of a stage fault. So does a health
//! alert whose snapshot cannot be decoded, as long as its target can.

mod rules;

pub use rules::{RuleScorer, SeverityWeights};

use crate::events::{
    AnalysisResult, Channel, DecodeError, Envelope, Event, HealthAlert, Inbound, ResultType,
};
use crate::models::{clamp_unit, TargetRef};
use crate::runner::{Emitter, StageHandler};
use anyhow::Result;
use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Raw scorer output before range enforcement
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub result_type: ResultType,
    pub confidence: f64,
    pub root_cause: String,
    pub recommended_action: Option<String>,
}

/// Root-cause scoring function
///
/// Must be a pure function of the alert: redelivered alerts are rescored.
pub trait Scorer: Send + Sync + 'static {
    fn score(&self, alert: &HealthAlert) -> Result<Verdict>;
}

pub struct AnalyzerHandler {
    scorer: Arc<dyn Scorer>,
}

impl AnalyzerHandler {
    pub fn new(scorer: Arc<dyn Scorer>) -> Self {
        Self { scorer }
    }

    /// Score `alert` and build the result published for it
    pub fn analyze(&self, alert: &HealthAlert) -> AnalysisResult {
        let start = Instant::now();
        let scored = catch_unwind(AssertUnwindSafe(|| self.scorer.score(alert)));
        let analysis_duration = start.elapsed().as_secs_f64();

        let verdict = match scored {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!(target_id = %alert.target.id, error = %e, "Scorer failed");
                failed_verdict(format!("analysis failed: {}", e))
            }
            Err(_) => {
                warn!(target_id = %alert.target.id, "Scorer panicked");
                failed_verdict("analysis failed: scorer panicked".to_string())
            }
        };

        let recommended_action = match verdict.result_type {
            ResultType::RootCauseFound => verdict
                .recommended_action
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            _ => None,
        };
        let confidence = match verdict.result_type {
            ResultType::Error => 0.0,
            _ => clamp_unit(verdict.confidence),
        };

        AnalysisResult {
            target: alert.target.clone(),
            result_type: verdict.result_type,
            confidence,
            root_cause: verdict.root_cause,
            recommended_action,
            analysis_duration,
            source_timestamp: alert.snapshot.timestamp,
        }
    }
}

/// Error result for a health alert whose payload could not be decoded
///
/// `None` unless the envelope is a health alert with a readable target.
pub fn undecodable_result(envelope: &Envelope, error: &DecodeError) -> Option<AnalysisResult> {
    if envelope.event_type != Channel::HealthAlert.as_str() {
        return None;
    }
    let target: TargetRef = serde_json::from_value(envelope.data.get("target")?.clone()).ok()?;
    if target.id.is_empty() {
        return None;
    }
    let source_timestamp = envelope
        .data
        .get("snapshot")
        .and_then(|s| s.get("timestamp"))
        .and_then(|t| t.as_i64())
        .unwrap_or_else(|| envelope.timestamp.timestamp());

    Some(AnalysisResult {
        target,
        result_type: ResultType::Error,
        confidence: 0.0,
        root_cause: format!("analysis failed: {}", error),
        recommended_action: None,
        analysis_duration: 0.0,
        source_timestamp,
    })
}

fn failed_verdict(root_cause: String) -> Verdict {
    Verdict {
        result_type: ResultType::Error,
        confidence: 0.0,
        root_cause,
        recommended_action: None,
    }
}

#[async_trait]
impl StageHandler for AnalyzerHandler {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    fn channels(&self) -> Vec<Channel> {
        vec![Channel::HealthAlert]
    }

    async fn handle(&self, inbound: Inbound, emitter: &Emitter) -> Result<()> {
        let Event::HealthAlert(alert) = inbound.event else {
            return Ok(());
        };

        let result = self.analyze(&alert);
        debug!(
            target_id = %result.target.id,
            result_type = %result.result_type,
            confidence = result.confidence,
            action = ?result.recommended_action,
            "Analysis complete"
        );
        emitter.emit(Event::AnalysisResult(result)).await?;
        Ok(())
    }

    async fn handle_undecodable(
        &self,
        envelope: &Envelope,
        error: &DecodeError,
        emitter: &Emitter,
    ) -> Result<bool> {
        let Some(result) = undecodable_result(envelope, error) else {
            return Ok(false);
        };
        warn!(target_id = %result.target.id, error = %error, "Health alert payload undecodable");
        emitter.emit(Event::AnalysisResult(result)).await?;
        Ok(true)
    }
}
