//! Responder stage: the remediation safety gate
//!
//! Per target the state cycles `Idle -> Executing -> CooldownActive -> Idle`.
//! The cooldown part lives in the coordination store: a record under
//! `cooldown:<target id>` with TTL equal to the action's cooldown window.
//! Claiming that record is the single atomic step that grants the right to
//! act, so two replicas can never both execute on one target. The record is
//! never released early; a failed action still consumes its window.

mod catalog;
mod executor;

pub use catalog::{ActionCatalog, ActionSpec};
pub use executor::{ActionExecutor, CommandExecutor, LogExecutor};

use crate::events::{
    AnalysisResult, Channel, Event, Inbound, RemediationOutcome, RemediationStatus, ResultType,
};
use crate::models::TargetRef;
use crate::observability::EventLogger;
use crate::runner::{Emitter, StageHandler};
use crate::store::{cooldown_key, CoordinationStore, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Value stored under `cooldown:<target id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub target_id: String,
    pub action: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CooldownRecord {
    pub fn new(target_id: &str, action: &ActionSpec, claimed_at: DateTime<Utc>) -> Self {
        let window = ChronoDuration::seconds(action.cooldown_secs.min(u32::MAX as u64) as i64);
        Self {
            target_id: target_id.to_string(),
            action: action.name.clone(),
            claimed_at,
            expires_at: claimed_at + window,
        }
    }
}

/// Remediation state of one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPhase {
    Idle,
    /// Action running in this process
    Executing { action: String },
    CooldownActive {
        action: String,
        remaining: Duration,
    },
}

impl TargetPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetPhase::Idle => "idle",
            TargetPhase::Executing { .. } => "executing",
            TargetPhase::CooldownActive { .. } => "cooldown_active",
        }
    }
}

/// Derive a target's phase from the store alone
///
/// `Executing` is only visible to the process running the action, so this
/// reports `CooldownActive` for it.
pub async fn target_phase(
    store: &dyn CoordinationStore,
    target_id: &str,
) -> Result<TargetPhase, StoreError> {
    let Some(entry) = store.get(&cooldown_key(target_id)).await? else {
        return Ok(TargetPhase::Idle);
    };
    let action = match serde_json::from_str::<CooldownRecord>(&entry.value) {
        Ok(record) => record.action,
        Err(e) => {
            warn!(target_id = %target_id, error = %e, "Unreadable cooldown record");
            "unknown".to_string()
        }
    };
    Ok(TargetPhase::CooldownActive {
        action,
        remaining: entry.ttl(),
    })
}

/// Removes the in-flight marker however execution ends
struct InFlight<'a> {
    executing: &'a DashMap<String, String>,
    target_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.executing.remove(&self.target_id);
    }
}

pub struct ResponderHandler {
    store: Arc<dyn CoordinationStore>,
    catalog: ActionCatalog,
    executor: Arc<dyn ActionExecutor>,
    dry_run: bool,
    executing: DashMap<String, String>,
    logger: EventLogger,
}

impl ResponderHandler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        catalog: ActionCatalog,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            store,
            catalog,
            executor,
            dry_run: false,
            executing: DashMap::new(),
            logger: EventLogger::new("local"),
        }
    }

    /// Claim cooldowns and report success without invoking the executor
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_logger(mut self, logger: EventLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    /// Current phase including actions running in this process
    pub async fn phase(&self, target_id: &str) -> Result<TargetPhase, StoreError> {
        if let Some(action) = self.executing.get(target_id) {
            return Ok(TargetPhase::Executing {
                action: action.value().clone(),
            });
        }
        target_phase(self.store.as_ref(), target_id).await
    }

    /// Apply the safety gate to one analysis result
    pub async fn respond(&self, result: &AnalysisResult, emitter: &Emitter) -> Result<()> {
        if result.result_type != ResultType::RootCauseFound {
            return Ok(());
        }
        let Some(action_name) = result.recommended_action.as_deref() else {
            return Ok(());
        };
        let target = &result.target;

        let Some(action) = self.catalog.get(action_name) else {
            let outcome = outcome(
                target,
                action_name,
                RemediationStatus::Rejected,
                format!("action {} is not in the approved catalog", action_name),
            );
            return self.publish(outcome, emitter).await;
        };

        let record = CooldownRecord::new(&target.id, action, Utc::now());
        let value = serde_json::to_string(&record)?;
        let claimed = self
            .store
            .claim(&cooldown_key(&target.id), &value, action.cooldown())
            .await
            .context("Cooldown claim failed")?;

        if !claimed {
            let message = match target_phase(self.store.as_ref(), &target.id).await {
                Ok(TargetPhase::CooldownActive { action, remaining }) => format!(
                    "cooldown active for {} ({}s remaining)",
                    action,
                    remaining.as_secs()
                ),
                _ => "cooldown active".to_string(),
            };
            let outcome = outcome(target, action_name, RemediationStatus::SkippedCooldown, message);
            return self.publish(outcome, emitter).await;
        }

        let mut started = outcome(
            target,
            action_name,
            RemediationStatus::Started,
            format!("cooldown {}s claimed", action.cooldown_secs),
        );
        started.cooldown_secs = Some(action.cooldown_secs);
        self.publish(started, emitter).await?;

        let (status, message, duration) = self.execute(target, action).await;
        let mut finished = outcome(target, action_name, status, message);
        finished.duration = duration;
        self.publish(finished, emitter).await
    }

    async fn execute(
        &self,
        target: &TargetRef,
        action: &ActionSpec,
    ) -> (RemediationStatus, String, f64) {
        self.executing
            .insert(target.id.clone(), action.name.clone());
        let _in_flight = InFlight {
            executing: &self.executing,
            target_id: target.id.clone(),
        };

        if self.dry_run {
            return (RemediationStatus::Succeeded, "dry run".to_string(), 0.0);
        }

        let start = Instant::now();
        let result =
            tokio::time::timeout(action.timeout(), self.executor.execute(target, action)).await;
        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(Ok(message)) => (RemediationStatus::Succeeded, message, duration),
            Ok(Err(e)) => (RemediationStatus::Failed, e.to_string(), duration),
            Err(_) => (
                RemediationStatus::Failed,
                format!("timed out after {}s", action.timeout_secs),
                duration,
            ),
        }
    }

    async fn publish(&self, outcome: RemediationOutcome, emitter: &Emitter) -> Result<()> {
        self.logger.log_remediation(&outcome);
        emitter.emit(Event::RemediationOutcome(outcome)).await?;
        Ok(())
    }
}

fn outcome(
    target: &TargetRef,
    action: &str,
    status: RemediationStatus,
    message: String,
) -> RemediationOutcome {
    RemediationOutcome {
        target: target.clone(),
        action: action.to_string(),
        status,
        duration: 0.0,
        cooldown_secs: None,
        message,
    }
}

#[async_trait]
impl StageHandler for ResponderHandler {
    fn name(&self) -> &'static str {
        "responder"
    }

    fn channels(&self) -> Vec<Channel> {
        vec![Channel::AnalysisResult]
    }

    async fn handle(&self, inbound: Inbound, emitter: &Emitter) -> Result<()> {
        let Event::AnalysisResult(result) = inbound.event else {
            return Ok(());
        };
        debug!(
            target_id = %result.target.id,
            action = ?result.recommended_action,
            "Evaluating analysis result"
        );
        self.respond(&result, emitter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, InMemoryBus, Subscription};
    use crate::observability::PipelineMetrics;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl Counting {
        fn new(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
                delay,
            })
        }
    }

    #[async_trait]
    impl ActionExecutor for Counting {
        async fn execute(&self, _target: &TargetRef, action: &ActionSpec) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("{} failed", action.name);
            }
            Ok("done".to_string())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        emitter: Emitter,
        outcomes: Box<dyn Subscription>,
    }

    impl Harness {
        async fn new() -> Self {
            let bus = Arc::new(InMemoryBus::new());
            let outcomes = bus.subscribe(Channel::RemediationOutcome).await.unwrap();
            Self {
                store: Arc::new(MemoryStore::new()),
                emitter: Emitter::new(bus, PipelineMetrics::new()),
                outcomes,
            }
        }

        async fn drain(&mut self) -> Vec<RemediationOutcome> {
            let mut out = Vec::new();
            while let Some(envelope) = self.outcomes.recv(Duration::from_millis(20)).await.unwrap() {
                match Event::decode(&envelope).unwrap() {
                    Event::RemediationOutcome(outcome) => out.push(outcome),
                    other => panic!("unexpected event {:?}", other),
                }
            }
            out
        }
    }

    fn result(target_id: &str, action: Option<&str>) -> AnalysisResult {
        AnalysisResult {
            target: TargetRef::new(target_id, target_id),
            result_type: ResultType::RootCauseFound,
            confidence: 0.9,
            root_cause: "high_memory (critical)".to_string(),
            recommended_action: action.map(str::to_string),
            analysis_duration: 0.01,
            source_timestamp: 0,
        }
    }

    fn statuses(outcomes: &[RemediationOutcome]) -> Vec<RemediationStatus> {
        outcomes.iter().map(|o| o.status).collect()
    }

    #[tokio::test]
    async fn test_claim_execute_then_skip() {
        let mut h = Harness::new().await;
        let executor = Counting::new(false, Duration::ZERO);
        let responder =
            ResponderHandler::new(h.store.clone(), ActionCatalog::default(), executor.clone());

        responder
            .respond(&result("db-1", Some("restart")), &h.emitter)
            .await
            .unwrap();
        responder
            .respond(&result("db-1", Some("restart")), &h.emitter)
            .await
            .unwrap();

        let outcomes = h.drain().await;
        assert_eq!(
            statuses(&outcomes),
            vec![
                RemediationStatus::Started,
                RemediationStatus::Succeeded,
                RemediationStatus::SkippedCooldown
            ]
        );
        assert_eq!(outcomes[0].cooldown_secs, Some(60));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        match responder.phase("db-1").await.unwrap() {
            TargetPhase::CooldownActive { action, remaining } => {
                assert_eq!(action, "restart");
                assert!(remaining <= Duration::from_secs(60));
            }
            other => panic!("unexpected phase {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_still_consumes_cooldown() {
        let mut h = Harness::new().await;
        let executor = Counting::new(true, Duration::ZERO);
        let responder =
            ResponderHandler::new(h.store.clone(), ActionCatalog::default(), executor.clone());

        for _ in 0..3 {
            responder
                .respond(&result("db-1", Some("restart")), &h.emitter)
                .await
                .unwrap();
        }

        let outcomes = h.drain().await;
        assert_eq!(
            statuses(&outcomes),
            vec![
                RemediationStatus::Started,
                RemediationStatus::Failed,
                RemediationStatus::SkippedCooldown,
                RemediationStatus::SkippedCooldown
            ]
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected_without_claim() {
        let mut h = Harness::new().await;
        let executor = Counting::new(false, Duration::ZERO);
        let responder =
            ResponderHandler::new(h.store.clone(), ActionCatalog::default(), executor.clone());

        responder
            .respond(&result("db-1", Some("drop-database")), &h.emitter)
            .await
            .unwrap();

        let outcomes = h.drain().await;
        assert_eq!(statuses(&outcomes), vec![RemediationStatus::Rejected]);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_results_without_action_are_ignored() {
        let mut h = Harness::new().await;
        let responder = ResponderHandler::new(
            h.store.clone(),
            ActionCatalog::default(),
            Counting::new(false, Duration::ZERO),
        );

        responder
            .respond(&result("db-1", None), &h.emitter)
            .await
            .unwrap();
        let mut inconclusive = result("db-1", Some("restart"));
        inconclusive.result_type = ResultType::Inconclusive;
        responder.respond(&inconclusive, &h.emitter).await.unwrap();

        assert!(h.drain().await.is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_failure() {
        let mut h = Harness::new().await;
        let catalog = ActionCatalog::new([ActionSpec::new(
            "restart",
            Duration::from_secs(60),
            Duration::from_secs(1),
        )])
        .unwrap();
        let responder = ResponderHandler::new(
            h.store.clone(),
            catalog,
            Counting::new(false, Duration::from_secs(5)),
        );

        responder
            .respond(&result("db-1", Some("restart")), &h.emitter)
            .await
            .unwrap();

        let outcomes = h.drain().await;
        assert_eq!(outcomes[1].status, RemediationStatus::Failed);
        assert!(outcomes[1].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_dry_run_skips_executor() {
        let mut h = Harness::new().await;
        let executor = Counting::new(false, Duration::ZERO);
        let responder =
            ResponderHandler::new(h.store.clone(), ActionCatalog::default(), executor.clone())
                .with_dry_run(true);

        responder
            .respond(&result("api-2", Some("scale")), &h.emitter)
            .await
            .unwrap();

        let outcomes = h.drain().await;
        assert_eq!(outcomes[1].status, RemediationStatus::Succeeded);
        assert_eq!(outcomes[1].message, "dry run");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.entry("cooldown:api-2").is_some());
    }

    #[tokio::test]
    async fn test_phase_is_executing_while_action_runs() {
        let h = Harness::new().await;
        let responder = Arc::new(ResponderHandler::new(
            h.store.clone(),
            ActionCatalog::default(),
            Counting::new(false, Duration::from_millis(200)),
        ));

        let running = {
            let responder = responder.clone();
            let emitter = h.emitter.clone();
            tokio::spawn(async move {
                responder
                    .respond(&result("db-1", Some("restart")), &emitter)
                    .await
            })
        };

        let mut saw_executing = false;
        for _ in 0..100 {
            if let TargetPhase::Executing { action } = responder.phase("db-1").await.unwrap() {
                assert_eq!(action, "restart");
                saw_executing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        running.await.unwrap().unwrap();

        assert!(saw_executing);
        assert!(matches!(
            responder.phase("db-1").await.unwrap(),
            TargetPhase::CooldownActive { .. }
        ));
    }

    #[tokio::test]
    async fn test_phase_idle_without_record() {
        let store = MemoryStore::new();
        assert_eq!(target_phase(&store, "db-1").await.unwrap(), TargetPhase::Idle);
    }
}
