//! Per-target remediation state

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use remedy_lib::responder::{target_phase, CooldownRecord, TargetPhase};
use remedy_lib::store::{cooldown_key, CoordinationStore};
use serde::Serialize;

use crate::output::{color_phase, format_ttl, print_json, OutputFormat};

#[derive(Debug, Clone, Serialize)]
pub struct CooldownView {
    pub target_id: String,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Build the view of one target from the store
pub async fn describe(store: &dyn CoordinationStore, target_id: &str) -> Result<CooldownView> {
    let phase = target_phase(store, target_id)
        .await
        .with_context(|| format!("Failed to read cooldown for {}", target_id))?;

    let mut view = CooldownView {
        target_id: target_id.to_string(),
        phase: phase.as_str().to_string(),
        action: None,
        remaining_secs: None,
        claimed_at: None,
        expires_at: None,
    };

    match phase {
        TargetPhase::Idle => {}
        TargetPhase::Executing { action } => view.action = Some(action),
        TargetPhase::CooldownActive { action, remaining } => {
            view.action = Some(action);
            view.remaining_secs = Some(remaining.as_secs());
            if let Some(entry) = store.get(&cooldown_key(target_id)).await? {
                if let Ok(record) = serde_json::from_str::<CooldownRecord>(&entry.value) {
                    view.claimed_at = Some(record.claimed_at);
                    view.expires_at = Some(record.expires_at);
                }
            }
        }
    }

    Ok(view)
}

/// `cooldown show`
pub async fn show_cooldown(
    store: &dyn CoordinationStore,
    target_id: &str,
    format: OutputFormat,
) -> Result<()> {
    let view = describe(store, target_id).await?;

    match format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Table => {
            println!("{}", format!("Target: {}", view.target_id).bold());
            println!("{}", "=".repeat(50));
            println!("Phase:          {}", color_phase(&view.phase));
            if let Some(action) = &view.action {
                println!("Action:         {}", action.cyan());
            }
            if let Some(secs) = view.remaining_secs {
                println!(
                    "Remaining:      {}",
                    format_ttl(std::time::Duration::from_secs(secs))
                );
            }
            if let Some(claimed_at) = view.claimed_at {
                println!(
                    "Claimed at:     {}",
                    claimed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
                );
            }
            if let Some(expires_at) = view.expires_at {
                println!(
                    "Expires at:     {}",
                    expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_lib::responder::ActionSpec;
    use remedy_lib::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_target() {
        let store = MemoryStore::new();
        let view = describe(&store, "db-1").await.unwrap();
        assert_eq!(view.phase, "idle");
        assert!(view.action.is_none());
        assert!(view.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_active_cooldown() {
        let store = MemoryStore::new();
        let spec = ActionSpec::new("restart", Duration::from_secs(60), Duration::from_secs(30));
        let record = CooldownRecord::new("db-1", &spec, Utc::now());
        let value = serde_json::to_string(&record).unwrap();
        store
            .claim(&cooldown_key("db-1"), &value, spec.cooldown())
            .await
            .unwrap();

        let view = describe(&store, "db-1").await.unwrap();
        assert_eq!(view.phase, "cooldown_active");
        assert_eq!(view.action.as_deref(), Some("restart"));
        assert!(view.remaining_secs.unwrap() <= 60);
        assert_eq!(view.expires_at, Some(record.expires_at));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["phase"], "cooldown_active");
    }

    #[tokio::test]
    async fn test_unreadable_record_still_reports_cooldown() {
        let store = MemoryStore::new();
        store
            .claim(&cooldown_key("db-1"), "garbage", Duration::from_secs(60))
            .await
            .unwrap();

        let view = describe(&store, "db-1").await.unwrap();
        assert_eq!(view.phase, "cooldown_active");
        assert_eq!(view.action.as_deref(), Some("unknown"));
        assert!(view.claimed_at.is_none());
    }
}
