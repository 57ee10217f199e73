//! Agent configuration

use anyhow::{Context, Result};
use remedy_lib::monitor::Thresholds;
use remedy_lib::responder::ActionSpec;
use remedy_lib::Severity;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which part of the pipeline this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Monitor,
    Analyzer,
    Responder,
    Alert,
    Observability,
    /// Hosts the shared bus and store for the other stages
    Coordinator,
    /// Every stage in one process over an in-memory bus and store
    All,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Monitor => "monitor",
            StageKind::Analyzer => "analyzer",
            StageKind::Responder => "responder",
            StageKind::Alert => "alert",
            StageKind::Observability => "observability",
            StageKind::Coordinator => "coordinator",
            StageKind::All => "all",
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_stage")]
    pub stage: StageKind,

    /// Node name reported in structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics (and the coordinator routes)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Coordinator base URL used by single-stage processes
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,

    /// Bus poll timeout for stage runners in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub analyzer: AnalyzerSettings,

    #[serde(default)]
    pub responder: ResponderSettings,

    #[serde(default)]
    pub alert: AlertSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    pub jitter_ms: u64,
    /// JSON file of target snapshots, refreshed by an external collector
    pub source_path: Option<PathBuf>,
    pub thresholds: Thresholds,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            jitter_ms: 1000,
            source_path: None,
            thresholds: Thresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Below this confidence a verdict is reported as inconclusive
    pub min_confidence: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
        }
    }
}

/// How approved actions are carried out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Log the action only
    #[default]
    Log,
    /// Run each action's configured command line
    Command,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponderSettings {
    pub dry_run: bool,
    pub executor: ExecutorKind,
    /// Approved actions; empty means the built-in catalog
    pub catalog: Vec<ActionSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub dedup_window_secs: u64,
    pub min_severity: Severity,
    pub webhook_url: Option<String>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            dedup_window_secs: 600,
            min_severity: Severity::Medium,
            webhook_url: None,
        }
    }
}

fn default_stage() -> StageKind {
    StageKind::All
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_coordinator_url() -> String {
    "http://remedy-coordinator:8080".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    250
}

impl AgentConfig {
    /// Load configuration from the optional `REMEDY_CONFIG` file, then the
    /// `REMEDY_*` environment (nested keys use `__`, e.g.
    /// `REMEDY_ALERT__WEBHOOK_URL`)
    pub fn load() -> Result<Self> {
        let file = std::env::var_os("REMEDY_CONFIG").map(PathBuf::from);
        let environment = config::Environment::with_prefix("REMEDY")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        Self::from_sources(file, Some(environment))
    }

    pub(crate) fn from_sources(
        file: Option<PathBuf>,
        environment: Option<config::Environment>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        if let Some(environment) = environment {
            builder = builder.add_source(environment);
        }

        let config = builder
            .build()
            .with_context(|| match &file {
                Some(path) => format!("Failed to read config file {}", path.display()),
                None => "Failed to read configuration".to_string(),
            })?;
        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_timeout_ms == 0 {
            anyhow::bail!("poll_timeout_ms must be positive");
        }
        if self.monitor.interval_secs == 0 {
            anyhow::bail!("monitor.interval_secs must be positive");
        }
        if self.alert.dedup_window_secs == 0 {
            anyhow::bail!("alert.dedup_window_secs must be positive");
        }
        if !(0.0..=1.0).contains(&self.analyzer.min_confidence) {
            anyhow::bail!("analyzer.min_confidence must be within [0, 1]");
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}
