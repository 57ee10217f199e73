//! Core data models shared by every pipeline stage

use serde::{Deserialize, Serialize};

/// A monitored workload instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    /// Stable id (container id)
    pub id: String,
    /// Display name
    pub name: String,
}

impl TargetRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Point-in-time resource reading for one target
///
/// Byte counters (network, block I/O) are cumulative since container start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSnapshot {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
    /// Memory limit in bytes, 0 when unlimited
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub blkio_read_bytes: u64,
    pub blkio_write_bytes: u64,
    pub restart_count: u64,
}

impl MetricSnapshot {
    /// Clamp percentages into [0, 100]
    pub fn normalize(&mut self) {
        self.cpu_percent = clamp_percent(self.cpu_percent);
        self.memory_percent = clamp_percent(self.memory_percent);
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    pub fn network_total_bytes(&self) -> u64 {
        self.network_rx_bytes.saturating_add(self.network_tx_bytes)
    }

    pub fn blkio_total_bytes(&self) -> u64 {
        self.blkio_read_bytes.saturating_add(self.blkio_write_bytes)
    }
}

/// Anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    HighCpu,
    HighMemory,
    MemoryGrowth,
    RestartLoop,
    NetworkSpike,
    DiskIoSpike,
    #[serde(other)]
    Unknown,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::HighCpu => "high_cpu",
            AnomalyType::HighMemory => "high_memory",
            AnomalyType::MemoryGrowth => "memory_growth",
            AnomalyType::RestartLoop => "restart_loop",
            AnomalyType::NetworkSpike => "network_spike",
            AnomalyType::DiskIoSpike => "disk_io_spike",
            AnomalyType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected deviation, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    #[serde(default)]
    pub detected_at: i64,
    #[serde(default)]
    pub details: String,
}

impl Anomaly {
    pub fn new(
        anomaly_type: AnomalyType,
        severity: Severity,
        detected_at: i64,
        details: impl Into<String>,
    ) -> Self {
        Self {
            anomaly_type,
            severity,
            detected_at,
            details: details.into(),
        }
    }
}

/// Clamp into [0.0, 1.0]; NaN maps to 0.0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Clamp into [0.0, 100.0]; NaN maps to 0.0
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
