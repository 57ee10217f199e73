//! Threshold and rolling-baseline anomaly classification
//!
//! Static thresholds cover CPU and memory pressure. Memory growth uses a
//! linear regression over a time window, and network/disk spikes compare
//! the per-tick byte delta against a rolling mean and standard deviation.

use super::AnomalyClassifier;
use crate::models::{Anomaly, AnomalyType, MetricSnapshot, Severity, TargetRef};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Minimum samples before growth or spike detection kicks in
const MIN_SAMPLES_FOR_DETECTION: usize = 10;

/// Fraction of non-decreasing steps required to call growth monotonic
const MONOTONICITY_THRESHOLD: f64 = 0.95;

/// Restarts between two samples at which the loop is critical
const CRITICAL_RESTART_DELTA: u64 = 5;

/// Classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub cpu_critical_percent: f64,
    /// Consecutive samples above `cpu_percent` before reporting
    pub cpu_consecutive_samples: u32,
    pub memory_percent: f64,
    pub memory_critical_percent: f64,
    /// Regression slope (bytes/sec) considered abnormal growth
    pub memory_growth_bytes_per_sec: f64,
    pub memory_growth_window_secs: u64,
    /// Growth is high severity when the limit is projected within this horizon
    pub oom_horizon_secs: u64,
    /// z-score at which a network or block I/O delta is a spike
    pub spike_z_score: f64,
    pub spike_window_secs: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 85.0,
            cpu_critical_percent: 95.0,
            cpu_consecutive_samples: 3,
            memory_percent: 90.0,
            memory_critical_percent: 97.0,
            memory_growth_bytes_per_sec: 1024.0 * 1024.0,
            memory_growth_window_secs: 3600,
            oom_horizon_secs: 15 * 60,
            spike_z_score: 3.0,
            spike_window_secs: 3600,
        }
    }
}

/// Rolling mean and standard deviation over a time window
#[derive(Debug, Clone)]
pub struct RollingStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: u64,
    samples: VecDeque<(i64, f64)>,
    window_secs: i64,
}

impl RollingStats {
    pub fn new(window: Duration) -> Self {
        Self {
            mean: 0.0,
            std_dev: 0.0,
            count: 0,
            samples: VecDeque::new(),
            window_secs: window.as_secs() as i64,
        }
    }

    pub fn add_sample(&mut self, timestamp: i64, value: f64) {
        let cutoff = timestamp - self.window_secs;
        while matches!(self.samples.front(), Some((ts, _)) if *ts < cutoff) {
            self.samples.pop_front();
        }
        self.samples.push_back((timestamp, value));
        self.recalculate();
    }

    /// Forget the baseline, e.g. after a counter reset
    pub fn reset(&mut self) {
        self.samples.clear();
        self.recalculate();
    }

    pub fn has_sufficient_data(&self) -> bool {
        self.count >= MIN_SAMPLES_FOR_DETECTION as u64
    }

    /// z-score of `value` against the current baseline
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if !self.has_sufficient_data() || self.std_dev < f64::EPSILON {
            return None;
        }
        Some((value - self.mean) / self.std_dev)
    }

    fn recalculate(&mut self) {
        self.count = self.samples.len() as u64;
        if self.count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }

        let sum: f64 = self.samples.iter().map(|(_, v)| v).sum();
        self.mean = sum / self.count as f64;

        // Sample variance (Bessel's correction)
        self.std_dev = if self.count > 1 {
            let variance = self
                .samples
                .iter()
                .map(|(_, v)| (v - self.mean).powi(2))
                .sum::<f64>()
                / (self.count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };
    }
}

/// Per-target history
#[derive(Debug)]
struct TargetHistory {
    cpu_streak: u32,
    memory: VecDeque<(i64, u64)>,
    restart_count: Option<u64>,
    network_total: Option<u64>,
    blkio_total: Option<u64>,
    network_deltas: RollingStats,
    blkio_deltas: RollingStats,
}

impl TargetHistory {
    fn new(thresholds: &Thresholds) -> Self {
        let window = Duration::from_secs(thresholds.spike_window_secs);
        Self {
            cpu_streak: 0,
            memory: VecDeque::new(),
            restart_count: None,
            network_total: None,
            blkio_total: None,
            network_deltas: RollingStats::new(window),
            blkio_deltas: RollingStats::new(window),
        }
    }
}

/// Default classifier built from static thresholds and rolling baselines
pub struct ThresholdClassifier {
    thresholds: Thresholds,
    history: HashMap<String, TargetHistory>,
}

impl ThresholdClassifier {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            history: HashMap::new(),
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn tracked_targets(&self) -> usize {
        self.history.len()
    }

    fn check_cpu(&self, history: &mut TargetHistory, s: &MetricSnapshot) -> Option<Anomaly> {
        let t = &self.thresholds;
        if s.cpu_percent < t.cpu_percent {
            history.cpu_streak = 0;
            return None;
        }
        history.cpu_streak = history.cpu_streak.saturating_add(1);
        if history.cpu_streak < t.cpu_consecutive_samples.max(1) {
            return None;
        }

        let severity = if s.cpu_percent >= t.cpu_critical_percent {
            Severity::Critical
        } else {
            Severity::High
        };
        Some(Anomaly::new(
            AnomalyType::HighCpu,
            severity,
            s.timestamp,
            format!(
                "cpu {:.1}% >= {:.1}% for {} samples",
                s.cpu_percent, t.cpu_percent, history.cpu_streak
            ),
        ))
    }

    fn check_memory(&self, s: &MetricSnapshot) -> Option<Anomaly> {
        let t = &self.thresholds;
        if s.memory_percent < t.memory_percent {
            return None;
        }
        let severity = if s.memory_percent >= t.memory_critical_percent {
            Severity::Critical
        } else {
            Severity::High
        };
        Some(Anomaly::new(
            AnomalyType::HighMemory,
            severity,
            s.timestamp,
            format!("memory {:.1}% >= {:.1}%", s.memory_percent, t.memory_percent),
        ))
    }

    fn check_growth(&self, history: &mut TargetHistory, s: &MetricSnapshot) -> Option<Anomaly> {
        let t = &self.thresholds;
        let cutoff = s.timestamp - t.memory_growth_window_secs as i64;
        while matches!(history.memory.front(), Some((ts, _)) if *ts < cutoff) {
            history.memory.pop_front();
        }
        history.memory.push_back((s.timestamp, s.memory_bytes));

        if history.memory.len() < MIN_SAMPLES_FOR_DETECTION {
            return None;
        }
        let samples = history.memory.make_contiguous();
        let slope = linear_regression_slope(samples);
        if slope <= t.memory_growth_bytes_per_sec || monotonicity(samples) < MONOTONICITY_THRESHOLD
        {
            return None;
        }

        let seconds_to_limit = (s.memory_limit_bytes > 0).then(|| {
            s.memory_limit_bytes.saturating_sub(s.memory_bytes) as f64 / slope
        });
        let severity = match seconds_to_limit {
            Some(secs) if secs <= t.oom_horizon_secs as f64 => Severity::High,
            _ => Severity::Medium,
        };
        let details = match seconds_to_limit {
            Some(secs) => format!("memory growing {:.0} B/s, limit in {:.0}s", slope, secs),
            None => format!("memory growing {:.0} B/s", slope),
        };
        Some(Anomaly::new(
            AnomalyType::MemoryGrowth,
            severity,
            s.timestamp,
            details,
        ))
    }

    fn check_restarts(history: &mut TargetHistory, s: &MetricSnapshot) -> Option<Anomaly> {
        let previous = history.restart_count.replace(s.restart_count)?;
        // A lower count means the counter was reset; the new value is the baseline
        let delta = s.restart_count.checked_sub(previous)?;
        let severity = match delta {
            0 => return None,
            1 | 2 => Severity::Medium,
            d if d >= CRITICAL_RESTART_DELTA => Severity::Critical,
            _ => Severity::High,
        };
        Some(Anomaly::new(
            AnomalyType::RestartLoop,
            severity,
            s.timestamp,
            format!("{} restarts since last sample", delta),
        ))
    }

    fn check_spike(
        &self,
        anomaly_type: AnomalyType,
        last_total: &mut Option<u64>,
        deltas: &mut RollingStats,
        current_total: u64,
        timestamp: i64,
    ) -> Option<Anomaly> {
        let previous = last_total.replace(current_total)?;
        let Some(delta) = current_total.checked_sub(previous) else {
            deltas.reset();
            return None;
        };
        let delta = delta as f64;

        let z = deltas.z_score(delta);
        deltas.add_sample(timestamp, delta);
        let z = z.filter(|z| *z >= self.thresholds.spike_z_score)?;

        let base = self.thresholds.spike_z_score;
        let severity = if z >= base + 3.0 {
            Severity::Critical
        } else if z >= base + 2.0 {
            Severity::High
        } else if z >= base + 1.0 {
            Severity::Medium
        } else {
            Severity::Low
        };
        Some(Anomaly::new(
            anomaly_type,
            severity,
            timestamp,
            format!("{:.0} bytes/tick, z-score {:.1}", delta, z),
        ))
    }
}

impl Default for ThresholdClassifier {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl AnomalyClassifier for ThresholdClassifier {
    fn classify(&mut self, target: &TargetRef, snapshot: &MetricSnapshot) -> Vec<Anomaly> {
        let snapshot = snapshot.clone().normalized();
        let mut history = self
            .history
            .remove(&target.id)
            .unwrap_or_else(|| TargetHistory::new(&self.thresholds));

        let mut anomalies = Vec::new();
        anomalies.extend(self.check_cpu(&mut history, &snapshot));
        anomalies.extend(self.check_memory(&snapshot));
        anomalies.extend(self.check_growth(&mut history, &snapshot));
        anomalies.extend(Self::check_restarts(&mut history, &snapshot));

        let TargetHistory {
            network_total,
            network_deltas,
            blkio_total,
            blkio_deltas,
            ..
        } = &mut history;
        anomalies.extend(self.check_spike(
            AnomalyType::NetworkSpike,
            network_total,
            network_deltas,
            snapshot.network_total_bytes(),
            snapshot.timestamp,
        ));
        anomalies.extend(self.check_spike(
            AnomalyType::DiskIoSpike,
            blkio_total,
            blkio_deltas,
            snapshot.blkio_total_bytes(),
            snapshot.timestamp,
        ));

        self.history.insert(target.id.clone(), history);
        anomalies
    }

    fn retain_targets(&mut self, live: &[TargetRef]) {
        self.history
            .retain(|id, _| live.iter().any(|target| &target.id == id));
    }
}

/// Least-squares slope of bytes over seconds
fn linear_regression_slope(samples: &[(i64, u64)]) -> f64 {
    let n = samples.len() as f64;
    if n < 2.0 {
        return 0.0;
    }

    // Normalize timestamps to avoid precision issues
    let t0 = samples.first().map(|(ts, _)| *ts).unwrap_or(0) as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (ts, bytes) in samples {
        let x = *ts as f64 - t0;
        let y = *bytes as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

/// Fraction of steps where the value did not decrease
fn monotonicity(samples: &[(i64, u64)]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let rising = samples.windows(2).filter(|w| w[1].1 >= w[0].1).count();
    rising as f64 / (samples.len() - 1) as f64
}
