//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Trend analysis over health history producing advisory warnings."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! The analyzer compares a recent window of samples against the window that
//! precedes it. Its output is stateless: each run produces the full warning
//! set, which replaces whatever was published before.
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use wardstream_common::config::PredictiveConfig;
use wardstream_common::time::seconds_between;

use crate::health::HealthSample;

/// Category of a predictive warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    PerformanceDegradation,
    MemoryPressure,
    MemoryLeak,
    ErrorRateSpike,
    LatencyIncrease,
}

impl WarningKind {
    pub const ALL: [WarningKind; 5] = [
        WarningKind::PerformanceDegradation,
        WarningKind::MemoryPressure,
        WarningKind::MemoryLeak,
        WarningKind::ErrorRateSpike,
        WarningKind::LatencyIncrease,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::PerformanceDegradation => "performance_degradation",
            WarningKind::MemoryPressure => "memory_pressure",
            WarningKind::MemoryLeak => "memory_leak",
            WarningKind::ErrorRateSpike => "error_rate_spike",
            WarningKind::LatencyIncrease => "latency_increase",
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory signal derived from health trends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveWarning {
    pub kind: WarningKind,
    pub severity: Severity,
    /// Numeric value that crossed the threshold (ratio, bytes/s, count, score or ms).
    pub evidence: f64,
    pub message: String,
}

impl PredictiveWarning {
    fn new(kind: WarningKind, severity: Severity, evidence: f64, message: String) -> Self {
        Self {
            kind,
            severity,
            evidence,
            message,
        }
    }
}

/// Composite 0..=100 score for one sample. Unknown inputs carry no penalty.
pub fn health_score(sample: &HealthSample) -> f64 {
    let memory_penalty = sample.memory_used_ratio.unwrap_or(0.0) * 40.0;
    let error_penalty = (f64::from(sample.recent_error_count) * 5.0).min(40.0);
    let latency_penalty = (sample.recent_latency_ms.unwrap_or(0.0) / 100.0).min(20.0);
    (100.0 - memory_penalty - error_penalty - latency_penalty).clamp(0.0, 100.0)
}

/// Evaluates health history against [`PredictiveConfig`] thresholds.
#[derive(Debug, Clone)]
pub struct PredictiveAnalyzer {
    config: PredictiveConfig,
}

impl PredictiveAnalyzer {
    pub fn new(config: PredictiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.config
    }

    /// Produce the complete warning set for `history` (oldest first). Returns
    /// an empty set until `min_history` samples exist.
    pub fn analyze(&self, history: &[HealthSample]) -> Vec<PredictiveWarning> {
        let window = self.config.window;
        if history.len() < self.config.min_history || history.len() < window * 2 {
            return Vec::new();
        }
        let recent = &history[history.len() - window..];
        let earlier = &history[history.len() - window * 2..history.len() - window];

        let mut warnings = Vec::new();
        warnings.extend(self.memory_pressure(recent));
        warnings.extend(self.memory_leak(recent));
        warnings.extend(self.error_spike(recent, earlier));
        warnings.extend(self.performance(recent, earlier));
        warnings.extend(self.latency(recent, earlier));
        warnings
    }

    fn memory_pressure(&self, recent: &[HealthSample]) -> Option<PredictiveWarning> {
        let ratio = recent.last()?.memory_used_ratio?;
        let severity = if ratio > self.config.memory_critical_ratio {
            Severity::Critical
        } else if ratio > self.config.memory_warning_ratio {
            Severity::Warning
        } else {
            return None;
        };
        Some(PredictiveWarning::new(
            WarningKind::MemoryPressure,
            severity,
            ratio,
            format!("memory usage at {:.0}%", ratio * 100.0),
        ))
    }

    fn memory_leak(&self, recent: &[HealthSample]) -> Option<PredictiveWarning> {
        let origin = recent.first()?.timestamp;
        let (xs, ys): (Vec<f64>, Vec<f64>) = recent
            .iter()
            .filter_map(|sample| {
                sample
                    .memory_used_bytes
                    .map(|bytes| (seconds_between(origin, sample.timestamp), bytes as f64))
            })
            .unzip();
        let slope = least_squares_slope(&xs, &ys)?;
        if slope <= self.config.leak_bytes_per_second {
            return None;
        }
        Some(PredictiveWarning::new(
            WarningKind::MemoryLeak,
            Severity::Critical,
            slope,
            format!(
                "memory growing at {:.1} MiB/s",
                slope / (1024.0 * 1024.0)
            ),
        ))
    }

    fn error_spike(
        &self,
        recent: &[HealthSample],
        earlier: &[HealthSample],
    ) -> Option<PredictiveWarning> {
        let recent_errors: u32 = recent.iter().map(|sample| sample.recent_error_count).sum();
        let earlier_errors: u32 = earlier.iter().map(|sample| sample.recent_error_count).sum();
        if recent_errors == 0
            || f64::from(recent_errors)
                <= f64::from(earlier_errors) * self.config.error_spike_factor
        {
            return None;
        }
        Some(PredictiveWarning::new(
            WarningKind::ErrorRateSpike,
            Severity::Critical,
            f64::from(recent_errors),
            format!("{recent_errors} faults in the recent window, {earlier_errors} before"),
        ))
    }

    fn performance(
        &self,
        recent: &[HealthSample],
        earlier: &[HealthSample],
    ) -> Option<PredictiveWarning> {
        let recent_score = recent.iter().map(health_score).mean();
        let earlier_score = earlier.iter().map(health_score).mean();
        if recent_score >= earlier_score * (1.0 - self.config.score_drop_ratio)
            || recent_score >= self.config.score_floor
        {
            return None;
        }
        let severity = if recent_score < self.config.score_critical_floor {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(PredictiveWarning::new(
            WarningKind::PerformanceDegradation,
            severity,
            recent_score,
            format!("health score fell from {earlier_score:.0} to {recent_score:.0}"),
        ))
    }

    fn latency(
        &self,
        recent: &[HealthSample],
        earlier: &[HealthSample],
    ) -> Option<PredictiveWarning> {
        let recent_latency = mean_latency(recent)?;
        let earlier_latency = mean_latency(earlier)?;
        if recent_latency <= self.config.latency_floor_ms
            || recent_latency <= earlier_latency * self.config.latency_increase_factor
        {
            return None;
        }
        let severity = if recent_latency > earlier_latency * self.config.latency_critical_factor {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(PredictiveWarning::new(
            WarningKind::LatencyIncrease,
            severity,
            recent_latency,
            format!("round trip rose from {earlier_latency:.0} ms to {recent_latency:.0} ms"),
        ))
    }
}

impl Default for PredictiveAnalyzer {
    fn default() -> Self {
        Self::new(PredictiveConfig::default())
    }
}

fn mean_latency(samples: &[HealthSample]) -> Option<f64> {
    let latencies: Vec<f64> = samples
        .iter()
        .filter_map(|sample| sample.recent_latency_ms)
        .collect();
    if latencies.is_empty() {
        return None;
    }
    Some(latencies.iter().mean())
}

fn least_squares_slope(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let variance = xs.iter().variance();
    if !variance.is_finite() || variance <= f64::EPSILON {
        return None;
    }
    let slope = xs.iter().covariance(ys.iter()) / variance;
    slope.is_finite().then_some(slope)
}

/// Latest published warning set.
#[derive(Debug, Default)]
pub struct WarningBoard {
    warnings: RwLock<Vec<PredictiveWarning>>,
}

impl WarningBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set. Returns `true` when it differs from the previous one.
    pub fn replace(&self, warnings: Vec<PredictiveWarning>) -> bool {
        let mut current = self.warnings.write();
        if *current == warnings {
            return false;
        }
        *current = warnings;
        true
    }

    pub fn current(&self) -> Vec<PredictiveWarning> {
        self.warnings.read().clone()
    }

    pub fn has_critical(&self) -> bool {
        self.warnings
            .read()
            .iter()
            .any(|warning| warning.severity == Severity::Critical)
    }
}
