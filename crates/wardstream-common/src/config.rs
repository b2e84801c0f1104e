//! ---
//! ws_section: "01-core-functionality"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Shared primitives and utilities for the streaming runtime."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_manual_retry_budget() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_standard_budget() -> u32 {
    3
}

fn default_high_availability_budget() -> u32 {
    6
}

fn default_fast_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_fast_attempts() -> u32 {
    2
}

fn default_rate_limit_multiplier() -> f64 {
    2.0
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_capacity() -> usize {
    60
}

fn default_min_history() -> usize {
    10
}

fn default_window() -> usize {
    5
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_progress_history() -> usize {
    20
}

fn default_stall_rate() -> f64 {
    0.001
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_owned()
}

fn default_stream_path() -> String {
    "/api/v1/strategist/stream".to_owned()
}

fn default_poll_path() -> String {
    "/api/v1/strategist/summary".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_file_prefix() -> String {
    "wardstream".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the streaming runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub predictive: PredictiveConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`StreamingConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedStreamingConfig {
    pub config: StreamingConfig,
    pub source: PathBuf,
}

impl StreamingConfig {
    pub const ENV_CONFIG_PATH: &str = "WARDSTREAM_CONFIG";

    /// Load configuration from disk, respecting the `WARDSTREAM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedStreamingConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedStreamingConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedStreamingConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<StreamingConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants across sections.
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()?;
        self.health.validate()?;
        self.predictive.validate()?;
        if self.predictive.min_history > self.health.capacity {
            return Err(anyhow!(
                "predictive.min_history ({}) exceeds health.capacity ({})",
                self.predictive.min_history,
                self.health.capacity
            ));
        }
        self.progress.validate()?;
        self.endpoint.validate()?;
        if self.fallback.poll_interval.is_zero() {
            return Err(anyhow!("fallback.poll_interval must be greater than zero"));
        }
        if self.session.attempt_timeout.is_zero() {
            return Err(anyhow!("session.attempt_timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for StreamingConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: StreamingConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Operating mode fixed at session creation.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Standard,
    /// Campaign mode: larger retry budget and faster first retries.
    #[serde(alias = "campaign")]
    HighAvailability,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Standard => "standard",
            StreamMode::HighAvailability => "high_availability",
        }
    }

    pub fn is_high_availability(&self) -> bool {
        matches!(self, StreamMode::HighAvailability)
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(StreamMode::Standard),
            "high_availability" | "high-availability" | "campaign" => {
                Ok(StreamMode::HighAvailability)
            }
            other => Err(format!("unknown stream mode: {}", other)),
        }
    }
}

/// How the session manager treats a request for a second topic.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Selecting a new topic tears down whatever was selected before.
    #[default]
    Exclusive,
    /// Every topic keeps its own session (watch-list dashboards).
    Concurrent,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_attempt_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub attempt_timeout: Duration,
    #[serde(default = "default_manual_retry_budget")]
    pub manual_retry_budget: u32,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub default_mode: StreamMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: default_attempt_timeout(),
            manual_retry_budget: default_manual_retry_budget(),
            selection: SelectionPolicy::default(),
            default_mode: StreamMode::default(),
        }
    }
}

/// Retry schedule constants. Treated as tunables rather than contract.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_standard_budget")]
    pub standard_budget: u32,
    #[serde(default = "default_high_availability_budget")]
    pub high_availability_budget: u32,
    #[serde(default = "default_fast_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub fast_delay: Duration,
    #[serde(default = "default_fast_attempts")]
    pub fast_attempts: u32,
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            standard_budget: default_standard_budget(),
            high_availability_budget: default_high_availability_budget(),
            fast_delay: default_fast_delay(),
            fast_attempts: default_fast_attempts(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.standard_budget == 0 {
            return Err(anyhow!("backoff.standard_budget must be at least 1"));
        }
        if self.high_availability_budget < self.standard_budget.saturating_mul(2) {
            return Err(anyhow!(
                "backoff.high_availability_budget ({}) must be at least twice standard_budget ({})",
                self.high_availability_budget,
                self.standard_budget
            ));
        }
        if self.base_delay.is_zero() || self.base_delay > self.max_delay {
            return Err(anyhow!(
                "backoff.base_delay must be non-zero and not exceed max_delay"
            ));
        }
        if self.fast_attempts > 0 {
            let exponent = (self.fast_attempts - 1).min(16);
            let last_fast = self.fast_delay.saturating_mul(1u32 << exponent);
            if self.fast_delay.is_zero() || last_fast > self.base_delay {
                return Err(anyhow!(
                    "backoff.fast_delay schedule must stay non-zero and below base_delay"
                ));
            }
        }
        if !(self.rate_limit_multiplier >= 1.0) {
            return Err(anyhow!("backoff.rate_limit_multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_health_capacity")]
    pub capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            capacity: default_health_capacity(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("health.interval must be greater than zero"));
        }
        if self.capacity < 2 {
            return Err(anyhow!("health.capacity must hold at least two samples"));
        }
        Ok(())
    }
}

/// Thresholds applied by the predictive analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub min_history: usize,
    pub window: usize,
    pub memory_warning_ratio: f64,
    pub memory_critical_ratio: f64,
    pub leak_bytes_per_second: f64,
    pub error_spike_factor: f64,
    pub score_drop_ratio: f64,
    pub score_floor: f64,
    pub score_critical_floor: f64,
    pub latency_increase_factor: f64,
    pub latency_critical_factor: f64,
    pub latency_floor_ms: f64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            min_history: default_min_history(),
            window: default_window(),
            memory_warning_ratio: 0.8,
            memory_critical_ratio: 0.9,
            leak_bytes_per_second: 1024.0 * 1024.0,
            error_spike_factor: 2.0,
            score_drop_ratio: 0.2,
            score_floor: 70.0,
            score_critical_floor: 40.0,
            latency_increase_factor: 1.5,
            latency_critical_factor: 3.0,
            latency_floor_ms: 250.0,
        }
    }
}

impl PredictiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(anyhow!("predictive.window must be at least 2"));
        }
        if self.min_history < self.window * 2 {
            return Err(anyhow!(
                "predictive.min_history ({}) must cover two windows of {}",
                self.min_history,
                self.window
            ));
        }
        if !(0.0..=1.0).contains(&self.memory_warning_ratio)
            || !(0.0..=1.0).contains(&self.memory_critical_ratio)
            || self.memory_warning_ratio > self.memory_critical_ratio
        {
            return Err(anyhow!(
                "predictive memory ratios must satisfy 0 <= warning <= critical <= 1"
            ));
        }
        if self.score_critical_floor > self.score_floor {
            return Err(anyhow!(
                "predictive.score_critical_floor must not exceed score_floor"
            ));
        }
        if self.latency_critical_factor < self.latency_increase_factor {
            return Err(anyhow!(
                "predictive.latency_critical_factor must not be below latency_increase_factor"
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub degrade_on_critical_warning: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            degrade_on_critical_warning: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_progress_history")]
    pub history_capacity: usize,
    #[serde(default = "default_stall_rate")]
    pub stall_rate: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_progress_history(),
            stall_rate: default_stall_rate(),
        }
    }
}

impl ProgressConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity < 3 {
            return Err(anyhow!(
                "progress.history_capacity must keep at least three points"
            ));
        }
        Ok(())
    }
}

/// Backend endpoints for the push channel and the polling fallback.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default = "default_poll_path")]
    pub poll_path: String,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            stream_path: default_stream_path(),
            poll_path: default_poll_path(),
            request_timeout: default_request_timeout(),
            bearer_token: None,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(anyhow!("endpoint.base_url must not be empty"));
        }
        for (name, path) in [("stream_path", &self.stream_path), ("poll_path", &self.poll_path)] {
            if !path.starts_with('/') {
                return Err(anyhow!("endpoint.{} must start with '/'", name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Rolling file name stem; files are written as `<prefix>.log.<date>`.
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: default_log_file_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StreamingConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_document() {
        let config: StreamingConfig = r#"
            [session]
            attempt_timeout = 2500
            selection = "concurrent"
            default_mode = "campaign"

            [backoff]
            high_availability_budget = 8

            [fallback]
            poll_interval = 5000
        "#
        .parse()
        .unwrap();
        assert_eq!(config.session.attempt_timeout, Duration::from_millis(2500));
        assert_eq!(config.session.selection, SelectionPolicy::Concurrent);
        assert_eq!(config.session.default_mode, StreamMode::HighAvailability);
        assert_eq!(config.backoff.high_availability_budget, 8);
        assert_eq!(config.backoff.standard_budget, 3);
        assert_eq!(config.fallback.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn rejects_small_high_availability_budget() {
        let err = r#"
            [backoff]
            standard_budget = 4
            high_availability_budget = 5
        "#
        .parse::<StreamingConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("twice"));
    }

    #[test]
    fn rejects_fast_schedule_above_base() {
        let err = r#"
            [backoff]
            fast_delay = 800
            fast_attempts = 2
            base_delay = 1000
        "#
        .parse::<StreamingConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("fast_delay"));
    }

    #[test]
    fn rejects_window_larger_than_history() {
        let err = r#"
            [predictive]
            window = 8
            min_history = 10
        "#
        .parse::<StreamingConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("two windows"));
    }

    #[test]
    fn stream_mode_parses_campaign_alias() {
        assert_eq!(
            "campaign".parse::<StreamMode>().unwrap(),
            StreamMode::HighAvailability
        );
        assert!("turbo".parse::<StreamMode>().is_err());
    }
}
