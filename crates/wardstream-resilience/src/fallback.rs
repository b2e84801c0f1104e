//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Fleet-wide fallback mode decision and emergency escalation."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wardstream_common::config::FallbackConfig;

use crate::error::ErrorKind;
use crate::metrics::StreamingMetrics;
use crate::predictive::{PredictiveWarning, Severity};
use crate::session::{SessionSnapshot, SessionState};

/// Operating strategy of the dashboard as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Push channels are healthy.
    #[default]
    None,
    /// Some channels are down; request/response polling fills the gap.
    Polling,
    /// The process has no connectivity.
    Offline,
    /// Every channel is down with retries exhausted on a high-availability topic.
    Emergency,
}

impl FallbackMode {
    /// Represent the mode as a static label for metrics and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackMode::None => "none",
            FallbackMode::Polling => "polling",
            FallbackMode::Offline => "offline",
            FallbackMode::Emergency => "emergency",
        }
    }

    /// Numeric encoding used by the gauge.
    pub fn ordinal(&self) -> i64 {
        match self {
            FallbackMode::None => 0,
            FallbackMode::Polling => 1,
            FallbackMode::Offline => 2,
            FallbackMode::Emergency => 3,
        }
    }
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a session currently lacks a healthy push channel.
pub fn is_degraded(session: &SessionSnapshot) -> bool {
    match session.state {
        SessionState::Reconnecting | SessionState::Failed | SessionState::Degraded => true,
        SessionState::Connecting => {
            session.attempt_count > 0 || session.last_error_kind.is_some()
        }
        SessionState::Idle | SessionState::Streaming | SessionState::Closed => false,
    }
}

/// Pure fallback decision. Closed sessions are ignored.
pub fn decide(
    config: &FallbackConfig,
    online: bool,
    sessions: &[SessionSnapshot],
    warnings: &[PredictiveWarning],
) -> FallbackMode {
    if !online {
        return FallbackMode::Offline;
    }
    let active: Vec<&SessionSnapshot> = sessions
        .iter()
        .filter(|session| session.state.is_active())
        .collect();
    if active.is_empty() {
        return FallbackMode::None;
    }
    let all_exhausted = active
        .iter()
        .all(|session| session.state == SessionState::Failed && session.budget_exhausted);
    let any_high_availability = active
        .iter()
        .any(|session| session.mode.is_high_availability());
    if all_exhausted && any_high_availability {
        return FallbackMode::Emergency;
    }
    if active.iter().any(|session| is_degraded(session)) {
        return FallbackMode::Polling;
    }
    if config.degrade_on_critical_warning
        && warnings
            .iter()
            .any(|warning| warning.severity == Severity::Critical)
    {
        return FallbackMode::Polling;
    }
    FallbackMode::None
}

/// Change of fallback mode reported by [`FallbackController::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackChange {
    pub from: FallbackMode,
    pub to: FallbackMode,
}

/// Payload handed to the [`EmergencySink`] when the fleet enters emergency mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyNotice {
    /// High-availability topic that triggered the escalation.
    pub topic: String,
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub at: DateTime<Utc>,
    /// Every topic without a live channel.
    pub affected: Vec<String>,
}

/// Receives emergency escalations (notification delivery lives elsewhere).
pub trait EmergencySink: Send + Sync {
    fn notify(&self, notice: &EmergencyNotice);
}

/// Sink that records escalations in the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEmergencySink;

impl EmergencySink for LoggingEmergencySink {
    fn notify(&self, notice: &EmergencyNotice) {
        tracing::error!(
            target: "wardstream::fallback",
            topic = %notice.topic,
            attempt = notice.attempt_count,
            error_kind = ?notice.last_error_kind,
            affected = ?notice.affected,
            "emergency fallback engaged",
        );
    }
}

/// Tracks the current fallback mode and reports changes via metrics, logs and
/// the emergency sink.
pub struct FallbackController {
    config: FallbackConfig,
    current: FallbackMode,
    sink: Arc<dyn EmergencySink>,
    metrics: Option<StreamingMetrics>,
}

impl FallbackController {
    pub fn new(
        config: FallbackConfig,
        sink: Arc<dyn EmergencySink>,
        metrics: Option<StreamingMetrics>,
    ) -> Self {
        Self {
            config,
            current: FallbackMode::None,
            sink,
            metrics,
        }
    }

    pub fn current(&self) -> FallbackMode {
        self.current
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Re-evaluate the mode. Returns the change when the mode moved.
    pub fn evaluate(
        &mut self,
        online: bool,
        sessions: &[SessionSnapshot],
        warnings: &[PredictiveWarning],
    ) -> Option<FallbackChange> {
        let next = decide(&self.config, online, sessions, warnings);
        if next == self.current {
            return None;
        }
        let change = FallbackChange {
            from: self.current,
            to: next,
        };
        self.current = next;
        if let Some(metrics) = &self.metrics {
            metrics.set_fallback_mode(next);
        }
        tracing::info!(
            target: "wardstream::fallback",
            from = %change.from,
            to = %change.to,
            online,
            sessions = sessions.len(),
            "fallback mode transition",
        );
        if next == FallbackMode::Emergency {
            self.escalate(sessions);
        }
        Some(change)
    }

    fn escalate(&self, sessions: &[SessionSnapshot]) {
        let Some(trigger) = sessions
            .iter()
            .filter(|session| session.state == SessionState::Failed)
            .find(|session| session.mode.is_high_availability())
        else {
            return;
        };
        let notice = EmergencyNotice {
            topic: trigger.topic.clone(),
            attempt_count: trigger.attempt_count,
            last_error_kind: trigger.last_error_kind,
            at: Utc::now(),
            affected: sessions
                .iter()
                .filter(|session| session.state.is_active())
                .map(|session| session.topic.clone())
                .collect(),
        };
        let sink = self.sink.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| sink.notify(&notice))).is_err() {
            tracing::error!(
                target: "wardstream::fallback",
                topic = %notice.topic,
                "emergency sink panicked",
            );
        }
    }
}

impl fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackController")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
