//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Stage progress tracking with trend and confidence reporting."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wardstream_common::config::ProgressConfig;
use wardstream_common::time::seconds_between;

use crate::channel::StageProgress;

/// Direction of recent progress within the current stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressTrend {
    Accelerating,
    #[default]
    Stable,
    Stalled,
}

impl fmt::Display for ProgressTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProgressTrend::Accelerating => "accelerating",
            ProgressTrend::Stable => "stable",
            ProgressTrend::Stalled => "stalled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPoint {
    pub percent: f64,
    pub at: DateTime<Utc>,
    pub stage_id: String,
}

/// Tracked state of one long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub operation_id: String,
    pub stage_id: String,
    pub percent_complete: f64,
    pub eta_seconds: Option<f64>,
    pub confidence: Option<f64>,
    pub message: Option<String>,
    pub trend: ProgressTrend,
    pub history: VecDeque<ProgressPoint>,
}

impl ProgressState {
    /// ETA rendered for display.
    pub fn eta_label(&self) -> Option<String> {
        format_eta(self.eta_seconds)
    }
}

/// Outcome of feeding one stage event to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Updated(ProgressState),
    /// The event was ignored; tracked state is unchanged.
    Rejected {
        stage_id: String,
        current: f64,
        attempted: f64,
    },
}

/// Tracks the operation currently reported on one session.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    config: ProgressConfig,
    current: Option<ProgressState>,
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&ProgressState> {
        self.current.as_ref()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Apply a stage event observed at `at`.
    pub fn apply(&mut self, event: &StageProgress, at: DateTime<Utc>) -> ProgressUpdate {
        if !event.percent_complete.is_finite() {
            return self.reject(event, f64::NAN);
        }
        let percent = event.percent_complete.clamp(0.0, 1.0);

        let same_operation = self
            .current
            .as_ref()
            .is_some_and(|state| state.operation_id == event.operation_id);
        if !same_operation {
            self.current = None;
        }

        if let Some(state) = &self.current {
            if state.stage_id == event.stage_id && percent < state.percent_complete {
                let current = state.percent_complete;
                return self.reject(event, current);
            }
        }

        let capacity = self.config.history_capacity.max(1);
        let stall_rate = self.config.stall_rate;
        let state = self.current.get_or_insert_with(|| ProgressState {
            operation_id: event.operation_id.clone(),
            stage_id: event.stage_id.clone(),
            percent_complete: 0.0,
            eta_seconds: None,
            confidence: None,
            message: None,
            trend: ProgressTrend::Stable,
            history: VecDeque::with_capacity(capacity),
        });

        state.stage_id = event.stage_id.clone();
        state.percent_complete = percent;
        state.eta_seconds = event.eta_seconds.filter(|eta| eta.is_finite());
        state.confidence = event
            .confidence
            .filter(|confidence| confidence.is_finite())
            .map(|confidence| confidence.clamp(0.0, 1.0));
        state.message = event.message.clone();
        while state.history.len() >= capacity {
            state.history.pop_front();
        }
        state.history.push_back(ProgressPoint {
            percent,
            at,
            stage_id: event.stage_id.clone(),
        });
        state.trend = trend(&state.history, &state.stage_id, stall_rate);
        ProgressUpdate::Updated(state.clone())
    }

    fn reject(&self, event: &StageProgress, current: f64) -> ProgressUpdate {
        tracing::debug!(
            target: "wardstream::progress",
            operation = %event.operation_id,
            stage = %event.stage_id,
            current,
            attempted = event.percent_complete,
            "rejected stage progress update",
        );
        ProgressUpdate::Rejected {
            stage_id: event.stage_id.clone(),
            current,
            attempted: event.percent_complete,
        }
    }
}

fn trend(history: &VecDeque<ProgressPoint>, stage_id: &str, stall_rate: f64) -> ProgressTrend {
    let points: Vec<&ProgressPoint> = history
        .iter()
        .rev()
        .take_while(|point| point.stage_id == stage_id)
        .take(3)
        .collect();
    let rate = |newer: &ProgressPoint, older: &ProgressPoint| {
        let elapsed = seconds_between(older.at, newer.at);
        let delta = newer.percent - older.percent;
        if elapsed > 0.0 {
            delta / elapsed
        } else if delta > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    };
    match points.as_slice() {
        [latest, previous, older] => {
            let latest_rate = rate(latest, previous);
            if latest_rate <= stall_rate {
                ProgressTrend::Stalled
            } else if latest_rate > rate(previous, older) {
                ProgressTrend::Accelerating
            } else {
                ProgressTrend::Stable
            }
        }
        [latest, previous] if rate(latest, previous) <= stall_rate => ProgressTrend::Stalled,
        _ => ProgressTrend::Stable,
    }
}

/// Render an ETA in seconds for display; `None` when unknown.
pub fn format_eta(eta_seconds: Option<f64>) -> Option<String> {
    let seconds = eta_seconds.filter(|eta| eta.is_finite())?.max(0.0).round() as u64;
    Some(if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3_600 {
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {:02}m", seconds / 3_600, (seconds % 3_600) / 60)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(operation: &str, stage: &str, percent: f64) -> StageProgress {
        StageProgress {
            operation_id: operation.into(),
            stage_id: stage.into(),
            percent_complete: percent,
            eta_seconds: Some(90.0),
            confidence: Some(0.8),
            message: None,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn updated(update: ProgressUpdate) -> ProgressState {
        match update {
            ProgressUpdate::Updated(state) => state,
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn regression_within_stage_is_rejected() {
        let mut tracker = ProgressTracker::new(ProgressConfig::default());
        tracker.apply(&event("brief-1", "collect", 0.5), at(0));
        let rejected = tracker.apply(&event("brief-1", "collect", 0.3), at(5));
        assert_eq!(
            rejected,
            ProgressUpdate::Rejected {
                stage_id: "collect".into(),
                current: 0.5,
                attempted: 0.3,
            }
        );
        let state = tracker.current().unwrap();
        assert_eq!(state.percent_complete, 0.5);
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn new_stage_may_reset_percent() {
        let mut tracker = ProgressTracker::new(ProgressConfig::default());
        tracker.apply(&event("brief-1", "collect", 0.9), at(0));
        let state = updated(tracker.apply(&event("brief-1", "summarise", 0.1), at(5)));
        assert_eq!(state.stage_id, "summarise");
        assert_eq!(state.percent_complete, 0.1);
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn new_operation_replaces_state() {
        let mut tracker = ProgressTracker::new(ProgressConfig::default());
        tracker.apply(&event("brief-1", "collect", 0.9), at(0));
        let state = updated(tracker.apply(&event("brief-2", "collect", 0.2), at(5)));
        assert_eq!(state.operation_id, "brief-2");
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut tracker = ProgressTracker::new(ProgressConfig {
            history_capacity: 4,
            ..Default::default()
        });
        for step in 0..10 {
            tracker.apply(&event("brief-1", "collect", step as f64 / 10.0), at(step));
        }
        let state = tracker.current().unwrap();
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.history.front().unwrap().percent, 0.6);
    }

    #[test]
    fn trend_follows_latest_rates() {
        let mut tracker = ProgressTracker::new(ProgressConfig::default());
        tracker.apply(&event("brief-1", "collect", 0.10), at(0));
        tracker.apply(&event("brief-1", "collect", 0.20), at(10));
        let state = updated(tracker.apply(&event("brief-1", "collect", 0.40), at(20)));
        assert_eq!(state.trend, ProgressTrend::Accelerating);

        let state = updated(tracker.apply(&event("brief-1", "collect", 0.50), at(30)));
        assert_eq!(state.trend, ProgressTrend::Stable);

        let state = updated(tracker.apply(&event("brief-1", "collect", 0.50), at(40)));
        assert_eq!(state.trend, ProgressTrend::Stalled);
    }

    #[test]
    fn out_of_range_values_are_clamped_and_nan_rejected() {
        let mut tracker = ProgressTracker::new(ProgressConfig::default());
        let mut overshoot = event("brief-1", "collect", 1.4);
        overshoot.confidence = Some(2.0);
        let state = updated(tracker.apply(&overshoot, at(0)));
        assert_eq!(state.percent_complete, 1.0);
        assert_eq!(state.confidence, Some(1.0));
        assert!(matches!(
            tracker.apply(&event("brief-1", "collect", f64::NAN), at(1)),
            ProgressUpdate::Rejected { .. }
        ));
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(None), None);
        assert_eq!(format_eta(Some(f64::NAN)), None);
        assert_eq!(format_eta(Some(-3.0)).as_deref(), Some("0s"));
        assert_eq!(format_eta(Some(42.4)).as_deref(), Some("42s"));
        assert_eq!(format_eta(Some(125.0)).as_deref(), Some("2m 05s"));
        assert_eq!(format_eta(Some(7_260.0)).as_deref(), Some("2h 01m"));
    }
}
