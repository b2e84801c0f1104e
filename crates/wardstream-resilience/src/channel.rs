//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Boundary contracts for push channels, polling sources, and connectivity."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::StreamError;

/// Stage progress reported in-band by a long-running remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Identifier of the overall operation (e.g. one briefing generation).
    pub operation_id: String,
    /// Identifier of the current stage.
    pub stage_id: String,
    /// Fraction complete in `0..=1`.
    pub percent_complete: f64,
    /// Remaining time as estimated by the source.
    #[serde(default)]
    pub eta_seconds: Option<f64>,
    /// Source confidence in `0..=1`.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Optional human-readable stage description.
    #[serde(default)]
    pub message: Option<String>,
}

/// Event delivered by an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Payload for the dashboard.
    Data(serde_json::Value),
    /// Multi-stage progress update.
    StageProgress(StageProgress),
    /// Keep-alive carrying the measured round trip.
    Heartbeat {
        /// Round-trip latency observed by the transport.
        round_trip: Duration,
    },
    /// In-band fault signalled by the backend.
    Error(StreamError),
    /// Graceful close signalled by the backend.
    Closed,
}

/// One open push subscription.
#[async_trait]
pub trait Channel: Send {
    /// Await the next event. `None` means the transport ended without an
    /// explicit close frame.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Release transport resources. Called once when the session leaves the channel.
    fn release(&mut self) {}
}

/// Opens push subscriptions keyed by topic.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Establish a channel for `topic`.
    async fn open(&self, topic: &str) -> Result<Box<dyn Channel>, StreamError>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Request/response endpoint used while polling replaces the push channel.
#[async_trait]
pub trait FallbackSource: Send + Sync {
    /// Fetch the latest payload for `topic`.
    async fn fetch(&self, topic: &str) -> Result<serde_json::Value, StreamError>;
}

/// Where a payload delivered to listeners came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    /// Live push channel.
    Stream,
    /// Polling fallback.
    Polling,
}

/// Process-wide online/offline indicator.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivitySignal {
    /// Create a signal with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new connectivity state. Repeated values are not re-broadcast.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connectivity_broadcasts_only_changes() {
        let signal = ConnectivitySignal::default();
        let mut rx = signal.subscribe();
        signal.set_online(true);
        assert!(!rx.has_changed().unwrap());
        signal.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!signal.is_online());
    }

    #[test]
    fn stage_progress_deserialises_with_optional_fields() {
        let progress: StageProgress = serde_json::from_str(
            r#"{"operation_id":"brief-1","stage_id":"collect","percent_complete":0.25}"#,
        )
        .unwrap();
        assert_eq!(progress.stage_id, "collect");
        assert_eq!(progress.eta_seconds, None);
    }
}
