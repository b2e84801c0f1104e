//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Resilient streaming session core."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! Streaming session core: fault classification, retry scheduling, the
//! per-topic session state machine and its async manager, fallback
//! degradation, health sampling with predictive warnings, and stage progress
//! tracking.

pub mod backoff;
pub mod channel;
pub mod error;
pub mod fallback;
pub mod health;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod predictive;
pub mod progress;
pub mod session;

pub use backoff::BackoffPolicy;
pub use channel::{
    Channel, ChannelEvent, ChannelSource, ConnectivitySignal, DataOrigin, FallbackSource,
    StageProgress,
};
pub use error::{classify, ErrorKind, SessionError, StreamError};
pub use fallback::{
    EmergencyNotice, EmergencySink, FallbackChange, FallbackController, FallbackMode,
    LoggingEmergencySink,
};
pub use health::{
    HealthHistory, HealthSample, HealthSampler, HealthSignals, MemoryProbe, MemoryReading,
    SystemMemoryProbe,
};
pub use listener::{ListenerGuard, ListenerRegistry, StreamListener};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use metrics::StreamingMetrics;
pub use predictive::{
    health_score, PredictiveAnalyzer, PredictiveWarning, Severity, WarningBoard, WarningKind,
};
pub use progress::{format_eta, ProgressState, ProgressTracker, ProgressTrend, ProgressUpdate};
pub use session::{
    SessionAction, SessionEvent, SessionMachine, SessionSnapshot, SessionState, Transition,
};

/// Crate prelude collecting the types most consumers need.
pub mod prelude {
    pub use super::channel::{ChannelSource, ConnectivitySignal, DataOrigin, FallbackSource};
    pub use super::error::{ErrorKind, SessionError, StreamError};
    pub use super::fallback::{EmergencyNotice, EmergencySink, FallbackMode};
    pub use super::listener::{ListenerGuard, StreamListener};
    pub use super::manager::SessionManager;
    pub use super::predictive::{PredictiveWarning, Severity, WarningKind};
    pub use super::progress::ProgressState;
    pub use super::session::{SessionSnapshot, SessionState};
    pub use wardstream_common::config::StreamMode;
}
