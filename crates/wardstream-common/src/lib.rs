//! ---
//! ws_section: "01-core-functionality"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Shared primitives and utilities for the streaming runtime."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! Core shared primitives for the WardStream workspace.
//! This crate exposes configuration loading, tracing bootstrap, and
//! time helpers consumed by the streaming core and its edge adapters.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    BackoffConfig, EndpointConfig, FallbackConfig, HealthConfig, LoadedStreamingConfig,
    LoggingConfig, MetricsConfig, PredictiveConfig, ProgressConfig, SelectionPolicy,
    SessionConfig, StreamMode, StreamingConfig,
};
pub use logging::{init_tracing, LogFormat};
