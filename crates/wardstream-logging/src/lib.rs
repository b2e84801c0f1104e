//! ---
//! ws_section: "03-persistence-logging"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Structured logging adapters and sinks."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tests and local runs.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_test_writer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Topic (ward) the event relates to.
    pub topic: Option<&'a str>,
    /// Session state label at the time of the event.
    pub state: Option<&'a str>,
    /// Retry attempt counter.
    pub attempt: Option<u32>,
    /// Operating mode (standard or high availability).
    pub mode: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a topic identifier.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach a session state label.
    pub fn with_state(mut self, state: &'a str) -> Self {
        self.state = Some(state);
        self
    }

    /// Attach the current attempt counter.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attach an operating mode descriptor.
    pub fn with_mode(mut self, mode: &'a str) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation degraded but the session keeps recovering.
    Degraded,
    /// The operation failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Degraded => "degraded",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event with an outcome classification.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let default_ctx = LogContext::default();
    let ctx = context.unwrap_or(&default_ctx);
    macro_rules! emit {
        ($level:expr) => {
            tracing::event!(
                target: "wardstream::lifecycle",
                $level,
                event,
                outcome = outcome.as_str(),
                topic = ctx.topic.unwrap_or(""),
                state = ctx.state.unwrap_or(""),
                attempt = ctx.attempt.unwrap_or_default(),
                mode = ctx.mode.unwrap_or(""),
                message = %message
            )
        };
    }
    match outcome {
        LifecycleOutcome::Fault => emit!(Level::ERROR),
        LifecycleOutcome::Degraded => emit!(Level::WARN),
        LifecycleOutcome::Success => emit!(Level::INFO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new().with_topic("ward-12").with_attempt(2);
        stream_info!(context = ctx.clone(), "session streaming");
        stream_warn!(context = ctx.clone(), "retry scheduled in {}ms", 250);
        stream_debug!("debug message");
        stream_error!(context = ctx, "error kind: {}", "network");
    }

    #[test]
    fn lifecycle_helper_emits() {
        init();
        let ctx = LogContext::new().with_topic("ward-3").with_state("failed");
        log_lifecycle_event(
            Some(&ctx),
            "session.failed",
            "retry budget exhausted",
            LifecycleOutcome::Fault,
        );
        log_lifecycle_event(
            None,
            "session.streaming",
            "channel established",
            LifecycleOutcome::Success,
        );
        log_lifecycle_event(
            None,
            "session.reconnecting",
            "network fault",
            LifecycleOutcome::Degraded,
        );
    }
}
