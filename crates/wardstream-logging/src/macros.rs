//! ---
//! ws_section: "03-persistence-logging"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Structured logging adapters and sinks."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---

#[doc(hidden)]
#[macro_export]
macro_rules! __stream_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            target: "wardstream::session",
            $level,
            topic = ctx.topic.unwrap_or(""),
            state = ctx.state.unwrap_or(""),
            attempt = ctx.attempt.unwrap_or_default(),
            mode = ctx.mode.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with session context.
#[macro_export]
macro_rules! stream_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with session context.
#[macro_export]
macro_rules! stream_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with session context.
#[macro_export]
macro_rules! stream_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with session context.
#[macro_export]
macro_rules! stream_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__stream_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
