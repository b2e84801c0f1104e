//! ---
//! ws_section: "01-core-functionality"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Tracing bootstrap for WardStream binaries and test runs."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! Session events are emitted under `wardstream::*` targets; this module only
//! decides where they go. The filter comes from `WARDSTREAM_LOG`, then
//! `RUST_LOG`, then [`DEFAULT_DIRECTIVE`].
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "WARDSTREAM_LOG";
/// Session internals at debug, everything else at info.
pub const DEFAULT_DIRECTIVE: &str = "info,wardstream=debug";

/// Appender workers must outlive the process' last event.
static WRITER_GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Stdout rendering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event, suitable for log shippers.
    #[default]
    StructuredJson,
    /// Human-readable multi-field lines.
    Pretty,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber: stdout in the configured format plus a daily
/// rolling JSON file under `config.directory`.
///
/// Returns `Ok(false)` when a subscriber was already installed (tests, or a host
/// application that set up its own); the existing one is left in place.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "failed to create log directory {}",
            config.directory.display()
        )
    })?;

    let appender = rolling::daily(&config.directory, format!("{}.log", config.file_prefix));
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let installed = tracing_subscriber::registry()
        .with(vec![
            stdout_layer(config.format, stdout_writer),
            file_layer(file_writer),
        ])
        .with(session_filter())
        .try_init()
        .is_ok();
    if !installed {
        return Ok(false);
    }
    let _ = WRITER_GUARDS.set([file_guard, stdout_guard]);

    tracing::info!(
        target: "wardstream::logging",
        directory = %config.directory.display(),
        prefix = %config.file_prefix,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(true)
}

fn session_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!(
                "ignoring invalid {LOG_ENV}={directive:?} ({err}); using {DEFAULT_DIRECTIVE}"
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

fn stdout_layer(format: LogFormat, writer: NonBlocking) -> BoxedLayer {
    let layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.json().flatten_event(true).boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    }
}

fn file_layer(writer: NonBlocking) -> BoxedLayer {
    fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_ansi(false)
        .json()
        .with_current_span(false)
        .with_writer(writer)
        .boxed()
}
