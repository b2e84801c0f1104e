//! ---
//! ws_section: "01-core-functionality"
//! ws_subsection: "binary"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Binary entrypoint for the streaming probe."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::signal;
use tracing::{info, warn};
use wardstream_common::config::{SelectionPolicy, StreamMode, StreamingConfig};
use wardstream_common::logging::init_tracing;
use wardstream_metrics::{new_registry, spawn_http_server, DiagnosticsProvider};
use wardstream_net::{build_client, HttpFallbackSource, SseChannelSource};
use wardstream_resilience::prelude::*;
use wardstream_resilience::StreamingMetrics;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("WardStream probe ", env!("CARGO_PKG_VERSION")),
    about = "Open ward sessions against a live endpoint and report their health",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long = "ward",
        value_name = "TOPIC",
        action = ArgAction::Append,
        help = "Ward to subscribe to; repeat to watch several"
    )]
    wards: Vec<String>,

    #[arg(long, help = "Open sessions in campaign (high-availability) mode")]
    campaign: bool,

    #[arg(long, value_name = "URL", help = "Override endpoint.base_url")]
    endpoint: Option<String>,

    #[arg(long, env = "WARDSTREAM_TOKEN", hide_env_values = true, help = "Bearer token")]
    token: Option<String>,

    #[arg(
        long,
        value_name = "SECS",
        help = "Exit after this many seconds instead of waiting for ctrl-c"
    )]
    duration: Option<u64>,
}

/// Writes every listener callback to the log.
struct LoggingListener;

impl StreamListener for LoggingListener {
    fn on_state_change(&self, snapshot: &SessionSnapshot) {
        info!(
            target: "wardstream::probe",
            topic = %snapshot.topic,
            state = %snapshot.state,
            attempt = snapshot.attempt_count,
            fallback = %snapshot.fallback_mode,
            auth_required = snapshot.auth_required,
            "session state"
        );
    }

    fn on_predictive_warning(&self, warnings: &[PredictiveWarning]) {
        if warnings.is_empty() {
            info!(target: "wardstream::probe", "predictive warnings cleared");
        }
        for warning in warnings {
            warn!(
                target: "wardstream::probe",
                kind = %warning.kind,
                severity = %warning.severity,
                "{}",
                warning.message
            );
        }
    }

    fn on_progress(&self, topic: &str, progress: &ProgressState) {
        info!(
            target: "wardstream::probe",
            topic,
            stage = %progress.stage_id,
            percent = progress.percent_complete * 100.0,
            eta = progress.eta_label().unwrap_or_else(|| "unknown".to_string()),
            trend = %progress.trend,
            "progress"
        );
    }

    fn on_data(&self, topic: &str, payload: &serde_json::Value, origin: DataOrigin) {
        info!(target: "wardstream::probe", topic, ?origin, %payload, "payload");
    }

    fn on_fallback_change(&self, mode: FallbackMode) {
        warn!(target: "wardstream::probe", %mode, "fallback mode changed");
    }

    fn on_escalation(&self, snapshot: &SessionSnapshot) {
        warn!(
            target: "wardstream::probe",
            topic = %snapshot.topic,
            last_error = ?snapshot.last_error_kind,
            "campaign session failed"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/wardstream.toml"));

    let (mut config, source) = match StreamingConfig::load_with_source(&candidates) {
        Ok(loaded) => (loaded.config, Some(loaded.source)),
        Err(err) if cli.config.is_none() => {
            eprintln!("no configuration file found, using defaults: {err:#}");
            (StreamingConfig::default(), None)
        }
        Err(err) => return Err(err),
    };
    if let Some(base_url) = cli.endpoint {
        config.endpoint.base_url = base_url;
    }
    if cli.token.is_some() {
        config.endpoint.bearer_token = cli.token;
    }
    if cli.wards.len() > 1 {
        config.session.selection = SelectionPolicy::Concurrent;
    }
    config.validate().context("invalid configuration after overrides")?;

    init_tracing(&config.logging)?;
    match &source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("running with default configuration"),
    }

    run_probe(config, cli.wards, cli.campaign, cli.duration.map(Duration::from_secs)).await
}

async fn run_probe(
    config: StreamingConfig,
    wards: Vec<String>,
    campaign: bool,
    duration: Option<Duration>,
) -> Result<()> {
    let registry = new_registry();
    let metrics = StreamingMetrics::new(registry.clone())?;

    let client = build_client(&config.endpoint)?;
    let channels = SseChannelSource::with_client(client.clone(), config.endpoint.clone());
    let polling = HttpFallbackSource::with_client(client, config.endpoint.clone());
    let metrics_settings = config.metrics.clone();

    let manager = SessionManager::builder(config, Arc::new(channels))
        .fallback_source(Arc::new(polling))
        .metrics(metrics)
        .build();
    manager.listeners().subscribe(Arc::new(LoggingListener)).detach();
    let monitor = manager.spawn_health_monitor();

    let metrics_server = if metrics_settings.enabled {
        let provider: Arc<dyn DiagnosticsProvider> = Arc::new(manager.clone());
        let server = spawn_http_server(registry, Some(provider), metrics_settings.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mode = if campaign {
        StreamMode::HighAvailability
    } else {
        StreamMode::Standard
    };
    if wards.is_empty() {
        warn!("no --ward given; only health sampling will run");
    }
    for ward in &wards {
        manager
            .open(ward, mode)
            .await
            .with_context(|| format!("failed to open ward {ward}"))?;
    }

    info!(wards = wards.len(), %mode, "probe running");
    match duration {
        Some(limit) => tokio::select! {
            _ = tokio::time::sleep(limit) => info!("probe duration elapsed"),
            result = signal::ctrl_c() => {
                result?;
                info!("ctrl-c received; shutting down");
            }
        },
        None => {
            signal::ctrl_c().await?;
            info!("ctrl-c received; shutting down");
        }
    }

    let report = serde_json::to_string_pretty(&manager.diagnostics())?;
    manager.shutdown().await;
    if let Err(err) = monitor.await {
        warn!(error = %err, "health monitor ended abnormally");
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    println!("{report}");
    Ok(())
}
