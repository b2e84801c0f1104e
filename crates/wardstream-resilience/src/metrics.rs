//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Prometheus instrumentation for sessions, faults, fallback, and predictions."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    self, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
};
use wardstream_common::config::StreamMode;
use wardstream_metrics::SharedRegistry;

use crate::error::ErrorKind;
use crate::fallback::FallbackMode;
use crate::predictive::{PredictiveWarning, Severity, WarningKind};
use crate::session::SessionState;

/// Metrics published by the streaming core.
#[derive(Clone)]
pub struct StreamingMetrics {
    registry: SharedRegistry,
    session_transitions_total: IntCounterVec,
    faults_total: IntCounterVec,
    retries_scheduled_total: IntCounterVec,
    retry_delay_seconds: Histogram,
    fallback_mode: IntGauge,
    predictive_warnings: IntGaugeVec,
    emergencies_total: IntCounter,
}

impl StreamingMetrics {
    /// Register the metric families against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let session_transitions_total = IntCounterVec::new(
            Opts::new(
                "wardstream_session_transitions_total",
                "Session state transitions by destination state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(session_transitions_total.clone()))?;

        let faults_total = IntCounterVec::new(
            Opts::new(
                "wardstream_faults_total",
                "Channel faults by classified kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(faults_total.clone()))?;

        let retries_scheduled_total = IntCounterVec::new(
            Opts::new(
                "wardstream_retries_scheduled_total",
                "Automatic retries scheduled by session mode",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(retries_scheduled_total.clone()))?;

        let retry_delay_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "wardstream_retry_delay_seconds",
                "Delay armed before each automatic retry",
            )
            .buckets(prometheus::exponential_buckets(0.125, 2.0, 10)?),
        )?;
        registry.register(Box::new(retry_delay_seconds.clone()))?;

        let fallback_mode = IntGauge::new(
            "wardstream_fallback_mode",
            "Current fallback mode (0 none, 1 polling, 2 offline, 3 emergency)",
        )?;
        registry.register(Box::new(fallback_mode.clone()))?;

        let predictive_warnings = IntGaugeVec::new(
            Opts::new(
                "wardstream_predictive_warnings",
                "Active predictive warnings by kind and severity",
            ),
            &["kind", "severity"],
        )?;
        registry.register(Box::new(predictive_warnings.clone()))?;

        let emergencies_total = IntCounter::new(
            "wardstream_emergencies_total",
            "Transitions into emergency fallback",
        )?;
        registry.register(Box::new(emergencies_total.clone()))?;

        Ok(Self {
            registry,
            session_transitions_total,
            faults_total,
            retries_scheduled_total,
            retry_delay_seconds,
            fallback_mode,
            predictive_warnings,
            emergencies_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_transition(&self, state: SessionState) {
        self.session_transitions_total
            .with_label_values(&[state.as_str()])
            .inc();
    }

    pub fn record_fault(&self, kind: ErrorKind) {
        self.faults_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Count a scheduled retry and observe its delay.
    pub fn record_retry(&self, mode: StreamMode, delay: Duration) {
        self.retries_scheduled_total
            .with_label_values(&[mode.as_str()])
            .inc();
        self.retry_delay_seconds.observe(delay.as_secs_f64());
    }

    pub fn set_fallback_mode(&self, mode: FallbackMode) {
        self.fallback_mode.set(mode.ordinal());
        if mode == FallbackMode::Emergency {
            self.emergencies_total.inc();
        }
    }

    /// Replace the warning gauges with the latest set.
    pub fn set_warnings(&self, warnings: &[PredictiveWarning]) {
        for kind in WarningKind::ALL {
            for severity in [Severity::Warning, Severity::Critical] {
                let active = warnings
                    .iter()
                    .filter(|warning| warning.kind == kind && warning.severity == severity)
                    .count();
                self.predictive_warnings
                    .with_label_values(&[kind.as_str(), severity.as_str()])
                    .set(active as i64);
            }
        }
    }
}

impl std::fmt::Debug for StreamingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;
    use wardstream_metrics::new_registry;

    fn render(registry: &SharedRegistry) -> String {
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn families_render_with_labels() {
        let registry = new_registry();
        let metrics = StreamingMetrics::new(registry.clone()).unwrap();
        metrics.record_transition(SessionState::Reconnecting);
        metrics.record_fault(ErrorKind::RateLimited);
        metrics.record_retry(StreamMode::HighAvailability, Duration::from_millis(250));
        metrics.set_fallback_mode(FallbackMode::Emergency);

        let text = render(&registry);
        assert!(text.contains("wardstream_session_transitions_total{state=\"reconnecting\"} 1"));
        assert!(text.contains("wardstream_faults_total{kind=\"rate_limited\"} 1"));
        assert!(text.contains(
            "wardstream_retries_scheduled_total{mode=\"high_availability\"} 1"
        ));
        assert!(text.contains("wardstream_fallback_mode 3"));
        assert!(text.contains("wardstream_emergencies_total 1"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        StreamingMetrics::new(registry.clone()).unwrap();
        assert!(StreamingMetrics::new(registry).is_err());
    }
}
