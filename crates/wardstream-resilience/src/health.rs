//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Periodic health sampling into a bounded history."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// One point-in-time health observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    /// Used/total memory in `0..=1`, when the probe could read it.
    pub memory_used_ratio: Option<f64>,
    pub memory_used_bytes: Option<u64>,
    /// Channel faults observed since the previous sample.
    pub recent_error_count: u32,
    /// Mean channel round trip since the previous sample.
    pub recent_latency_ms: Option<f64>,
}

/// Raw memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryReading {
    pub fn ratio(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some((self.used_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0))
    }
}

/// Source of memory figures. `None` means unknown on this platform.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> Option<MemoryReading>;
}

/// Probe backed by `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn read(&self) -> Option<MemoryReading> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total_bytes = system.total_memory();
        if total_bytes == 0 {
            return None;
        }
        Some(MemoryReading {
            used_bytes: system.used_memory(),
            total_bytes,
        })
    }
}

/// Counters fed by session drivers and drained by each sample.
#[derive(Debug, Default)]
pub struct HealthSignals {
    faults: AtomicU32,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
}

impl HealthSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, round_trip: Duration) {
        let micros = u64::try_from(round_trip.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the fault count and mean latency (ms) accumulated since the last drain.
    pub fn drain(&self) -> (u32, Option<f64>) {
        let faults = self.faults.swap(0, Ordering::Relaxed);
        let micros = self.latency_micros.swap(0, Ordering::Relaxed);
        let samples = self.latency_samples.swap(0, Ordering::Relaxed);
        let latency = (samples > 0).then(|| micros as f64 / samples as f64 / 1_000.0);
        (faults, latency)
    }
}

/// Bounded FIFO of samples, oldest evicted first.
#[derive(Debug)]
pub struct HealthHistory {
    capacity: usize,
    samples: Mutex<VecDeque<HealthSample>>,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, sample: HealthSample) {
        let mut samples = self.samples.lock();
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Copy of the history, oldest first.
    pub fn snapshot(&self) -> Vec<HealthSample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<HealthSample> {
        self.samples.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Collects a [`HealthSample`] from the probe and signals on demand.
#[derive(Clone)]
pub struct HealthSampler {
    probe: Arc<dyn MemoryProbe>,
    signals: Arc<HealthSignals>,
    history: Arc<HealthHistory>,
}

impl HealthSampler {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        signals: Arc<HealthSignals>,
        history: Arc<HealthHistory>,
    ) -> Self {
        Self {
            probe,
            signals,
            history,
        }
    }

    pub fn history(&self) -> &Arc<HealthHistory> {
        &self.history
    }

    /// Take one sample, append it to the history and return it.
    pub fn sample(&self, timestamp: DateTime<Utc>) -> HealthSample {
        let memory = self.probe.read();
        let (recent_error_count, recent_latency_ms) = self.signals.drain();
        let sample = HealthSample {
            timestamp,
            memory_used_ratio: memory.and_then(|reading| reading.ratio()),
            memory_used_bytes: memory.map(|reading| reading.used_bytes),
            recent_error_count,
            recent_latency_ms,
        };
        tracing::trace!(
            target: "wardstream::health",
            ratio = ?sample.memory_used_ratio,
            errors = sample.recent_error_count,
            latency_ms = ?sample.recent_latency_ms,
            "health sample",
        );
        self.history.push(sample.clone());
        sample
    }
}

impl std::fmt::Debug for HealthSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthSampler")
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProbe(Option<MemoryReading>);

    impl MemoryProbe for StaticProbe {
        fn read(&self) -> Option<MemoryReading> {
            self.0
        }
    }

    fn sample_at(offset_secs: i64) -> HealthSample {
        HealthSample {
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap(),
            memory_used_ratio: Some(0.5),
            memory_used_bytes: Some(1 << 30),
            recent_error_count: 0,
            recent_latency_ms: None,
        }
    }

    #[test]
    fn history_evicts_oldest_first() {
        let history = HealthHistory::new(3);
        for offset in 0..5 {
            history.push(sample_at(offset));
        }
        let samples = history.snapshot();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].timestamp, sample_at(2).timestamp);
        assert_eq!(history.latest().unwrap().timestamp, sample_at(4).timestamp);
    }

    #[test]
    fn signals_drain_resets_counters() {
        let signals = HealthSignals::new();
        signals.record_fault();
        signals.record_fault();
        signals.record_latency(Duration::from_millis(100));
        signals.record_latency(Duration::from_millis(300));
        let (faults, latency) = signals.drain();
        assert_eq!(faults, 2);
        assert!((latency.unwrap() - 200.0).abs() < 1e-9);
        assert_eq!(signals.drain(), (0, None));
    }

    #[test]
    fn sampler_combines_probe_and_signals() {
        let signals = Arc::new(HealthSignals::new());
        let history = Arc::new(HealthHistory::new(10));
        let sampler = HealthSampler::new(
            Arc::new(StaticProbe(Some(MemoryReading {
                used_bytes: 3,
                total_bytes: 4,
            }))),
            signals.clone(),
            history.clone(),
        );
        signals.record_fault();
        let sample = sampler.sample(Utc::now());
        assert_eq!(sample.memory_used_ratio, Some(0.75));
        assert_eq!(sample.memory_used_bytes, Some(3));
        assert_eq!(sample.recent_error_count, 1);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn unknown_memory_is_recorded_as_none() {
        let sampler = HealthSampler::new(
            Arc::new(StaticProbe(None)),
            Arc::new(HealthSignals::new()),
            Arc::new(HealthHistory::new(2)),
        );
        let sample = sampler.sample(Utc::now());
        assert_eq!(sample.memory_used_ratio, None);
        assert_eq!(sample.memory_used_bytes, None);
    }
}
