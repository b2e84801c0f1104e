//! ---
//! ws_section: "11-simulation"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Scripted fakes and recorders for session manager scenarios."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! Deterministic stand-ins for the session manager's collaborators. Channel
//! scripts are queued per topic and consumed one per open attempt, so a test
//! can describe "fail twice, then stream these events" without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use wardstream_resilience::channel::{
    Channel, ChannelEvent, ChannelSource, DataOrigin, FallbackSource, StageProgress,
};
use wardstream_resilience::error::StreamError;
use wardstream_resilience::fallback::{EmergencyNotice, EmergencySink, FallbackMode};
use wardstream_resilience::health::{MemoryProbe, MemoryReading};
use wardstream_resilience::listener::StreamListener;
use wardstream_resilience::predictive::PredictiveWarning;
use wardstream_resilience::progress::ProgressState;
use wardstream_resilience::session::{SessionSnapshot, SessionState};

/// Outcome of one open attempt.
#[derive(Debug, Clone)]
pub enum OpenScript {
    /// The open fails with the given fault.
    Fail(StreamError),
    /// The open succeeds and the channel plays the script.
    Accept(ChannelScript),
    /// The open never completes.
    Hang,
    /// Wait, then resolve the inner script.
    After(Duration, Box<OpenScript>),
}

impl OpenScript {
    pub fn fail(error: StreamError) -> Self {
        OpenScript::Fail(error)
    }

    pub fn network_failure() -> Self {
        OpenScript::Fail(StreamError::Transport("connection refused".into()))
    }

    /// Accept and keep the channel open with no events.
    pub fn accept() -> Self {
        OpenScript::Accept(ChannelScript::new())
    }

    pub fn after(delay: Duration, then: OpenScript) -> Self {
        OpenScript::After(delay, Box::new(then))
    }
}

#[derive(Debug, Clone)]
enum ChannelStep {
    Emit(ChannelEvent),
    Wait(Duration),
    End,
}

/// Sequence of events played by an accepted channel. After the last step the
/// channel stays open silently unless [`ChannelScript::end`] was called.
#[derive(Debug, Clone, Default)]
pub struct ChannelScript {
    steps: VecDeque<ChannelStep>,
}

impl ChannelScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(mut self, event: ChannelEvent) -> Self {
        self.steps.push_back(ChannelStep::Emit(event));
        self
    }

    pub fn data(self, payload: Value) -> Self {
        self.emit(ChannelEvent::Data(payload))
    }

    pub fn progress(self, progress: StageProgress) -> Self {
        self.emit(ChannelEvent::StageProgress(progress))
    }

    pub fn heartbeat(self, round_trip: Duration) -> Self {
        self.emit(ChannelEvent::Heartbeat { round_trip })
    }

    pub fn error(self, error: StreamError) -> Self {
        self.emit(ChannelEvent::Error(error))
    }

    pub fn wait(mut self, delay: Duration) -> Self {
        self.steps.push_back(ChannelStep::Wait(delay));
        self
    }

    /// End the transport without a close frame.
    pub fn end(mut self) -> Self {
        self.steps.push_back(ChannelStep::End);
        self
    }
}

/// [`ChannelSource`] driven by per-topic scripts.
#[derive(Debug)]
pub struct ScriptedChannelSource {
    scripts: Mutex<HashMap<String, VecDeque<OpenScript>>>,
    exhausted: OpenScript,
    opens: Mutex<Vec<String>>,
    releases: Arc<AtomicUsize>,
}

impl ScriptedChannelSource {
    /// Once a topic's queue is empty every further open fails with a network fault.
    pub fn new() -> Self {
        Self::with_exhausted(OpenScript::network_failure())
    }

    /// Use `exhausted` once a topic's queue is empty.
    pub fn with_exhausted(exhausted: OpenScript) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            exhausted,
            opens: Mutex::new(Vec::new()),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue the outcome of the next open attempt for `topic`.
    pub fn push(&self, topic: &str, script: OpenScript) -> &Self {
        self.scripts
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(script);
        self
    }

    /// Number of open attempts made for `topic`.
    pub fn open_count(&self, topic: &str) -> usize {
        self.opens
            .lock()
            .iter()
            .filter(|opened| opened.as_str() == topic)
            .count()
    }

    /// Number of channels released by the session manager.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn next_script(&self, topic: &str) -> OpenScript {
        self.scripts
            .lock()
            .get_mut(topic)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.exhausted.clone())
    }
}

impl Default for ScriptedChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelSource for ScriptedChannelSource {
    async fn open(&self, topic: &str) -> Result<Box<dyn Channel>, StreamError> {
        self.opens.lock().push(topic.to_string());
        let mut script = self.next_script(topic);
        loop {
            match script {
                OpenScript::Fail(error) => return Err(error),
                OpenScript::Accept(channel) => {
                    return Ok(Box::new(ScriptedChannel {
                        steps: channel.steps,
                        deadline: None,
                        releases: self.releases.clone(),
                    }))
                }
                OpenScript::Hang => std::future::pending::<()>().await,
                OpenScript::After(delay, then) => {
                    tokio::time::sleep(delay).await;
                    script = *then;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedChannel {
    steps: VecDeque<ChannelStep>,
    deadline: Option<Instant>,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(deadline) = self.deadline {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            match self.steps.pop_front() {
                Some(ChannelStep::Emit(event)) => return Some(event),
                Some(ChannelStep::Wait(delay)) => self.deadline = Some(Instant::now() + delay),
                Some(ChannelStep::End) => return None,
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// [`FallbackSource`] returning canned responses per topic.
#[derive(Debug, Default)]
pub struct ScriptedFallbackSource {
    responses: Mutex<HashMap<String, Result<Value, StreamError>>>,
    fetches: Mutex<Vec<String>>,
}

impl ScriptedFallbackSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, topic: &str, response: Result<Value, StreamError>) -> &Self {
        self.responses.lock().insert(topic.to_string(), response);
        self
    }

    pub fn fetch_count(&self, topic: &str) -> usize {
        self.fetches
            .lock()
            .iter()
            .filter(|fetched| fetched.as_str() == topic)
            .count()
    }
}

#[async_trait]
impl FallbackSource for ScriptedFallbackSource {
    async fn fetch(&self, topic: &str) -> Result<Value, StreamError> {
        self.fetches.lock().push(topic.to_string());
        self.responses
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_else(|| Err(StreamError::http(404, "no canned response")))
    }
}

/// Everything a [`RecordingListener`] observed, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    State(SessionSnapshot),
    Warnings(Vec<PredictiveWarning>),
    Progress(String, ProgressState),
    Data(String, Value, DataOrigin),
    Fallback(FallbackMode),
    Escalation(SessionSnapshot),
}

/// Listener that keeps every callback for later assertions.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Snapshots delivered for `topic`, in order.
    pub fn snapshots(&self, topic: &str) -> Vec<SessionSnapshot> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::State(snapshot) if snapshot.topic == topic => Some(snapshot.clone()),
                _ => None,
            })
            .collect()
    }

    /// States delivered for `topic`, in order.
    pub fn states(&self, topic: &str) -> Vec<SessionState> {
        self.snapshots(topic)
            .into_iter()
            .map(|snapshot| snapshot.state)
            .collect()
    }

    pub fn fallback_modes(&self) -> Vec<FallbackMode> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Fallback(mode) => Some(*mode),
                _ => None,
            })
            .collect()
    }

    pub fn escalations(&self) -> Vec<SessionSnapshot> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Escalation(snapshot) => Some(snapshot.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn data(&self, topic: &str) -> Vec<(Value, DataOrigin)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Data(from, payload, origin) if from == topic => {
                    Some((payload.clone(), *origin))
                }
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self, topic: &str) -> Vec<ProgressState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Progress(from, state) if from == topic => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Latest warning set delivered, if any.
    pub fn latest_warnings(&self) -> Option<Vec<PredictiveWarning>> {
        self.events.lock().iter().rev().find_map(|event| match event {
            Recorded::Warnings(warnings) => Some(warnings.clone()),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: Recorded) {
        self.events.lock().push(event);
    }
}

impl StreamListener for RecordingListener {
    fn on_state_change(&self, snapshot: &SessionSnapshot) {
        self.record(Recorded::State(snapshot.clone()));
    }

    fn on_predictive_warning(&self, warnings: &[PredictiveWarning]) {
        self.record(Recorded::Warnings(warnings.to_vec()));
    }

    fn on_progress(&self, topic: &str, progress: &ProgressState) {
        self.record(Recorded::Progress(topic.to_string(), progress.clone()));
    }

    fn on_data(&self, topic: &str, payload: &Value, origin: DataOrigin) {
        self.record(Recorded::Data(topic.to_string(), payload.clone(), origin));
    }

    fn on_fallback_change(&self, mode: FallbackMode) {
        self.record(Recorded::Fallback(mode));
    }

    fn on_escalation(&self, snapshot: &SessionSnapshot) {
        self.record(Recorded::Escalation(snapshot.clone()));
    }
}

/// Emergency sink that keeps every notice.
#[derive(Debug, Default)]
pub struct RecordingEmergencySink {
    notices: Mutex<Vec<EmergencyNotice>>,
}

impl RecordingEmergencySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<EmergencyNotice> {
        self.notices.lock().clone()
    }
}

impl EmergencySink for RecordingEmergencySink {
    fn notify(&self, notice: &EmergencyNotice) {
        self.notices.lock().push(notice.clone());
    }
}

/// Memory probe replaying a queue of readings; the last one repeats.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    readings: Mutex<VecDeque<MemoryReading>>,
    last: Mutex<Option<MemoryReading>>,
}

impl FixedMemoryProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Probe always reporting `used` of `total` bytes.
    pub fn constant(used_bytes: u64, total_bytes: u64) -> Arc<Self> {
        let probe = Self::new();
        probe.push(used_bytes, total_bytes);
        probe
    }

    pub fn push(&self, used_bytes: u64, total_bytes: u64) {
        self.readings.lock().push_back(MemoryReading {
            used_bytes,
            total_bytes,
        });
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn read(&self) -> Option<MemoryReading> {
        let next = self.readings.lock().pop_front();
        let mut last = self.last.lock();
        if next.is_some() {
            *last = next;
        }
        *last
    }
}

/// Poll `condition` every 10 ms until it holds or `limit` elapses. Works with
/// paused time, where sleeps auto-advance the clock.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scripts_are_consumed_in_order() {
        let source = ScriptedChannelSource::new();
        source
            .push("ward-1", OpenScript::fail(StreamError::http(401, "")))
            .push(
                "ward-1",
                OpenScript::Accept(
                    ChannelScript::new()
                        .data(serde_json::json!({"seq": 1}))
                        .wait(Duration::from_secs(1))
                        .end(),
                ),
            );

        assert!(source.open("ward-1").await.is_err());
        let mut channel = source.open("ward-1").await.unwrap();
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Data(serde_json::json!({"seq": 1})))
        );
        let started = Instant::now();
        assert_eq!(channel.next_event().await, None);
        assert!(started.elapsed() >= Duration::from_secs(1));
        channel.release();
        assert_eq!(source.release_count(), 1);

        assert!(matches!(
            source.open("ward-1").await,
            Err(StreamError::Transport(_))
        ));
        assert_eq!(source.open_count("ward-1"), 3);
    }

    #[test]
    fn probe_repeats_last_reading() {
        let probe = FixedMemoryProbe::new();
        assert_eq!(probe.read(), None);
        probe.push(1, 4);
        probe.push(2, 4);
        assert_eq!(probe.read().unwrap().used_bytes, 1);
        assert_eq!(probe.read().unwrap().used_bytes, 2);
        assert_eq!(probe.read().unwrap().used_bytes, 2);
    }
}
