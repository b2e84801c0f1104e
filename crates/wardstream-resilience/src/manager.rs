//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Async session manager: per-topic drivers, fallback polling, health monitoring."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! Each session is owned by one driver task, the only writer of its
//! [`SessionMachine`]. The driver multiplexes its command queue, the
//! connectivity watch and the current link (open in flight, live channel or
//! retry timer) with `tokio::select!`. Closing a session is a command that is
//! acknowledged once the `Closed` transition has been published; the driver
//! then exits, dropping whatever open was still in flight.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use wardstream_common::config::{SelectionPolicy, StreamMode, StreamingConfig};
use wardstream_common::time::utc_now;
use wardstream_logging::{
    log_lifecycle_event, stream_debug, stream_info, stream_warn, LifecycleOutcome, LogContext,
};
use wardstream_metrics::DiagnosticsProvider;

use crate::backoff::BackoffPolicy;
use crate::channel::{
    Channel, ChannelEvent, ChannelSource, ConnectivitySignal, DataOrigin, FallbackSource,
};
use crate::error::{classify, SessionError, StreamError};
use crate::fallback::{EmergencySink, FallbackController, FallbackMode, LoggingEmergencySink};
use crate::health::{
    HealthHistory, HealthSample, HealthSampler, HealthSignals, MemoryProbe, SystemMemoryProbe,
};
use crate::listener::ListenerRegistry;
use crate::metrics::StreamingMetrics;
use crate::predictive::{PredictiveAnalyzer, PredictiveWarning, WarningBoard};
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::session::{SessionAction, SessionEvent, SessionMachine, SessionSnapshot, SessionState};

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: StreamingConfig,
    channels: Arc<dyn ChannelSource>,
    fallback_source: Option<Arc<dyn FallbackSource>>,
    emergency_sink: Arc<dyn EmergencySink>,
    memory_probe: Arc<dyn MemoryProbe>,
    connectivity: ConnectivitySignal,
    metrics: Option<StreamingMetrics>,
}

impl SessionManagerBuilder {
    /// Source used while polling replaces push channels.
    pub fn fallback_source(mut self, source: Arc<dyn FallbackSource>) -> Self {
        self.fallback_source = Some(source);
        self
    }

    pub fn emergency_sink(mut self, sink: Arc<dyn EmergencySink>) -> Self {
        self.emergency_sink = sink;
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    /// Share an externally owned connectivity signal.
    pub fn connectivity(mut self, connectivity: ConnectivitySignal) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn metrics(mut self, metrics: StreamingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the manager. Must be called from within a tokio runtime.
    pub fn build(self) -> SessionManager {
        let (mode_tx, _) = watch::channel(FallbackMode::None);
        let (shutdown_tx, _) = watch::channel(false);
        let signals = Arc::new(HealthSignals::new());
        let history = Arc::new(HealthHistory::new(self.config.health.capacity));
        let shared = Arc::new(Shared {
            policy: BackoffPolicy::new(self.config.backoff.clone()),
            fallback: Mutex::new(FallbackController::new(
                self.config.fallback.clone(),
                self.emergency_sink,
                self.metrics.clone(),
            )),
            analyzer: PredictiveAnalyzer::new(self.config.predictive.clone()),
            sampler: HealthSampler::new(self.memory_probe, signals.clone(), history),
            config: self.config,
            channels: self.channels,
            listeners: ListenerRegistry::new(),
            connectivity: self.connectivity,
            snapshots: RwLock::new(IndexMap::new()),
            warnings: WarningBoard::new(),
            signals,
            metrics: self.metrics,
            mode_tx,
            shutdown_tx,
        });

        let mut background = Vec::new();
        background.push(tokio::spawn(watch_connectivity(
            Arc::downgrade(&shared),
            shared.connectivity.subscribe(),
            shared.shutdown_tx.subscribe(),
        )));
        if let Some(source) = self.fallback_source {
            background.push(tokio::spawn(run_poller(
                Arc::downgrade(&shared),
                source,
                shared.mode_tx.subscribe(),
                shared.shutdown_tx.subscribe(),
                shared.config.fallback.poll_interval,
            )));
        }

        SessionManager {
            inner: Arc::new(ManagerInner {
                shared,
                sessions: Mutex::new(IndexMap::new()),
                ops: tokio::sync::Mutex::new(()),
                background: Mutex::new(background),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

/// Owns every topic session and the fleet-wide fallback, health and warning state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    shared: Arc<Shared>,
    sessions: Mutex<IndexMap<String, SessionHandle>>,
    ops: tokio::sync::Mutex<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

enum Command {
    Close(oneshot::Sender<()>),
    Retry {
        credentials_refreshed: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// State shared with driver and background tasks. Holds no command senders so
/// that dropping the manager ends every driver.
struct Shared {
    config: StreamingConfig,
    policy: BackoffPolicy,
    channels: Arc<dyn ChannelSource>,
    listeners: ListenerRegistry,
    connectivity: ConnectivitySignal,
    snapshots: RwLock<IndexMap<String, SessionSnapshot>>,
    fallback: Mutex<FallbackController>,
    analyzer: PredictiveAnalyzer,
    sampler: HealthSampler,
    warnings: WarningBoard,
    signals: Arc<HealthSignals>,
    metrics: Option<StreamingMetrics>,
    mode_tx: watch::Sender<FallbackMode>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionManager {
    /// Start a builder with the system memory probe, a logging emergency sink,
    /// a fresh connectivity signal and no polling fallback.
    pub fn builder(
        config: StreamingConfig,
        channels: Arc<dyn ChannelSource>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            channels,
            fallback_source: None,
            emergency_sink: Arc::new(LoggingEmergencySink),
            memory_probe: Arc::new(SystemMemoryProbe::new()),
            connectivity: ConnectivitySignal::default(),
            metrics: None,
        }
    }

    /// Manager with default collaborators. Must be called from within a tokio runtime.
    pub fn new(config: StreamingConfig, channels: Arc<dyn ChannelSource>) -> Self {
        Self::builder(config, channels).build()
    }

    /// Select `topic`. Idempotent for a topic that already has a session. An
    /// empty topic deselects: under the exclusive policy every session is closed.
    /// Under the exclusive policy, other sessions are closed (and awaited)
    /// before the new one starts.
    pub async fn open(&self, topic: &str, mode: StreamMode) -> Result<(), SessionError> {
        self.ensure_running()?;
        let _ops = self.inner.ops.lock().await;
        let exclusive = self.inner.shared.config.session.selection == SelectionPolicy::Exclusive;

        if topic.is_empty() {
            if exclusive {
                self.close_all_locked().await;
            }
            return Ok(());
        }

        if self.inner.sessions.lock().contains_key(topic) {
            stream_debug!(
                context = LogContext::new().with_topic(topic).with_mode(mode.as_str()),
                "topic already open"
            );
            return Ok(());
        }

        if exclusive {
            self.close_all_locked().await;
        }

        let shared = &self.inner.shared;
        let machine = SessionMachine::new(topic, mode, shared.config.session.manual_retry_budget);
        let initial = machine.snapshot(&shared.policy, shared.fallback_mode(), 0);
        shared
            .snapshots
            .write()
            .insert(topic.to_string(), initial);

        let (commands, receiver) = mpsc::unbounded_channel();
        let driver = SessionDriver::new(shared.clone(), machine);
        let task = tokio::spawn(driver.run(receiver));
        self.inner
            .sessions
            .lock()
            .insert(topic.to_string(), SessionHandle { commands, task });
        Ok(())
    }

    /// Open `topic` in the configured default mode.
    pub async fn select(&self, topic: &str) -> Result<(), SessionError> {
        let mode = self.inner.shared.config.session.default_mode;
        self.open(topic, mode).await
    }

    /// Close `topic`. When this returns, the session is `Closed` and no further
    /// transition for it will be observed.
    pub async fn close(&self, topic: &str) -> Result<(), SessionError> {
        let _ops = self.inner.ops.lock().await;
        let handle = self
            .inner
            .sessions
            .lock()
            .shift_remove(topic)
            .ok_or_else(|| SessionError::UnknownTopic(topic.to_string()))?;
        self.finish(topic, handle).await;
        Ok(())
    }

    /// Close every session.
    pub async fn close_all(&self) {
        let _ops = self.inner.ops.lock().await;
        self.close_all_locked().await;
    }

    /// Manual retry of a failed session, bounded by the manual retry budget.
    pub async fn retry(&self, topic: &str) -> Result<(), SessionError> {
        self.send_retry(topic, false).await
    }

    /// Manual retry after the caller refreshed credentials; required for
    /// sessions that failed on authentication.
    pub async fn retry_after_reauthentication(&self, topic: &str) -> Result<(), SessionError> {
        self.send_retry(topic, true).await
    }

    pub fn snapshot(&self, topic: &str) -> Result<SessionSnapshot, SessionError> {
        self.inner
            .shared
            .snapshots
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| SessionError::UnknownTopic(topic.to_string()))
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.inner.shared.snapshots.read().values().cloned().collect()
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        self.inner.shared.fallback_mode()
    }

    /// Subscribe to fallback mode changes.
    pub fn watch_fallback(&self) -> watch::Receiver<FallbackMode> {
        self.inner.shared.mode_tx.subscribe()
    }

    pub fn warnings(&self) -> Vec<PredictiveWarning> {
        self.inner.shared.warnings.current()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.shared.listeners
    }

    pub fn connectivity(&self) -> ConnectivitySignal {
        self.inner.shared.connectivity.clone()
    }

    pub fn health_history(&self) -> Vec<HealthSample> {
        self.inner.shared.sampler.history().snapshot()
    }

    /// Counters fed by channel faults and heartbeats.
    pub fn health_signals(&self) -> Arc<HealthSignals> {
        self.inner.shared.signals.clone()
    }

    /// Take one health sample, re-run the analyzer and publish the warning set
    /// when it changed. Returns the current set.
    pub fn health_tick(&self) -> Vec<PredictiveWarning> {
        self.inner.shared.health_tick()
    }

    /// Sample health every `health.interval` until shutdown.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.inner.shared);
        let shutdown = self.inner.shared.shutdown_tx.subscribe();
        let interval = self.inner.shared.config.health.interval;
        tokio::spawn(run_health_monitor(shared, shutdown, interval))
    }

    /// Close every session and stop background tasks. Further opens fail with
    /// [`SessionError::ManagerShutdown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_all().await;
        self.inner.shared.shutdown_tx.send_replace(true);
        let background: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for task in background {
            let _ = task.await;
        }
        tracing::info!(target: "wardstream::manager", "session manager shut down");
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::ManagerShutdown);
        }
        Ok(())
    }

    async fn send_retry(
        &self,
        topic: &str,
        credentials_refreshed: bool,
    ) -> Result<(), SessionError> {
        self.ensure_running()?;
        let (reply, response) = oneshot::channel();
        {
            let sessions = self.inner.sessions.lock();
            let handle = sessions
                .get(topic)
                .ok_or_else(|| SessionError::UnknownTopic(topic.to_string()))?;
            handle
                .commands
                .send(Command::Retry {
                    credentials_refreshed,
                    reply,
                })
                .map_err(|_| SessionError::ManagerShutdown)?;
        }
        response.await.map_err(|_| SessionError::ManagerShutdown)?
    }

    async fn close_all_locked(&self) {
        let handles: Vec<(String, SessionHandle)> =
            self.inner.sessions.lock().drain(..).collect();
        for (topic, handle) in handles {
            self.finish(&topic, handle).await;
        }
    }

    async fn finish(&self, topic: &str, handle: SessionHandle) {
        let (ack, acknowledged) = oneshot::channel();
        if handle.commands.send(Command::Close(ack)).is_ok() {
            let _ = acknowledged.await;
        }
        if let Err(error) = handle.task.await {
            if error.is_panic() {
                tracing::error!(target: "wardstream::manager", topic, "session driver panicked");
            }
        }
        self.inner.shared.snapshots.write().shift_remove(topic);
        self.inner.shared.reevaluate_fallback();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.sessions.lock().len())
            .field("fallback_mode", &self.fallback_mode())
            .finish_non_exhaustive()
    }
}

impl DiagnosticsProvider for SessionManager {
    fn diagnostics(&self) -> serde_json::Value {
        serde_json::json!({
            "fallback_mode": self.fallback_mode(),
            "online": self.inner.shared.connectivity.is_online(),
            "sessions": self.snapshots(),
            "warnings": self.warnings(),
            "health": self.health_history(),
        })
    }
}

impl Shared {
    fn fallback_mode(&self) -> FallbackMode {
        *self.mode_tx.borrow()
    }

    /// Re-run the fallback decision and return the resulting mode.
    ///
    /// The controller lock is held from reading the session views through the
    /// broadcast, so concurrent drivers apply mode changes one at a time and in
    /// order. Stored snapshots are re-stamped with the mode before it is released.
    fn reevaluate_fallback(&self) -> FallbackMode {
        let mut controller = self.fallback.lock();
        let sessions: Vec<SessionSnapshot> = self.snapshots.read().values().cloned().collect();
        let warnings = self.warnings.current();
        let online = self.connectivity.is_online();
        let change = controller.evaluate(online, &sessions, &warnings);
        let mode = controller.current();
        for snapshot in self.snapshots.write().values_mut() {
            snapshot.fallback_mode = mode;
        }
        if let Some(change) = change {
            self.mode_tx.send_replace(change.to);
            self.listeners.fallback_change(change.to);
        }
        mode
    }

    fn health_tick(&self) -> Vec<PredictiveWarning> {
        self.sampler.sample(utc_now());
        let history = self.sampler.history().snapshot();
        let warnings = self.analyzer.analyze(&history);
        if self.warnings.replace(warnings.clone()) {
            if let Some(metrics) = &self.metrics {
                metrics.set_warnings(&warnings);
            }
            for warning in &warnings {
                tracing::warn!(
                    target: "wardstream::predictive",
                    kind = %warning.kind,
                    severity = %warning.severity,
                    evidence = warning.evidence,
                    "{}",
                    warning.message,
                );
            }
            self.listeners.predictive_warning(&warnings);
            self.reevaluate_fallback();
        }
        warnings
    }

    /// Topics without a live channel, served by the poller.
    fn polling_topics(&self) -> Vec<String> {
        self.snapshots
            .read()
            .values()
            .filter(|snapshot| {
                snapshot.state.is_active() && snapshot.state != SessionState::Streaming
            })
            .map(|snapshot| snapshot.topic.clone())
            .collect()
    }
}

type OpenFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Channel>, StreamError>> + Send>>;

/// What the driver is currently waiting on besides commands and connectivity.
enum Link {
    Idle,
    Opening(OpenFuture),
    Live(Box<dyn Channel>),
    Waiting(Pin<Box<Sleep>>),
}

enum LinkEvent {
    Opened(Result<Box<dyn Channel>, StreamError>),
    Received(Option<ChannelEvent>),
    Elapsed,
}

impl Link {
    async fn next(&mut self) -> LinkEvent {
        match self {
            Link::Idle => std::future::pending().await,
            Link::Opening(open) => LinkEvent::Opened(open.as_mut().await),
            Link::Live(channel) => LinkEvent::Received(channel.next_event().await),
            Link::Waiting(sleep) => {
                sleep.as_mut().await;
                LinkEvent::Elapsed
            }
        }
    }

    fn release(&mut self) {
        if let Link::Live(channel) = self {
            channel.release();
        }
        *self = Link::Idle;
    }
}

/// Single writer of one session's state.
struct SessionDriver {
    shared: Arc<Shared>,
    machine: SessionMachine,
    progress: ProgressTracker,
    link: Link,
    sequence: u64,
}

impl SessionDriver {
    fn new(shared: Arc<Shared>, machine: SessionMachine) -> Self {
        let progress = ProgressTracker::new(shared.config.progress.clone());
        Self {
            shared,
            machine,
            progress,
            link: Link::Idle,
            sequence: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut connectivity = self.shared.connectivity.subscribe();
        let mut connectivity_open = true;

        self.apply(SessionEvent::Open);
        if !*connectivity.borrow_and_update() {
            self.apply(SessionEvent::NetworkOffline);
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(ack)) => {
                        self.apply(SessionEvent::Close);
                        let _ = ack.send(());
                        return;
                    }
                    Some(Command::Retry { credentials_refreshed, reply }) => {
                        let outcome = self.machine.check_manual_retry(credentials_refreshed);
                        if outcome.is_ok() {
                            self.apply(SessionEvent::ManualRetry);
                        }
                        let _ = reply.send(outcome);
                    }
                    None => {
                        self.apply(SessionEvent::Close);
                        return;
                    }
                },
                changed = connectivity.changed(), if connectivity_open => {
                    if changed.is_err() {
                        connectivity_open = false;
                        continue;
                    }
                    let online = *connectivity.borrow_and_update();
                    self.apply(if online {
                        SessionEvent::ConnectivityRestored
                    } else {
                        SessionEvent::NetworkOffline
                    });
                }
                event = self.link.next() => self.on_link_event(event),
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(Ok(channel)) => {
                self.link = Link::Live(channel);
                self.apply(SessionEvent::ChannelEstablished);
            }
            LinkEvent::Opened(Err(error)) => {
                self.link = Link::Idle;
                self.fault(error);
            }
            LinkEvent::Received(Some(ChannelEvent::Data(payload))) => {
                self.shared
                    .listeners
                    .data(self.machine.topic(), &payload, DataOrigin::Stream);
            }
            LinkEvent::Received(Some(ChannelEvent::StageProgress(stage))) => {
                if let ProgressUpdate::Updated(state) = self.progress.apply(&stage, utc_now()) {
                    self.shared.listeners.progress(self.machine.topic(), &state);
                }
            }
            LinkEvent::Received(Some(ChannelEvent::Heartbeat { round_trip })) => {
                self.shared.signals.record_latency(round_trip);
            }
            LinkEvent::Received(Some(ChannelEvent::Error(error))) => self.fault(error),
            LinkEvent::Received(Some(ChannelEvent::Closed)) | LinkEvent::Received(None) => {
                self.fault(StreamError::PeerClosed)
            }
            LinkEvent::Elapsed => {
                self.link = Link::Idle;
                self.apply(SessionEvent::DelayElapsed);
            }
        }
    }

    fn fault(&mut self, error: StreamError) {
        let kind = classify(&error);
        self.shared.signals.record_fault();
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_fault(kind);
        }
        stream_warn!(
            context = LogContext::new()
                .with_topic(self.machine.topic())
                .with_state(self.machine.state().as_str())
                .with_attempt(self.machine.attempt_count())
                .with_mode(self.machine.mode().as_str()),
            "channel fault classified as {}: {}",
            kind,
            error
        );
        self.apply(SessionEvent::Fault(kind));
    }

    fn apply(&mut self, event: SessionEvent) {
        let Some(transition) = self.machine.apply(event, &self.shared.policy) else {
            return;
        };
        let mut escalate = false;
        for action in &transition.actions {
            match *action {
                SessionAction::OpenChannel => self.link = Link::Opening(self.open_channel()),
                SessionAction::NotifyConnected => {}
                SessionAction::ScheduleRetry(delay) => {
                    if let Some(metrics) = &self.shared.metrics {
                        metrics.record_retry(self.machine.mode(), delay);
                    }
                    self.link = Link::Waiting(Box::pin(tokio::time::sleep_until(
                        Instant::now() + delay,
                    )));
                }
                SessionAction::CancelRetry | SessionAction::ReleaseChannel => self.link.release(),
                SessionAction::Escalate => escalate = true,
            }
        }
        if transition.to == SessionState::Closed {
            self.progress.reset();
        }

        self.sequence += 1;
        let mut snapshot =
            self.machine
                .snapshot(&self.shared.policy, self.shared.fallback_mode(), self.sequence);
        self.shared
            .snapshots
            .write()
            .insert(snapshot.topic.clone(), snapshot.clone());
        snapshot.fallback_mode = self.shared.reevaluate_fallback();
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_transition(snapshot.state);
        }
        let context = LogContext::new()
            .with_topic(&snapshot.topic)
            .with_state(snapshot.state.as_str())
            .with_attempt(snapshot.attempt_count)
            .with_mode(snapshot.mode.as_str());
        match snapshot.next_retry_ms {
            Some(delay_ms) => stream_info!(
                context = context,
                "{} -> {}, retry in {}ms ({} left)",
                transition.from,
                transition.to,
                delay_ms,
                snapshot.retry_budget_remaining
            ),
            None => stream_info!(
                context = context,
                "{} -> {}",
                transition.from,
                transition.to
            ),
        }
        if let Some((event, message, outcome)) = milestone(&snapshot) {
            log_lifecycle_event(Some(&context), event, message, outcome);
        }

        self.shared.listeners.state_change(&snapshot);
        if escalate {
            stream_warn!(
                context = LogContext::new()
                    .with_topic(&snapshot.topic)
                    .with_mode(snapshot.mode.as_str()),
                "high-availability session failed, escalating"
            );
            self.shared.listeners.escalation(&snapshot);
        }
    }

    fn open_channel(&self) -> OpenFuture {
        let channels = self.shared.channels.clone();
        let topic = self.machine.topic().to_string();
        let timeout = self.shared.config.session.attempt_timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, channels.open(&topic)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StreamError::Timeout(timeout)),
            }
        })
    }
}

fn milestone(snapshot: &SessionSnapshot) -> Option<(&'static str, &'static str, LifecycleOutcome)> {
    match snapshot.state {
        SessionState::Streaming => Some((
            "session.streaming",
            "channel established",
            LifecycleOutcome::Success,
        )),
        SessionState::Degraded => Some((
            "session.degraded",
            "network offline, channel released",
            LifecycleOutcome::Degraded,
        )),
        SessionState::Failed if snapshot.auth_required => Some((
            "session.failed",
            "authentication rejected, re-authenticate before retrying",
            LifecycleOutcome::Fault,
        )),
        SessionState::Failed => Some((
            "session.failed",
            "automatic retries exhausted",
            LifecycleOutcome::Fault,
        )),
        _ => None,
    }
}

async fn watch_connectivity(
    shared: Weak<Shared>,
    mut connectivity: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = connectivity.changed() => {
                if changed.is_err() {
                    return;
                }
                let online = *connectivity.borrow_and_update();
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                tracing::info!(target: "wardstream::manager", online, "connectivity changed");
                shared.reevaluate_fallback();
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_poller(
    shared: Weak<Shared>,
    source: Arc<dyn FallbackSource>,
    mut mode: watch::Receiver<FallbackMode>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    loop {
        while *mode.borrow_and_update() != FallbackMode::Polling {
            tokio::select! {
                changed = mode.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = mode.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *mode.borrow() != FallbackMode::Polling {
                        break;
                    }
                }
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    poll_once(&shared, source.as_ref()).await;
                }
            }
        }
    }
}

async fn poll_once(shared: &Shared, source: &dyn FallbackSource) {
    for topic in shared.polling_topics() {
        match source.fetch(&topic).await {
            Ok(payload) => shared.listeners.data(&topic, &payload, DataOrigin::Polling),
            Err(error) => {
                let kind = classify(&error);
                tracing::warn!(
                    target: "wardstream::fallback",
                    topic = %topic,
                    error_kind = %kind,
                    %error,
                    "polling fetch failed",
                );
            }
        }
    }
}

async fn run_health_monitor(
    shared: Weak<Shared>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.health_tick();
            }
            _ = shutdown.changed() => return,
        }
    }
}
