//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Connection lifecycle state machine for one topic subscription."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! The machine is synchronous and side-effect free: it consumes
//! [`SessionEvent`]s and answers with a [`Transition`] listing the
//! [`SessionAction`]s the driver must carry out. Events that are not valid in
//! the current state yield `None` and leave the machine untouched.
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wardstream_common::config::StreamMode;

use crate::backoff::BackoffPolicy;
use crate::error::{ErrorKind, SessionError};
use crate::fallback::FallbackMode;

/// Lifecycle states of a topic session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, channel not yet requested.
    Idle,
    /// Channel open in flight.
    Connecting,
    /// Channel live and delivering events.
    Streaming,
    /// Network offline; waiting for connectivity to return.
    Degraded,
    /// Waiting out a retry delay.
    Reconnecting,
    /// Automatic retries stopped; needs a manual retry.
    Failed,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Static label for logs, metrics and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Degraded => "degraded",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }

    /// Whether the session still owns resources or timers.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Topic selected.
    Open,
    /// Channel handshake completed.
    ChannelEstablished,
    /// Classified fault from the channel, including peer close.
    Fault(ErrorKind),
    /// Scheduled retry delay elapsed.
    DelayElapsed,
    /// Caller-initiated retry from `Failed`.
    ManualRetry,
    /// Topic deselected or owner dropped.
    Close,
    /// Process-wide connectivity went offline.
    NetworkOffline,
    /// Connectivity came back.
    ConnectivityRestored,
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Start opening a channel.
    OpenChannel,
    /// Tell listeners the channel is live.
    NotifyConnected,
    /// Arm the retry timer.
    ScheduleRetry(Duration),
    /// Disarm the retry timer.
    CancelRetry,
    /// Drop the live channel or the in-flight open.
    ReleaseChannel,
    /// High-availability session failed; escalate instead of stopping silently.
    Escalate,
}

/// Record of one applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the event.
    pub from: SessionState,
    /// State after the event.
    pub to: SessionState,
    /// The event that caused it.
    pub event: SessionEvent,
    /// Effects to perform.
    pub actions: Vec<SessionAction>,
}

impl Transition {
    fn new(from: SessionState, to: SessionState, event: SessionEvent) -> Self {
        Self {
            from,
            to,
            event,
            actions: Vec::new(),
        }
    }

    fn with(mut self, action: SessionAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Retry delay armed by this transition, if any.
    pub fn scheduled_delay(&self) -> Option<Duration> {
        self.actions.iter().find_map(|action| match action {
            SessionAction::ScheduleRetry(delay) => Some(*delay),
            _ => None,
        })
    }
}

/// Pure state machine for one topic.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    topic: String,
    mode: StreamMode,
    state: SessionState,
    attempt_count: u32,
    last_error_kind: Option<ErrorKind>,
    budget_exhausted: bool,
    pending_delay: Option<Duration>,
    manual_budget: u32,
    manual_used: u32,
}

impl SessionMachine {
    /// Create an idle machine. `mode` is fixed for the session lifetime.
    pub fn new(topic: impl Into<String>, mode: StreamMode, manual_budget: u32) -> Self {
        Self {
            topic: topic.into(),
            mode,
            state: SessionState::Idle,
            attempt_count: 0,
            last_error_kind: None,
            budget_exhausted: false,
            pending_delay: None,
            manual_budget,
            manual_used: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error_kind
    }

    pub fn budget_exhausted(&self) -> bool {
        self.budget_exhausted
    }

    /// Delay armed by the latest transition into `Reconnecting`.
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending_delay
    }

    pub fn manual_retries_remaining(&self) -> u32 {
        self.manual_budget.saturating_sub(self.manual_used)
    }

    /// Whether a manual retry may be issued right now. Sessions that failed on
    /// authentication only retry once credentials have been refreshed.
    pub fn check_manual_retry(&self, credentials_refreshed: bool) -> Result<(), SessionError> {
        if self.state != SessionState::Failed {
            return Err(SessionError::NotFailed {
                topic: self.topic.clone(),
                state: self.state.to_string(),
            });
        }
        if self.manual_retries_remaining() == 0 {
            return Err(SessionError::ManualRetryExhausted(self.topic.clone()));
        }
        if self.last_error_kind == Some(ErrorKind::AuthError) && !credentials_refreshed {
            return Err(SessionError::AuthRequired(self.topic.clone()));
        }
        Ok(())
    }

    /// Apply an event. Returns `None` when the event has no effect in the
    /// current state.
    pub fn apply(&mut self, event: SessionEvent, policy: &BackoffPolicy) -> Option<Transition> {
        use SessionState::*;

        let from = self.state;
        let transition = match (from, event) {
            (Closed, _) => return None,
            (_, SessionEvent::Close) => {
                let transition = Transition::new(from, Closed, event);
                match from {
                    Reconnecting => transition.with(SessionAction::CancelRetry),
                    Connecting | Streaming => transition.with(SessionAction::ReleaseChannel),
                    _ => transition,
                }
            }
            (Degraded | Failed, SessionEvent::NetworkOffline) => return None,
            (_, SessionEvent::NetworkOffline) => {
                let transition = Transition::new(from, Degraded, event);
                match from {
                    Reconnecting => transition.with(SessionAction::CancelRetry),
                    Connecting | Streaming => transition.with(SessionAction::ReleaseChannel),
                    _ => transition,
                }
            }
            (Idle, SessionEvent::Open) => {
                Transition::new(from, Connecting, event).with(SessionAction::OpenChannel)
            }
            (Connecting, SessionEvent::ChannelEstablished) => {
                self.attempt_count = 0;
                self.budget_exhausted = false;
                Transition::new(from, Streaming, event).with(SessionAction::NotifyConnected)
            }
            (Connecting | Streaming, SessionEvent::Fault(kind)) => {
                self.last_error_kind = Some(kind);
                let released = from == Streaming;
                match policy.delay(self.attempt_count, kind, self.mode) {
                    Some(delay) => {
                        self.pending_delay = Some(delay);
                        let transition = Transition::new(from, Reconnecting, event);
                        let transition = if released {
                            transition.with(SessionAction::ReleaseChannel)
                        } else {
                            transition
                        };
                        transition.with(SessionAction::ScheduleRetry(delay))
                    }
                    None => {
                        self.budget_exhausted = true;
                        let transition = Transition::new(from, Failed, event);
                        let transition = if released {
                            transition.with(SessionAction::ReleaseChannel)
                        } else {
                            transition
                        };
                        if self.mode.is_high_availability() {
                            transition.with(SessionAction::Escalate)
                        } else {
                            transition
                        }
                    }
                }
            }
            (Reconnecting, SessionEvent::DelayElapsed) => {
                self.attempt_count = self.attempt_count.saturating_add(1);
                self.pending_delay = None;
                Transition::new(from, Connecting, event).with(SessionAction::OpenChannel)
            }
            (Failed, SessionEvent::ManualRetry) => {
                if self.manual_retries_remaining() == 0 {
                    return None;
                }
                self.manual_used += 1;
                self.attempt_count = 0;
                self.budget_exhausted = false;
                Transition::new(from, Connecting, event).with(SessionAction::OpenChannel)
            }
            (Degraded, SessionEvent::ConnectivityRestored) => {
                Transition::new(from, Connecting, event).with(SessionAction::OpenChannel)
            }
            _ => return None,
        };

        if transition.to != Reconnecting {
            self.pending_delay = None;
        }
        self.state = transition.to;
        Some(transition)
    }

    /// Observable view of the machine.
    pub fn snapshot(
        &self,
        policy: &BackoffPolicy,
        fallback_mode: FallbackMode,
        sequence: u64,
    ) -> SessionSnapshot {
        SessionSnapshot {
            topic: self.topic.clone(),
            state: self.state,
            attempt_count: self.attempt_count,
            last_error_kind: self.last_error_kind,
            mode: self.mode,
            fallback_mode,
            retry_budget_remaining: policy.remaining(self.attempt_count, self.mode),
            manual_retries_remaining: self.manual_retries_remaining(),
            auth_required: self.state == SessionState::Failed
                && self.last_error_kind == Some(ErrorKind::AuthError),
            budget_exhausted: self.budget_exhausted,
            next_retry_ms: self.pending_delay.map(|delay| delay.as_millis() as u64),
            sequence,
            at: Utc::now(),
        }
    }
}

/// What listeners and diagnostics see of a session. Raw faults are never exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub topic: String,
    pub state: SessionState,
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub mode: StreamMode,
    pub fallback_mode: FallbackMode,
    /// Automatic retries left (shown while reconnecting).
    pub retry_budget_remaining: u32,
    /// Manual retries left (disables the retry affordance at zero).
    pub manual_retries_remaining: u32,
    /// Failed because of an authentication problem; prompt re-authentication.
    pub auth_required: bool,
    pub budget_exhausted: bool,
    pub next_retry_ms: Option<u64>,
    /// Per-session transition counter, starting at 1.
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn machine(mode: StreamMode) -> SessionMachine {
        SessionMachine::new("ward-7", mode, 2)
    }

    fn drive(
        machine: &mut SessionMachine,
        policy: &BackoffPolicy,
        events: &[SessionEvent],
    ) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|event| machine.apply(*event, policy))
            .map(|transition| transition.to)
            .collect()
    }

    #[test]
    fn open_then_established_streams_and_resets_attempts() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::Standard);
        let open = machine.apply(SessionEvent::Open, &policy).unwrap();
        assert_eq!(open.actions, vec![SessionAction::OpenChannel]);
        machine
            .apply(SessionEvent::Fault(ErrorKind::Network), &policy)
            .unwrap();
        machine.apply(SessionEvent::DelayElapsed, &policy).unwrap();
        assert_eq!(machine.attempt_count(), 1);
        let established = machine
            .apply(SessionEvent::ChannelEstablished, &policy)
            .unwrap();
        assert_eq!(established.to, SessionState::Streaming);
        assert_eq!(established.actions, vec![SessionAction::NotifyConnected]);
        assert_eq!(machine.attempt_count(), 0);
    }

    #[test]
    fn standard_mode_fails_after_third_retry() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::Standard);
        machine.apply(SessionEvent::Open, &policy);
        for retry in 1..=3 {
            let transition = machine
                .apply(SessionEvent::Fault(ErrorKind::Network), &policy)
                .unwrap();
            assert_eq!(transition.to, SessionState::Reconnecting);
            machine.apply(SessionEvent::DelayElapsed, &policy);
            assert_eq!(machine.attempt_count(), retry);
        }
        let failed = machine
            .apply(SessionEvent::Fault(ErrorKind::Network), &policy)
            .unwrap();
        assert_eq!(failed.to, SessionState::Failed);
        assert_eq!(failed.scheduled_delay(), None);
        assert!(!failed.actions.contains(&SessionAction::Escalate));
        assert!(machine.budget_exhausted());
        assert_eq!(machine.apply(SessionEvent::DelayElapsed, &policy), None);
    }

    #[test]
    fn high_availability_keeps_reconnecting_after_three_faults() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::HighAvailability);
        machine.apply(SessionEvent::Open, &policy);
        let first = machine
            .apply(SessionEvent::Fault(ErrorKind::Timeout), &policy)
            .unwrap();
        let standard_first = policy
            .delay(0, ErrorKind::Timeout, StreamMode::Standard)
            .unwrap();
        assert!(first.scheduled_delay().unwrap() < standard_first);
        machine.apply(SessionEvent::DelayElapsed, &policy);
        for _ in 0..2 {
            machine.apply(SessionEvent::Fault(ErrorKind::Timeout), &policy);
            machine.apply(SessionEvent::DelayElapsed, &policy);
        }
        machine.apply(SessionEvent::Fault(ErrorKind::Timeout), &policy);
        assert_eq!(machine.state(), SessionState::Reconnecting);
    }

    #[test]
    fn auth_error_fails_immediately() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::Standard);
        machine.apply(SessionEvent::Open, &policy);
        let transition = machine
            .apply(SessionEvent::Fault(ErrorKind::AuthError), &policy)
            .unwrap();
        assert_eq!(transition.to, SessionState::Failed);
        assert_eq!(transition.scheduled_delay(), None);
        assert_eq!(machine.attempt_count(), 0);
        assert!(machine.budget_exhausted());
        let snapshot = machine.snapshot(&policy, FallbackMode::None, 2);
        assert!(snapshot.auth_required);
    }

    #[test]
    fn high_availability_failure_escalates() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::HighAvailability);
        machine.apply(SessionEvent::Open, &policy);
        let transition = machine
            .apply(SessionEvent::Fault(ErrorKind::AuthError), &policy)
            .unwrap();
        assert_eq!(transition.actions, vec![SessionAction::Escalate]);
    }

    #[test]
    fn close_is_terminal_from_every_state() {
        let policy = BackoffPolicy::default();
        let paths: Vec<Vec<SessionEvent>> = vec![
            vec![],
            vec![SessionEvent::Open],
            vec![SessionEvent::Open, SessionEvent::ChannelEstablished],
            vec![SessionEvent::Open, SessionEvent::Fault(ErrorKind::Network)],
            vec![SessionEvent::Open, SessionEvent::Fault(ErrorKind::AuthError)],
            vec![SessionEvent::Open, SessionEvent::NetworkOffline],
        ];
        for path in paths {
            let mut machine = machine(StreamMode::Standard);
            drive(&mut machine, &policy, &path);
            let from = machine.state();
            let close = machine.apply(SessionEvent::Close, &policy).unwrap();
            assert_eq!(close.to, SessionState::Closed);
            match from {
                SessionState::Reconnecting => {
                    assert_eq!(close.actions, vec![SessionAction::CancelRetry])
                }
                SessionState::Connecting | SessionState::Streaming => {
                    assert_eq!(close.actions, vec![SessionAction::ReleaseChannel])
                }
                _ => assert!(close.actions.is_empty()),
            }
            for event in [
                SessionEvent::Open,
                SessionEvent::ChannelEstablished,
                SessionEvent::DelayElapsed,
                SessionEvent::ManualRetry,
                SessionEvent::Close,
                SessionEvent::NetworkOffline,
            ] {
                assert_eq!(machine.apply(event, &policy), None);
            }
        }
    }

    #[test]
    fn offline_degrades_and_restores() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::Standard);
        let states = drive(
            &mut machine,
            &policy,
            &[
                SessionEvent::Open,
                SessionEvent::Fault(ErrorKind::Network),
                SessionEvent::NetworkOffline,
                SessionEvent::NetworkOffline,
                SessionEvent::DelayElapsed,
                SessionEvent::ConnectivityRestored,
            ],
        );
        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::Reconnecting,
                SessionState::Degraded,
                SessionState::Connecting,
            ]
        );
        assert_eq!(machine.pending_delay(), None);
    }

    #[test]
    fn failed_session_ignores_connectivity_changes() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::Standard);
        let states = drive(
            &mut machine,
            &policy,
            &[
                SessionEvent::Open,
                SessionEvent::Fault(ErrorKind::AuthError),
                SessionEvent::NetworkOffline,
                SessionEvent::ConnectivityRestored,
            ],
        );
        assert_eq!(states, vec![SessionState::Connecting, SessionState::Failed]);
        assert_eq!(machine.state(), SessionState::Failed);
        assert_eq!(machine.manual_retries_remaining(), 2);
    }

    #[test]
    fn manual_retry_only_from_failed_and_within_budget() {
        let policy = BackoffPolicy::default();
        let mut machine = machine(StreamMode::Standard);
        machine.apply(SessionEvent::Open, &policy);
        assert!(matches!(
            machine.check_manual_retry(false),
            Err(SessionError::NotFailed { .. })
        ));
        for _ in 0..2 {
            machine.apply(SessionEvent::Fault(ErrorKind::AuthError), &policy);
            assert_eq!(
                machine.check_manual_retry(false),
                Err(SessionError::AuthRequired("ward-7".into()))
            );
            assert!(machine.check_manual_retry(true).is_ok());
            let retry = machine.apply(SessionEvent::ManualRetry, &policy).unwrap();
            assert_eq!(retry.to, SessionState::Connecting);
            assert_eq!(machine.attempt_count(), 0);
        }
        machine.apply(SessionEvent::Fault(ErrorKind::AuthError), &policy);
        assert_eq!(
            machine.check_manual_retry(true),
            Err(SessionError::ManualRetryExhausted("ward-7".into()))
        );
        assert_eq!(machine.apply(SessionEvent::ManualRetry, &policy), None);
    }

    #[test]
    fn attempt_count_monotonic_across_random_fault_sequences() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..200 {
            let mode = if rng.gen_bool(0.5) {
                StreamMode::Standard
            } else {
                StreamMode::HighAvailability
            };
            let mut machine = machine(mode);
            machine.apply(SessionEvent::Open, &policy);
            let mut last_reconnect_attempt: Option<u32> = None;
            for _ in 0..40 {
                let event = match machine.state() {
                    SessionState::Connecting | SessionState::Streaming => {
                        match rng.gen_range(0..4) {
                            0 => SessionEvent::ChannelEstablished,
                            1 => SessionEvent::Fault(ErrorKind::Network),
                            2 => SessionEvent::Fault(ErrorKind::RateLimited),
                            _ => SessionEvent::Fault(ErrorKind::Timeout),
                        }
                    }
                    SessionState::Reconnecting => SessionEvent::DelayElapsed,
                    _ => break,
                };
                let before = machine.attempt_count();
                let Some(transition) = machine.apply(event, &policy) else {
                    continue;
                };
                match transition.to {
                    SessionState::Streaming => {
                        assert_eq!(machine.attempt_count(), 0);
                        last_reconnect_attempt = None;
                    }
                    SessionState::Reconnecting | SessionState::Failed => {
                        assert!(machine.attempt_count() >= before);
                        if let Some(previous) = last_reconnect_attempt {
                            assert!(machine.attempt_count() > previous);
                        }
                        if transition.to == SessionState::Reconnecting {
                            last_reconnect_attempt = Some(machine.attempt_count());
                        }
                    }
                    SessionState::Connecting => {
                        assert_eq!(machine.attempt_count(), before + 1);
                    }
                    _ => {}
                }
            }
        }
    }
}
