//! ---
//! ws_section: "07-resilience-fault-tolerance"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Channel fault taxonomy and classification."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! Faults are captured as [`StreamError`] at the channel boundary and
//! classified exactly once into an [`ErrorKind`]; everything downstream of the
//! classifier only sees the enumerated kind.
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fault raised by a channel or fallback source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The backend answered with a non-success HTTP status.
    #[error("http status {status}: {message}")]
    Http {
        /// Numeric HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },
    /// The attempt did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The attempt was aborted before completing.
    #[error("aborted: {0}")]
    Aborted(String),
    /// Transport-level failure (DNS, connect, reset, fetch failure).
    #[error("transport failure: {0}")]
    Transport(String),
    /// The stream delivered malformed or unexpected frames.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The peer closed the channel.
    #[error("channel closed by peer")]
    PeerClosed,
    /// Anything else, carrying the raw message for classification.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Convenience constructor for HTTP status faults.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        StreamError::Http {
            status,
            message: message.into(),
        }
    }

    fn message(&self) -> String {
        self.to_string().to_lowercase()
    }
}

/// Stable classification produced by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity problems reaching the backend.
    Network,
    /// Attempt deadline exceeded or aborted.
    Timeout,
    /// Malformed stream or unexpected close.
    ProtocolError,
    /// Authentication or permission failure; requires user action.
    AuthError,
    /// Backend throttling.
    RateLimited,
    /// Anything not recognised.
    Unknown,
}

impl ErrorKind {
    /// All kinds in classification order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::AuthError,
        ErrorKind::RateLimited,
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::ProtocolError,
        ErrorKind::Unknown,
    ];

    /// Static label for metrics and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether automatic retries may be scheduled for this kind.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::AuthError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const AUTH_SIGNALS: &[&str] = &[
    "unauthorized",
    "unauthorised",
    "forbidden",
    "permission",
    "authentication",
    "not authenticated",
    "token expired",
];
const RATE_SIGNALS: &[&str] = &["rate limit", "ratelimit", "quota", "too many requests"];
const TIMEOUT_SIGNALS: &[&str] = &["timeout", "timed out", "abort", "deadline"];
const NETWORK_SIGNALS: &[&str] = &[
    "network",
    "fetch",
    "connection",
    "connect",
    "offline",
    "dns",
    "unreachable",
    "reset",
];
const PROTOCOL_SIGNALS: &[&str] = &["stream", "eventsource", "sse", "parse", "frame", "protocol"];

fn mentions(message: &str, signals: &[&str]) -> bool {
    signals.iter().any(|signal| message.contains(signal))
}

/// Map a fault to its [`ErrorKind`]. First match wins, in the order
/// auth → rate limit → timeout → network → protocol → unknown.
pub fn classify(error: &StreamError) -> ErrorKind {
    let status = match error {
        StreamError::Http { status, .. } => Some(*status),
        _ => None,
    };
    let message = error.message();

    if matches!(status, Some(401) | Some(403)) || mentions(&message, AUTH_SIGNALS) {
        return ErrorKind::AuthError;
    }
    if status == Some(429) || mentions(&message, RATE_SIGNALS) {
        return ErrorKind::RateLimited;
    }
    if matches!(error, StreamError::Timeout(_) | StreamError::Aborted(_))
        || matches!(status, Some(408) | Some(504))
        || mentions(&message, TIMEOUT_SIGNALS)
    {
        return ErrorKind::Timeout;
    }
    if matches!(error, StreamError::Transport(_))
        || matches!(status, Some(502) | Some(503))
        || mentions(&message, NETWORK_SIGNALS)
    {
        return ErrorKind::Network;
    }
    if matches!(error, StreamError::Protocol(_) | StreamError::PeerClosed)
        || mentions(&message, PROTOCOL_SIGNALS)
    {
        return ErrorKind::ProtocolError;
    }
    ErrorKind::Unknown
}

/// Errors returned by [`crate::manager::SessionManager`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session is registered for the topic.
    #[error("no session registered for topic '{0}'")]
    UnknownTopic(String),
    /// A manual retry was requested while the session is not failed.
    #[error("session for topic '{topic}' is {state}, manual retry only applies to failed sessions")]
    NotFailed {
        /// Topic of the session.
        topic: String,
        /// Current state label.
        state: String,
    },
    /// The session failed on authentication; credentials must be refreshed first.
    #[error("session for topic '{0}' failed authentication, re-authenticate before retrying")]
    AuthRequired(String),
    /// The separate manual retry budget is spent.
    #[error("manual retry budget exhausted for topic '{0}'")]
    ManualRetryExhausted(String),
    /// The manager has been shut down.
    #[error("session manager has shut down")]
    ManagerShutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(classify(&StreamError::http(401, "")), ErrorKind::AuthError);
        assert_eq!(classify(&StreamError::http(403, "")), ErrorKind::AuthError);
        assert_eq!(classify(&StreamError::http(429, "")), ErrorKind::RateLimited);
        assert_eq!(classify(&StreamError::http(504, "")), ErrorKind::Timeout);
        assert_eq!(classify(&StreamError::http(503, "")), ErrorKind::Network);
        assert_eq!(classify(&StreamError::http(500, "")), ErrorKind::Unknown);
    }

    #[test]
    fn variants_map_to_kinds() {
        assert_eq!(
            classify(&StreamError::Timeout(Duration::from_secs(10))),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify(&StreamError::Aborted("navigation".into())),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify(&StreamError::Transport("reset by peer".into())),
            ErrorKind::Network
        );
        assert_eq!(
            classify(&StreamError::Protocol("bad json".into())),
            ErrorKind::ProtocolError
        );
        assert_eq!(classify(&StreamError::PeerClosed), ErrorKind::ProtocolError);
        assert_eq!(
            classify(&StreamError::Other("something odd".into())),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn message_signals_follow_priority_order() {
        // auth wins over network wording
        assert_eq!(
            classify(&StreamError::Other(
                "network request failed: Unauthorized".into()
            )),
            ErrorKind::AuthError
        );
        // rate limit wins over timeout wording
        assert_eq!(
            classify(&StreamError::Other("quota exceeded, request timed out".into())),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&StreamError::Other("Failed to fetch".into())),
            ErrorKind::Network
        );
        assert_eq!(
            classify(&StreamError::Other("EventSource failed".into())),
            ErrorKind::ProtocolError
        );
        // a transport variant mentioning permission is still an auth problem
        assert_eq!(
            classify(&StreamError::Transport("permission denied".into())),
            ErrorKind::AuthError
        );
    }

    #[test]
    fn only_auth_is_not_retryable() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.is_retryable(), kind != ErrorKind::AuthError);
        }
    }
}
