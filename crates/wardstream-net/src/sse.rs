//! ---
//! ws_section: "05-networking-external-interfaces"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Server-Sent Events push channel."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! Push channel over `text/event-stream`. Frame names understood on the wire:
//!
//! | event        | data                                           | channel event   |
//! |--------------|------------------------------------------------|-----------------|
//! | `message`    | JSON payload (plain text is kept as a string)  | `Data`          |
//! | `progress`   | `StageProgress` JSON                           | `StageProgress` |
//! | `heartbeat`  | `{"sent_at_ms": <epoch ms>}`                   | `Heartbeat`     |
//! | `error`      | `{"status": <u16>?, "message": "..."}`         | `Error`         |
//! | `close`      | ignored                                        | `Closed`        |
//!
//! Unknown event names are skipped.
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use wardstream_common::config::EndpointConfig;
use wardstream_common::time::utc_now;
use wardstream_resilience::channel::{Channel, ChannelEvent, ChannelSource, StageProgress};
use wardstream_resilience::error::StreamError;

use crate::http::{authorised, build_client, map_transport_error, status_error, topic_url};

/// One dispatched event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name, `message` when the frame named none.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream, if any.
    pub id: Option<String>,
}

/// Upper bound on an unterminated line or an undispatched frame's data.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental `text/event-stream` parser. Accepts `\n` and `\r\n` line
/// endings; chunks may split lines anywhere.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    data_bytes: usize,
    last_id: Option<String>,
    retry: Option<Duration>,
    max_frame_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    /// Create an empty decoder with [`DEFAULT_MAX_FRAME_BYTES`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty decoder that rejects lines or frames above `max_frame_bytes`.
    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            data_bytes: 0,
            last_id: None,
            retry: None,
            max_frame_bytes,
        }
    }

    /// Feed a chunk and return every frame it completed.
    ///
    /// Fails with [`StreamError::Protocol`] once a line or a frame outgrows the
    /// limit; the decoder is reset and the stream should be dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, StreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
            if self.data_bytes > self.max_frame_bytes {
                return Err(self.overflow("event data"));
            }
        }
        if self.buffer.len() > self.max_frame_bytes {
            return Err(self.overflow("unterminated line"));
        }
        Ok(frames)
    }

    fn overflow(&mut self, what: &str) -> StreamError {
        let limit = self.max_frame_bytes;
        *self = Self::with_limit(limit);
        StreamError::Protocol(format!("event stream {what} exceeds {limit} bytes"))
    }

    /// Reconnection delay last advertised by the server.
    pub fn retry_hint(&self) -> Option<Duration> {
        self.retry
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_bytes += value.len();
                self.data.push(value.to_string());
            }
            "id" => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        self.data_bytes = 0;
        Some(SseFrame {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

#[derive(Deserialize)]
struct HeartbeatFrame {
    sent_at_ms: i64,
}

#[derive(Deserialize)]
struct ErrorFrame {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: String,
}

/// Translate a frame received at `received_at` into a channel event.
pub fn frame_to_event(frame: &SseFrame, received_at: DateTime<Utc>) -> Option<ChannelEvent> {
    match frame.event.as_str() {
        "message" | "data" => Some(ChannelEvent::Data(
            serde_json::from_str(&frame.data).unwrap_or_else(|_| Value::String(frame.data.clone())),
        )),
        "progress" => Some(match serde_json::from_str::<StageProgress>(&frame.data) {
            Ok(progress) => ChannelEvent::StageProgress(progress),
            Err(err) => ChannelEvent::Error(StreamError::Protocol(format!(
                "malformed progress frame: {err}"
            ))),
        }),
        "heartbeat" => {
            let round_trip = serde_json::from_str::<HeartbeatFrame>(&frame.data)
                .ok()
                .and_then(|beat| {
                    u64::try_from(received_at.timestamp_millis() - beat.sent_at_ms).ok()
                })
                .map(Duration::from_millis)
                .unwrap_or_default();
            Some(ChannelEvent::Heartbeat { round_trip })
        }
        "error" => Some(ChannelEvent::Error(
            match serde_json::from_str::<ErrorFrame>(&frame.data) {
                Ok(ErrorFrame {
                    status: Some(status),
                    message,
                }) => StreamError::http(status, message),
                Ok(ErrorFrame { message, .. }) if !message.is_empty() => {
                    StreamError::Other(message)
                }
                _ => StreamError::Other(frame.data.clone()),
            },
        )),
        "close" => Some(ChannelEvent::Closed),
        other => {
            tracing::debug!(target: "wardstream::net", event = other, "skipping unknown event");
            None
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Open event stream for one topic. Reading is cancel-safe: decoded frames
/// not yet returned stay queued on the channel.
pub struct SseChannel {
    topic: String,
    body: Option<ByteStream>,
    decoder: SseDecoder,
    pending: VecDeque<ChannelEvent>,
    timeout: Duration,
}

impl SseChannel {
    fn new(topic: &str, body: ByteStream, timeout: Duration) -> Self {
        Self {
            topic: topic.to_string(),
            body: Some(body),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Channel for SseChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let body = self.body.as_mut()?;
            match body.next().await {
                Some(Ok(chunk)) => {
                    let received_at = utc_now();
                    let frames = match self.decoder.push(&chunk) {
                        Ok(frames) => frames,
                        Err(err) => {
                            self.body = None;
                            return Some(ChannelEvent::Error(err));
                        }
                    };
                    for frame in frames {
                        if let Some(event) = frame_to_event(&frame, received_at) {
                            self.pending.push_back(event);
                        }
                    }
                }
                Some(Err(err)) => {
                    self.body = None;
                    return Some(ChannelEvent::Error(map_transport_error(err, self.timeout)));
                }
                None => {
                    self.body = None;
                    tracing::debug!(
                        target: "wardstream::net",
                        topic = %self.topic,
                        "event stream ended"
                    );
                    return None;
                }
            }
        }
    }

    fn release(&mut self) {
        if self.body.take().is_some() {
            tracing::debug!(
                target: "wardstream::net",
                topic = %self.topic,
                "event stream released"
            );
        }
        self.pending.clear();
    }
}

/// [`ChannelSource`] subscribing to `endpoint.stream_path` per topic.
#[derive(Debug, Clone)]
pub struct SseChannelSource {
    client: Client,
    endpoint: EndpointConfig,
}

impl SseChannelSource {
    /// Build a source with its own client.
    pub fn new(endpoint: EndpointConfig) -> anyhow::Result<Self> {
        let client = build_client(&endpoint)?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Build a source sharing an existing client.
    pub fn with_client(client: Client, endpoint: EndpointConfig) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl ChannelSource for SseChannelSource {
    async fn open(&self, topic: &str) -> Result<Box<dyn Channel>, StreamError> {
        let url = topic_url(&self.endpoint, &self.endpoint.stream_path, topic)?;
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream");
        let response = authorised(request, &self.endpoint)
            .send()
            .await
            .map_err(|err| map_transport_error(err, self.endpoint.request_timeout))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        if !is_event_stream {
            return Err(StreamError::Protocol(
                "response is not a text/event-stream".to_string(),
            ));
        }
        tracing::debug!(target: "wardstream::net", topic, "event stream established");
        Ok(Box::new(SseChannel::new(
            topic,
            Box::pin(response.bytes_stream()),
            self.endpoint.request_timeout,
        )))
    }

    fn name(&self) -> &'static str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wardstream_resilience::error::{classify, ErrorKind};

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let wire: &[u8] =
            b"event: progress\r\ndata: {\"a\":\r\ndata: 1}\r\nid: 7\r\n\r\n: keep-alive\n\ndata: hi\n\n";
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(5) {
            frames.extend(decoder.push(chunk).unwrap());
        }
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "progress".into(),
                    data: "{\"a\":\n1}".into(),
                    id: Some("7".into()),
                },
                SseFrame {
                    event: "message".into(),
                    data: "hi".into(),
                    id: Some("7".into()),
                },
            ]
        );
    }

    #[test]
    fn event_without_data_is_dropped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder
            .push(b"event: heartbeat\n\nretry: 3000\n\n")
            .unwrap()
            .is_empty());
        assert_eq!(decoder.retry_hint(), Some(Duration::from_secs(3)));
        assert_eq!(decoder.push(b"data:x\n\n").unwrap()[0].event, "message");
    }

    #[test]
    fn endless_line_is_rejected_as_protocol_error() {
        let mut decoder = SseDecoder::with_limit(16);
        assert!(decoder.push(b"data: 0123456789").unwrap().is_empty());
        let err = decoder.push(b"abcdef").unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
        assert_eq!(classify(&err), ErrorKind::ProtocolError);

        // decoder starts clean afterwards
        assert_eq!(decoder.push(b"data: ok\n\n").unwrap()[0].data, "ok");
    }

    #[tokio::test]
    async fn channel_surfaces_oversized_line_and_stops_reading() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"ward\":1}\n\n")),
            Ok(Bytes::from(vec![b'x'; DEFAULT_MAX_FRAME_BYTES + 1])),
            Ok(Bytes::from_static(b"\n\ndata: late\n\n")),
        ];
        let body: ByteStream = Box::pin(futures_util::stream::iter(chunks));
        let mut channel = SseChannel::new("ward-1", body, Duration::from_secs(5));

        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Data(json!({"ward": 1})))
        );
        match channel.next_event().await {
            Some(ChannelEvent::Error(err)) => {
                assert_eq!(classify(&err), ErrorKind::ProtocolError)
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert_eq!(channel.next_event().await, None);
    }

    #[test]
    fn oversized_frame_across_lines_is_rejected() {
        let mut decoder = SseDecoder::with_limit(16);
        assert!(decoder.push(b"data: 0123456789\n").unwrap().is_empty());
        assert!(matches!(
            decoder.push(b"data: 0123456789\n"),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn payloads_map_to_channel_events() {
        let now = Utc::now();
        assert_eq!(
            frame_to_event(&frame("message", "{\"ward\":12}"), now),
            Some(ChannelEvent::Data(json!({"ward": 12})))
        );
        assert_eq!(
            frame_to_event(&frame("message", "plain"), now),
            Some(ChannelEvent::Data(json!("plain")))
        );
        assert_eq!(frame_to_event(&frame("close", ""), now), Some(ChannelEvent::Closed));
        assert_eq!(frame_to_event(&frame("telemetry", "{}"), now), None);
    }

    #[test]
    fn heartbeat_measures_round_trip() {
        let now = Utc::now();
        let sent = now.timestamp_millis() - 140;
        let event = frame_to_event(&frame("heartbeat", &format!("{{\"sent_at_ms\":{sent}}}")), now);
        assert_eq!(
            event,
            Some(ChannelEvent::Heartbeat {
                round_trip: Duration::from_millis(140)
            })
        );
        let skewed = frame_to_event(
            &frame("heartbeat", &format!("{{\"sent_at_ms\":{}}}", sent + 10_000)),
            now,
        );
        assert_eq!(
            skewed,
            Some(ChannelEvent::Heartbeat {
                round_trip: Duration::ZERO
            })
        );
    }

    #[test]
    fn in_band_errors_keep_their_classification() {
        let now = Utc::now();
        let Some(ChannelEvent::Error(auth)) =
            frame_to_event(&frame("error", "{\"status\":401,\"message\":\"token expired\"}"), now)
        else {
            panic!("expected error event");
        };
        assert_eq!(classify(&auth), ErrorKind::AuthError);

        let Some(ChannelEvent::Error(bad)) = frame_to_event(&frame("progress", "{"), now) else {
            panic!("expected error event");
        };
        assert_eq!(classify(&bad), ErrorKind::ProtocolError);

        let Some(ChannelEvent::Error(text)) = frame_to_event(&frame("error", "rate limit hit"), now)
        else {
            panic!("expected error event");
        };
        assert_eq!(classify(&text), ErrorKind::RateLimited);
    }
}
