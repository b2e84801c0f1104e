//! ---
//! ws_section: "15-testing-qa-runbook"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Round trips of the SSE channel and polling source against a local backend."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use wardstream_common::config::{EndpointConfig, StreamMode, StreamingConfig};
use wardstream_net::{HttpFallbackSource, SseChannelSource};
use wardstream_resilience::prelude::*;
use wardstream_resilience::{classify, ChannelEvent};
use wardstream_testharness::{wait_until, FixedMemoryProbe, RecordingListener};

const TOKEN: &str = "test-token";

#[derive(Deserialize)]
struct TopicQuery {
    topic: String,
}

fn authorised(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn stream_handler(headers: HeaderMap, Query(query): Query<TopicQuery>) -> Response {
    if !authorised(&headers) {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }
    if query.topic == "ward-plain" {
        return (StatusCode::OK, "not a stream").into_response();
    }
    let sent_at = chrono::Utc::now().timestamp_millis();
    let events = vec![
        Event::default().data(json!({"topic": query.topic, "sentiment": 0.4}).to_string()),
        Event::default().comment("keep-alive"),
        Event::default().event("progress").data(
            json!({
                "operation_id": "brief-1",
                "stage_id": "collect",
                "percent_complete": 0.25,
                "eta_seconds": 42.0,
                "confidence": 0.6
            })
            .to_string(),
        ),
        Event::default()
            .event("heartbeat")
            .data(json!({"sent_at_ms": sent_at}).to_string()),
        Event::default().event("close").data("bye"),
    ];
    Sse::new(stream::iter(events.into_iter().map(Ok::<Event, Infallible>))).into_response()
}

async fn summary_handler(headers: HeaderMap, Query(query): Query<TopicQuery>) -> Response {
    if !authorised(&headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    if query.topic == "ward-unknown" {
        return (StatusCode::NOT_FOUND, "no such ward").into_response();
    }
    Json(json!({"topic": query.topic, "summary": "stable"})).into_response()
}

async fn spawn_backend() -> (SocketAddr, JoinHandle<()>) {
    let app = Router::new()
        .route("/api/v1/strategist/stream", get(stream_handler))
        .route("/api/v1/strategist/summary", get(summary_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (address, task)
}

fn endpoint(address: SocketAddr, token: Option<&str>) -> EndpointConfig {
    EndpointConfig {
        base_url: format!("http://{address}"),
        bearer_token: token.map(str::to_string),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn sse_channel_yields_typed_events() {
    let (address, server) = spawn_backend().await;
    let source = SseChannelSource::new(endpoint(address, Some(TOKEN))).unwrap();
    let mut channel = source.open("ward-12").await.unwrap();

    assert_eq!(
        channel.next_event().await,
        Some(ChannelEvent::Data(json!({"topic": "ward-12", "sentiment": 0.4})))
    );
    let Some(ChannelEvent::StageProgress(progress)) = channel.next_event().await else {
        panic!("expected stage progress");
    };
    assert_eq!(progress.stage_id, "collect");
    assert_eq!(progress.percent_complete, 0.25);
    assert_eq!(progress.message, None);
    assert!(matches!(
        channel.next_event().await,
        Some(ChannelEvent::Heartbeat { .. })
    ));
    assert_eq!(channel.next_event().await, Some(ChannelEvent::Closed));
    assert_eq!(channel.next_event().await, None);
    channel.release();
    server.abort();
}

#[tokio::test]
async fn rejected_credentials_are_auth_faults() {
    let (address, server) = spawn_backend().await;
    let source = SseChannelSource::new(endpoint(address, None)).unwrap();
    let err = source.open("ward-12").await.err().unwrap();
    assert_eq!(err, StreamError::http(401, "token expired"));
    assert_eq!(classify(&err), ErrorKind::AuthError);
    server.abort();
}

#[tokio::test]
async fn plain_response_is_a_protocol_fault() {
    let (address, server) = spawn_backend().await;
    let source = SseChannelSource::new(endpoint(address, Some(TOKEN))).unwrap();
    let err = source.open("ward-plain").await.err().unwrap();
    assert_eq!(classify(&err), ErrorKind::ProtocolError);
    server.abort();
}

#[tokio::test]
async fn unreachable_backend_is_a_network_fault() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    let source = SseChannelSource::new(endpoint(address, Some(TOKEN))).unwrap();
    let err = source.open("ward-12").await.err().unwrap();
    assert_eq!(classify(&err), ErrorKind::Network);

    let polling = HttpFallbackSource::new(endpoint(address, Some(TOKEN))).unwrap();
    let err = polling.fetch("ward-12").await.unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Network);
}

#[tokio::test]
async fn polling_source_fetches_summaries() {
    let (address, server) = spawn_backend().await;
    let polling = HttpFallbackSource::new(endpoint(address, Some(TOKEN))).unwrap();
    assert_eq!(
        polling.fetch("ward-3").await.unwrap(),
        json!({"topic": "ward-3", "summary": "stable"})
    );
    assert_eq!(
        polling.fetch("ward-unknown").await.unwrap_err(),
        StreamError::http(404, "no such ward")
    );

    let anonymous = HttpFallbackSource::new(endpoint(address, None)).unwrap();
    let err = anonymous.fetch("ward-3").await.unwrap_err();
    assert_eq!(classify(&err), ErrorKind::AuthError);
    server.abort();
}

#[tokio::test]
async fn session_manager_streams_over_sse() {
    let (address, server) = spawn_backend().await;
    let config = StreamingConfig {
        endpoint: endpoint(address, Some(TOKEN)),
        ..Default::default()
    };
    let source = SseChannelSource::new(config.endpoint.clone()).unwrap();
    let manager = SessionManager::builder(config, Arc::new(source))
        .memory_probe(FixedMemoryProbe::constant(1, 4))
        .build();
    let listener = RecordingListener::new();
    let _guard = manager.listeners().subscribe(listener.clone());

    manager.open("ward-12", StreamMode::Standard).await.unwrap();
    let reconnecting = wait_until(Duration::from_secs(5), || {
        listener.states("ward-12").contains(&SessionState::Reconnecting)
    })
    .await;
    assert!(reconnecting);

    let states = listener.states("ward-12");
    assert_eq!(
        &states[..3],
        &[
            SessionState::Connecting,
            SessionState::Streaming,
            SessionState::Reconnecting
        ]
    );
    let closed = &listener.snapshots("ward-12")[2];
    assert_eq!(closed.last_error_kind, Some(ErrorKind::ProtocolError));
    assert_eq!(
        listener.data("ward-12")[0],
        (json!({"topic": "ward-12", "sentiment": 0.4}), DataOrigin::Stream)
    );
    assert_eq!(listener.progress("ward-12")[0].percent_complete, 0.25);

    manager.shutdown().await;
    server.abort();
}
