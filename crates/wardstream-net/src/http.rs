//! ---
//! ws_section: "05-networking-external-interfaces"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Shared HTTP client construction and fault mapping."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, RequestBuilder, Response};
use url::Url;
use wardstream_common::config::EndpointConfig;
use wardstream_resilience::error::StreamError;

const USER_AGENT: &str = concat!("wardstream/", env!("CARGO_PKG_VERSION"));

/// Build the client shared by the push and polling adapters. Only the connect
/// phase is bounded here; long-lived streams must not inherit a total timeout.
pub fn build_client(endpoint: &EndpointConfig) -> anyhow::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(endpoint.request_timeout)
        .build()
        .context("failed to build http client")
}

/// Resolve `path` against the endpoint base and attach the topic query.
pub fn topic_url(endpoint: &EndpointConfig, path: &str, topic: &str) -> Result<Url, StreamError> {
    let base = Url::parse(&endpoint.base_url)
        .map_err(|err| {
            StreamError::Other(format!("invalid base url {}: {err}", endpoint.base_url))
        })?;
    let mut url = base
        .join(path)
        .map_err(|err| StreamError::Other(format!("invalid path {path}: {err}")))?;
    url.query_pairs_mut().append_pair("topic", topic);
    Ok(url)
}

/// Map a client error to the channel fault vocabulary.
pub fn map_transport_error(err: reqwest::Error, timeout: Duration) -> StreamError {
    if err.is_timeout() {
        return StreamError::Timeout(timeout);
    }
    if let Some(status) = err.status() {
        return StreamError::http(status.as_u16(), err.to_string());
    }
    if err.is_decode() {
        return StreamError::Protocol(err.to_string());
    }
    StreamError::Transport(err.to_string())
}

pub(crate) fn authorised(request: RequestBuilder, endpoint: &EndpointConfig) -> RequestBuilder {
    match endpoint.bearer_token.as_deref() {
        Some(token) if !token.is_empty() => request.bearer_auth(token),
        _ => request,
    }
}

/// Turn a non-success response into an HTTP fault carrying the body.
pub(crate) async fn status_error(response: Response) -> StreamError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("").to_string()
    } else {
        body.trim().to_string()
    };
    StreamError::http(status.as_u16(), message)
}
