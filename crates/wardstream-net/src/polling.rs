//! ---
//! ws_section: "05-networking-external-interfaces"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "HTTP request/response source used while polling."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::Value;
use wardstream_common::config::EndpointConfig;
use wardstream_resilience::channel::FallbackSource;
use wardstream_resilience::error::StreamError;

use crate::http::{authorised, build_client, map_transport_error, status_error, topic_url};

/// [`FallbackSource`] fetching `endpoint.poll_path` for a topic. Each fetch
/// is bounded by `endpoint.request_timeout`.
#[derive(Debug, Clone)]
pub struct HttpFallbackSource {
    client: Client,
    endpoint: EndpointConfig,
}

impl HttpFallbackSource {
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
impl FallbackSource for HttpFallbackSource {
    async fn fetch(&self, topic: &str) -> Result<Value, StreamError> {
        let url = topic_url(&self.endpoint, &self.endpoint.poll_path, topic)?;
        let timeout = self.endpoint.request_timeout;
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .timeout(timeout);
        let response = authorised(request, &self.endpoint)
            .send()
            .await
            .map_err(|err| map_transport_error(err, timeout))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| map_transport_error(err, timeout))
    }
}
