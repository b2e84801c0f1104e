//! ---
//! ws_section: "05-networking-external-interfaces"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "HTTP edge adapters for the streaming core."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
//! HTTP edge of the streaming core: a Server-Sent Events push channel and the
//! request/response endpoint used while the fleet is polling.
#![warn(missing_docs)]

pub mod http;
pub mod polling;
pub mod sse;

pub use http::{build_client, map_transport_error, topic_url};
pub use polling::HttpFallbackSource;
pub use sse::{
    frame_to_event, SseChannel, SseChannelSource, SseDecoder, SseFrame, DEFAULT_MAX_FRAME_BYTES,
};
