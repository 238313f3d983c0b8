//! Chat completion: a thin adapter from validated messages to the transport.

use std::sync::Arc;

use serde_json::json;

use crate::error::Result;
use crate::message::{validate_messages, Message};
use crate::transport::{EventStream, RawResponse, Transport};

fn encode_messages(messages: &[Message]) -> serde_json::Value {
    json!(messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect::<Vec<_>>())
}

/// Sends chat-completion requests. Holds no quota state of its own — callers
/// run messages through the admission gate first.
#[derive(Debug)]
pub struct ChatHandler {
    transport: Arc<dyn Transport>,
    endpoint: String,
}

impl ChatHandler {
    /// Construct a handler posting to `endpoint` (e.g. `/chat/completions`).
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
        }
    }

    /// Send a non-streaming completion request.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        max_tokens: Option<u32>,
    ) -> Result<RawResponse> {
        validate_messages(messages)?;
        let payload = json!({
            "model": model,
            "messages": encode_messages(messages),
            "max_tokens": max_tokens,
            "stream": false,
        });
        self.transport.post_json(&self.endpoint, payload).await
    }

    /// Send a streaming completion request, returning a decoded SSE event
    /// stream.
    pub async fn stream(
        &self,
        model: &str,
        messages: &[Message],
        max_tokens: Option<u32>,
    ) -> Result<EventStream> {
        validate_messages(messages)?;
        let payload = json!({
            "model": model,
            "messages": encode_messages(messages),
            "max_tokens": max_tokens,
            "stream": true,
        });
        self.transport.post_stream(&self.endpoint, payload).await
    }
}
