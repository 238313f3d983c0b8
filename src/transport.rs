//! Transport: the opaque boundary between the admission pipeline and the wire.
//!
//! The core never touches TLS, multipart encoding, or SSE framing directly —
//! it speaks to a `Transport` trait object with exactly three operations.
//! `ReqwestTransport` is the production implementation; tests substitute a
//! hand-rolled fake.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::{Error, Result};

/// A case-insensitive bag of response headers surfaced to the core
/// (§6 "Headers surfaced to the core").
#[derive(Debug, Clone, Default)]
pub struct HeaderBag(HashMap<String, String>);

impl HeaderBag {
    /// Construct an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Insert a header, lowercasing the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_lowercase(), value.into());
    }

    /// Look up a header case-insensitively.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_lowercase()).map(String::as_str)
    }
}

/// A JSON body plus the response headers that arrived with it.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Decoded JSON body.
    pub body: serde_json::Value,
    /// Headers surfaced to the core.
    pub headers: HeaderBag,
}

/// One file attached to a multipart upload.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Multipart field name (e.g. `"file"`).
    pub field_name: String,
    /// Original file name sent to the server.
    pub file_name: String,
    /// MIME type for the `Content-Type` of this part.
    pub content_type: String,
    /// Raw file bytes.
    pub bytes: Vec<u8>,
}

/// A boxed stream of decoded SSE events, or a network error if the
/// connection failed mid-stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<serde_json::Value>> + Send>>;

/// The three operations the admission pipeline needs from the wire.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// POST a JSON payload, returning the decoded body and response headers.
    async fn post_json(&self, endpoint: &str, payload: serde_json::Value) -> Result<RawResponse>;

    /// POST a multipart form: plain fields plus file parts.
    async fn post_multipart(
        &self,
        endpoint: &str,
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    ) -> Result<RawResponse>;

    /// POST a JSON payload and stream back SSE-framed events.
    async fn post_stream(&self, endpoint: &str, payload: serde_json::Value) -> Result<EventStream>;
}

/// Production `Transport` backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    credential: String,
    json_timeout: std::time::Duration,
    multipart_timeout: std::time::Duration,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.base_url)
            .field("credential", &crate::util::mask_api_key(&self.credential))
            .finish()
    }
}

const USER_AGENT: &str = concat!("admission-client/", env!("CARGO_PKG_VERSION"));

impl ReqwestTransport {
    /// Build a transport against `base_url`, authenticating with `credential`.
    ///
    /// Builds its own `reqwest::Client` with no client-level timeout; every
    /// call instead attaches an explicit per-call timeout (`json_timeout` or
    /// `multipart_timeout`) — relying on `reqwest::Client::new()`'s default of
    /// no timeout at all would let a stalled connection hang indefinitely.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        credential: impl Into<String>,
        json_timeout: std::time::Duration,
        multipart_timeout: std::time::Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            credential: credential.into(),
            json_timeout,
            multipart_timeout,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn handle_response(response: reqwest::Response) -> Result<RawResponse> {
        let status = response.status();
        let mut headers = HeaderBag::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str(), v);
            }
        }

        if status.as_u16() == 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Validation(text));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Authentication(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
                .unwrap_or(text);
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        Ok(RawResponse { body, headers })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(&self, endpoint: &str, payload: serde_json::Value) -> Result<RawResponse> {
        let response = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(&self.credential)
            .header("User-Agent", USER_AGENT)
            .timeout(self.json_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RequestTimeout(self.json_timeout)
                } else {
                    Error::Network(e.to_string())
                }
            })?;
        Self::handle_response(response).await
    }

    async fn post_multipart(
        &self,
        endpoint: &str,
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    ) -> Result<RawResponse> {
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in fields {
            form = form.text(key, value);
        }
        for file in files {
            let part = reqwest::multipart::Part::bytes(file.bytes)
                .file_name(file.file_name)
                .mime_str(&file.content_type)
                .map_err(|e| Error::Validation(e.to_string()))?;
            form = form.part(file.field_name, part);
        }

        // `multipart::Form` sets its own `Content-Type: multipart/form-data;
        // boundary=...` — never set one explicitly here, it would drop the boundary.
        let response = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(&self.credential)
            .header("User-Agent", USER_AGENT)
            .timeout(self.multipart_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RequestTimeout(self.multipart_timeout)
                } else {
                    Error::Network(e.to_string())
                }
            })?;
        Self::handle_response(response).await
    }

    async fn post_stream(&self, endpoint: &str, payload: serde_json::Value) -> Result<EventStream> {
        let response = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(&self.credential)
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "application/json")
            .timeout(self.json_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RequestTimeout(self.json_timeout)
                } else {
                    Error::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let bytes_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> =
            Box::pin(response.bytes_stream());

        Ok(Box::pin(decode_sse(bytes_stream)))
    }
}

/// State driving the SSE line-decoder in [`decode_sse`].
struct SseState {
    bytes_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: String,
    errored: bool,
}

/// Decode a byte stream into SSE-framed JSON events.
///
/// Lines beginning `data: ` are stripped and parsed as JSON; a line whose
/// payload is `[DONE]` ends the stream; a line that fails to parse as JSON is
/// skipped without aborting the stream (§6). A connection-level error from
/// the underlying byte stream is *not* swallowed — it is surfaced as the
/// stream's final item, `Error::Network`.
fn decode_sse(
    bytes_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
) -> impl Stream<Item = Result<serde_json::Value>> + Send {
    let state = SseState {
        bytes_stream,
        buffer: String::new(),
        errored: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.errored {
            return None;
        }
        loop {
            if let Some(pos) = state.buffer.find('\n') {
                let line: String = state.buffer.drain(..=pos).collect();
                let line = line.trim_end_matches(['\r', '\n']);
                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    return None;
                }
                match serde_json::from_str::<serde_json::Value>(payload) {
                    Ok(value) => return Some((Ok(value), state)),
                    Err(_) => continue,
                }
            }

            match state.bytes_stream.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => {
                    state.errored = true;
                    return Some((Err(Error::Network(e.to_string())), state));
                }
                None => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunk_stream(
        chunks: Vec<&'static str>,
    ) -> Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from(c))),
        ))
    }

    #[tokio::test]
    async fn decodes_events_and_stops_at_done() {
        let events = chunk_stream(vec![
            "data: {\"n\":1}\n",
            "data: {\"n\":2}\n",
            "data: [DONE]\n",
        ]);
        let mut stream = Box::pin(decode_sse(events));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first["n"], 1);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second["n"], 2);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn skips_unparseable_event_without_aborting() {
        let events = chunk_stream(vec!["data: not json\n", "data: {\"ok\":true}\n"]);
        let mut stream = Box::pin(decode_sse(events));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first["ok"], true);
    }

    #[test]
    fn header_bag_lookup_is_case_insensitive() {
        let mut bag = HeaderBag::new();
        bag.insert("X-Request-Id", "abc123");
        assert_eq!(bag.get("x-request-id"), Some("abc123"));
    }
}
