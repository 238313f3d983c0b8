//! Speech-to-text transcription: file-format/size validation plus a thin
//! multipart adapter.

use std::sync::Arc;

use crate::admission::reject_if_too_short;
use crate::config::Plan;
use crate::error::{Error, Result};
use crate::transport::{FilePart, RawResponse, Transport};

/// Audio extensions accepted for transcription, matching the service's
/// supported upload formats.
pub const SUPPORTED_FORMATS: &[&str] =
    &["mp3", "mp4", "mpeg", "mpga", "m4a", "wav", "webm", "ogg", "flac"];

fn extension_of(file_name: &str) -> String {
    file_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

fn mime_type_for(extension: &str) -> Option<&'static str> {
    match extension {
        "mp3" => Some("audio/mpeg"),
        "mp4" => Some("audio/mp4"),
        "mpeg" => Some("audio/mpeg"),
        "mpga" => Some("audio/mpeg"),
        "m4a" => Some("audio/mp4"),
        "wav" => Some("audio/wav"),
        "webm" => Some("audio/webm"),
        "ogg" => Some("audio/ogg"),
        "flac" => Some("audio/flac"),
        _ => None,
    }
}

/// Sends transcription requests. Validates file extension and size before
/// ever touching the transport; quota/duration admission happens upstream in
/// the admission gate.
#[derive(Debug)]
pub struct TranscriptionHandler {
    transport: Arc<dyn Transport>,
    endpoint: String,
    plan: Plan,
}

impl TranscriptionHandler {
    /// Construct a handler posting to `endpoint` (e.g. `/audio/transcriptions`),
    /// enforcing `plan`'s file-size cap.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>, plan: Plan) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            plan,
        }
    }

    /// The extensions this handler will accept.
    #[must_use]
    pub fn supported_formats(&self) -> &'static [&'static str] {
        SUPPORTED_FORMATS
    }

    /// Check a candidate upload against the format allowlist and the plan's
    /// size cap without sending anything. Returns the MIME type that would
    /// be used for the upload.
    pub fn check_file_compatibility(&self, file_name: &str, size_bytes: u64) -> Result<&'static str> {
        let extension = extension_of(file_name);
        let content_type = mime_type_for(&extension).ok_or_else(|| Error::UnsupportedFormat {
            format: extension.clone(),
            supported: SUPPORTED_FORMATS.iter().map(|s| s.to_string()).collect(),
        })?;

        let max = self.plan.max_file_size_bytes();
        if size_bytes > max {
            return Err(Error::FileSize { size: size_bytes, max });
        }

        reject_if_too_short(size_bytes)?;

        Ok(content_type)
    }

    /// Transcribe `bytes` (named `file_name`) with `model`, optionally
    /// biasing with `prompt`, declaring `language`, and requesting
    /// `response_format` (`"json"`, `"text"`, `"verbose_json"`, ...).
    pub async fn transcribe(
        &self,
        model: &str,
        file_name: &str,
        bytes: Vec<u8>,
        prompt: Option<String>,
        language: Option<String>,
        response_format: Option<String>,
    ) -> Result<RawResponse> {
        let content_type = self.check_file_compatibility(file_name, bytes.len() as u64)?;

        let mut fields = vec![("model".to_string(), model.to_string())];
        if let Some(prompt) = prompt {
            fields.push(("prompt".to_string(), prompt));
        }
        if let Some(language) = language {
            fields.push(("language".to_string(), language));
        }
        if let Some(response_format) = response_format {
            fields.push(("response_format".to_string(), response_format));
        }

        let file = FilePart {
            field_name: "file".to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            bytes,
        };

        self.transport.post_multipart(&self.endpoint, fields, vec![file]).await
    }

    /// Convenience wrapper: transcribe with a prompt, no other options.
    pub async fn transcribe_with_prompt(
        &self,
        model: &str,
        file_name: &str,
        bytes: Vec<u8>,
        prompt: impl Into<String>,
    ) -> Result<RawResponse> {
        self.transcribe(model, file_name, bytes, Some(prompt.into()), None, None).await
    }

    /// Convenience wrapper: transcribe with a declared source language, no
    /// other options.
    pub async fn transcribe_with_language(
        &self,
        model: &str,
        file_name: &str,
        bytes: Vec<u8>,
        language: impl Into<String>,
    ) -> Result<RawResponse> {
        self.transcribe(model, file_name, bytes, None, Some(language.into()), None).await
    }

    /// Convenience wrapper: request `response_format: "json"`.
    pub async fn transcribe_json(&self, model: &str, file_name: &str, bytes: Vec<u8>) -> Result<RawResponse> {
        self.transcribe(model, file_name, bytes, None, None, Some("json".to_string())).await
    }

    /// Convenience wrapper: request `response_format: "verbose_json"`
    /// (segment-level timestamps).
    pub async fn transcribe_verbose(&self, model: &str, file_name: &str, bytes: Vec<u8>) -> Result<RawResponse> {
        self.transcribe(model, file_name, bytes, None, None, Some("verbose_json".to_string())).await
    }
}
