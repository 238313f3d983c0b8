//! AdmissionGate: the single per-request decision combining the registry,
//! the token counter, and the rate-limit tracker.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::message::Message;
use crate::model_registry::{ModelKind, ModelRegistry};
use crate::rate_limit::RateLimitTracker;
use crate::token_counter::TokenCounter;

/// Seconds of audio estimated per megabyte of file size (§4.4).
const AUDIO_SECONDS_PER_MB: f64 = 45.0;
/// Minimum estimated audio duration accepted.
const MIN_AUDIO_SECONDS: f64 = 1.0;
/// Maximum estimated audio duration accepted.
const MAX_AUDIO_SECONDS: f64 = 3600.0;
/// Bytes per "MB" used for the estimate (binary megabyte, matching the
/// original implementation's `file_size / (1024 * 1024)`).
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Minimum estimated duration a file must clear before it's accepted at all
/// (§6 "Supported audio formats").
const MIN_ACCEPTED_DURATION_SECONDS: f64 = 0.01;

/// Estimate audio duration from file size: 45 seconds per MB, clamped to
/// [1s, 3600s]. This is the value fed into the quota check, not the
/// raw estimate used by [`reject_if_too_short`].
#[must_use]
pub fn estimate_audio_seconds(file_size_bytes: u64) -> f64 {
    let mb = file_size_bytes as f64 / BYTES_PER_MB;
    (mb * AUDIO_SECONDS_PER_MB).clamp(MIN_AUDIO_SECONDS, MAX_AUDIO_SECONDS)
}

/// Reject files whose unclamped estimated duration falls under the
/// accepted minimum — a basic sanity check on near-empty uploads, distinct
/// from the quota-facing clamp in [`estimate_audio_seconds`].
pub fn reject_if_too_short(file_size_bytes: u64) -> Result<(), Error> {
    let mb = file_size_bytes as f64 / BYTES_PER_MB;
    let raw = mb * AUDIO_SECONDS_PER_MB;
    if raw < MIN_ACCEPTED_DURATION_SECONDS {
        return Err(Error::AudioFile(format!(
            "estimated duration {raw:.4}s is below the {MIN_ACCEPTED_DURATION_SECONDS}s minimum"
        )));
    }
    Ok(())
}

/// The payload being admitted: chat completion or transcription.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Chat completion: a message sequence plus an optional declared cap on
    /// generated tokens.
    Chat {
        /// The conversation to send.
        messages: Vec<Message>,
        /// Caller-declared max output tokens, if any.
        max_tokens: Option<u32>,
    },
    /// Transcription: only the file size matters for admission.
    Transcription {
        /// Size of the file to upload, in bytes.
        file_size_bytes: u64,
    },
}

/// The three-way outcome of an admission check.
#[derive(Debug)]
pub enum AdmissionVerdict {
    /// Send the request now.
    Go,
    /// Wait this long, then re-evaluate.
    Wait(Duration),
    /// Do not send; the payload or current quota state makes this request
    /// impossible to admit.
    Reject(Error),
}

/// Combines [`ModelRegistry`], [`TokenCounter`], and [`RateLimitTracker`]
/// into a single admission decision. Holds read-only references; never
/// mutates any of the three.
pub struct AdmissionGate {
    registry: Arc<ModelRegistry>,
    counter: Arc<TokenCounter>,
    tracker: Arc<RateLimitTracker>,
}

impl AdmissionGate {
    /// Construct a gate over the given components.
    #[must_use]
    pub fn new(
        registry: Arc<ModelRegistry>,
        counter: Arc<TokenCounter>,
        tracker: Arc<RateLimitTracker>,
    ) -> Self {
        Self {
            registry,
            counter,
            tracker,
        }
    }

    /// Decide whether `payload` may be sent to `model` right now.
    pub async fn evaluate(&self, model: &str, payload: &Payload) -> AdmissionVerdict {
        let expected_kind = match &payload {
            Payload::Chat { .. } => ModelKind::Chat,
            Payload::Transcription { .. } => ModelKind::Stt,
        };

        let descriptor = match self.registry.info(model).await {
            Ok(d) => d,
            Err(e) => return AdmissionVerdict::Reject(e),
        };
        if descriptor.kind != expected_kind {
            return AdmissionVerdict::Reject(Error::InvalidModel {
                model: model.to_string(),
                reason: format!("expected {expected_kind:?}, found {:?}", descriptor.kind),
            });
        }

        let (tokens_needed, audio_seconds) = match payload {
            Payload::Chat { messages, max_tokens } => {
                let counted = match self.counter.count_messages(messages, model).await {
                    Ok(c) => c,
                    Err(e) => return AdmissionVerdict::Reject(e),
                };
                if let Some(context_window) = descriptor.context_window {
                    let declared = max_tokens.unwrap_or(0) as usize;
                    if counted + declared > context_window as usize {
                        return AdmissionVerdict::Reject(Error::TokenLimitExceeded {
                            requested: counted + declared,
                            max: context_window as usize,
                        });
                    }
                }
                (counted as i64, 0)
            }
            Payload::Transcription { file_size_bytes } => {
                (0, estimate_audio_seconds(*file_size_bytes).ceil() as i64)
            }
        };

        let can_proceed = match self.tracker.can_proceed(1, tokens_needed, audio_seconds).await {
            Ok(v) => v,
            Err(e) => return AdmissionVerdict::Reject(e),
        };

        if can_proceed {
            return AdmissionVerdict::Go;
        }

        match self.tracker.compute_wait().await {
            Ok(wait) => AdmissionVerdict::Wait(wait),
            Err(e) => AdmissionVerdict::Reject(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::transport::{EventStream, FilePart, HeaderBag, RawResponse, Transport};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct FakeTransport;

    #[async_trait]
    impl Transport for FakeTransport {
        async fn post_json(&self, _e: &str, _p: serde_json::Value) -> crate::error::Result<RawResponse> {
            Ok(RawResponse {
                body: serde_json::json!({
                    "data": [
                        {"id": "chat-model", "owned_by": "acme", "created": 0, "active": true, "context_window": 100, "max_completion_tokens": 50},
                        {"id": "whisper-mini", "owned_by": "acme", "created": 0, "active": true, "context_window": null, "max_completion_tokens": null}
                    ]
                }),
                headers: HeaderBag::new(),
            })
        }
        async fn post_multipart(&self, _e: &str, _f: Vec<(String, String)>, _fp: Vec<FilePart>) -> crate::error::Result<RawResponse> {
            unimplemented!()
        }
        async fn post_stream(&self, _e: &str, _p: serde_json::Value) -> crate::error::Result<EventStream> {
            unimplemented!()
        }
    }

    async fn gate() -> AdmissionGate {
        let clock = Arc::new(MockClock::default());
        let registry = Arc::new(ModelRegistry::new(
            clock.clone(),
            Arc::new(FakeTransport),
            "/models",
            std::time::Duration::from_secs(3600),
        ));
        registry.populate().await.unwrap();
        let counter = Arc::new(TokenCounter::new(clock.clone(), registry.clone()));
        let tracker = Arc::new(RateLimitTracker::new(clock));
        AdmissionGate::new(registry, counter, tracker)
    }

    #[tokio::test]
    async fn go_when_quota_and_tokens_fit() {
        let gate = gate().await;
        let verdict = gate
            .evaluate(
                "chat-model",
                &Payload::Chat {
                    messages: vec![Message::user("hi")],
                    max_tokens: Some(10),
                },
            )
            .await;
        assert!(matches!(verdict, AdmissionVerdict::Go));
    }

    #[tokio::test]
    async fn rejects_token_overage_before_any_quota_check() {
        let gate = gate().await;
        let verdict = gate
            .evaluate(
                "chat-model",
                &Payload::Chat {
                    messages: vec![Message::user("x".repeat(2000))],
                    max_tokens: Some(20),
                },
            )
            .await;
        assert!(matches!(verdict, AdmissionVerdict::Reject(Error::TokenLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn rejects_wrong_kind_for_operation() {
        let gate = gate().await;
        let verdict = gate
            .evaluate(
                "whisper-mini",
                &Payload::Chat {
                    messages: vec![Message::user("hi")],
                    max_tokens: None,
                },
            )
            .await;
        assert!(matches!(verdict, AdmissionVerdict::Reject(Error::InvalidModel { .. })));
    }

    #[test]
    fn audio_estimate_is_clamped() {
        assert_eq!(estimate_audio_seconds(0), 1.0);
        assert!((estimate_audio_seconds(10 * 1024 * 1024) - 450.0).abs() < 1e-9);
        assert_eq!(estimate_audio_seconds(10_000 * 1024 * 1024), 3600.0);
    }

    #[test]
    fn near_empty_file_is_rejected_as_too_short() {
        assert!(reject_if_too_short(0).is_err());
        assert!(reject_if_too_short(1024 * 1024).is_ok());
    }
}
