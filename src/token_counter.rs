//! TokenCounter: deterministic token-cost estimation and usage tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use tiktoken_rs::{cl100k_base, CoreBPE};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::message::{validate_messages, Message, MessageRole};
use crate::model_registry::{ModelKind, ModelRegistry};

/// Literal prelude reserved for the model's response when the final message
/// isn't already from the assistant.
const ASSISTANT_PRELUDE: &str = "<|im_start|>assistant\n";

/// Global `cl100k_base` encoder, shared by every counted model: the scheme is
/// fixed crate-wide, so there is nothing to key a per-model cache on.
static TOKENIZER: LazyLock<CoreBPE> =
    LazyLock::new(|| cl100k_base().expect("cl100k_base is a static vocabulary and never fails to load"));

/// One accounted dispatch.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    /// When the dispatch was recorded.
    pub timestamp: DateTime<Utc>,
    /// Model the tokens were counted against.
    pub model_id: String,
    /// Tokens consumed.
    pub token_count: usize,
    /// Originating request id, if tracked by the caller.
    pub request_id: Option<String>,
    /// Number of messages in the dispatched sequence.
    pub message_count: usize,
}

/// Aggregate view over the bounded usage history.
#[derive(Debug, Clone)]
pub struct UsageStats {
    /// Number of records currently retained.
    pub total_records: usize,
    /// Sum of `token_count` across all retained records.
    pub total_tokens: u64,
    /// `total_tokens / total_records`, or 0.0 if there are no records.
    pub average_tokens_per_request: f64,
}

/// Counts tokens for chat models and tracks usage history. Append-only;
/// history retention is bounded only by the caller's query limit.
pub struct TokenCounter {
    clock: Arc<dyn Clock>,
    registry: Arc<ModelRegistry>,
    history: RwLock<Vec<UsageRecord>>,
    total_tokens: AtomicU64,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

impl TokenCounter {
    /// Construct a counter over `registry`'s context-window limits.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            clock,
            registry,
            history: RwLock::new(Vec::new()),
            total_tokens: AtomicU64::new(0),
        }
    }

    fn raw_count(text: &str) -> usize {
        TOKENIZER.encode_with_special_tokens(text).len()
    }

    /// Token cost of a single string for `model`. Non-empty strings only.
    /// STT models always cost 0 tokens — tokens aren't their quota axis.
    pub async fn count(&self, text: &str, model: &str) -> Result<usize> {
        if text.is_empty() {
            return Err(Error::Validation("text must not be empty".to_string()));
        }
        if self.registry.kind(model).await? == ModelKind::Stt {
            return Ok(0);
        }
        Ok(Self::raw_count(text))
    }

    /// Token cost of a message sequence: each message is rendered into its
    /// canonical frame and tokenized independently; if the sequence doesn't
    /// already end with an assistant turn, the response-prelude frame is
    /// added to reserve room for it.
    pub async fn count_messages(&self, messages: &[Message], model: &str) -> Result<usize> {
        validate_messages(messages)?;
        if self.registry.kind(model).await? == ModelKind::Stt {
            return Ok(0);
        }

        let mut total = messages
            .iter()
            .map(|m| Self::raw_count(&m.render()))
            .sum::<usize>();

        if messages.last().map(|m| m.role) != Some(MessageRole::Assistant) {
            total += Self::raw_count(ASSISTANT_PRELUDE);
        }

        Ok(total)
    }

    /// Validate that `messages` fit under `max_tokens` (or, if absent, under
    /// `model`'s context window — a model with no declared context window
    /// always passes).
    pub async fn validate(
        &self,
        messages: &[Message],
        model: &str,
        max_tokens: Option<u32>,
    ) -> Result<()> {
        let counted = self.count_messages(messages, model).await?;
        let limit = match max_tokens {
            Some(explicit) => Some(explicit),
            None => self.registry.context_window(model).await?,
        };
        match limit {
            Some(limit) if counted as u32 > limit => Err(Error::TokenLimitExceeded {
                requested: counted,
                max: limit as usize,
            }),
            _ => Ok(()),
        }
    }

    /// Append a usage record and update the running total.
    pub async fn record_usage(
        &self,
        model_id: impl Into<String>,
        token_count: usize,
        request_id: Option<String>,
        message_count: usize,
    ) {
        let record = UsageRecord {
            timestamp: self.clock.now(),
            model_id: model_id.into(),
            token_count,
            request_id,
            message_count,
        };
        self.total_tokens.fetch_add(token_count as u64, Ordering::SeqCst);
        self.history.write().await.push(record);
    }

    /// The `limit` most recent usage records.
    pub async fn history(&self, limit: usize) -> Vec<UsageRecord> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregate usage statistics over the full retained history.
    pub async fn usage_stats(&self) -> UsageStats {
        let history = self.history.read().await;
        let total_records = history.len();
        let total_tokens = self.total_tokens.load(Ordering::SeqCst);
        let average_tokens_per_request = if total_records == 0 {
            0.0
        } else {
            total_tokens as f64 / total_records as f64
        };
        UsageStats {
            total_records,
            total_tokens,
            average_tokens_per_request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::model_registry::ModelRegistry;
    use crate::transport::{EventStream, FilePart, HeaderBag, RawResponse, Transport};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct FakeTransport;

    #[async_trait]
    impl Transport for FakeTransport {
        async fn post_json(&self, _endpoint: &str, _payload: serde_json::Value) -> Result<RawResponse> {
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
        async fn post_multipart(&self, _e: &str, _f: Vec<(String, String)>, _fp: Vec<FilePart>) -> Result<RawResponse> {
            unimplemented!()
        }
        async fn post_stream(&self, _e: &str, _p: serde_json::Value) -> Result<EventStream> {
            unimplemented!()
        }
    }

    async fn counter() -> TokenCounter {
        let clock = Arc::new(MockClock::default());
        let registry = Arc::new(ModelRegistry::new(
            clock.clone(),
            Arc::new(FakeTransport),
            "/models",
            std::time::Duration::from_secs(3600),
        ));
        registry.populate().await.unwrap();
        TokenCounter::new(clock, registry)
    }

    #[tokio::test]
    async fn stt_model_counts_zero_tokens() {
        let counter = counter().await;
        assert_eq!(counter.count("hello there", "whisper-mini").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_string_is_validation_error() {
        let counter = counter().await;
        assert!(matches!(counter.count("", "chat-model").await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn count_messages_matches_sum_of_rendered_counts() {
        let counter = counter().await;
        let messages = vec![Message::system("be terse"), Message::user("hi")];
        let total = counter.count_messages(&messages, "chat-model").await.unwrap();

        let expected: usize = messages
            .iter()
            .map(|m| TokenCounter::raw_count(&m.render()))
            .sum::<usize>()
            + TokenCounter::raw_count(ASSISTANT_PRELUDE);
        assert_eq!(total, expected);
    }

    #[tokio::test]
    async fn trailing_assistant_message_skips_prelude() {
        let counter = counter().await;
        let with_assistant = vec![Message::user("hi"), Message::assistant("hello")];
        let without_prelude = counter.count_messages(&with_assistant, "chat-model").await.unwrap();
        let expected: usize = with_assistant.iter().map(|m| TokenCounter::raw_count(&m.render())).sum();
        assert_eq!(without_prelude, expected);
    }

    #[tokio::test]
    async fn validate_substitutes_context_window_when_max_tokens_absent() {
        let counter = counter().await;
        let messages = vec![Message::user("x".repeat(2000))];
        let err = counter.validate(&messages, "chat-model", None).await.unwrap_err();
        assert!(matches!(err, Error::TokenLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn usage_stats_reflect_recorded_history() {
        let counter = counter().await;
        counter.record_usage("chat-model", 10, None, 1).await;
        counter.record_usage("chat-model", 20, None, 1).await;
        let stats = counter.usage_stats().await;
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.total_tokens, 30);
        assert!((stats.average_tokens_per_request - 15.0).abs() < 1e-9);
    }
}
