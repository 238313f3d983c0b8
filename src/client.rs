//! The top-level client: wires the registry, counter, tracker, gate, queue,
//! and handlers into one entry point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::admission::{AdmissionGate, AdmissionVerdict, Payload};
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::handlers::chat::ChatHandler;
use crate::handlers::transcription::TranscriptionHandler;
use crate::message::Message;
use crate::model_registry::{ModelDescriptor, ModelKind, ModelRegistry, RegistrySummary};
use crate::queue::{Priority, PriorityQueueManager, QueueStatus, QueuedCallable};
use crate::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::token_counter::{TokenCounter, UsageStats};
use crate::transport::{EventStream, RawResponse, ReqwestTransport, Transport};

/// Hard cap on the single-retry wait a direct (non-queued) call will sleep
/// through before giving up.
const DIRECT_WAIT_CAP: Duration = Duration::from_secs(300);

/// The admission-and-scheduling client. Cheap to clone (everything inside
/// is an `Arc`); the intended usage is one long-lived instance per process.
#[derive(Clone)]
pub struct Client {
    clock: Arc<dyn Clock>,
    registry: Arc<ModelRegistry>,
    counter: Arc<TokenCounter>,
    tracker: Arc<RateLimitTracker>,
    gate: Arc<AdmissionGate>,
    queue: Arc<PriorityQueueManager>,
    chat: Arc<ChatHandler>,
    transcription: Arc<TranscriptionHandler>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client from `config`, wiring a production [`ReqwestTransport`]
    /// and [`SystemClock`] underneath.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `config.queue_capacity` is zero.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.base_url.clone(),
            config.credential.clone(),
            config.json_timeout,
            config.multipart_timeout,
        ));
        Self::with_transport(config, transport)
    }

    /// Build a client against a caller-supplied transport — the seam tests
    /// use to substitute a fake.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `config.queue_capacity` is zero.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Arc::new(ModelRegistry::new(
            clock.clone(),
            transport.clone(),
            "/models",
            config.cache_interval,
        ));
        let counter = Arc::new(TokenCounter::new(clock.clone(), registry.clone()));
        let tracker = Arc::new(RateLimitTracker::new(clock.clone()));
        let gate = Arc::new(AdmissionGate::new(registry.clone(), counter.clone(), tracker.clone()));
        let queue = Arc::new(PriorityQueueManager::new(
            clock.clone(),
            gate.clone(),
            tracker.clone(),
            counter.clone(),
            config.queue_capacity,
        )?);
        let chat = Arc::new(ChatHandler::new(transport.clone(), "/chat/completions"));
        let transcription = Arc::new(TranscriptionHandler::new(
            transport,
            "/audio/transcriptions",
            config.plan,
        ));

        Ok(Self {
            clock,
            registry,
            counter,
            tracker,
            gate,
            queue,
            chat,
            transcription,
        })
    }

    /// Start the background dispatch worker for queued requests.
    pub async fn start_worker(self: &Arc<Self>) {
        let queue = Arc::clone(&self.queue);
        queue.start().await;
    }

    /// Stop the background worker. In-flight work finishes; nothing new is pulled.
    pub async fn stop_worker(&self) {
        self.queue.stop().await;
    }

    /// Drain the queue on the calling task until empty. Does not start or
    /// touch the background worker; intended for batch-style callers that
    /// never call [`Client::start_worker`].
    pub async fn process_queue_blocking(&self) -> Result<()> {
        self.queue.process_queue_blocking().await
    }

    /// Populate the model catalog if it hasn't been refreshed within the
    /// configured cache interval.
    pub async fn refresh_models(&self) -> Result<()> {
        self.registry.populate().await
    }

    /// Full descriptor for a known model id.
    pub async fn model_info(&self, id: &str) -> Result<ModelDescriptor> {
        self.registry.info(id).await
    }

    /// List known models, optionally filtered by kind.
    pub async fn list_models(&self, kind: Option<ModelKind>) -> Vec<ModelDescriptor> {
        self.registry.list(kind).await
    }

    async fn admit_or_wait(&self, model: &str, payload: &Payload) -> Result<()> {
        match self.gate.evaluate(model, payload).await {
            AdmissionVerdict::Go => Ok(()),
            AdmissionVerdict::Wait(delta) => {
                let bounded = delta.min(DIRECT_WAIT_CAP);
                debug!(?bounded, "direct call waiting on admission");
                self.clock.sleep(bounded).await;
                match self.gate.evaluate(model, payload).await {
                    AdmissionVerdict::Go => Ok(()),
                    AdmissionVerdict::Wait(delta) => Err(Error::RateLimitExceeded { wait: delta }),
                    AdmissionVerdict::Reject(err) => Err(err),
                }
            }
            AdmissionVerdict::Reject(err) => Err(err),
        }
    }

    /// Send a chat completion immediately, waiting through at most one
    /// admission-suggested delay before giving up. Use [`Client::enqueue_chat`]
    /// for work that should be scheduled and retried instead.
    pub async fn chat_complete(
        &self,
        model: &str,
        messages: &[Message],
        max_tokens: Option<u32>,
    ) -> Result<RawResponse> {
        let payload = Payload::Chat {
            messages: messages.to_vec(),
            max_tokens,
        };
        self.admit_or_wait(model, &payload).await?;

        let response = self.chat.complete(model, messages, max_tokens).await?;
        self.tracker.ingest_headers(&response.headers).await?;
        let tokens = self.counter.count_messages(messages, model).await.unwrap_or(0);
        self.counter
            .record_usage(model.to_string(), tokens, None, messages.len())
            .await;
        Ok(response)
    }

    /// Open a streaming chat completion, admitted the same way as
    /// [`Client::chat_complete`].
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
        max_tokens: Option<u32>,
    ) -> Result<EventStream> {
        let payload = Payload::Chat {
            messages: messages.to_vec(),
            max_tokens,
        };
        self.admit_or_wait(model, &payload).await?;
        self.chat.stream(model, messages, max_tokens).await
    }

    /// Transcribe audio immediately, admitted the same way as [`Client::chat_complete`].
    pub async fn transcribe(
        &self,
        model: &str,
        file_name: &str,
        bytes: Vec<u8>,
        prompt: Option<String>,
        language: Option<String>,
        response_format: Option<String>,
    ) -> Result<RawResponse> {
        let payload = Payload::Transcription {
            file_size_bytes: bytes.len() as u64,
        };
        self.admit_or_wait(model, &payload).await?;

        let response = self
            .transcription
            .transcribe(model, file_name, bytes, prompt, language, response_format)
            .await?;
        self.tracker.ingest_headers(&response.headers).await?;
        Ok(response)
    }

    /// Enqueue a chat completion for scheduled dispatch. Returns the
    /// request's opaque id and a receiver for its terminal outcome.
    pub async fn enqueue_chat(
        &self,
        priority: Priority,
        model: &str,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
        max_retries: u32,
    ) -> Result<(String, oneshot::Receiver<Result<RawResponse>>)> {
        let payload = Payload::Chat {
            messages: messages.clone(),
            max_tokens,
        };
        let callable = Box::new(ChatCallable {
            handler: Arc::clone(&self.chat),
            model: model.to_string(),
            messages,
            max_tokens,
        });
        self.queue.enqueue(priority, model, payload, max_retries, callable).await
    }

    /// Enqueue a transcription for scheduled dispatch. Returns the
    /// request's opaque id and a receiver for its terminal outcome.
    pub async fn enqueue_transcription(
        &self,
        priority: Priority,
        model: &str,
        file_name: String,
        bytes: Vec<u8>,
        max_retries: u32,
    ) -> Result<(String, oneshot::Receiver<Result<RawResponse>>)> {
        let payload = Payload::Transcription {
            file_size_bytes: bytes.len() as u64,
        };
        let callable = Box::new(TranscriptionCallable {
            handler: Arc::clone(&self.transcription),
            model: model.to_string(),
            file_name: file_name.clone(),
            bytes,
        });
        self.queue.enqueue(priority, model, payload, max_retries, callable).await
    }

    /// Queue depth, lifetime counters, and worker state.
    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    /// Drop pending queued items, one priority or all of them.
    pub async fn clear_queue(&self, priority: Option<Priority>) -> usize {
        self.queue.clear(priority).await
    }

    /// Aggregate token usage over the retained history.
    pub async fn usage_stats(&self) -> UsageStats {
        self.counter.usage_stats().await
    }

    /// Count-by-kind plus cache age for the model catalog.
    pub async fn model_summary(&self) -> RegistrySummary {
        self.registry.summary().await
    }

    /// Current view of the three quota windows.
    pub async fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.tracker.snapshot().await
    }
}

struct ChatCallable {
    handler: Arc<ChatHandler>,
    model: String,
    messages: Vec<Message>,
    max_tokens: Option<u32>,
}

#[async_trait]
impl QueuedCallable for ChatCallable {
    async fn call(&self) -> Result<RawResponse> {
        self.handler.complete(&self.model, &self.messages, self.max_tokens).await
    }
}

struct TranscriptionCallable {
    handler: Arc<TranscriptionHandler>,
    model: String,
    file_name: String,
    bytes: Vec<u8>,
}

#[async_trait]
impl QueuedCallable for TranscriptionCallable {
    async fn call(&self) -> Result<RawResponse> {
        self.handler
            .transcribe(&self.model, &self.file_name, self.bytes.clone(), None, None, None)
            .await
    }
}
