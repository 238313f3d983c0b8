//! admission-client — request admission and priority scheduling for a
//! quota-metered LLM inference service.
//!
//! - Registry: lazily-refreshed catalog of model ids, kinds, and limits
//! - Token counter: deterministic `cl100k_base` cost estimation and usage history
//! - Rate-limit tracker: three server-reported quota windows (requests, tokens, audio-seconds)
//! - Admission gate: combines the three into a single go/wait/reject verdict
//! - Priority queue: a four-level FIFO drained by one background worker under the gate
//! - Handlers: thin chat-completion and transcription adapters over the transport

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod clock;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod message;
pub mod model_registry;
pub mod queue;
pub mod rate_limit;
pub mod token_counter;
pub mod transport;
pub mod util;

pub use admission::{AdmissionGate, AdmissionVerdict, Payload};
pub use client::Client;
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ClientConfig, Plan};
pub use error::{Error, Result};
pub use handlers::chat::ChatHandler;
pub use handlers::transcription::TranscriptionHandler;
pub use message::{Message, MessageRole};
pub use model_registry::{ModelDescriptor, ModelKind, ModelRegistry, RegistrySummary};
pub use queue::{Priority, PriorityQueueManager, QueueStats, QueueStatus, QueuedCallable};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
pub use token_counter::{TokenCounter, UsageRecord, UsageStats};
pub use transport::{EventStream, FilePart, HeaderBag, RawResponse, ReqwestTransport, Transport};
