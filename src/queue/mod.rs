//! PriorityQueueManager: a four-level priority FIFO drained by a single
//! background worker under the `AdmissionGate`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::admission::{AdmissionGate, AdmissionVerdict, Payload};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::rate_limit::RateLimitTracker;
use crate::token_counter::TokenCounter;
use crate::transport::RawResponse;

/// Dispatch precedence, highest first.
const PRIORITY_ORDER: [Priority; 4] =
    [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

/// Hard cap on a single idle wait between dispatch attempts.
const WAIT_HARD_CAP: Duration = Duration::from_secs(300);

/// How long the background worker sleeps between cycles when every queue
/// is empty, so it doesn't busy-spin while idle.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One of four dispatch classes; `Urgent` always drains before `High`,
/// `High` before `Normal`, and so on. There is no aging — a steady stream of
/// urgent work can starve everything below it, by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Drains first.
    Urgent,
    /// Drains second.
    High,
    /// Drains third.
    Normal,
    /// Drains last.
    Low,
}

impl Priority {
    /// Parse a priority name, coercing anything unrecognized to `Normal`
    /// (documented behavior, matching the source's stringly-typed enqueue).
    #[must_use]
    pub fn parse_or_normal(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "urgent" => Priority::Urgent,
            "high" => Priority::High,
            "normal" => Priority::Normal,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

/// A unit of deferred work the queue knows how to execute once admitted.
#[async_trait]
pub trait QueuedCallable: Send + Sync {
    /// Perform the actual dispatch (the transport call). The queue ingests
    /// the returned headers into the tracker and records usage on success.
    async fn call(&self) -> Result<RawResponse>;
}

struct QueuedRequestEntry {
    id: String,
    priority: Priority,
    original_priority: Priority,
    #[allow(dead_code)]
    enqueued_at: DateTime<Utc>,
    retry_count: u32,
    max_retries: u32,
    model: String,
    payload: Payload,
    callable: Box<dyn QueuedCallable>,
    result_tx: Option<oneshot::Sender<Result<RawResponse>>>,
}

/// Lifetime counters surfaced by [`PriorityQueueManager::status`].
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Successful enqueue attempts (queue-full rejections do not count).
    pub total_queued: u64,
    /// Items that reached a terminal success.
    pub total_processed: u64,
    /// Individual failed attempts, including ones that were later retried.
    pub total_failed: u64,
    /// Attempts that were requeued after a retryable failure.
    pub total_retries: u64,
}

/// A point-in-time view of queue depth and lifetime counters.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    /// Live item count per priority.
    pub sizes: HashMap<Priority, usize>,
    /// Lifetime counters.
    pub stats: QueueStats,
    /// Whether a background worker is currently running.
    pub processing: bool,
}

struct QueueState {
    sequences: HashMap<Priority, VecDeque<QueuedRequestEntry>>,
    stats: QueueStats,
    next_counter: u64,
}

impl QueueState {
    fn live_count(&self) -> usize {
        self.sequences.values().map(VecDeque::len).sum()
    }
}

/// Accepts deferred requests, serializes them under quota via a single
/// background worker, retries transient failures, and surfaces terminal
/// outcomes through a `oneshot` channel per request.
pub struct PriorityQueueManager {
    clock: Arc<dyn Clock>,
    gate: Arc<AdmissionGate>,
    tracker: Arc<RateLimitTracker>,
    counter: Arc<TokenCounter>,
    capacity: usize,
    state: Mutex<QueueState>,
    worker: RwLock<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl std::fmt::Debug for PriorityQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueueManager").finish_non_exhaustive()
    }
}

impl PriorityQueueManager {
    /// Construct a queue manager with a hard cap on live items.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `capacity` is zero.
    pub fn new(
        clock: Arc<dyn Clock>,
        gate: Arc<AdmissionGate>,
        tracker: Arc<RateLimitTracker>,
        counter: Arc<TokenCounter>,
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Validation("capacity must be greater than zero".to_string()));
        }
        Ok(Self {
            clock,
            gate,
            tracker,
            counter,
            capacity,
            state: Mutex::new(QueueState {
                sequences: HashMap::new(),
                stats: QueueStats::default(),
                next_counter: 0,
            }),
            worker: RwLock::new(None),
        })
    }

    /// Enqueue `callable` for dispatch under `model`/`payload` at `priority`.
    /// Returns the request's opaque id and a receiver for its terminal
    /// outcome. Rejects with `Error::QueueFull` without any side effect if
    /// the queue is already at capacity.
    pub async fn enqueue(
        &self,
        priority: Priority,
        model: impl Into<String>,
        payload: Payload,
        max_retries: u32,
        callable: Box<dyn QueuedCallable>,
    ) -> Result<(String, oneshot::Receiver<Result<RawResponse>>)> {
        let mut state = self.state.lock().await;
        let live = state.live_count();
        if live >= self.capacity {
            return Err(Error::QueueFull {
                size: live,
                max: self.capacity,
            });
        }

        let id = format!("req_{}_{}", self.clock.now().timestamp(), state.next_counter);
        state.next_counter += 1;

        let (result_tx, result_rx) = oneshot::channel();
        let entry = QueuedRequestEntry {
            id: id.clone(),
            priority,
            original_priority: priority,
            enqueued_at: self.clock.now(),
            retry_count: 0,
            max_retries,
            model: model.into(),
            payload,
            callable,
            result_tx: Some(result_tx),
        };
        state.sequences.entry(priority).or_default().push_back(entry);
        state.stats.total_queued += 1;

        Ok((id, result_rx))
    }

    /// Start the background worker if it isn't already running.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.write().await;
        if worker.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    debug!("queue worker stopping, no new item will be pulled");
                    return;
                }
                let found_work = this.tick(false).await;
                if shutdown_rx.has_changed().unwrap_or(false) && *shutdown_rx.borrow_and_update() {
                    return;
                }
                if !found_work {
                    this.clock.sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        });
        *worker = Some((shutdown_tx, handle));
    }

    /// Flip the stop flag. Any in-flight callable completes; no new item is
    /// pulled afterward. Pending items remain queryable and are not
    /// cancelled.
    pub async fn stop(&self) {
        let mut worker = self.worker.write().await;
        if let Some((tx, handle)) = worker.take() {
            let _ = tx.send(true);
            let _ = handle.await;
        }
    }

    /// Drain the queue on the calling thread until empty, applying the
    /// sync-path exponential backoff (`2^attempt` seconds, 2-attempt floor)
    /// between a failed attempt and its retry. Blocks the caller; does not
    /// spawn or touch the async background worker.
    pub async fn process_queue_blocking(&self) -> Result<()> {
        loop {
            let has_pending = {
                let state = self.state.lock().await;
                state.live_count() > 0
            };
            if !has_pending {
                return Ok(());
            }
            self.tick(true).await;
        }
    }

    /// One scheduling step: find the highest-priority non-empty queue,
    /// evaluate admission for its head, and act on the verdict. Performs at
    /// most one dispatch or one idle wait per call. Returns whether any
    /// queue had an item to act on, so the caller can back off when idle.
    async fn tick(&self, sync_backoff: bool) -> bool {
        for &priority in &PRIORITY_ORDER {
            let head = {
                let state = self.state.lock().await;
                state
                    .sequences
                    .get(&priority)
                    .and_then(VecDeque::front)
                    .map(|entry| (entry.model.clone(), entry.payload.clone()))
            };
            let Some((model, payload)) = head else {
                continue;
            };

            match self.gate.evaluate(&model, &payload).await {
                AdmissionVerdict::Go => {
                    let entry = {
                        let mut state = self.state.lock().await;
                        state.sequences.get_mut(&priority).and_then(VecDeque::pop_front)
                    };
                    if let Some(entry) = entry {
                        self.dispatch(entry, sync_backoff).await;
                    }
                }
                AdmissionVerdict::Wait(delta) => {
                    let bounded = delta.min(WAIT_HARD_CAP);
                    debug!(?priority, ?bounded, "admission gate says wait");
                    // Position-preserving: the head stays at the front of its
                    // own queue, we just idle before re-evaluating it.
                    self.clock.sleep(bounded).await;
                }
                AdmissionVerdict::Reject(err) => {
                    let entry = {
                        let mut state = self.state.lock().await;
                        state.sequences.get_mut(&priority).and_then(VecDeque::pop_front)
                    };
                    if let Some(mut entry) = entry {
                        if let Some(tx) = entry.result_tx.take() {
                            let _ = tx.send(Err(err));
                        }
                    }
                }
            }
            return true;
        }
        false
    }

    /// Invoke the callable with no locks held, then ingest headers, record
    /// usage, and apply retry policy on failure.
    async fn dispatch(&self, mut entry: QueuedRequestEntry, sync_backoff: bool) {
        let outcome = entry.callable.call().await;
        match outcome {
            Ok(response) => {
                if let Err(e) = self.tracker.ingest_headers(&response.headers).await {
                    warn!(error = %e, "header ingestion failed after a successful dispatch");
                }
                let tokens = match &entry.payload {
                    Payload::Chat { messages, .. } => self
                        .counter
                        .count_messages(messages, &entry.model)
                        .await
                        .unwrap_or(0),
                    Payload::Transcription { .. } => 0,
                };
                let message_count = match &entry.payload {
                    Payload::Chat { messages, .. } => messages.len(),
                    Payload::Transcription { .. } => 1,
                };
                self.counter
                    .record_usage(entry.model.clone(), tokens, Some(entry.id.clone()), message_count)
                    .await;

                self.state.lock().await.stats.total_processed += 1;
                if let Some(tx) = entry.result_tx.take() {
                    let _ = tx.send(Ok(response));
                }
            }
            Err(err) => {
                self.state.lock().await.stats.total_failed += 1;
                entry.retry_count += 1;

                if err.is_retryable() && entry.retry_count <= entry.max_retries {
                    if sync_backoff {
                        let backoff_secs = 2u64.pow(entry.retry_count.max(1));
                        self.clock.sleep(Duration::from_secs(backoff_secs)).await;
                    }
                    self.state.lock().await.stats.total_retries += 1;
                    entry.priority = entry.original_priority;
                    let original_priority = entry.original_priority;
                    self.state
                        .lock()
                        .await
                        .sequences
                        .entry(original_priority)
                        .or_default()
                        .push_back(entry);
                } else if let Some(tx) = entry.result_tx.take() {
                    if err.is_retryable() {
                        let _ = tx.send(Err(Error::RetryExhausted {
                            retries: entry.retry_count,
                            cause: Box::new(err),
                        }));
                    } else {
                        let _ = tx.send(Err(err));
                    }
                }
            }
        }
    }

    /// Queue depth per priority, lifetime counters, and whether a worker is
    /// currently running.
    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        let mut sizes = HashMap::new();
        for &priority in &PRIORITY_ORDER {
            sizes.insert(priority, state.sequences.get(&priority).map(VecDeque::len).unwrap_or(0));
        }
        QueueStatus {
            sizes,
            stats: state.stats.clone(),
            processing: self.worker.read().await.is_some(),
        }
    }

    /// Drop pending items from one priority, or all of them if `None`.
    /// Returns the number of items dropped. Does not touch lifetime
    /// counters other than the sizes they implicitly report.
    pub async fn clear(&self, priority: Option<Priority>) -> usize {
        let mut state = self.state.lock().await;
        match priority {
            Some(p) => state.sequences.remove(&p).map(|q| q.len()).unwrap_or(0),
            None => {
                let total = state.live_count();
                state.sequences.clear();
                total
            }
        }
    }
}
