//! RateLimitTracker: a pure state machine over three server-reported quota
//! windows (requests, tokens, audio-seconds).

mod headers;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::transport::HeaderBag;

/// Default wait when no window has a pending reset (§4.1 "Wait policy").
const DEFAULT_WAIT: Duration = Duration::from_secs(60);

/// Hard cap past which `wait_if_needed` refuses to sleep (§4.1 "Wait policy").
const WAIT_HARD_CAP: Duration = Duration::from_secs(300);

/// Refresh thresholds (§4.1 "Refresh policy").
const REQUESTS_REFRESH_THRESHOLD: chrono::Duration = chrono::Duration::seconds(30);
const TOKENS_REFRESH_THRESHOLD: chrono::Duration = chrono::Duration::seconds(60);
const STALE_INGESTION_THRESHOLD: chrono::Duration = chrono::Duration::minutes(10);

/// An integer budget with a reset deadline. `limit == 0` means "limit
/// unknown" and is treated as permissive by `can_proceed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaWindow {
    /// Total budget for the current window.
    pub limit: u64,
    /// Remaining budget for the current window.
    pub remaining: u64,
    /// When this window resets, if known.
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaWindow {
    /// If `reset_at` has passed, restore `remaining` to `limit` and clear it.
    fn lazy_reset(&mut self, now: DateTime<Utc>) {
        if let Some(reset_at) = self.reset_at {
            if now >= reset_at {
                self.remaining = self.limit;
                self.reset_at = None;
            }
        }
    }

    fn has_capacity(&self, requested: u64) -> bool {
        self.limit == 0 || self.remaining >= requested
    }

    /// Percentage of this window's budget currently consumed, rounded to one
    /// decimal place. `0.0` when the limit is unknown (`limit == 0`).
    #[must_use]
    pub fn usage_pct(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        let used = self.limit.saturating_sub(self.remaining) as f64;
        (used / self.limit as f64 * 100.0 * 10.0).round() / 10.0
    }
}

/// A consistent view of all three quota windows plus the last ingestion time.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSnapshot {
    /// Requests-per-window budget.
    pub requests: QuotaWindow,
    /// Tokens-per-window budget.
    pub tokens: QuotaWindow,
    /// Audio-seconds-per-window budget (transcription only).
    pub audio_seconds: QuotaWindow,
    /// When headers were last ingested.
    pub last_update_at: Option<DateTime<Utc>>,
}

impl RateLimitSnapshot {
    /// Percentage of the requests window consumed; see [`QuotaWindow::usage_pct`].
    #[must_use]
    pub fn requests_usage_pct(&self) -> f64 {
        self.requests.usage_pct()
    }

    /// Percentage of the tokens window consumed; see [`QuotaWindow::usage_pct`].
    #[must_use]
    pub fn tokens_usage_pct(&self) -> f64 {
        self.tokens.usage_pct()
    }
}

type ChangeHook = dyn Fn(u64, u64, u64, u64) + Send + Sync;

/// Tracks the three quota windows and answers admission questions about them.
pub struct RateLimitTracker {
    clock: Arc<dyn Clock>,
    snapshot: RwLock<RateLimitSnapshot>,
    on_limit_change: RwLock<Option<Arc<ChangeHook>>>,
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker").finish_non_exhaustive()
    }
}

impl RateLimitTracker {
    /// Construct a tracker with no quota information yet ingested.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            snapshot: RwLock::new(RateLimitSnapshot::default()),
            on_limit_change: RwLock::new(None),
        }
    }

    /// Register the change-detection callback. Fires with
    /// `(old_requests_limit, new_requests_limit, old_tokens_limit, new_tokens_limit)`
    /// whenever an ingestion changes either limit.
    pub async fn set_on_limit_change<F>(&self, hook: F)
    where
        F: Fn(u64, u64, u64, u64) + Send + Sync + 'static,
    {
        *self.on_limit_change.write().await = Some(Arc::new(hook));
    }

    /// Consume a case-insensitive header bag from a response. Values that
    /// fail to parse are an ingestion error; partial success is not applied.
    pub async fn ingest_headers(&self, bag: &HeaderBag) -> Result<()> {
        let now = self.clock.now();
        let requests = headers::parse_window(bag, "requests", now)?;
        let tokens = headers::parse_window(bag, "tokens", now)?;
        let audio_seconds = headers::parse_window(bag, "audio-seconds", now)?;

        let (old_requests_limit, old_tokens_limit, new_requests_limit, new_tokens_limit) = {
            let mut snapshot = self.snapshot.write().await;
            let old_requests_limit = snapshot.requests.limit;
            let old_tokens_limit = snapshot.tokens.limit;

            apply(&mut snapshot.requests, requests);
            apply(&mut snapshot.tokens, tokens);
            apply(&mut snapshot.audio_seconds, audio_seconds);
            snapshot.last_update_at = Some(now);

            (
                old_requests_limit,
                old_tokens_limit,
                snapshot.requests.limit,
                snapshot.tokens.limit,
            )
        };

        // A limit of 0 means "never ingested"; the first ingestion that
        // establishes a limit is not itself a change, only a baseline.
        let requests_changed = old_requests_limit != 0 && old_requests_limit != new_requests_limit;
        let tokens_changed = old_tokens_limit != 0 && old_tokens_limit != new_tokens_limit;
        if requests_changed || tokens_changed {
            if let Some(hook) = self.on_limit_change.read().await.clone() {
                hook(old_requests_limit, new_requests_limit, old_tokens_limit, new_tokens_limit);
            }
        }

        Ok(())
    }

    /// Whether `requests`/`tokens`/`audio_seconds` may proceed right now.
    /// Negative amounts are a precondition violation.
    pub async fn can_proceed(&self, requests: i64, tokens: i64, audio_seconds: i64) -> Result<bool> {
        if requests < 0 || tokens < 0 || audio_seconds < 0 {
            return Err(Error::Validation(
                "requested amounts must not be negative".to_string(),
            ));
        }
        let now = self.clock.now();
        let mut snapshot = self.snapshot.write().await;
        snapshot.requests.lazy_reset(now);
        snapshot.tokens.lazy_reset(now);
        snapshot.audio_seconds.lazy_reset(now);

        Ok(snapshot.requests.has_capacity(requests as u64)
            && snapshot.tokens.has_capacity(tokens as u64)
            && snapshot.audio_seconds.has_capacity(audio_seconds as u64))
    }

    /// Compute the maximum of (reset_at - now) across all three windows
    /// under the lock, without sleeping. Used both by `wait_if_needed` and
    /// by the `AdmissionGate`, which needs the would-be wait without
    /// actually suspending the caller.
    pub async fn compute_wait(&self) -> Result<Duration> {
        let wait = {
            let now = self.clock.now();
            let snapshot = self.snapshot.read().await;
            [
                snapshot.requests.reset_at,
                snapshot.tokens.reset_at,
                snapshot.audio_seconds.reset_at,
            ]
            .into_iter()
            .flatten()
            .filter_map(|reset_at| (reset_at - now).to_std().ok())
            .max()
            .unwrap_or(DEFAULT_WAIT)
        };

        if wait > WAIT_HARD_CAP {
            warn!(?wait, "rate limit wait exceeds hard cap, refusing to sleep");
            return Err(Error::RateLimitExceeded { wait });
        }
        Ok(wait)
    }

    /// Compute the wait, release the lock, then sleep for it. Returns the
    /// duration actually waited, or `Error::RateLimitExceeded` without
    /// sleeping if the computed wait exceeds the hard cap.
    pub async fn wait_if_needed(&self) -> Result<Duration> {
        let wait = self.compute_wait().await?;

        debug!(?wait, "sleeping for rate limit window");
        self.clock.sleep(wait).await;

        let now = self.clock.now();
        let mut snapshot = self.snapshot.write().await;
        snapshot.requests.lazy_reset(now);
        snapshot.tokens.lazy_reset(now);
        snapshot.audio_seconds.lazy_reset(now);

        Ok(wait)
    }

    /// True when no header has ever been ingested, any window's reset is
    /// imminent, or the last ingestion is stale.
    pub async fn needs_refresh(&self) -> bool {
        let now = self.clock.now();
        let snapshot = self.snapshot.read().await;

        let Some(last_update_at) = snapshot.last_update_at else {
            return true;
        };

        if let Some(reset_at) = snapshot.requests.reset_at {
            if reset_at - now <= REQUESTS_REFRESH_THRESHOLD {
                return true;
            }
        }
        if let Some(reset_at) = snapshot.tokens.reset_at {
            if reset_at - now <= TOKENS_REFRESH_THRESHOLD {
                return true;
            }
        }

        now - last_update_at > STALE_INGESTION_THRESHOLD
    }

    /// Read-only snapshot of the current windows, for telemetry.
    pub async fn snapshot(&self) -> RateLimitSnapshot {
        self.snapshot.read().await.clone()
    }
}

fn apply(window: &mut QuotaWindow, partial: headers::PartialWindow) {
    if let Some(limit) = partial.limit {
        window.limit = limit;
    }
    if let Some(remaining) = partial.remaining {
        window.remaining = remaining;
    }
    if let Some(reset_at) = partial.reset_at {
        window.reset_at = Some(reset_at);
    }
}
