//! Client configuration.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::mask_api_key;

/// STT plan tier, each with its own upload size cap (§6 Configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// 25 MiB cap.
    Free,
    /// 100 MiB cap.
    Developer,
}

impl Plan {
    /// Maximum accepted upload size for this plan, in bytes.
    #[must_use]
    pub fn max_file_size_bytes(&self) -> u64 {
        match self {
            Plan::Free => 25 * 1024 * 1024,
            Plan::Developer => 100 * 1024 * 1024,
        }
    }
}

/// Default model-catalog cache interval (one hour, §4.2 "Caching").
const DEFAULT_CACHE_INTERVAL: Duration = Duration::from_secs(3600);

/// Transport timeout for JSON calls (§5 "Cancellation and timeouts").
const JSON_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport timeout for multipart calls (§5 "Cancellation and timeouts").
const MULTIPART_TIMEOUT: Duration = Duration::from_secs(60);

/// Default queue hard cap.
const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Client-wide configuration: credential, endpoint, STT plan, and scheduling knobs.
#[derive(Clone)]
pub struct ClientConfig {
    /// Bearer credential sent as `Authorization: Bearer <key>`. Required, non-empty.
    pub credential: String,
    /// Base URL, trailing slash stripped. Required.
    pub base_url: String,
    /// STT plan tier, determines the upload size cap.
    pub plan: Plan,
    /// Hard cap on live queued requests. Must be greater than zero.
    pub queue_capacity: usize,
    /// How long a populated model catalog stays fresh before a refresh is needed.
    pub cache_interval: Duration,
    /// Per-call timeout for JSON requests.
    pub json_timeout: Duration,
    /// Per-call timeout for multipart requests.
    pub multipart_timeout: Duration,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("credential", &mask_api_key(&self.credential))
            .field("base_url", &self.base_url)
            .field("plan", &self.plan)
            .field("queue_capacity", &self.queue_capacity)
            .field("cache_interval", &self.cache_interval)
            .field("json_timeout", &self.json_timeout)
            .field("multipart_timeout", &self.multipart_timeout)
            .finish()
    }
}

impl ClientConfig {
    /// Construct a configuration with the given credential and base URL,
    /// defaulting the remaining fields.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `credential` is empty or `base_url` is empty.
    pub fn new(credential: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let credential = credential.into();
        if credential.is_empty() {
            return Err(Error::Validation("credential must not be empty".to_string()));
        }
        let base_url = base_url.into();
        if base_url.is_empty() {
            return Err(Error::Validation("base_url must not be empty".to_string()));
        }
        Ok(Self {
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            plan: Plan::Free,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cache_interval: DEFAULT_CACHE_INTERVAL,
            json_timeout: JSON_TIMEOUT,
            multipart_timeout: MULTIPART_TIMEOUT,
        })
    }

    /// Build configuration from `SERVICE_API_KEY` / `SERVICE_BASE_URL` environment
    /// variables, falling back to the production default base URL.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `SERVICE_API_KEY` is unset or empty.
    pub fn from_env() -> Result<Self> {
        let credential = std::env::var("SERVICE_API_KEY").map_err(|_| {
            Error::Validation("SERVICE_API_KEY environment variable is not set".to_string())
        })?;
        let base_url = std::env::var("SERVICE_BASE_URL")
            .unwrap_or_else(|_| "https://api.example.com".to_string());
        Self::new(credential, base_url)
    }

    /// Set the STT plan tier.
    #[must_use]
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }

    /// Set the queue hard cap.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if `capacity` is zero.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Validation("queue_capacity must be greater than zero".to_string()));
        }
        self.queue_capacity = capacity;
        Ok(self)
    }

    /// Set the model-catalog cache interval.
    #[must_use]
    pub fn with_cache_interval(mut self, interval: Duration) -> Self {
        self.cache_interval = interval;
        self
    }
}
