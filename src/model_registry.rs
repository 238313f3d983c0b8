//! ModelRegistry: a lazily-refreshed catalog of model ids, their kind, and
//! their numeric limits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Which operation a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Chat completion.
    Chat,
    /// Speech-to-text transcription.
    Stt,
}

/// One catalog entry. Replaced atomically on every successful refresh.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// The model id as reported by the service.
    pub id: String,
    /// Chat or STT.
    pub kind: ModelKind,
    /// Context window, in tokens. Semantically unused for STT models.
    pub context_window: Option<u32>,
    /// Maximum completion tokens. Semantically unused for STT models.
    pub max_completion_tokens: Option<u32>,
    /// Organization that owns the model.
    pub owned_by: String,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    data: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    owned_by: String,
    #[allow(dead_code)]
    created: Option<i64>,
    #[serde(default)]
    active: bool,
    context_window: Option<u32>,
    max_completion_tokens: Option<u32>,
}

/// A total/chat/stt count plus cache age, for telemetry.
#[derive(Debug, Clone)]
pub struct RegistrySummary {
    /// Total active models in the catalog.
    pub total: usize,
    /// Chat-kind models.
    pub chat: usize,
    /// STT-kind models.
    pub stt: usize,
    /// How long ago the catalog was last populated, if ever.
    pub cache_age: Option<chrono::Duration>,
}

/// Lazily-refreshed, atomically-swapped model catalog.
pub struct ModelRegistry {
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    catalog_endpoint: String,
    fetch_interval: std::time::Duration,
    table: RwLock<HashMap<String, ModelDescriptor>>,
    populated_at: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry").finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Construct a registry that will fetch `catalog_endpoint` no more than
    /// once per `fetch_interval`.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        catalog_endpoint: impl Into<String>,
        fetch_interval: std::time::Duration,
    ) -> Self {
        Self {
            clock,
            transport,
            catalog_endpoint: catalog_endpoint.into(),
            fetch_interval,
            table: RwLock::new(HashMap::new()),
            populated_at: RwLock::new(None),
        }
    }

    /// Populate the catalog if it has never been populated or
    /// `fetch_interval` has elapsed since the last population. A failed
    /// fetch leaves the prior table in place.
    pub async fn populate(&self) -> Result<()> {
        if let Some(last) = *self.populated_at.read().await {
            if (self.clock.now() - last).to_std().unwrap_or_default() < self.fetch_interval {
                return Ok(());
            }
        }
        self.force_refresh().await
    }

    /// Clear the cache stamp and refetch unconditionally. Failures leave the
    /// prior table (and stamp) in place.
    pub async fn force_refresh(&self) -> Result<()> {
        let response = self
            .transport
            .post_json(&self.catalog_endpoint, serde_json::Value::Null)
            .await?;

        let catalog: CatalogResponse = serde_json::from_value(response.body)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let mut table = HashMap::new();
        for entry in catalog.data {
            if !entry.active {
                continue;
            }
            let kind = if entry.id.to_lowercase().contains("whisper") {
                ModelKind::Stt
            } else {
                ModelKind::Chat
            };
            table.insert(
                entry.id.clone(),
                ModelDescriptor {
                    id: entry.id,
                    kind,
                    context_window: entry.context_window,
                    max_completion_tokens: entry.max_completion_tokens,
                    owned_by: entry.owned_by,
                },
            );
        }

        debug!(count = table.len(), "model registry refreshed");

        // Build the new table off-lock, then install it atomically: readers
        // never observe a half-swapped view.
        *self.table.write().await = table;
        *self.populated_at.write().await = Some(self.clock.now());
        Ok(())
    }

    fn invalid_model(id: &str, reason: &str) -> Error {
        Error::InvalidModel {
            model: id.to_string(),
            reason: reason.to_string(),
        }
    }

    fn check_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::Validation("model id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Full descriptor for `id`, or `invalid-model` if unknown.
    pub async fn info(&self, id: &str) -> Result<ModelDescriptor> {
        Self::check_id(id)?;
        self.table
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Self::invalid_model(id, "not found"))
    }

    /// The kind of `id`, or `invalid-model` if unknown.
    pub async fn kind(&self, id: &str) -> Result<ModelKind> {
        Ok(self.info(id).await?.kind)
    }

    /// Whether `id` is a known, active model.
    pub async fn is_supported(&self, id: &str) -> bool {
        if Self::check_id(id).is_err() {
            return false;
        }
        self.table.read().await.contains_key(id)
    }

    /// List all models, optionally filtered by kind.
    pub async fn list(&self, kind: Option<ModelKind>) -> Vec<ModelDescriptor> {
        self.table
            .read()
            .await
            .values()
            .filter(|m| kind.is_none_or(|k| m.kind == k))
            .cloned()
            .collect()
    }

    /// `id`'s context window, or `invalid-model` if unknown.
    pub async fn context_window(&self, id: &str) -> Result<Option<u32>> {
        Ok(self.info(id).await?.context_window)
    }

    /// `id`'s max completion tokens, or `invalid-model` if unknown.
    pub async fn max_completion_tokens(&self, id: &str) -> Result<Option<u32>> {
        Ok(self.info(id).await?.max_completion_tokens)
    }

    /// Count-by-kind plus cache age, for telemetry.
    pub async fn summary(&self) -> RegistrySummary {
        let table = self.table.read().await;
        let chat = table.values().filter(|m| m.kind == ModelKind::Chat).count();
        let stt = table.values().filter(|m| m.kind == ModelKind::Stt).count();
        let cache_age = self
            .populated_at
            .read()
            .await
            .map(|ts| self.clock.now() - ts);
        RegistrySummary {
            total: table.len(),
            chat,
            stt,
            cache_age,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::transport::{EventStream, FilePart, HeaderBag, RawResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn post_json(&self, _endpoint: &str, _payload: serde_json::Value) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawResponse {
                body: serde_json::json!({
                    "data": [
                        {"id": "gpt-mega", "owned_by": "acme", "created": 0, "active": true, "context_window": 128000, "max_completion_tokens": 4096},
                        {"id": "whisper-large", "owned_by": "acme", "created": 0, "active": true, "context_window": null, "max_completion_tokens": null},
                        {"id": "gpt-retired", "owned_by": "acme", "created": 0, "active": false, "context_window": 8000, "max_completion_tokens": 1000}
                    ]
                }),
                headers: HeaderBag::new(),
            })
        }

        async fn post_multipart(
            &self,
            _endpoint: &str,
            _fields: Vec<(String, String)>,
            _files: Vec<FilePart>,
        ) -> Result<RawResponse> {
            unimplemented!()
        }

        async fn post_stream(&self, _endpoint: &str, _payload: serde_json::Value) -> Result<EventStream> {
            unimplemented!()
        }
    }

    fn registry(interval: std::time::Duration) -> (ModelRegistry, Arc<FakeTransport>, Arc<MockClock>) {
        let transport = Arc::new(FakeTransport { calls: AtomicUsize::new(0) });
        let clock = Arc::new(MockClock::default());
        let registry = ModelRegistry::new(clock.clone(), transport.clone(), "/models", interval);
        (registry, transport, clock)
    }

    #[tokio::test]
    async fn populate_classifies_by_whisper_substring_and_drops_inactive() {
        let (registry, _transport, _clock) = registry(std::time::Duration::from_secs(3600));
        registry.populate().await.unwrap();

        assert_eq!(registry.kind("gpt-mega").await.unwrap(), ModelKind::Chat);
        assert_eq!(registry.kind("whisper-large").await.unwrap(), ModelKind::Stt);
        assert!(!registry.is_supported("gpt-retired").await);
    }

    #[tokio::test]
    async fn populate_is_a_no_op_within_fetch_interval() {
        let (registry, transport, clock) = registry(std::time::Duration::from_secs(3600));
        registry.populate().await.unwrap();
        clock.advance(std::time::Duration::from_secs(10));
        registry.populate().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_always_refetches() {
        let (registry, transport, _clock) = registry(std::time::Duration::from_secs(3600));
        registry.populate().await.unwrap();
        registry.force_refresh().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_id_is_invalid_model() {
        let (registry, _transport, _clock) = registry(std::time::Duration::from_secs(3600));
        registry.populate().await.unwrap();
        assert!(matches!(registry.info("nonexistent").await, Err(Error::InvalidModel { .. })));
    }

    #[tokio::test]
    async fn empty_id_is_validation_error() {
        let (registry, _transport, _clock) = registry(std::time::Duration::from_secs(3600));
        assert!(matches!(registry.info("").await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn summary_counts_by_kind() {
        let (registry, _transport, _clock) = registry(std::time::Duration::from_secs(3600));
        registry.populate().await.unwrap();
        let summary = registry.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.chat, 1);
        assert_eq!(summary.stt, 1);
        assert!(summary.cache_age.is_some());
    }
}
