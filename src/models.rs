//! Model discovery for the listing endpoints.
//!
//! [`ModelDirectory`] caches each backend's model list by base URL. A fresh
//! entry is served without touching the network; a stale one is served while
//! a single background task refreshes it. Misses are fetched with retries and
//! never fail: when the backend can't be listed, a synthetic single-model
//! list is returned instead (and not cached).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::client::{DiscoveredModel, ProviderClient};
use crate::config::ModelCacheConfig;
use crate::error::Result;
use crate::providers::Dialect;
use crate::translate::ollama_types::{OllamaTag, OllamaTagDetails, OllamaTagList};

const DEFAULT_ARCH: &str = "transformer";
const DEFAULT_QUANTIZATION: &str = "unknown";
const DEFAULT_STATE: &str = "loaded";
const DEFAULT_CONTEXT_LENGTH: u64 = 4096;

/// A model entry with every metadata field filled in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRecord {
    pub id: String,
    pub object: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub publisher: String,
    pub arch: String,
    pub compatibility_type: String,
    pub quantization: String,
    pub state: String,
    pub max_context_length: u64,
    pub created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ModelRecord {
    /// Fill the gaps in a backend-reported model with fixed defaults.
    pub fn normalize(model: DiscoveredModel, dialect: Dialect, now: u64) -> Self {
        Self {
            id: model.id,
            object: "model".to_string(),
            model_type: "llm".to_string(),
            publisher: model
                .owned_by
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| dialect.publisher().to_string()),
            arch: model.family.unwrap_or_else(|| DEFAULT_ARCH.to_string()),
            compatibility_type: compatibility_type(dialect).to_string(),
            quantization: model
                .quantization
                .unwrap_or_else(|| DEFAULT_QUANTIZATION.to_string()),
            state: DEFAULT_STATE.to_string(),
            max_context_length: DEFAULT_CONTEXT_LENGTH,
            created: model.created.unwrap_or(now),
            size: model.size,
            modified_at: model.modified_at,
            digest: model.digest,
        }
    }

    /// Stand-in entry reported when the backend can't be listed.
    pub fn fallback(id: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            object: "model".to_string(),
            model_type: "llm".to_string(),
            publisher: "dialect-proxy".to_string(),
            arch: DEFAULT_ARCH.to_string(),
            compatibility_type: "openai".to_string(),
            quantization: "fp16".to_string(),
            state: DEFAULT_STATE.to_string(),
            max_context_length: DEFAULT_CONTEXT_LENGTH,
            created: now,
            size: None,
            modified_at: None,
            digest: None,
        }
    }

    fn to_tag(&self) -> OllamaTag {
        let modified_at = self.modified_at.clone().unwrap_or_else(|| {
            DateTime::<Utc>::from_timestamp(i64::try_from(self.created).unwrap_or(0), 0)
                .unwrap_or_default()
                .to_rfc3339()
        });
        OllamaTag {
            name: self.id.clone(),
            model: self.id.clone(),
            modified_at,
            size: self.size.unwrap_or(0),
            digest: self.digest.clone().unwrap_or_default(),
            details: Some(OllamaTagDetails {
                format: self.compatibility_type.clone(),
                family: self.arch.clone(),
                parameter_size: String::new(),
                quantization_level: self.quantization.clone(),
            }),
        }
    }
}

fn compatibility_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::OpenAi | Dialect::OpenWebUi => "openai",
        Dialect::Ollama => "gguf",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelRecord>,
}

impl ModelList {
    pub fn new(data: Vec<ModelRecord>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }

    /// Shape for Ollama's `GET /api/tags`.
    pub fn to_tags(&self) -> OllamaTagList {
        OllamaTagList {
            models: self.data.iter().map(ModelRecord::to_tag).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedModels {
    list: ModelList,
    fetched_at: Instant,
}

/// TTL cache of model lists keyed by backend base URL.
#[derive(Debug)]
pub struct ModelDirectory {
    entries: DashMap<String, CachedModels>,
    refreshing: DashMap<String, ()>,
    ttl: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl ModelDirectory {
    pub fn new(config: &ModelCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            refreshing: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        }
    }

    /// Model list for `provider`'s backend. Never fails: see the module docs.
    pub async fn fetch_models(
        self: &Arc<Self>,
        provider: Arc<dyn ProviderClient>,
        fallback_id: &str,
    ) -> ModelList {
        let key = provider.base_url().to_string();

        let cached = self.entries.get(&key).map(|entry| entry.value().clone());
        if let Some(cached) = cached {
            if cached.fetched_at.elapsed() < self.ttl {
                tracing::debug!(url = %key, "Serving cached model list");
                return cached.list;
            }
            self.spawn_refresh(key, provider);
            return cached.list;
        }

        match self.fetch_with_retry(provider.as_ref()).await {
            Ok(list) => {
                self.store(&key, list.clone());
                list
            }
            Err(e) => {
                tracing::warn!(url = %key, error = %e, fallback = %fallback_id, "Model listing failed, serving fallback");
                ModelList::new(vec![ModelRecord::fallback(fallback_id, unix_now())])
            }
        }
    }

    /// Drop every cached list.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refresh a stale entry in the background, at most one task per key.
    fn spawn_refresh(self: &Arc<Self>, key: String, provider: Arc<dyn ProviderClient>) {
        if self.refreshing.insert(key.clone(), ()).is_some() {
            return;
        }

        let directory = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(url = %key, "Refreshing stale model list");
            match directory.fetch_with_retry(provider.as_ref()).await {
                Ok(list) => directory.store(&key, list),
                Err(e) => {
                    tracing::warn!(url = %key, error = %e, "Background model refresh failed, keeping stale list");
                }
            }
            directory.refreshing.remove(&key);
        });
    }

    fn store(&self, key: &str, list: ModelList) {
        self.entries.insert(
            key.to_string(),
            CachedModels {
                list,
                fetched_at: Instant::now(),
            },
        );
    }

    async fn fetch_with_retry(&self, provider: &dyn ProviderClient) -> Result<ModelList> {
        let mut attempt = 1;
        loop {
            match provider.list_models().await {
                Ok(models) => {
                    let now = unix_now();
                    let dialect = provider.dialect();
                    let data = models
                        .into_iter()
                        .map(|m| ModelRecord::normalize(m, dialect, now))
                        .collect();
                    return Ok(ModelList::new(data));
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.initial_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        url = %provider.base_url(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Model listing failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}
