//! Cached inventory of the backend's models.
//!
//! The registry holds an immutable snapshot that is swapped wholesale on
//! refresh. Concurrent callers that find the snapshot stale share a single
//! in-flight refresh instead of each hitting the backend.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::openai::ModelObject;

/// What a model can be used for, as reported in `/api/show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Completion,
    Tools,
    Insert,
    Embedding,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Completion => "completion",
            Capability::Tools => "tools",
            Capability::Insert => "insert",
            Capability::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completion" | "chat" => Some(Capability::Completion),
            "tools" | "tool_use" | "function_calling" => Some(Capability::Tools),
            "insert" | "fim" => Some(Capability::Insert),
            "embedding" | "embeddings" => Some(Capability::Embedding),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: String,
    pub backend_id: String,
    pub size_bytes: Option<i64>,
    pub modified_at: Option<DateTime<Utc>>,
    pub capabilities: BTreeSet<Capability>,
}

impl ModelEntry {
    pub fn from_backend(model: ModelObject) -> Self {
        let reported: BTreeSet<Capability> = model
            .capabilities
            .iter()
            .flatten()
            .filter_map(|c| Capability::parse(c))
            .collect();
        let capabilities = if reported.is_empty() {
            infer_capabilities(&model.id)
        } else {
            reported
        };

        Self {
            name: model.id.clone(),
            modified_at: model.created.and_then(|s| DateTime::from_timestamp(s, 0)),
            size_bytes: model.size,
            backend_id: model.id,
            capabilities,
        }
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|c| c.as_str().to_string())
            .collect()
    }
}

// Substring -> extra capabilities. Matched against the lowercased model id.
const TOOL_FAMILIES: &[&str] = &[
    "llama3.1",
    "llama-3.1",
    "llama3.2",
    "llama-3.2",
    "llama3.3",
    "llama-3.3",
    "qwen2.5",
    "qwen3",
    "mistral",
    "mixtral",
    "gpt-",
    "claude",
    "gemini",
    "command-r",
    "hermes",
    "granite3",
    "firefunction",
];

const INSERT_FAMILIES: &[&str] = &["coder", "code", "starcoder", "codellama", "deepseek-coder"];

const EMBEDDING_FAMILIES: &[&str] = &["embed", "bge-", "e5-", "minilm"];

/// Guess capabilities from a model name.
///
/// Best-effort only: names are not a contract, and a backend that reports
/// capabilities itself always takes precedence over this table.
pub fn infer_capabilities(name: &str) -> BTreeSet<Capability> {
    let lower = name.to_ascii_lowercase();
    let matches = |table: &[&str]| table.iter().any(|needle| lower.contains(needle));

    if matches(EMBEDDING_FAMILIES) {
        return BTreeSet::from([Capability::Embedding]);
    }

    let mut caps = BTreeSet::from([Capability::Completion]);
    if matches(TOOL_FAMILIES) {
        caps.insert(Capability::Tools);
    }
    if matches(INSERT_FAMILIES) {
        caps.insert(Capability::Insert);
    }
    caps
}

/// Where the registry gets its inventory from.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn fetch_models(&self) -> ProxyResult<Vec<ModelEntry>>;
}

#[derive(Debug)]
struct Snapshot {
    entries: Arc<Vec<ModelEntry>>,
    refreshed_at: Instant,
}

const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

type Refresh = Shared<BoxFuture<'static, ProxyResult<Arc<Vec<ModelEntry>>>>>;

struct Inner {
    source: Arc<dyn ModelSource>,
    ttl: Duration,
    refresh_timeout: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    inflight: Mutex<Option<Refresh>>,
}

#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Inner>,
}

impl ModelRegistry {
    pub fn new(source: Arc<dyn ModelSource>, ttl: Duration) -> Self {
        Self::with_refresh_timeout(source, ttl, DEFAULT_REFRESH_TIMEOUT)
    }

    /// A refresh that takes longer than `refresh_timeout` counts as failed, so
    /// callers fall back to the stale snapshot instead of waiting on it.
    pub fn with_refresh_timeout(
        source: Arc<dyn ModelSource>,
        ttl: Duration,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                ttl,
                refresh_timeout,
                snapshot: RwLock::new(None),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Current model list, refreshing from the source when stale.
    ///
    /// A failed refresh falls back to the last good snapshot if there is one.
    pub async fn list(&self) -> ProxyResult<Arc<Vec<ModelEntry>>> {
        if let Some(entries) = self.fresh().await {
            return Ok(entries);
        }

        let refresh = {
            let mut slot = self.inner.inflight.lock().await;
            // A refresh may have landed while we waited for the lock.
            if let Some(entries) = self.fresh().await {
                return Ok(entries);
            }
            match slot.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = Self::refresh(self.inner.clone()).boxed().shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        match refresh.await {
            Ok(entries) => Ok(entries),
            Err(err) => match self.inner.snapshot.read().await.as_ref() {
                Some(stale) => {
                    warn!(
                        error = %err,
                        age_secs = stale.refreshed_at.elapsed().as_secs(),
                        "model refresh failed, serving stale list"
                    );
                    Ok(stale.entries.clone())
                }
                None => Err(ProxyError::RegistryUnavailable(err.to_string())),
            },
        }
    }

    /// Look a model up by name. `llama3` also matches `llama3:latest` and
    /// the other way round.
    pub async fn get(&self, name: &str) -> ProxyResult<Option<ModelEntry>> {
        let entries = self.list().await?;
        Ok(find_entry(&entries, name).cloned())
    }

    async fn fresh(&self) -> Option<Arc<Vec<ModelEntry>>> {
        let snapshot = self.inner.snapshot.read().await;
        snapshot
            .as_ref()
            .filter(|s| s.refreshed_at.elapsed() < self.inner.ttl)
            .map(|s| s.entries.clone())
    }

    async fn refresh(inner: Arc<Inner>) -> ProxyResult<Arc<Vec<ModelEntry>>> {
        debug!("refreshing model list");
        let fetched = match tokio::time::timeout(inner.refresh_timeout, inner.source.fetch_models())
            .await
        {
            Ok(fetched) => fetched,
            Err(_) => Err(ProxyError::BackendTimeout {
                timeout_secs: inner.refresh_timeout.as_secs(),
            }),
        };
        let result = fetched.map(|models| {
            let mut seen = BTreeSet::new();
            let entries: Vec<ModelEntry> = models
                .into_iter()
                .filter(|m| seen.insert(m.name.clone()))
                .collect();
            Arc::new(entries)
        });

        if let Ok(entries) = &result {
            info!(count = entries.len(), "model list refreshed");
            *inner.snapshot.write().await = Some(Snapshot {
                entries: entries.clone(),
                refreshed_at: Instant::now(),
            });
        }
        *inner.inflight.lock().await = None;
        result
    }
}

fn strip_latest(name: &str) -> &str {
    name.strip_suffix(":latest").unwrap_or(name)
}

fn find_entry<'a>(entries: &'a [ModelEntry], name: &str) -> Option<&'a ModelEntry> {
    entries
        .iter()
        .find(|e| e.name == name)
        .or_else(|| entries.iter().find(|e| strip_latest(&e.name) == strip_latest(name)))
}
