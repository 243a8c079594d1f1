//! Vector store client with single-step search-mode demotion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BackendError, FailureKind};
use crate::config::VectorStoreSettings;
use crate::metrics;
use crate::models::{sort_by_score, RetrievalResult, META_SEARCH_MODE, META_SOURCE};

/// Search strategy requested from the vector store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Pure semantic similarity
    #[default]
    Vector,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vector" | "semantic" => Ok(SearchMode::Vector),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingOptions {
    pub ranker_type: String,
    /// Weight of the semantic score, 0..=1
    pub alpha: f32,
}

impl RankingOptions {
    pub fn new(ranker_type: impl Into<String>, alpha: f32) -> Self {
        let alpha = if alpha.is_finite() { alpha } else { 0.5 };
        Self {
            ranker_type: ranker_type.into(),
            alpha: alpha.clamp(0.0, 1.0),
        }
    }
}

/// One request as seen by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub collection_id: String,
    pub text: String,
    pub top_k: usize,
    pub mode: SearchMode,
    /// Only sent for non-vector modes
    pub ranking: Option<RankingOptions>,
}

/// Document to insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Chunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A concrete vector store.
///
/// Implementations report a rejected search mode as
/// [`FailureKind::Unsupported`](super::FailureKind::Unsupported) so the client
/// can demote it.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn query(&self, request: &VectorQuery) -> Result<Vec<RetrievalResult>, BackendError>;

    async fn insert(&self, collection_id: &str, chunks: &[Chunk]) -> Result<usize, BackendError>;
}

/// Outcome of [`VectorClient::search`]
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearchOutcome {
    pub results: Vec<RetrievalResult>,
    /// Mode that produced `results`
    pub mode: SearchMode,
    /// The configured mode was rejected and the call was demoted to `Vector`
    pub fell_back: bool,
    pub error: Option<BackendError>,
}

impl VectorSearchOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True when at least one non-error result is present
    pub fn has_usable_results(&self) -> bool {
        self.results.iter().any(|r| !r.is_error())
    }

    /// Results for the critic; an error becomes a single error result
    pub fn into_results(self) -> Vec<RetrievalResult> {
        match self.error {
            Some(err) => vec![RetrievalResult::from_error(&err, "vector")],
            None => self.results,
        }
    }
}

/// Client owning one vector backend and its search configuration
#[derive(Clone)]
pub struct VectorClient {
    backend: Arc<dyn VectorBackend>,
    collection_id: String,
    mode: SearchMode,
    ranking: RankingOptions,
    timeout: Duration,
}

impl VectorClient {
    pub fn new(backend: Arc<dyn VectorBackend>, settings: &VectorStoreSettings) -> Self {
        Self {
            backend,
            collection_id: settings.vector_store_id.clone(),
            mode: settings.search_mode,
            ranking: RankingOptions::new(settings.ranker_type.clone(), settings.ranking_alpha),
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    fn request(&self, text: &str, top_k: usize, mode: SearchMode) -> VectorQuery {
        VectorQuery {
            collection_id: self.collection_id.clone(),
            text: text.to_string(),
            top_k,
            mode,
            ranking: (mode != SearchMode::Vector).then(|| self.ranking.clone()),
        }
    }

    async fn query_once(&self, request: &VectorQuery) -> Result<Vec<RetrievalResult>, BackendError> {
        let outcome = match tokio::time::timeout(self.timeout, self.backend.query(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(self.timeout)),
        };
        metrics::record_backend_call(self.backend.name(), outcome.is_ok());
        outcome
    }

    /// Search the collection. Never fails: errors are carried in the outcome.
    ///
    /// A rejected `keyword`/`hybrid` mode is demoted to `vector` once for this
    /// call; the rejected mode is not tried again.
    pub async fn search(&self, text: &str, top_k: usize) -> VectorSearchOutcome {
        debug!(mode = %self.mode, top_k, "Vector search: {}", text);

        if top_k == 0 {
            return VectorSearchOutcome {
                results: Vec::new(),
                mode: self.mode,
                fell_back: false,
                error: None,
            };
        }

        let first = self.query_once(&self.request(text, top_k, self.mode)).await;

        let (result, mode, fell_back) = match first {
            Err(err) if err.kind == FailureKind::Unsupported && self.mode != SearchMode::Vector => {
                warn!(
                    rejected = %self.mode,
                    "Vector store rejected search mode ({}), retrying with vector mode",
                    err.message
                );
                metrics::record_fallback(self.mode.as_str());
                let retry = self
                    .query_once(&self.request(text, top_k, SearchMode::Vector))
                    .await;
                (retry, SearchMode::Vector, true)
            }
            other => (other, self.mode, false),
        };

        match result {
            Ok(mut results) => {
                sort_by_score(&mut results);
                results.truncate(top_k);
                for r in &mut results {
                    r.metadata
                        .entry(META_SOURCE.to_string())
                        .or_insert_with(|| Value::from("vector"));
                    r.metadata
                        .entry(META_SEARCH_MODE.to_string())
                        .or_insert_with(|| Value::from(mode.as_str()));
                }
                info!(count = results.len(), %mode, fell_back, "Vector search complete");
                VectorSearchOutcome {
                    results,
                    mode,
                    fell_back,
                    error: None,
                }
            }
            Err(err) => {
                warn!(%mode, "Vector search failed: {}", err);
                VectorSearchOutcome {
                    results: Vec::new(),
                    mode,
                    fell_back,
                    error: Some(err),
                }
            }
        }
    }

    /// Insert a batch of chunks into the collection
    pub async fn insert(&self, chunks: &[Chunk]) -> Result<usize, BackendError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let outcome = match tokio::time::timeout(
            self.timeout,
            self.backend.insert(&self.collection_id, chunks),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(self.timeout)),
        };
        metrics::record_backend_call(self.backend.name(), outcome.is_ok());
        match &outcome {
            Ok(count) => info!(count, "Inserted chunks into {}", self.collection_id),
            Err(err) => warn!("Vector insert failed: {}", err),
        }
        outcome
    }
}
