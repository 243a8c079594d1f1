//! Vector store backend on Qdrant, embedding queries with OpenAI.
//!
//! Qdrant only offers semantic search here: `keyword` and `hybrid` requests
//! are rejected as unsupported, which makes the client demote them.

use async_trait::async_trait;
use qdrant_client::qdrant::{PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue};
use qdrant_client::Qdrant;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::embeddings::EmbeddingService;
use super::vector::{Chunk, SearchMode, VectorBackend, VectorQuery};
use super::{BackendError, FailureKind};
use crate::models::RetrievalResult;

/// Payload key holding the chunk text
const CONTENT_KEY: &str = "content";

/// Vector store backed by Qdrant
pub struct QdrantBackend {
    client: Qdrant,
    embeddings: EmbeddingService,
}

impl QdrantBackend {
    /// Connect to Qdrant server
    pub fn new(url: &str, embeddings: EmbeddingService) -> anyhow::Result<Self> {
        let client = Qdrant::from_url(url).build()?;
        Ok(Self { client, embeddings })
    }
}

fn classify(err: impl std::fmt::Display) -> BackendError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if ["unavailable", "connect", "transport", "deadline", "timed out"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        BackendError::transport(message)
    } else {
        BackendError::new(FailureKind::Other, "QdrantError", message)
    }
}

fn qdrant_to_json(value: &QdrantValue) -> Value {
    if let Some(s) = value.as_str() {
        Value::from(s.as_str())
    } else if let Some(i) = value.as_integer() {
        Value::from(i)
    } else if let Some(d) = value.as_double() {
        Value::from(d)
    } else if let Some(b) = value.as_bool() {
        Value::from(b)
    } else if let Some(list) = value.as_list() {
        Value::Array(list.iter().map(qdrant_to_json).collect())
    } else {
        Value::Null
    }
}

fn json_to_qdrant(value: &Value) -> QdrantValue {
    match value {
        Value::String(s) => s.clone().into(),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or_default().into(),
        },
        other => other.to_string().into(),
    }
}

/// Split a point payload into chunk text and metadata
fn payload_to_result(payload: HashMap<String, QdrantValue>, score: f32) -> RetrievalResult {
    let mut metadata = Map::new();
    let mut content = String::new();
    for (key, value) in &payload {
        if key == CONTENT_KEY || (key == "text" && content.is_empty()) {
            if let Some(text) = value.as_str() {
                content = text.to_string();
                continue;
            }
        }
        metadata.insert(key.clone(), qdrant_to_json(value));
    }
    RetrievalResult {
        content,
        score,
        metadata,
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    async fn query(&self, request: &VectorQuery) -> Result<Vec<RetrievalResult>, BackendError> {
        if request.mode != SearchMode::Vector {
            return Err(BackendError::unsupported(format!(
                "qdrant backend does not support {} search",
                request.mode
            )));
        }

        let embedding = self.embeddings.embed(&request.text).await.map_err(classify)?;

        let search = SearchPointsBuilder::new(
            request.collection_id.as_str(),
            embedding,
            request.top_k as u64,
        )
        .with_payload(true);

        let response = self.client.search_points(search).await.map_err(classify)?;
        debug!(points = response.result.len(), "Qdrant search returned");

        Ok(response
            .result
            .into_iter()
            .map(|point| payload_to_result(point.payload, point.score))
            .collect())
    }

    async fn insert(&self, collection_id: &str, chunks: &[Chunk]) -> Result<usize, BackendError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embeddings.embed_batch(&texts).await.map_err(classify)?;

        let points: Vec<PointStruct> = chunks
            .iter()
            .zip(embeddings)
            .filter(|(_, embedding)| !embedding.is_empty())
            .map(|(chunk, embedding)| {
                let mut payload: HashMap<String, QdrantValue> = chunk
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
                    .collect();
                payload.insert(CONTENT_KEY.to_string(), chunk.content.clone().into());
                PointStruct::new(Uuid::new_v4().to_string(), embedding, payload)
            })
            .collect();

        if points.is_empty() {
            return Ok(0);
        }

        let count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection_id, points))
            .await
            .map_err(classify)?;

        info!("Upserted {} chunks into {}", count, collection_id);
        Ok(count)
    }
}
