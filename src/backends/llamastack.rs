//! Vector store backend speaking the LlamaStack `vector-io` HTTP API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use super::vector::{Chunk, SearchMode, VectorBackend, VectorQuery};
use super::{BackendError, FailureKind};
use crate::config::VectorStoreSettings;
use crate::models::RetrievalResult;
use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    vector_db_id: &'a str,
    query: &'a str,
    params: QueryParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ranking_options: Option<Value>,
}

#[derive(Debug, Serialize)]
struct QueryParams {
    max_chunks: usize,
}

#[derive(Debug, Serialize)]
struct InsertRequest<'a> {
    vector_db_id: &'a str,
    chunks: &'a [Chunk],
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    chunks: Vec<ResponseChunk>,
    /// Some deployments return scores in a parallel array
    #[serde(default)]
    scores: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ResponseChunk {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    metadata: Map<String, Value>,
    score: Option<f32>,
}

/// HTTP client for a LlamaStack vector store
#[derive(Debug, Clone)]
pub struct LlamaStackBackend {
    http: Client,
    base_url: String,
}

impl LlamaStackBackend {
    pub fn new(settings: &VectorStoreSettings) -> Result<Self> {
        let base_url = settings.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::VectorStoreError(
                "vector_store.base_url is not configured".to_string(),
            ));
        }

        let http = Client::builder()
            .user_agent("graphrag_router/0.1.0")
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .build()
            .map_err(|e| Error::HttpError(format!("HTTP client error: {}", e)))?;

        Ok(Self { http, base_url })
    }

    fn ranking_payload(request: &VectorQuery) -> Option<Value> {
        if request.mode != SearchMode::Hybrid {
            return None;
        }
        let ranking = request.ranking.as_ref()?;
        let mut ranker = Map::new();
        ranker.insert("type".into(), Value::from(ranking.ranker_type.clone()));
        if ranking.ranker_type == "weighted" {
            ranker.insert("alpha".into(), Value::from(ranking.alpha));
        }
        Some(serde_json::json!({ "ranker": ranker }))
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> std::result::Result<(StatusCode, String), BackendError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        Ok((status, text))
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::new(FailureKind::Transport, "Timeout", err.to_string())
    } else if err.is_connect() || err.is_request() {
        BackendError::transport(err.to_string())
    } else {
        BackendError::new(FailureKind::Other, "HttpError", err.to_string())
    }
}

fn classify_status(status: StatusCode, mode: SearchMode, body: &str) -> BackendError {
    let message = format!("vector store returned {}: {}", status, truncate(body, 200));
    if status == StatusCode::BAD_REQUEST && mode != SearchMode::Vector {
        BackendError::unsupported(message)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::transport(message)
    } else {
        BackendError::new(FailureKind::Other, format!("Http{}", status.as_u16()), message)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn content_to_string(content: Value) -> String {
    match content {
        Value::String(s) => s,
        Value::Null => String::new(),
        // Interleaved content items: keep their text parts
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str).or_else(|| item.as_str()))
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorBackend for LlamaStackBackend {
    fn name(&self) -> &'static str {
        "llamastack"
    }

    async fn query(
        &self,
        request: &VectorQuery,
    ) -> std::result::Result<Vec<RetrievalResult>, BackendError> {
        let body = QueryRequest {
            vector_db_id: &request.collection_id,
            query: &request.text,
            params: QueryParams {
                max_chunks: request.top_k,
            },
            search_mode: (request.mode != SearchMode::Vector).then(|| request.mode.as_str()),
            ranking_options: Self::ranking_payload(request),
        };

        let (status, text) = self.post("/v1/vector-io/query", &body).await?;
        if !status.is_success() {
            return Err(classify_status(status, request.mode, &text));
        }

        let parsed: QueryResponse = serde_json::from_str(&text).map_err(|e| {
            BackendError::new(
                FailureKind::Other,
                "InvalidResponse",
                format!("invalid vector store response: {}", e),
            )
        })?;

        debug!(chunks = parsed.chunks.len(), "LlamaStack query returned");

        let scores = parsed.scores;
        Ok(parsed
            .chunks
            .into_iter()
            .enumerate()
            .map(|(idx, chunk)| {
                let score = chunk
                    .score
                    .or_else(|| scores.get(idx).copied())
                    .unwrap_or(0.0);
                RetrievalResult {
                    content: content_to_string(chunk.content),
                    score,
                    metadata: chunk.metadata,
                }
            })
            .collect())
    }

    async fn insert(
        &self,
        collection_id: &str,
        chunks: &[Chunk],
    ) -> std::result::Result<usize, BackendError> {
        let body = InsertRequest {
            vector_db_id: collection_id,
            chunks,
        };
        let (status, text) = self.post("/v1/vector-io/insert", &body).await?;
        if !status.is_success() {
            return Err(classify_status(status, SearchMode::Vector, &text));
        }
        Ok(chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::vector::VectorClient;
    use crate::config::Config;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn settings(server: &MockServer, mode: &str) -> VectorStoreSettings {
        let mut config = Config::from_yaml_str("").unwrap();
        config.vector_store.base_url = server.base_url();
        config.vector_store.vector_store_id = "docs".to_string();
        config.vector_store.search_mode = mode.parse().unwrap();
        config.vector_store.ranking_alpha = 0.7;
        config.vector_store
    }

    fn body_json(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    }

    #[test]
    fn new_rejects_empty_base_url() {
        let mut config = Config::from_yaml_str("").unwrap();
        config.vector_store.base_url = "  ".to_string();
        let err = LlamaStackBackend::new(&config.vector_store).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[tokio::test]
    async fn query_posts_vector_payload_and_parses_chunks() {
        let server = MockServer::start_async().await;

        let query_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/vector-io/query").is_true(|req| {
                let body = body_json(req.body().as_ref());
                body["vector_db_id"] == "docs"
                    && body["query"] == "What is Basel III?"
                    && body["params"]["max_chunks"] == 3
                    && body.get("search_mode").is_none()
                    && body.get("ranking_options").is_none()
            });
            then.status(200).json_body(json!({
                "chunks": [
                    { "content": "Basel III overview", "metadata": {"doc": "reg-1"}, "score": 0.42 },
                    { "content": [{"type": "text", "text": "capital"}, {"type": "text", "text": "buffers"}], "metadata": {} }
                ],
                "scores": [0.42, 0.91]
            }));
        });

        let settings = settings(&server, "vector");
        let backend = Arc::new(LlamaStackBackend::new(&settings).unwrap());
        let outcome = VectorClient::new(backend, &settings)
            .search("What is Basel III?", 3)
            .await;

        query_mock.assert_calls(1);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].content, "capital buffers");
        assert!((outcome.results[0].score - 0.91).abs() < 1e-6);
        assert_eq!(outcome.results[1].metadata["doc"], "reg-1");
    }

    #[tokio::test]
    async fn hybrid_sends_weighted_ranker() {
        let server = MockServer::start_async().await;

        let hybrid_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/vector-io/query").is_true(|req| {
                let body = body_json(req.body().as_ref());
                body["search_mode"] == "hybrid"
                    && body["ranking_options"]["ranker"]["type"] == "weighted"
                    && (body["ranking_options"]["ranker"]["alpha"].as_f64().unwrap_or(0.0) - 0.7)
                        .abs()
                        < 1e-3
            });
            then.status(200).json_body(json!({ "chunks": [] }));
        });

        let settings = settings(&server, "hybrid");
        let backend = Arc::new(LlamaStackBackend::new(&settings).unwrap());
        let outcome = VectorClient::new(backend, &settings).search("aml", 5).await;

        hybrid_mock.assert_calls(1);
        assert!(!outcome.fell_back);
        assert_eq!(outcome.mode, SearchMode::Hybrid);
    }

    #[tokio::test]
    async fn bad_request_in_hybrid_mode_falls_back_once() {
        let server = MockServer::start_async().await;

        let hybrid_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/vector-io/query")
                .is_true(|req| body_json(req.body().as_ref()).get("search_mode").is_some());
            then.status(400).body("search_mode not supported");
        });
        let vector_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/vector-io/query")
                .is_true(|req| body_json(req.body().as_ref()).get("search_mode").is_none());
            then.status(200).json_body(json!({
                "chunks": [{ "content": "Basel III overview", "metadata": {}, "score": 0.8 }]
            }));
        });

        let settings = settings(&server, "hybrid");
        let backend = Arc::new(LlamaStackBackend::new(&settings).unwrap());
        let outcome = VectorClient::new(backend, &settings)
            .search("basel", 5)
            .await;

        hybrid_mock.assert_calls(1);
        vector_mock.assert_calls(1);
        assert!(outcome.fell_back);
        assert_eq!(outcome.mode, SearchMode::Vector);
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn bad_request_in_vector_mode_is_not_retried() {
        let server = MockServer::start_async().await;

        let query_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/vector-io/query");
            then.status(400).body("unknown vector_db_id");
        });

        let settings = settings(&server, "vector");
        let backend = Arc::new(LlamaStackBackend::new(&settings).unwrap());
        let outcome = VectorClient::new(backend, &settings).search("q", 5).await;

        query_mock.assert_calls(1);
        let err = outcome.error.expect("error");
        assert_eq!(err.kind, FailureKind::Other);
        assert!(err.message.contains("unknown vector_db_id"));
    }

    #[tokio::test]
    async fn server_error_is_transport_failure() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/v1/vector-io/query");
            then.status(503).body("unavailable");
        });

        let settings = settings(&server, "keyword");
        let backend = Arc::new(LlamaStackBackend::new(&settings).unwrap());
        let outcome = VectorClient::new(backend, &settings).search("q", 5).await;

        assert!(!outcome.fell_back);
        assert!(outcome.error.unwrap().is_transient());
    }

    #[tokio::test]
    async fn insert_posts_chunks() {
        let server = MockServer::start_async().await;

        let insert_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/vector-io/insert").is_true(|req| {
                let body = body_json(req.body().as_ref());
                body["vector_db_id"] == "docs"
                    && body["chunks"][0]["content"] == "Basel III overview"
                    && body["chunks"][0]["metadata"]["doc"] == "reg-1"
            });
            then.status(200).json_body(json!({}));
        });

        let settings = settings(&server, "vector");
        let backend = Arc::new(LlamaStackBackend::new(&settings).unwrap());
        let inserted = VectorClient::new(backend, &settings)
            .insert(&[Chunk::new("Basel III overview").with_metadata("doc", "reg-1")])
            .await
            .unwrap();

        insert_mock.assert_calls(1);
        assert_eq!(inserted, 1);
    }
}
