//! In-process fake backends shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use graphrag_router::backends::{
    BackendError, Chunk, GraphBackend, GraphClient, Params, Row, SearchMode, VectorBackend,
    VectorClient, VectorQuery,
};
use graphrag_router::lightrag::{EntityExtractor, GraphExpander, HybridFuser};
use graphrag_router::{Config, QualityCritic, RetrievalResult, Router};

/// Vector store answering by substring match on the query text
#[derive(Default)]
pub struct FakeVector {
    /// (lowercase needle, results); first match wins
    pub responses: Vec<(String, Vec<RetrievalResult>)>,
    pub rejects: Vec<SearchMode>,
    pub down: bool,
    pub seen: Mutex<Vec<VectorQuery>>,
    pub inserted: Mutex<Vec<Chunk>>,
}

impl FakeVector {
    pub fn answering(needle: &str, contents: &[&str]) -> Self {
        Self {
            responses: vec![(needle.to_lowercase(), docs(contents))],
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn modes(&self) -> Vec<SearchMode> {
        self.seen.lock().unwrap().iter().map(|q| q.mode).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|q| q.text.clone()).collect()
    }
}

#[async_trait]
impl VectorBackend for FakeVector {
    fn name(&self) -> &'static str {
        "fake_vector"
    }

    async fn query(&self, request: &VectorQuery) -> Result<Vec<RetrievalResult>, BackendError> {
        self.seen.lock().unwrap().push(request.clone());
        if self.down {
            return Err(BackendError::transport("connection refused"));
        }
        if self.rejects.contains(&request.mode) {
            return Err(BackendError::unsupported(format!(
                "search mode {} not supported",
                request.mode
            )));
        }
        let text = request.text.to_lowercase();
        Ok(self
            .responses
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, results)| results.clone())
            .unwrap_or_default())
    }

    async fn insert(&self, _collection_id: &str, chunks: &[Chunk]) -> Result<usize, BackendError> {
        self.inserted.lock().unwrap().extend_from_slice(chunks);
        Ok(chunks.len())
    }
}

/// Graph store keyed by lookup term, with scripted failures first
#[derive(Default)]
pub struct FakeGraph {
    /// lowercase term -> lookup row
    pub nodes: Vec<(String, Row)>,
    pub script: Mutex<VecDeque<BackendError>>,
    pub down: bool,
    pub calls: AtomicUsize,
    pub terms: Mutex<Vec<String>>,
}

impl FakeGraph {
    pub fn with_node(term: &str, row: Row) -> Self {
        Self {
            nodes: vec![(term.to_lowercase(), row)],
            ..Default::default()
        }
    }

    pub fn failing_first(errors: Vec<BackendError>) -> Self {
        Self {
            script: Mutex::new(errors.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn terms(&self) -> Vec<String> {
        self.terms.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphBackend for FakeGraph {
    fn name(&self) -> &'static str {
        "fake_graph"
    }

    async fn execute(&self, statement: &str, params: &Params) -> Result<Vec<Row>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down {
            return Err(BackendError::transport("graph unreachable"));
        }
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        if statement.starts_with("RETURN 1") {
            return Ok(vec![row(json!({"ok": 1}))]);
        }

        let term = params
            .get("term")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        self.terms.lock().unwrap().push(term.clone());
        Ok(self
            .nodes
            .iter()
            .filter(|(t, _)| *t == term)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

pub fn docs(contents: &[&str]) -> Vec<RetrievalResult> {
    contents
        .iter()
        .enumerate()
        .map(|(i, c)| RetrievalResult::new(*c, 0.9 - i as f32 * 0.05))
        .collect()
}

/// Lookup row for a node with `connections` outgoing relationships
pub fn node_row(entity_type: &str, name: &str, connections: usize) -> Row {
    let connections: Vec<Value> = (0..connections)
        .map(|i| {
            json!({
                "relationship": "APPLIES_TO",
                "outgoing": true,
                "related_entity": format!("Institution {}", i),
                "related_type": "Institution"
            })
        })
        .collect();
    row(json!({
        "entity_type": entity_type,
        "entity_name": name,
        "data": {"name": name, "embedding": [0.1, 0.2]},
        "connections": connections
    }))
}

pub const BASE_YAML: &str = r#"
neo4j:
  max_retries: 3
  base_delay_ms: 10
graphrag:
  max_entity_lookups: 10
  max_connections_per_entity: 5
  entity_patterns:
    regulations: ["basel iii", "aml", "kyc", "mifid", "gdpr"]
    products: ["savings account"]
agentic_loop:
  max_iterations: 3
  top_k: 5
  routing_hints:
    "how do i": vector
    relationship: graph
answer_critic:
  escalate: false
vector_store:
  search_mode: vector
"#;

pub fn config() -> Config {
    Config::from_yaml_str(BASE_YAML).unwrap()
}

pub struct Harness {
    pub config: Config,
    pub vector: Arc<FakeVector>,
    pub graph: Arc<FakeGraph>,
    pub vector_client: Arc<VectorClient>,
    pub graph_client: Arc<GraphClient>,
    pub fuser: Arc<HybridFuser>,
}

impl Harness {
    pub fn new(config: Config, vector: FakeVector, graph: FakeGraph) -> Self {
        let vector = Arc::new(vector);
        let graph = Arc::new(graph);
        let vector_client = Arc::new(VectorClient::new(vector.clone(), &config.vector_store));
        let graph_client = Arc::new(
            GraphClient::new(graph.clone(), &config.neo4j).with_timeout(Duration::from_secs(2)),
        );
        let fuser = Arc::new(HybridFuser::new(
            vector_client.clone(),
            EntityExtractor::from_config(&config),
            GraphExpander::new(graph_client.clone(), &config),
            config.graphrag.clone(),
        ));
        Self {
            config,
            vector,
            graph,
            vector_client,
            graph_client,
            fuser,
        }
    }

    pub fn router(&self) -> Router {
        Router::from_config(
            self.fuser.clone(),
            self.graph_client.clone(),
            QualityCritic::from_config(&self.config),
            &self.config,
        )
    }

    pub fn router_with(&self, critic: QualityCritic) -> Router {
        Router::from_config(
            self.fuser.clone(),
            self.graph_client.clone(),
            critic,
            &self.config,
        )
    }
}
