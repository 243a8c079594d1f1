//! Graph backend on Neo4j

use async_trait::async_trait;
use neo4rs::{query, BoltList, BoltMap, BoltNull, BoltString, BoltType, Graph};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::graph::{classify_failure, GraphBackend, Params, Row};
use super::{BackendError, FailureKind};
use crate::config::Neo4jSettings;

/// Graph store backed by Neo4j.
///
/// The driver connects on first use and the handle is reused afterwards.
pub struct Neo4jBackend {
    uri: String,
    user: String,
    password: String,
    graph: OnceCell<Graph>,
}

impl Neo4jBackend {
    pub fn new(settings: &Neo4jSettings) -> Self {
        Self {
            uri: settings.uri.clone(),
            user: settings.username.clone(),
            password: settings.password.clone(),
            graph: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.graph.initialized()
    }

    async fn graph(&self) -> Result<&Graph, BackendError> {
        self.graph
            .get_or_try_init(|| async {
                info!(uri = %self.uri, "Connecting to Neo4j");
                Graph::new(&self.uri, &self.user, &self.password)
                    .await
                    .map_err(driver_error)
            })
            .await
    }
}

fn driver_error(err: neo4rs::Error) -> BackendError {
    // Variant names (e.g. ConnectionError) only show up in Debug output
    let mut classified = classify_failure(&format!("{:?} {}", err, err));
    classified.message = err.to_string();
    classified
}

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => BoltType::from(s.as_str()),
        Value::Array(items) => {
            BoltType::List(BoltList::from(items.iter().map(to_bolt).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut bolt = BoltMap::new();
            for (key, value) in map {
                bolt.put(BoltString::from(key.as_str()), to_bolt(value));
            }
            BoltType::Map(bolt)
        }
    }
}

#[async_trait]
impl GraphBackend for Neo4jBackend {
    fn name(&self) -> &'static str {
        "neo4j"
    }

    async fn execute(&self, statement: &str, params: &Params) -> Result<Vec<Row>, BackendError> {
        let graph = self.graph().await?;

        let mut q = query(statement);
        for (key, value) in params {
            q = q.param(key.as_str(), to_bolt(value));
        }

        let mut result = graph.execute(q).await.map_err(driver_error)?;
        let mut rows = Vec::new();
        while let Some(row) = result.next().await.map_err(driver_error)? {
            let parsed: Row = row.to().map_err(|e| {
                BackendError::new(
                    FailureKind::Other,
                    "DeserializationError",
                    format!("cannot convert row: {}", e),
                )
            })?;
            rows.push(parsed);
        }

        debug!(rows = rows.len(), "Neo4j statement returned");
        Ok(rows)
    }
}
