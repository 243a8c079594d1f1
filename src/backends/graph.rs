//! Graph store client: bounded retries, actionable hints and schema
//! introspection over a pluggable [`GraphBackend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BackendError, FailureKind};
use crate::config::{NamedQuery, Neo4jSettings};
use crate::metrics;

/// One result row keyed by column name
pub type Row = Map<String, Value>;
/// Statement parameters
pub type Params = Map<String, Value>;

/// Property names holding vectors; never returned in schema or context
pub const EMBEDDING_PROPERTIES: &[&str] = &["embedding", "vector", "embeddings", "text_embedding"];

/// Row cap appended to unbounded reads
const DEFAULT_READ_LIMIT: usize = 100;

pub fn is_embedding_property(name: &str) -> bool {
    EMBEDDING_PROPERTIES
        .iter()
        .any(|p| p.eq_ignore_ascii_case(name))
}

/// A concrete graph store executing parameterized statements
#[async_trait]
pub trait GraphBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, statement: &str, params: &Params) -> Result<Vec<Row>, BackendError>;
}

/// Classify a raw driver error message
pub fn classify_failure(message: &str) -> BackendError {
    const TRANSIENT: &[(&str, &str)] = &[
        ("ServiceUnavailable", "ServiceUnavailable"),
        ("SessionExpired", "SessionExpired"),
        ("TransientError", "TransientError"),
        ("Transient", "TransientError"),
        ("connection refused", "ServiceUnavailable"),
        ("connection reset", "ServiceUnavailable"),
        ("broken pipe", "ServiceUnavailable"),
        ("timed out", "Timeout"),
        ("ConnectionError", "ServiceUnavailable"),
        ("IOError", "ServiceUnavailable"),
    ];
    const QUERY_SHAPE: &[(&str, &str)] = &[
        ("SyntaxError", "CypherSyntaxError"),
        ("Invalid input", "CypherSyntaxError"),
        ("UnknownLabel", "UnknownLabel"),
        ("label does not exist", "UnknownLabel"),
        ("UnknownRelationshipType", "UnknownRelationshipType"),
        ("relationship type does not exist", "UnknownRelationshipType"),
        ("UnknownPropertyKey", "UnknownPropertyKey"),
        ("property key does not exist", "UnknownPropertyKey"),
        ("ParameterMissing", "ParameterMissing"),
    ];

    let lower = message.to_lowercase();
    let found = |needle: &str| lower.contains(&needle.to_lowercase());

    if let Some((_, error_type)) = TRANSIENT.iter().find(|(needle, _)| found(needle)) {
        return BackendError::new(FailureKind::Transport, *error_type, message);
    }
    if let Some((_, error_type)) = QUERY_SHAPE.iter().find(|(needle, _)| found(needle)) {
        return BackendError::new(FailureKind::QueryShape, *error_type, message);
    }
    BackendError::new(FailureKind::Other, "DatabaseError", message)
}

/// Suggestions for fixing a failed statement
pub fn hints_for(err: &BackendError) -> Vec<String> {
    let text = format!("{} {}", err.error_type, err.message).to_lowercase();
    let mut hints = Vec::new();

    if err.kind == FailureKind::Transport {
        hints.push("The graph store is unreachable; retry later or check the connection settings.".to_string());
        return hints;
    }
    if text.contains("label") {
        hints.push("Unknown node label: call the schema introspection first to list available labels.".to_string());
    }
    if text.contains("relationship") {
        hints.push("Unknown relationship type: call the schema introspection first to list relationship types.".to_string());
    }
    if text.contains("syntax") || text.contains("invalid input") || text.contains("parameter") {
        hints.push("Check the statement syntax and use $param placeholders for values.".to_string());
    }
    if text.contains("property") {
        hints.push("Check property names against the schema.".to_string());
    }
    if hints.is_empty() {
        hints.push("Call the schema introspection first to confirm labels and properties.".to_string());
    }
    hints
}

/// Statement after read-safety checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedStatement {
    pub statement: String,
    pub warnings: Vec<String>,
}

/// Upper-cased words of a statement outside string literals, escaped
/// identifiers, property accesses and parameters, each flagged when it is
/// called like a function.
fn clause_words(statement: &str) -> Vec<(String, bool)> {
    let chars: Vec<char> = statement.chars().collect();
    let mut words = Vec::new();
    let mut qualified = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if matches!(c, '\'' | '"' | '`') {
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            qualified = false;
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            if !qualified {
                let word: String = chars[start..i].iter().collect::<String>().to_uppercase();
                let next = chars[i..].iter().find(|ch| !ch.is_whitespace());
                words.push((word, next == Some(&'(')));
            }
            qualified = false;
            continue;
        }
        if !c.is_whitespace() {
            qualified = c == '.' || c == '$';
        }
        i += 1;
    }
    words
}

const WRITE_CLAUSES: &[&str] = &["CREATE", "MERGE", "DELETE", "SET", "REMOVE"];
const AGGREGATES: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX", "COLLECT"];

/// Check an ad-hoc read statement.
///
/// Warns when an embedding property is returned and caps non-aggregating
/// reads without `LIMIT` at 100 rows.
pub fn validate_statement(statement: &str) -> ValidatedStatement {
    let mut warnings = Vec::new();
    let trimmed = statement.trim().trim_end_matches(';').trim_end();

    let lower = trimmed.to_lowercase();
    if let Some(return_pos) = lower.rfind("return") {
        let returned = &lower[return_pos..];
        for prop in EMBEDDING_PROPERTIES {
            if returned.contains(&format!(".{}", prop)) {
                warnings.push(format!(
                    "Statement returns embedding property `{}`; exclude it to keep results small.",
                    prop
                ));
            }
        }
    }

    let words = clause_words(trimmed);
    let has = |keyword: &str| words.iter().any(|(w, _)| w == keyword);
    let is_read = has("RETURN") && !WRITE_CLAUSES.iter().any(|kw| has(kw));
    let aggregates = words
        .iter()
        .any(|(w, call)| *call && AGGREGATES.contains(&w.as_str()));

    let statement = if is_read && !aggregates && !has("LIMIT") {
        warnings.push(format!("No LIMIT given; capped at {} rows.", DEFAULT_READ_LIMIT));
        format!("{} LIMIT {}", trimmed, DEFAULT_READ_LIMIT)
    } else {
        statement.to_string()
    };

    ValidatedStatement {
        statement,
        warnings,
    }
}

/// Schema of one node label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSchema {
    pub label: String,
    /// property -> type, indexed ones marked `"<TYPE> indexed"`
    pub attributes: BTreeMap<String, String>,
    /// relationship type -> target label
    pub relationships: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSchema {
    pub labels: Vec<LabelSchema>,
}

impl GraphSchema {
    pub fn label(&self, name: &str) -> Option<&LabelSchema> {
        self.labels.iter().find(|l| l.label == name)
    }
}

const NODE_PROPERTIES_QUERY: &str = "CALL db.schema.nodeTypeProperties() \
     YIELD nodeType, propertyName, propertyTypes \
     RETURN nodeType, collect({name: propertyName, type: propertyTypes[0]}) AS properties";

const INDEXES_QUERY: &str = "SHOW INDEXES YIELD labelsOrTypes, properties, type \
     WHERE type IN ['RANGE', 'BTREE', 'TEXT', 'FULLTEXT', 'POINT'] \
     RETURN labelsOrTypes[0] AS label, properties AS indexed_props";

const RELATIONSHIPS_QUERY: &str = "CALL db.schema.visualization() YIELD relationships \
     UNWIND relationships AS rel \
     RETURN startNode(rel).name AS from_label, type(rel) AS rel_type, endNode(rel).name AS to_label";

fn str_field<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

/// Assemble schema rows into per-label descriptions
pub fn build_schema(node_rows: &[Row], index_rows: &[Row], rel_rows: &[Row]) -> GraphSchema {
    let mut indexed: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for row in index_rows {
        if let Some(label) = str_field(row, "label") {
            let props = row
                .get("indexed_props")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                .unwrap_or_default();
            indexed.entry(label).or_default().extend(props);
        }
    }

    let mut rels: BTreeMap<&str, BTreeMap<String, String>> = BTreeMap::new();
    for row in rel_rows {
        if let (Some(from), Some(rel), Some(to)) = (
            str_field(row, "from_label"),
            str_field(row, "rel_type"),
            str_field(row, "to_label"),
        ) {
            rels.entry(from)
                .or_default()
                .insert(rel.to_string(), to.to_string());
        }
    }

    let mut labels = Vec::new();
    for row in node_rows {
        // nodeType looks like ":`Label`"
        let label = str_field(row, "nodeType")
            .unwrap_or_default()
            .replace(":`", "")
            .replace('`', "")
            .trim_matches(':')
            .to_string();
        if label.is_empty() {
            continue;
        }

        let indexed_props = indexed.get(label.as_str());
        let mut attributes = BTreeMap::new();
        for prop in row
            .get("properties")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(name) = prop.get("name").and_then(Value::as_str) else {
                continue;
            };
            if is_embedding_property(name) {
                continue;
            }
            let ty = prop
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("STRING")
                .to_string();
            let is_indexed = indexed_props.is_some_and(|p| p.contains(&name));
            attributes.insert(
                name.to_string(),
                if is_indexed { format!("{} indexed", ty) } else { ty },
            );
        }

        labels.push(LabelSchema {
            relationships: rels.get(label.as_str()).cloned().unwrap_or_default(),
            label,
            attributes,
        });
    }

    labels.sort_by(|a, b| a.label.cmp(&b.label));
    GraphSchema { labels }
}

/// Client owning one graph backend
pub struct GraphClient {
    backend: Arc<dyn GraphBackend>,
    max_retries: u32,
    base_delay: Duration,
    timeout: Duration,
    schema_ttl: Duration,
    schema_cache: Mutex<Option<(Instant, GraphSchema)>>,
    named_queries: BTreeMap<String, NamedQuery>,
}

impl GraphClient {
    pub fn new(backend: Arc<dyn GraphBackend>, settings: &Neo4jSettings) -> Self {
        Self {
            backend,
            max_retries: settings.max_retries.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            schema_ttl: Duration::from_secs(settings.schema_cache_ttl_secs),
            schema_cache: Mutex::new(None),
            named_queries: BTreeMap::new(),
        }
    }

    pub fn with_named_queries(mut self, queries: BTreeMap<String, NamedQuery>) -> Self {
        self.named_queries = queries;
        self
    }

    pub fn named_queries(&self) -> &BTreeMap<String, NamedQuery> {
        &self.named_queries
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.base_delay = base_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay before retry number `attempt + 1`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run a parameterized statement.
    ///
    /// Transient failures (including timeouts) are retried up to
    /// `max_retries` attempts in total with exponential backoff. Other
    /// failures return immediately with hints attached.
    pub async fn run(&self, statement: &str, params: &Params) -> Result<Vec<Row>, BackendError> {
        let mut attempt = 0;
        loop {
            let outcome =
                match tokio::time::timeout(self.timeout, self.backend.execute(statement, params))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::timeout(self.timeout)),
                };
            metrics::record_backend_call(self.backend.name(), outcome.is_ok());

            match outcome {
                Ok(rows) => {
                    debug!(rows = rows.len(), attempt, "Graph statement succeeded");
                    return Ok(rows);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        ?delay,
                        "Transient graph error, retrying: {}",
                        err
                    );
                    metrics::record_retry(self.backend.name());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    let hints = hints_for(&err);
                    warn!(attempts = attempt + 1, "Graph statement failed: {}", err);
                    return Err(err.with_hints(hints));
                }
            }
        }
    }

    /// Validate an ad-hoc read statement, then run it
    pub async fn query(
        &self,
        statement: &str,
        params: &Params,
    ) -> Result<(ValidatedStatement, Vec<Row>), BackendError> {
        let validated = validate_statement(statement);
        for warning in &validated.warnings {
            warn!("{}", warning);
        }
        let rows = self.run(&validated.statement, params).await?;
        Ok((validated, rows))
    }

    /// Run a configured statement template by name.
    ///
    /// Every declared parameter must be present in `params`. The template is
    /// validated like an ad-hoc statement and runs through the same retries.
    pub async fn run_named(
        &self,
        name: &str,
        params: &Params,
    ) -> Result<(ValidatedStatement, Vec<Row>), BackendError> {
        let Some(template) = self.named_queries.get(name) else {
            let available = if self.named_queries.is_empty() {
                "none".to_string()
            } else {
                self.named_queries.keys().cloned().collect::<Vec<_>>().join(", ")
            };
            return Err(BackendError::new(
                FailureKind::QueryShape,
                "UnknownQuery",
                format!("No named query `{}`", name),
            )
            .with_hints(vec![format!("Available named queries: {}", available)]));
        };

        let missing: Vec<&str> = template
            .parameters
            .iter()
            .filter(|p| !params.contains_key(p.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(BackendError::new(
                FailureKind::QueryShape,
                "ParameterMissing",
                format!("Named query `{}` needs: {}", name, missing.join(", ")),
            )
            .with_hints(vec![
                "Pass every declared parameter as a key of the JSON params object.".to_string(),
            ]));
        }

        info!(name, "Running named graph query");
        self.query(&template.statement, params).await
    }

    /// Schema introspection, cached for the configured TTL
    pub async fn schema(&self) -> Result<GraphSchema, BackendError> {
        let mut cache = self.schema_cache.lock().await;
        if let Some((fetched_at, schema)) = cache.as_ref() {
            if fetched_at.elapsed() < self.schema_ttl {
                return Ok(schema.clone());
            }
        }

        let empty = Params::new();
        let nodes = self.run(NODE_PROPERTIES_QUERY, &empty).await?;
        let indexes = self.run(INDEXES_QUERY, &empty).await?;
        let rels = self.run(RELATIONSHIPS_QUERY, &empty).await?;

        let schema = build_schema(&nodes, &indexes, &rels);
        info!(labels = schema.labels.len(), "Graph schema refreshed");
        *cache = Some((Instant::now(), schema.clone()));
        Ok(schema)
    }

    /// Drop the cached schema
    pub async fn invalidate_schema(&self) {
        *self.schema_cache.lock().await = None;
    }

    /// Availability check, single attempt
    pub async fn ping(&self) -> bool {
        let reply = tokio::time::timeout(
            self.timeout,
            self.backend.execute("RETURN 1 AS ok", &Params::new()),
        )
        .await;
        matches!(reply, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Backend replaying scripted responses, then succeeding
    struct ScriptedGraph {
        script: StdMutex<VecDeque<Result<Vec<Row>, BackendError>>>,
        calls: StdMutex<Vec<String>>,
        params: StdMutex<Vec<Params>>,
    }

    impl ScriptedGraph {
        fn new(script: Vec<Result<Vec<Row>, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                calls: StdMutex::new(Vec::new()),
                params: StdMutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GraphBackend for ScriptedGraph {
        fn name(&self) -> &'static str {
            "scripted_graph"
        }

        async fn execute(&self, statement: &str, params: &Params) -> Result<Vec<Row>, BackendError> {
            self.calls.lock().unwrap().push(statement.to_string());
            self.params.lock().unwrap().push(params.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![row(json!({"ok": 1}))]))
        }
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    fn client(backend: Arc<ScriptedGraph>) -> GraphClient {
        let config = Config::from_yaml_str("").unwrap();
        GraphClient::new(backend, &config.neo4j).with_retry_policy(3, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let backend = ScriptedGraph::new(vec![
            Err(BackendError::transport("ServiceUnavailable: no route")),
            Err(BackendError::new(FailureKind::Transport, "SessionExpired", "expired")),
        ]);
        let client = client(backend.clone());

        let started = Instant::now();
        let rows = client.run("MATCH (n) RETURN n", &Params::new()).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(backend.call_count(), 3);
        // 10ms + 20ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let backend = ScriptedGraph::new(vec![
            Err(BackendError::transport("down")),
            Err(BackendError::transport("down")),
            Err(BackendError::transport("down")),
            Err(BackendError::transport("down")),
        ]);
        let client = client(backend.clone());

        let err = client.run("RETURN 1", &Params::new()).await.unwrap_err();

        assert_eq!(backend.call_count(), 3);
        assert!(err.is_transient());
        assert!(!err.hints.is_empty());
    }

    #[tokio::test]
    async fn query_shape_errors_are_not_retried() {
        let backend = ScriptedGraph::new(vec![Err(classify_failure(
            "Neo.ClientError.Statement.SyntaxError: Invalid input 'MATC'",
        ))]);
        let client = client(backend.clone());

        let err = client.run("MATC (n) RETURN n", &Params::new()).await.unwrap_err();

        assert_eq!(backend.call_count(), 1);
        assert_eq!(err.kind, FailureKind::QueryShape);
        assert!(err.hints.iter().any(|h| h.contains("$param")));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let backend = ScriptedGraph::new(vec![]);
        let client = client(backend).with_retry_policy(3, Duration::from_millis(500));

        assert_eq!(client.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(client.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(client.backoff_delay(2), Duration::from_millis(2000));
    }

    #[test]
    fn classify_failure_recognizes_driver_messages() {
        assert_eq!(
            classify_failure("Neo.TransientError.General.DatabaseUnavailable").kind,
            FailureKind::Transport
        );
        assert_eq!(
            classify_failure("The provided label is not in the database: UnknownLabel").error_type,
            "UnknownLabel"
        );
        assert_eq!(classify_failure("constraint violated").kind, FailureKind::Other);
    }

    #[test]
    fn hints_match_error_shape() {
        let label = hints_for(&classify_failure("UnknownLabel warning: label does not exist"));
        assert!(label[0].contains("schema introspection"));

        let rel = hints_for(&classify_failure("relationship type does not exist: OWNZ"));
        assert!(rel.iter().any(|h| h.contains("relationship types")));

        let prop = hints_for(&classify_failure("UnknownPropertyKey: nme"));
        assert!(prop.iter().any(|h| h.contains("property names")));

        let other = hints_for(&classify_failure("something odd"));
        assert_eq!(other.len(), 1);
        assert!(other[0].contains("schema introspection"));
    }

    #[test]
    fn validate_appends_limit_to_plain_reads() {
        let validated = validate_statement("MATCH (c:Customer) RETURN c.name;");
        assert_eq!(validated.statement, "MATCH (c:Customer) RETURN c.name LIMIT 100");
        assert_eq!(validated.warnings.len(), 1);
    }

    #[test]
    fn validate_leaves_aggregates_and_limited_reads() {
        let agg = validate_statement("MATCH (c:Customer) RETURN count(c)");
        assert_eq!(agg.statement, "MATCH (c:Customer) RETURN count(c)");

        let limited = validate_statement("MATCH (c) RETURN c LIMIT 5");
        assert!(limited.warnings.is_empty());

        let write = validate_statement("MERGE (c:Customer {id: $id}) RETURN c");
        assert!(!write.statement.contains("LIMIT"));
    }

    #[test]
    fn validate_warns_on_embedding_properties() {
        let validated = validate_statement("MATCH (d:Doc) RETURN d.title, d.embedding LIMIT 3");
        assert!(validated.warnings.iter().any(|w| w.contains("embedding")));
        assert!(validated.statement.ends_with("LIMIT 3"));
    }

    #[test]
    fn validate_matches_clause_words_not_identifiers() {
        let amount = validate_statement("MATCH (l:Loan) WHERE l.limit_amount > 5 RETURN l");
        assert!(amount.statement.ends_with("RETURN l LIMIT 100"));

        let deleted = validate_statement("MATCH (n:Account) WHERE n.is_deleted = false RETURN n");
        assert!(deleted.statement.ends_with("LIMIT 100"));

        let offset = validate_statement("MATCH (n) WHERE n.settlement = $limit RETURN n");
        assert!(offset.statement.ends_with("LIMIT 100"));

        let literal = validate_statement("MATCH (n) WHERE n.name = 'limit' RETURN n");
        assert!(literal.statement.ends_with("LIMIT 100"));

        let write = validate_statement("MATCH (n:Account) SET n.flag = true RETURN n");
        assert!(!write.statement.contains("LIMIT"));

        let delete = validate_statement("MATCH (n:Tmp) DETACH DELETE n RETURN 1");
        assert!(!delete.statement.contains("LIMIT"));

        let spaced = validate_statement("MATCH (c) RETURN count (c)");
        assert!(!spaced.statement.contains("LIMIT"));
    }

    fn named_client(backend: Arc<ScriptedGraph>) -> GraphClient {
        let yaml = r#"
specialized_queries:
  product_fees:
    description: Product with its fees
    cypher: "MATCH (p:Product)-[:HAS_FEE]->(f:Fee) WHERE toLower(p.name) CONTAINS toLower($product_name) RETURN p.name AS product, f.amount AS fee"
    parameters: [product_name]
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        client(backend).with_named_queries(config.specialized_queries)
    }

    #[tokio::test]
    async fn named_query_passes_params_to_the_template() {
        let backend = ScriptedGraph::new(vec![]);
        let client = named_client(backend.clone());
        let params = row(json!({"product_name": "Gold Card"}));

        let (validated, rows) = client.run_named("product_fees", &params).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert!(validated.statement.ends_with("AS fee LIMIT 100"));
        assert_eq!(backend.calls.lock().unwrap()[0], validated.statement);
        assert_eq!(backend.params.lock().unwrap()[0]["product_name"], "Gold Card");
    }

    #[tokio::test]
    async fn unknown_named_query_lists_available_names() {
        let backend = ScriptedGraph::new(vec![]);
        let client = named_client(backend.clone());

        let err = client.run_named("product_rates", &Params::new()).await.unwrap_err();

        assert_eq!(err.error_type, "UnknownQuery");
        assert_eq!(err.kind, FailureKind::QueryShape);
        assert!(err.hints[0].contains("product_fees"));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn named_query_requires_declared_params() {
        let backend = ScriptedGraph::new(vec![]);
        let client = named_client(backend.clone());

        let err = client.run_named("product_fees", &Params::new()).await.unwrap_err();

        assert_eq!(err.error_type, "ParameterMissing");
        assert!(err.message.contains("product_name"));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn named_query_retries_transient_failures() {
        let backend = ScriptedGraph::new(vec![
            Err(BackendError::transport("ServiceUnavailable")),
            Err(BackendError::timeout(Duration::from_secs(1))),
        ]);
        let client = named_client(backend.clone());
        let params = row(json!({"product_name": "Gold Card"}));

        let (_, rows) = client.run_named("product_fees", &params).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(backend.call_count(), 3);
    }

    fn schema_rows() -> (Vec<Row>, Vec<Row>, Vec<Row>) {
        let nodes = vec![row(json!({
            "nodeType": ":`Customer`",
            "properties": [
                {"name": "id", "type": "String"},
                {"name": "name", "type": "String"},
                {"name": "embedding", "type": "FloatArray"}
            ]
        }))];
        let indexes = vec![row(json!({"label": "Customer", "indexed_props": ["id"]}))];
        let rels = vec![row(json!({
            "from_label": "Customer", "rel_type": "OWNS", "to_label": "Account"
        }))];
        (nodes, indexes, rels)
    }

    #[test]
    fn build_schema_marks_indexes_and_strips_embeddings() {
        let (nodes, indexes, rels) = schema_rows();
        let schema = build_schema(&nodes, &indexes, &rels);

        let customer = schema.label("Customer").unwrap();
        assert_eq!(customer.attributes["id"], "String indexed");
        assert_eq!(customer.attributes["name"], "String");
        assert!(!customer.attributes.contains_key("embedding"));
        assert_eq!(customer.relationships["OWNS"], "Account");
    }

    #[tokio::test]
    async fn schema_is_cached_until_invalidated() {
        let (nodes, indexes, rels) = schema_rows();
        let backend = ScriptedGraph::new(vec![
            Ok(nodes.clone()),
            Ok(indexes.clone()),
            Ok(rels.clone()),
            Ok(nodes),
            Ok(indexes),
            Ok(rels),
        ]);
        let client = client(backend.clone());

        let first = client.schema().await.unwrap();
        let second = client.schema().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.call_count(), 3);

        client.invalidate_schema().await;
        client.schema().await.unwrap();
        assert_eq!(backend.call_count(), 6);
    }

    #[tokio::test]
    async fn adhoc_queries_run_the_validated_statement() {
        let backend = ScriptedGraph::new(vec![]);
        let client = client(backend.clone());

        let (validated, rows) = client
            .query("MATCH (c:Customer) RETURN c.name;", &Params::new())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(validated.warnings.len(), 1);
        assert_eq!(
            backend.calls.lock().unwrap()[0],
            "MATCH (c:Customer) RETURN c.name LIMIT 100"
        );
    }

    #[tokio::test]
    async fn ping_reports_availability_without_retrying() {
        let down = ScriptedGraph::new(vec![Err(BackendError::transport("down"))]);
        assert!(!client(down.clone()).ping().await);
        assert_eq!(down.call_count(), 1);

        let up = ScriptedGraph::new(vec![]);
        assert!(client(up).ping().await);
    }
}
