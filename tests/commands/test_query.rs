//! Tests for the named graph query command

use serde_json::{json, Value};
use std::sync::Arc;

use graphrag_router::backends::GraphClient;
use graphrag_router::commands::query_run;
use graphrag_router::Config;

use crate::support::{node_row, FakeGraph, BASE_YAML};

fn config() -> Config {
    let yaml = format!(
        "{}{}",
        BASE_YAML,
        r#"
specialized_queries:
  regulation_by_name:
    description: Regulation node with its neighbors
    cypher: "MATCH (r:Regulation) WHERE toLower(r.name) CONTAINS $term RETURN r.name AS entity_name"
    parameters: [term]
"#
    );
    Config::from_yaml_str(&yaml).unwrap()
}

fn client(config: &Config, graph: FakeGraph) -> GraphClient {
    GraphClient::new(Arc::new(graph), &config.neo4j)
        .with_named_queries(config.specialized_queries.clone())
}

#[tokio::test]
async fn query_runs_the_named_template() {
    let config = config();
    let graph = client(
        &config,
        FakeGraph::with_node("basel iii", node_row("Regulation", "Basel III", 1)),
    );

    let output = query_run(&graph, Some("regulation_by_name"), Some(r#"{"term": "basel iii"}"#))
        .await
        .unwrap();

    let value: Value = serde_json::from_str(&output).unwrap();
    assert!(value["statement"].as_str().unwrap().ends_with("LIMIT 100"));
    assert_eq!(value["rows"][0]["entity_name"], json!("Basel III"));
}

#[tokio::test]
async fn query_without_name_lists_templates() {
    let config = config();
    let graph = client(&config, FakeGraph::default());

    let output = query_run(&graph, None, None).await.unwrap();

    let value: Value = serde_json::from_str(&output).unwrap();
    assert_eq!(value[0]["name"], json!("regulation_by_name"));
    assert_eq!(value[0]["parameters"], json!(["term"]));
}

#[tokio::test]
async fn query_rejects_unknown_names() {
    let config = config();
    let graph = client(&config, FakeGraph::default());

    let err = query_run(&graph, Some("missing"), None).await.unwrap_err();
    assert!(err.to_string().contains("UnknownQuery"));
}
