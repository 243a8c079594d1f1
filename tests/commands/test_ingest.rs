//! Tests for the ingest command

use tempfile::tempdir;

use graphrag_router::commands::ingest_run;

use crate::support::{config, FakeGraph, FakeVector, Harness};

#[tokio::test]
async fn ingest_inserts_every_chunk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("docs.jsonl");
    std::fs::write(
        &path,
        "{\"content\": \"Basel III overview\", \"metadata\": {\"doc\": \"reg-1\"}}\n\"AML policy\"\n",
    )
    .unwrap();
    let h = Harness::new(config(), FakeVector::empty(), FakeGraph::default());

    let stored = ingest_run(&h.vector_client, &path).await.unwrap();

    assert_eq!(stored, 2);
    let inserted = h.vector.inserted.lock().unwrap();
    assert_eq!(inserted[0].content, "Basel III overview");
    assert_eq!(inserted[1].content, "AML policy");
}

#[tokio::test]
async fn ingest_reports_missing_files() {
    let h = Harness::new(config(), FakeVector::empty(), FakeGraph::default());
    let err = ingest_run(&h.vector_client, std::path::Path::new("/nonexistent/docs.jsonl"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Failed to read"));
}
