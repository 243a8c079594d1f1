//! Tests for the ask command

use serde_json::Value;
use tempfile::tempdir;

use graphrag_router::commands::{ask_run, AskArgs};
use graphrag_router::state::{AppMetadata, StateStore};

use crate::support::{config, node_row, FakeGraph, FakeVector, Harness};

fn harness() -> Harness {
    Harness::new(
        config(),
        FakeVector::answering("basel", &["What Basel III is: a capital framework"]),
        FakeGraph::with_node("basel iii", node_row("Regulation", "Basel III", 1)),
    )
}

#[tokio::test]
async fn ask_reports_outcome_and_state_as_json() {
    let h = harness();
    let args = AskArgs {
        question: "What is Basel III?".to_string(),
        user_id: "alice".to_string(),
        state_file: None,
        synthesis: false,
    };

    let output = ask_run(&h.router(), &h.config, &args).await.unwrap();
    let report: Value = serde_json::from_str(&output).unwrap();

    assert_eq!(report["outcome"]["status"], "complete");
    assert_eq!(report["outcome"]["iterations"], 1);
    assert_eq!(report["state"]["user_id"], "alice");
    assert_eq!(report["state"]["session"]["query_count"], 1);
    assert!(report["state"].get("turn").is_none());
}

#[tokio::test]
async fn ask_can_render_the_synthesis_prompt() {
    let h = harness();
    let args = AskArgs {
        question: "What is Basel III?".to_string(),
        user_id: "alice".to_string(),
        state_file: None,
        synthesis: true,
    };

    let output = ask_run(&h.router(), &h.config, &args).await.unwrap();

    assert!(output.starts_with("Question: What is Basel III?"));
    assert!(output.contains("--- Source 1 (graph) ---"));
    assert!(output.contains("--- Source 2 (vector) ---"));
}

#[tokio::test]
async fn ask_persists_user_scope_between_runs() {
    let dir = tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let h = harness();

    for question in ["What is Basel III?", "What is AML?"] {
        let args = AskArgs {
            question: question.to_string(),
            user_id: "alice".to_string(),
            state_file: Some(state_file.clone()),
            synthesis: false,
        };
        ask_run(&h.router(), &h.config, &args).await.unwrap();
    }

    let store = StateStore::load_from(&state_file, AppMetadata::default()).unwrap();
    let profile = store.user_profile("alice").unwrap();
    assert_eq!(profile.query_history, vec!["What is Basel III?", "What is AML?"]);
}
