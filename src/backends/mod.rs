//! Backend clients for the document vector store and the property graph.
//!
//! Every backend call returns a value: failures are reported as
//! [`BackendError`] and never cross a client boundary as a panic or as the
//! crate-level [`crate::Error`].

pub mod embeddings;
pub mod graph;
pub mod llamastack;
pub mod neo4j;
pub mod qdrant;
pub mod vector;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use embeddings::EmbeddingService;
pub use graph::{
    validate_statement, GraphBackend, GraphClient, GraphSchema, LabelSchema, Params, Row,
    ValidatedStatement,
};
pub use llamastack::LlamaStackBackend;
pub use neo4j::Neo4jBackend;
pub use qdrant::QdrantBackend;
pub use vector::{
    Chunk, RankingOptions, SearchMode, VectorBackend, VectorClient, VectorQuery,
    VectorSearchOutcome,
};

/// How a backend call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Backend unreachable, timed out or temporarily unavailable
    Transport,
    /// Backend rejected a feature (e.g. hybrid search)
    Unsupported,
    /// Statement is malformed or references unknown schema
    QueryShape,
    Other,
}

/// Structured failure of a backend call
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{error_type}: {message}")]
pub struct BackendError {
    pub kind: FailureKind,
    /// Backend-specific error name, e.g. `ServiceUnavailable`
    pub error_type: String,
    pub message: String,
    /// Actionable suggestions for the caller
    pub hints: Vec<String>,
}

impl BackendError {
    pub fn new(kind: FailureKind, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: error_type.into(),
            message: message.into(),
            hints: Vec::new(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, "ServiceUnavailable", message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            FailureKind::Transport,
            "Timeout",
            format!("backend call timed out after {:?}", after),
        )
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unsupported, "Unsupported", message)
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transport
    }
}
