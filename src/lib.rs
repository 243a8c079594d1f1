//! Hybrid GraphRAG Retrieval Library
//!
//! This library provides:
//! - Vector and property-graph backend clients with structured failures
//! - Entity extraction and bounded graph-context expansion
//! - Hybrid fusion of documents with graph neighborhoods
//! - A heuristic answer critic with optional model-based escalation
//! - Scoped session state
//! - A router that iterates retrieval until the answer is good enough

pub mod backends;
pub mod config;
pub mod critic;
pub mod error;
pub mod integrations;
pub mod lightrag;
pub mod metrics;
pub mod models;
pub mod router;
pub mod state;

// Re-export common types
pub use config::Config;
pub use critic::{QualityAssessment, QualityCritic, Verdict};
pub use error::{Error, Result};
pub use models::{Query, RetrievalResult};
pub use router::{RetrieverKind, Router, TurnOutcome, TurnStatus};
pub use state::{SessionState, StateScope, StateStore};

// Commands module uses re-exported types, so it must be declared after the re-exports
pub mod commands;
