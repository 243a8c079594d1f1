//! LightRAG-style hybrid retrieval over an external vector store and a
//! property graph.
//!
//! Documents come from semantic search; literal entity patterns found in
//! them anchor targeted graph lookups whose neighborhoods are fused back
//! into the context:
//! - `entity_extractor`: pattern-table matching over retrieved text
//! - `graph_expander`: bounded, parameterized entity lookups
//! - `fuser`: vector search first, graph enrichment only when anchored

pub mod entity_extractor;
pub mod fuser;
pub mod graph_expander;

pub use entity_extractor::{extract, EntityExtractor};
pub use fuser::{FusedContext, HybridFuser};
pub use graph_expander::{GraphExpander, GraphExpansion};
