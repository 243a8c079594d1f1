//! Hybrid retrieval: vector search enriched with graph context.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::entity_extractor::EntityExtractor;
use super::graph_expander::GraphExpander;
use crate::backends::{BackendError, SearchMode, VectorClient};
use crate::config::GraphRagSettings;
use crate::models::{EntityMentions, GraphContextRecord, RetrievalResult};

/// Output of [`HybridFuser::fuse`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusedContext {
    pub documents: Vec<RetrievalResult>,
    pub entities_mentioned: EntityMentions,
    pub graph_context: Vec<GraphContextRecord>,
    /// True iff at least one graph record was produced
    pub graphrag_enabled: bool,
    #[serde(skip)]
    pub search_mode: Option<SearchMode>,
    #[serde(skip)]
    pub fell_back: bool,
    #[serde(skip)]
    pub vector_error: Option<BackendError>,
    /// Graph lookups issued
    #[serde(skip)]
    pub graph_lookups: usize,
}

impl FusedContext {
    /// Documents and graph records as one result list for scoring
    pub fn evidence(&self) -> Vec<RetrievalResult> {
        let mut evidence = self.documents.clone();
        evidence.extend(self.graph_context.iter().map(GraphContextRecord::to_result));
        evidence
    }

    pub fn has_usable_documents(&self) -> bool {
        self.documents.iter().any(|d| !d.is_error())
    }
}

/// Combines the vector client, extractor and graph expander
pub struct HybridFuser {
    vector: Arc<VectorClient>,
    extractor: EntityExtractor,
    expander: GraphExpander,
    settings: GraphRagSettings,
}

impl HybridFuser {
    pub fn new(
        vector: Arc<VectorClient>,
        extractor: EntityExtractor,
        expander: GraphExpander,
        settings: GraphRagSettings,
    ) -> Self {
        Self {
            vector,
            extractor,
            expander,
            settings,
        }
    }

    /// Vector search, then graph enrichment anchored on the documents.
    ///
    /// The graph is never queried when enrichment is disabled (by argument or
    /// configuration) or the search produced no usable documents.
    pub async fn fuse(&self, query: &str, top_k: usize, enable_graph: bool) -> FusedContext {
        let outcome = self.vector.search(query, top_k).await;
        let mut context = FusedContext {
            search_mode: Some(outcome.mode),
            fell_back: outcome.fell_back,
            vector_error: outcome.error.clone(),
            ..Default::default()
        };
        context.documents = outcome.into_results();

        if !enable_graph || !self.settings.enable_graph_context {
            debug!("Graph enrichment disabled");
            return context;
        }
        if !context.has_usable_documents() {
            debug!("No usable documents, skipping graph enrichment");
            return context;
        }

        context.entities_mentioned = self.extractor.extract(&context.documents);
        if context.entities_mentioned.is_empty() {
            return context;
        }

        let expansion = self
            .expander
            .expand(
                &context.entities_mentioned,
                self.settings.max_entity_lookups,
                self.settings.max_connections_per_entity,
            )
            .await;

        context.graph_lookups = expansion.lookups;
        context.graph_context = expansion.records;
        context.graphrag_enabled = !context.graph_context.is_empty();

        info!(
            documents = context.documents.len(),
            mentions = context.entities_mentioned.len(),
            records = context.graph_context.len(),
            "Hybrid retrieval complete"
        );
        context
    }

    pub fn extractor(&self) -> &EntityExtractor {
        &self.extractor
    }

    pub fn expander(&self) -> &GraphExpander {
        &self.expander
    }

    pub fn settings(&self) -> &GraphRagSettings {
        &self.settings
    }
}
