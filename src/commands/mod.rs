//! Command implementations
//!
//! Each module corresponds to a subcommand in the CLI. [`Pipeline`] wires the
//! configured backends into a router once per process.

pub mod ask;
pub mod graph;
pub mod ingest;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::backends::{
    EmbeddingService, GraphClient, LlamaStackBackend, Neo4jBackend, QdrantBackend, VectorBackend,
    VectorClient,
};
use crate::config::{Config, VectorProvider};
use crate::critic::QualityCritic;
use crate::integrations::OpenAiEvaluator;
use crate::lightrag::{EntityExtractor, GraphExpander, HybridFuser};
use crate::router::Router;

pub use ask::{run as ask_run, AskArgs};
pub use graph::{cypher as cypher_run, named as query_run, schema as schema_run};
pub use ingest::run as ingest_run;

/// Clients and router built from one configuration
pub struct Pipeline {
    pub config: Config,
    pub vector: Arc<VectorClient>,
    pub graph: Arc<GraphClient>,
    pub router: Router,
}

fn vector_backend(config: &Config) -> anyhow::Result<Arc<dyn VectorBackend>> {
    let settings = &config.vector_store;
    match settings.provider {
        VectorProvider::Llamastack => Ok(Arc::new(
            LlamaStackBackend::new(settings).context("Failed to create Llama Stack client")?,
        )),
        VectorProvider::Qdrant => {
            let embeddings = EmbeddingService::new(
                &config.evaluator.api_key,
                &config.evaluator.base_url,
                settings.embedding_model.clone(),
            )?;
            Ok(Arc::new(QdrantBackend::new(&settings.base_url, embeddings)?))
        }
    }
}

impl Pipeline {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let vector = Arc::new(VectorClient::new(vector_backend(&config)?, &config.vector_store));
        let graph = Arc::new(
            GraphClient::new(Arc::new(Neo4jBackend::new(&config.neo4j)), &config.neo4j)
                .with_named_queries(config.specialized_queries.clone()),
        );

        let fuser = HybridFuser::new(
            vector.clone(),
            EntityExtractor::from_config(&config),
            GraphExpander::new(graph.clone(), &config),
            config.graphrag.clone(),
        );

        let mut critic = QualityCritic::from_config(&config);
        if config.evaluator_enabled() {
            critic = critic.with_evaluator(Arc::new(OpenAiEvaluator::new(&config.evaluator)?));
            info!(model = %config.evaluator.model, "Model-based evaluation enabled");
        }

        let router = Router::from_config(Arc::new(fuser), graph.clone(), critic, &config);

        info!(
            provider = ?config.vector_store.provider,
            collection = %vector.collection_id(),
            mode = %vector.mode(),
            "Pipeline ready"
        );

        Ok(Self {
            config,
            vector,
            graph,
            router,
        })
    }
}
