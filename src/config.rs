//! Configuration for the retrieval backends, GraphRAG enrichment, the answer
//! critic and the agentic loop.
//!
//! Loads configuration from config.yml. String values written as `${VAR}` are
//! resolved from the environment, and a fixed set of environment variables
//! override the file (see [`Config::load_from_file`]).

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::backends::vector::SearchMode;
use crate::error::{Error, Result};
use crate::router::RetrieverKind;

/// Default constants (fallback if config.yml not found)
pub const CONFIG_FILE: &str = "config.yml";
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_MAX_ENTITY_LOOKUPS: usize = 10;
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub const DEFAULT_RANKING_ALPHA: f32 = 0.7;
pub const DEFAULT_GRAPH_RETRIES: u32 = 3;
pub const DEFAULT_NEO4J_URI: &str = "bolt://localhost:7687";

/// Which vector backend implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorProvider {
    #[default]
    Llamastack,
    Qdrant,
}

/// How a lookup route compares the mention against node properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Case-insensitive substring match
    #[default]
    Contains,
    /// Case-insensitive equality
    Exact,
}

/// Graph lookup routing for one entity category.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LookupRoute {
    /// Restrict candidate nodes to these labels (empty = any label)
    pub labels: Vec<String>,
    /// Node properties tested against the mention
    pub match_properties: Vec<String>,
    pub match_mode: MatchMode,
}

impl Default for LookupRoute {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            match_properties: vec!["name".to_string()],
            match_mode: MatchMode::Contains,
        }
    }
}

/// Vetted parameterized graph statement runnable by name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NamedQuery {
    #[serde(alias = "cypher")]
    pub statement: String,
    #[serde(default)]
    pub description: String,
    /// Parameters the statement expects
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorStoreSettings {
    pub provider: VectorProvider,
    pub base_url: String,
    pub vector_store_id: String,
    pub search_mode: SearchMode,
    pub ranker_type: String,
    pub ranking_alpha: f32,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
    pub embedding_model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neo4jSettings {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub timeout_secs: u64,
    pub schema_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphRagSettings {
    pub enable_graph_context: bool,
    pub max_entity_lookups: usize,
    pub max_connections_per_entity: usize,
    /// category -> literal patterns
    pub entity_patterns: BTreeMap<String, Vec<String>>,
    /// category -> lookup route; the `default` key applies to unrouted categories
    pub lookup_routes: BTreeMap<String, LookupRoute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CriticThresholds {
    pub retry: u32,
    pub partial: u32,
    pub complete: u32,
}

impl Default for CriticThresholds {
    fn default() -> Self {
        Self {
            retry: 40,
            partial: 60,
            complete: 80,
        }
    }
}

/// Points awarded by the heuristic critic.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CriticWeights {
    pub has_results: u32,
    pub list_many: u32,
    pub list_some: u32,
    pub specific: u32,
    pub keywords: u32,
}

impl Default for CriticWeights {
    fn default() -> Self {
        Self {
            has_results: 40,
            list_many: 20,
            list_some: 10,
            specific: 20,
            keywords: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriticSettings {
    pub thresholds: CriticThresholds,
    pub weights: CriticWeights,
    /// Escalate ambiguous scores to the model-based evaluator
    pub escalate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub top_k: usize,
    /// question keyword -> retriever to dispatch
    pub routing_hints: BTreeMap<String, RetrieverKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request timeout for the chat-completions call
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub name: String,
    pub description: String,
}

/// YAML config structures
#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    app: Option<YamlApp>,
    vector_store: Option<YamlVectorStore>,
    neo4j: Option<YamlNeo4j>,
    graphrag: Option<YamlGraphRag>,
    answer_critic: Option<YamlCritic>,
    agentic_loop: Option<YamlLoop>,
    evaluator: Option<YamlEvaluator>,
    #[serde(default)]
    specialized_queries: BTreeMap<String, NamedQuery>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlApp {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlVectorStore {
    provider: Option<VectorProvider>,
    base_url: Option<String>,
    vector_store_id: Option<String>,
    search_mode: Option<String>,
    ranker_type: Option<String>,
    ranking_alpha: Option<f32>,
    verify_ssl: Option<bool>,
    timeout_secs: Option<u64>,
    embedding_model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlNeo4j {
    uri: Option<String>,
    username: Option<String>,
    password: Option<String>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    timeout_secs: Option<u64>,
    schema_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlGraphRag {
    enable_graph_context: Option<bool>,
    max_entity_lookups: Option<usize>,
    max_connections_per_entity: Option<usize>,
    #[serde(default)]
    entity_patterns: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    lookup_routes: BTreeMap<String, LookupRoute>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlCritic {
    thresholds: Option<CriticThresholds>,
    weights: Option<CriticWeights>,
    escalate: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlLoop {
    max_iterations: Option<u32>,
    top_k: Option<usize>,
    #[serde(default)]
    routing_hints: BTreeMap<String, RetrieverKind>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlEvaluator {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
}

/// Main configuration struct
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub app: AppSettings,
    pub vector_store: VectorStoreSettings,
    pub neo4j: Neo4jSettings,
    pub graphrag: GraphRagSettings,
    pub critic: CriticSettings,
    pub agentic_loop: LoopSettings,
    pub evaluator: EvaluatorSettings,
    /// name -> graph statement template
    pub specialized_queries: BTreeMap<String, NamedQuery>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Load configuration from config.yml or use defaults
    /// Environment variables take precedence over config.yml values
    pub fn new() -> Self {
        Self::load_from_file(CONFIG_FILE)
            .or_else(|_| Self::load_from_file(format!("../{}", CONFIG_FILE)))
            .unwrap_or_else(|_| Self::from_yaml(YamlConfig::default()))
    }

    /// Resolve a value: prefer env var if config value looks like ${VAR}
    fn resolve_env_string(value: Option<String>, env_key: &str) -> Option<String> {
        if let Some(ref v) = value {
            if let Some(var_name) = v.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
                if let Ok(env_val) = std::env::var(var_name) {
                    return Some(env_val);
                }
            }
        }
        if let Ok(env_val) = std::env::var(env_key) {
            if !env_val.is_empty() {
                return Some(env_val);
            }
        }
        value.filter(|v| !(v.starts_with("${") && v.ends_with('}')))
    }

    /// Resolve a bool env override ("true"/"1"/"yes" or "false"/"0"/"no")
    fn resolve_env_bool(value: Option<bool>, env_key: &str) -> Option<bool> {
        match std::env::var(env_key).map(|v| v.to_lowercase()) {
            Ok(v) if matches!(v.as_str(), "true" | "1" | "yes") => Some(true),
            Ok(v) if matches!(v.as_str(), "false" | "0" | "no") => Some(false),
            _ => value,
        }
    }

    /// Load .env file into environment variables using dotenvy
    fn load_dotenv() {
        if dotenvy::dotenv().is_err() {
            let _ = dotenvy::from_filename("../.env");
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_dotenv();

        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text (env overrides still apply)
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let yaml: YamlConfig = if content.trim().is_empty() {
            YamlConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))?
        };

        Ok(Self::from_yaml(yaml))
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        let app = yaml.app.unwrap_or_default();
        let vs = yaml.vector_store.unwrap_or_default();
        let neo4j = yaml.neo4j.unwrap_or_default();
        let graphrag = yaml.graphrag.unwrap_or_default();
        let critic = yaml.answer_critic.unwrap_or_default();
        let agentic_loop = yaml.agentic_loop.unwrap_or_default();
        let evaluator = yaml.evaluator.unwrap_or_default();

        let search_mode = Self::resolve_env_string(vs.search_mode, "VECTOR_STORE_SEARCH_MODE")
            .and_then(|mode| mode.parse::<SearchMode>().ok())
            .unwrap_or_default();

        let ranking_alpha = std::env::var("VECTOR_STORE_RANKING_ALPHA")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .or(vs.ranking_alpha)
            .filter(|alpha| alpha.is_finite())
            .unwrap_or(DEFAULT_RANKING_ALPHA)
            .clamp(0.0, 1.0);

        let mut lookup_routes = graphrag.lookup_routes;
        lookup_routes.entry("default".to_string()).or_default();

        let thresholds = critic.thresholds.unwrap_or_default();

        Self {
            app: AppSettings {
                name: app.name.unwrap_or_else(|| "graphrag".to_string()),
                description: app.description.unwrap_or_else(|| {
                    "Hybrid vector + knowledge graph question answering".to_string()
                }),
            },
            vector_store: VectorStoreSettings {
                provider: vs.provider.unwrap_or_default(),
                base_url: Self::resolve_env_string(vs.base_url, "LLAMASTACK_BASE_URL")
                    .unwrap_or_default(),
                vector_store_id: Self::resolve_env_string(vs.vector_store_id, "VECTOR_STORE_ID")
                    .unwrap_or_else(|| "docs_store".to_string()),
                search_mode,
                ranker_type: vs.ranker_type.unwrap_or_else(|| "weighted".to_string()),
                ranking_alpha,
                verify_ssl: Self::resolve_env_bool(vs.verify_ssl, "VECTOR_STORE_VERIFY_SSL")
                    .unwrap_or(true),
                timeout_secs: vs.timeout_secs.unwrap_or(30),
                embedding_model: vs
                    .embedding_model
                    .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            },
            neo4j: Neo4jSettings {
                uri: Self::resolve_env_string(neo4j.uri, "NEO4J_URI")
                    .unwrap_or_else(|| DEFAULT_NEO4J_URI.to_string()),
                username: Self::resolve_env_string(neo4j.username, "NEO4J_USERNAME")
                    .unwrap_or_else(|| "neo4j".to_string()),
                password: Self::resolve_env_string(neo4j.password, "NEO4J_PASSWORD")
                    .unwrap_or_default(),
                max_retries: neo4j.max_retries.unwrap_or(DEFAULT_GRAPH_RETRIES).max(1),
                base_delay_ms: neo4j.base_delay_ms.unwrap_or(500),
                timeout_secs: neo4j.timeout_secs.unwrap_or(30),
                schema_cache_ttl_secs: neo4j.schema_cache_ttl_secs.unwrap_or(300),
            },
            graphrag: GraphRagSettings {
                enable_graph_context: graphrag.enable_graph_context.unwrap_or(true),
                max_entity_lookups: graphrag
                    .max_entity_lookups
                    .unwrap_or(DEFAULT_MAX_ENTITY_LOOKUPS),
                max_connections_per_entity: graphrag
                    .max_connections_per_entity
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS),
                entity_patterns: graphrag.entity_patterns,
                lookup_routes,
            },
            critic: CriticSettings {
                thresholds,
                weights: critic.weights.unwrap_or_default(),
                escalate: critic.escalate.unwrap_or(true),
            },
            agentic_loop: LoopSettings {
                max_iterations: agentic_loop
                    .max_iterations
                    .unwrap_or(DEFAULT_MAX_ITERATIONS)
                    .max(1),
                top_k: agentic_loop.top_k.unwrap_or(DEFAULT_TOP_K).max(1),
                routing_hints: agentic_loop
                    .routing_hints
                    .into_iter()
                    .map(|(keyword, kind)| (keyword.to_lowercase(), kind))
                    .collect(),
            },
            evaluator: EvaluatorSettings {
                api_key: Self::resolve_env_string(evaluator.api_key, "OPENAI_API_KEY")
                    .unwrap_or_default(),
                base_url: Self::resolve_env_string(evaluator.base_url, "OPENAI_API_BASE")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model: evaluator.model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
                temperature: evaluator.temperature.unwrap_or(0.1),
                max_tokens: evaluator.max_tokens.unwrap_or(400),
                timeout_secs: evaluator.timeout_secs.unwrap_or(30).max(1),
            },
            specialized_queries: yaml.specialized_queries,
        }
    }

    /// Lookup route for an entity category (falls back to `default`)
    pub fn route_for(&self, category: &str) -> LookupRoute {
        self.graphrag
            .lookup_routes
            .get(category)
            .or_else(|| self.graphrag.lookup_routes.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a model-based evaluator can be built
    pub fn evaluator_enabled(&self) -> bool {
        self.critic.escalate && !self.evaluator.api_key.trim().is_empty()
    }
}
