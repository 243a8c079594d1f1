//! GraphRAG CLI - main entry point

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use graphrag_router::commands::{self, AskArgs, Pipeline};
use graphrag_router::{metrics, Config};

#[derive(Parser)]
#[command(name = "graphrag")]
#[command(about = "Hybrid vector + knowledge-graph retrieval", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./config.yml or ../config.yml)
    #[arg(short, long, env = "GRAPHRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Address to expose Prometheus metrics (e.g., 0.0.0.0:9898)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question with iterative hybrid retrieval
    Ask {
        question: String,

        /// User id for user-scoped state
        #[arg(short, long, default_value = "default")]
        user_id: String,

        /// JSON file keeping user and application state between runs
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Print the synthesis prompt instead of the JSON report
        #[arg(long, default_value_t = false)]
        synthesis: bool,
    },

    /// Insert JSON-lines documents into the vector store
    Ingest {
        /// File with one `{"content", "metadata"}` object or string per line
        path: PathBuf,
    },

    /// Print the graph schema
    Schema,

    /// Run a configured graph query by name (lists them without --name)
    Query {
        #[arg(short, long)]
        name: Option<String>,

        /// Query parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,
    },

    /// Run an ad-hoc read statement against the graph
    Cypher {
        statement: String,

        /// Statement parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env for local development
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("graphrag_router=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr.as_deref() {
        match addr.parse::<SocketAddr>() {
            Ok(socket) => metrics::spawn_metrics_server(socket),
            Err(err) => warn!(%addr, "Invalid metrics address: {}", err),
        }
    }

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::new(),
    };
    let pipeline = Pipeline::build(config)?;

    let output = match cli.command {
        Commands::Ask {
            question,
            user_id,
            state_file,
            synthesis,
        } => {
            let args = AskArgs {
                question,
                user_id,
                state_file,
                synthesis,
            };
            commands::ask_run(&pipeline.router, &pipeline.config, &args).await?
        }
        Commands::Ingest { path } => {
            let stored = commands::ingest_run(&pipeline.vector, &path).await?;
            format!("Stored {} chunks in {}", stored, pipeline.vector.collection_id())
        }
        Commands::Schema => commands::schema_run(&pipeline.graph).await?,
        Commands::Query { name, params } => {
            commands::query_run(&pipeline.graph, name.as_deref(), params.as_deref()).await?
        }
        Commands::Cypher { statement, params } => {
            commands::cypher_run(&pipeline.graph, &statement, params.as_deref()).await?
        }
    };

    println!("{}", output);
    Ok(())
}
