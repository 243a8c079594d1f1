//! `ask`: run one question through the retrieval loop

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::router::{Router, TurnOutcome};
use crate::state::{AppMetadata, StateSnapshot, StateStore};

pub struct AskArgs {
    pub question: String,
    pub user_id: String,
    /// Persist user and application scopes here between runs
    pub state_file: Option<PathBuf>,
    /// Print the synthesis prompt instead of the JSON report
    pub synthesis: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    outcome: &'a TurnOutcome,
    state: StateSnapshot,
}

/// Answer the question and render the output
pub async fn run(router: &Router, config: &Config, args: &AskArgs) -> anyhow::Result<String> {
    let store = match &args.state_file {
        Some(path) => StateStore::load_from(path, AppMetadata::from_config(config))?,
        None => StateStore::from_config(config),
    };

    let mut session = store.session(&args.user_id);
    let outcome = router.run_turn(&mut session, &args.question).await;

    if let Some(path) = &args.state_file {
        store.save_to(path)?;
        info!(path = %path.display(), "State saved");
    }

    if args.synthesis {
        return Ok(outcome.synthesis_prompt());
    }

    let report = Report {
        outcome: &outcome,
        state: session.snapshot(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}
