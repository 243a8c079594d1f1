//! Retrieval router and iteration controller.
//!
//! One turn walks the state machine
//! `Dispatch -> AwaitResult -> Assess -> {Done | Refine -> Dispatch}`.
//! The iteration counter is bumped on every `Dispatch` before any retriever
//! runs, so a turn always ends within `max_iterations` rounds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backends::{FailureKind, GraphClient};
use crate::config::{Config, LoopSettings};
use crate::critic::{format_for_synthesis, QualityAssessment, QualityCritic, SynthesisSource};
use crate::lightrag::{FusedContext, GraphExpansion, HybridFuser};
use crate::metrics;
use crate::models::{EntityMentions, GraphContextRecord, Query, RetrievalResult};
use crate::state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieverKind {
    /// Vector search enriched with graph context
    Hybrid,
    Vector,
    /// Entity lookups anchored on the query text
    Graph,
}

impl RetrieverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieverKind::Hybrid => "hybrid",
            RetrieverKind::Vector => "vector",
            RetrieverKind::Graph => "graph",
        }
    }
}

impl fmt::Display for RetrieverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Dispatch,
    AwaitResult,
    Assess,
    Refine,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Score reached the `complete` threshold
    Complete,
    /// Iteration budget ran out first
    Incomplete,
    /// Both backends unreachable
    Unavailable,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Complete => "complete",
            TurnStatus::Incomplete => "incomplete",
            TurnStatus::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub iteration: u32,
    pub from: RouterState,
    pub to: RouterState,
}

/// What one round dispatched and gathered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Round {
    pub iteration: u32,
    pub query: String,
    pub retrievers: Vec<RetrieverKind>,
    pub result_count: usize,
    pub graph_records: usize,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Final query text with its refinement lineage
    pub query: Query,
    pub iterations: u32,
    pub assessment: QualityAssessment,
    /// Results from every round, deduplicated
    pub evidence: Vec<RetrievalResult>,
    pub graph_context: Vec<GraphContextRecord>,
    pub entities: EntityMentions,
    pub rounds: Vec<Round>,
    pub trace: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl TurnOutcome {
    /// Evidence grouped by source, rendered for answer synthesis
    pub fn synthesis_prompt(&self) -> String {
        let mut by_source: BTreeMap<String, Vec<RetrievalResult>> = BTreeMap::new();
        for result in self.evidence.iter().filter(|r| !r.is_error()) {
            by_source
                .entry(result.source().unwrap_or("unknown").to_string())
                .or_default()
                .push(result.clone());
        }
        let sources: Vec<SynthesisSource> = by_source
            .into_iter()
            .map(|(tool, results)| SynthesisSource { tool, results })
            .collect();
        format_for_synthesis(&self.query.original, &sources, self.note.as_deref())
    }
}

/// Output of the retrievers dispatched in one round
#[derive(Debug, Default)]
struct RoundOutput {
    results: Vec<(RetrieverKind, Vec<RetrievalResult>)>,
    graph_context: Vec<GraphContextRecord>,
    entities: EntityMentions,
    vector_unreachable: bool,
}

impl RoundOutput {
    fn from_fused(kind: RetrieverKind, context: FusedContext) -> Self {
        let vector_unreachable = context
            .vector_error
            .as_ref()
            .is_some_and(|e| e.kind == FailureKind::Transport);
        Self {
            results: vec![(kind, context.evidence())],
            graph_context: context.graph_context,
            entities: context.entities_mentioned,
            vector_unreachable,
        }
    }

    fn add_graph(&mut self, entities: EntityMentions, expansion: GraphExpansion) {
        let results = expansion
            .records
            .iter()
            .map(GraphContextRecord::to_result)
            .collect();
        self.results.push((RetrieverKind::Graph, results));
        self.graph_context.extend(expansion.records);
        self.entities.merge(&entities);
    }
}

pub struct Router {
    fuser: Arc<HybridFuser>,
    graph: Arc<GraphClient>,
    critic: QualityCritic,
    settings: LoopSettings,
}

impl Router {
    pub fn new(
        fuser: Arc<HybridFuser>,
        graph: Arc<GraphClient>,
        critic: QualityCritic,
        settings: LoopSettings,
    ) -> Self {
        Self {
            fuser,
            graph,
            critic,
            settings,
        }
    }

    pub fn from_config(
        fuser: Arc<HybridFuser>,
        graph: Arc<GraphClient>,
        critic: QualityCritic,
        config: &Config,
    ) -> Self {
        Self::new(fuser, graph, critic, config.agentic_loop.clone())
    }

    pub fn critic(&self) -> &QualityCritic {
        &self.critic
    }

    /// Retrievers whose hint keyword occurs in `text`; hybrid when none match
    /// or a hybrid hint matches.
    pub fn select_retrievers(&self, text: &str) -> Vec<RetrieverKind> {
        let lower = text.to_lowercase();
        let mut selected: Vec<RetrieverKind> = Vec::new();
        for (keyword, kind) in &self.settings.routing_hints {
            if lower.contains(keyword.as_str()) && !selected.contains(kind) {
                selected.push(*kind);
            }
        }
        if selected.is_empty() || selected.contains(&RetrieverKind::Hybrid) {
            return vec![RetrieverKind::Hybrid];
        }
        selected.sort();
        selected
    }

    async fn graph_retrieve(&self, text: &str) -> (EntityMentions, GraphExpansion) {
        let mentions = self.fuser.extractor().extract_text(text);
        if mentions.is_empty() {
            debug!("No entity mentions in query, skipping graph lookups");
            return (mentions, GraphExpansion::default());
        }
        let settings = self.fuser.settings();
        let expansion = self
            .fuser
            .expander()
            .expand(
                &mentions,
                settings.max_entity_lookups,
                settings.max_connections_per_entity,
            )
            .await;
        (mentions, expansion)
    }

    async fn dispatch(&self, text: &str, retrievers: &[RetrieverKind]) -> RoundOutput {
        let top_k = self.settings.top_k;
        let wants_vector = retrievers.contains(&RetrieverKind::Vector);
        let wants_graph = retrievers.contains(&RetrieverKind::Graph);

        if retrievers.contains(&RetrieverKind::Hybrid) {
            let context = self.fuser.fuse(text, top_k, true).await;
            return RoundOutput::from_fused(RetrieverKind::Hybrid, context);
        }

        match (wants_vector, wants_graph) {
            (true, true) => {
                let (context, (entities, expansion)) = tokio::join!(
                    self.fuser.fuse(text, top_k, false),
                    self.graph_retrieve(text)
                );
                let mut output = RoundOutput::from_fused(RetrieverKind::Vector, context);
                output.add_graph(entities, expansion);
                output
            }
            (true, false) => {
                let context = self.fuser.fuse(text, top_k, false).await;
                RoundOutput::from_fused(RetrieverKind::Vector, context)
            }
            _ => {
                let (entities, expansion) = self.graph_retrieve(text).await;
                let mut output = RoundOutput::default();
                output.add_graph(entities, expansion);
                output
            }
        }
    }

    /// Run one question through retrieval and assessment rounds
    pub async fn run_turn(&self, state: &mut SessionState, question: &str) -> TurnOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();
        metrics::record_turn_start();
        state.begin_turn(question);

        let max_iterations = self.settings.max_iterations.max(1);
        let mut query = Query::new(question);
        let mut current = RouterState::Dispatch;
        let mut trace: Vec<Transition> = Vec::new();
        let mut rounds: Vec<Round> = Vec::new();

        let mut iteration = 0u32;
        let mut retrievers: Vec<RetrieverKind> = Vec::new();
        let mut output = RoundOutput::default();
        let mut evidence: Vec<RetrievalResult> = Vec::new();
        let mut graph_context: Vec<GraphContextRecord> = Vec::new();
        let mut entities = EntityMentions::new();
        let mut assessment: Option<QualityAssessment> = None;
        let mut status = TurnStatus::Incomplete;

        while current != RouterState::Done {
            let next = match current {
                RouterState::Dispatch => {
                    iteration = state.increment_iteration();
                    retrievers = self.select_retrievers(&query.text);
                    info!(
                        iteration,
                        query = %query.text,
                        retrievers = ?retrievers,
                        "Dispatching retrieval round"
                    );
                    RouterState::AwaitResult
                }
                RouterState::AwaitResult => {
                    output = self.dispatch(&query.text, &retrievers).await;
                    RouterState::Assess
                }
                RouterState::Assess => {
                    for (_, results) in &output.results {
                        for result in results {
                            if !evidence.contains(result) {
                                evidence.push(result.clone());
                            }
                        }
                    }
                    for record in &output.graph_context {
                        if !graph_context.contains(record) {
                            graph_context.push(record.clone());
                        }
                    }
                    entities.merge(&output.entities);
                    state.merge_entities(&output.entities);

                    let unavailable = output.vector_unreachable && !self.graph.ping().await;
                    let current_assessment = self.critic.review(&query.original, &evidence).await;
                    state.update_quality(&current_assessment);

                    for (kind, results) in &output.results {
                        state.record_retrieval(
                            kind.as_str(),
                            &query.text,
                            results,
                            Some(current_assessment.score),
                        );
                    }
                    rounds.push(Round {
                        iteration,
                        query: query.text.clone(),
                        retrievers: retrievers.clone(),
                        result_count: output
                            .results
                            .iter()
                            .map(|(_, r)| r.iter().filter(|r| !r.is_error()).count())
                            .sum(),
                        graph_records: output.graph_context.len(),
                        score: current_assessment.score,
                    });
                    info!(
                        iteration,
                        score = current_assessment.score,
                        verdict = current_assessment.verdict.as_str(),
                        "Round assessed"
                    );

                    let complete =
                        current_assessment.score >= self.critic.thresholds().complete;
                    assessment = Some(current_assessment);

                    if unavailable {
                        warn!("Vector and graph backends are both unreachable");
                        status = TurnStatus::Unavailable;
                        RouterState::Done
                    } else if complete {
                        status = TurnStatus::Complete;
                        RouterState::Done
                    } else if iteration >= max_iterations {
                        status = TurnStatus::Incomplete;
                        RouterState::Done
                    } else {
                        RouterState::Refine
                    }
                }
                RouterState::Refine => {
                    let followup = assessment
                        .as_ref()
                        .and_then(|a| a.followup_query.clone())
                        .filter(|q| !q.trim().is_empty())
                        .unwrap_or_else(|| query.original.clone());
                    debug!(from = %query.text, to = %followup, "Refining query");
                    query = query.refine(followup);
                    state.set_current_query(&query.text);
                    RouterState::Dispatch
                }
                RouterState::Done => RouterState::Done,
            };
            trace.push(Transition {
                iteration,
                from: current,
                to: next,
            });
            current = next;
        }

        state.end_turn();

        let note = match status {
            TurnStatus::Complete => None,
            TurnStatus::Incomplete => Some(format!(
                "Iteration budget of {} rounds exhausted; the answer may be incomplete.",
                max_iterations
            )),
            TurnStatus::Unavailable => Some(
                "Vector and graph backends are unreachable; no answer could be retrieved."
                    .to_string(),
            ),
        };

        // Assess runs at least once before Done
        let assessment = assessment.unwrap_or_else(|| self.critic.assess(question, &evidence));

        metrics::record_turn_result(timer.elapsed(), status.as_str());
        info!(
            status = status.as_str(),
            iterations = iteration,
            score = assessment.score,
            "Turn finished"
        );

        TurnOutcome {
            status,
            query,
            iterations: iteration,
            assessment,
            evidence,
            graph_context,
            entities,
            rounds,
            trace,
            note,
            started_at,
        }
    }
}
