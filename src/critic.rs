//! Answer quality critic.
//!
//! [`QualityCritic::assess`] is a fast, pure heuristic. Scores that land
//! between the `retry` and `complete` thresholds are ambiguous, and
//! [`QualityCritic::review`] can escalate those to a model-based
//! [`AnswerEvaluator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, CriticSettings, CriticThresholds, CriticWeights};
use crate::models::{RetrievalResult, META_INJECTED};
use crate::router::RetrieverKind;
use crate::Result;

/// Words that mark a question as asking for a list
const LIST_WORDS: &[&str] = &["all", "list"];
const LIST_PHRASES: &[&str] = &["what are", "show me"];

/// Question scaffolding dropped when rewriting follow-ups
const STOPWORDS: &[&str] = &[
    "what", "which", "who", "whom", "whose", "when", "where", "why", "how", "is", "are", "was",
    "were", "the", "a", "an", "of", "for", "to", "in", "on", "and", "or", "do", "does", "did",
    "can", "could", "show", "me", "list", "all", "tell", "about", "there", "their", "with", "that",
    "this", "these", "those", "please", "give",
];

/// Most retrievers suggested per assessment
const MAX_SUGGESTIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Complete,
    Partial,
    Retry,
    Insufficient,
}

impl Verdict {
    /// Partial and retry scores warrant a model-based second opinion
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Verdict::Partial | Verdict::Retry)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Complete => "complete",
            Verdict::Partial => "partial",
            Verdict::Retry => "retry",
            Verdict::Insufficient => "insufficient",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// 0..=100
    pub score: u32,
    pub verdict: Verdict,
    pub needs_followup: bool,
    pub followup_query: Option<String>,
    /// Non-error results considered
    pub result_count: usize,
    pub suggested_retrievers: Vec<RetrieverKind>,
    /// Question keywords absent from the results
    pub missing_keywords: Vec<String>,
    /// Score came from the model-based evaluator
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Model-based evaluation of an ambiguous answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: u32,
    #[serde(default)]
    pub needs_followup: bool,
    #[serde(default)]
    pub followup_query: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait AnswerEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        question: &str,
        results: &[RetrievalResult],
        heuristic: &QualityAssessment,
    ) -> Result<Evaluation>;
}

/// Lowercased question tokens longer than 3 characters, in order, deduplicated
pub fn question_keywords(question: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for token in tokens(question) {
        if token.chars().count() > 3 && !keywords.contains(&token) {
            keywords.push(token);
        }
    }
    keywords
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
}

fn is_list_question(question: &str) -> bool {
    let lower = question.to_lowercase();
    let normalized = tokens(&lower).collect::<Vec<_>>().join(" ");
    tokens(&lower).any(|t| LIST_WORDS.contains(&t.as_str()))
        || LIST_PHRASES.iter().any(|p| normalized.contains(p))
}

/// Lowercased text of the usable results, used for keyword matching.
/// Client-injected metadata is left out so a question mentioning "vector" or
/// "source" does not match every result.
fn serialize_results(results: &[&RetrievalResult]) -> String {
    let mut text = String::new();
    for r in results {
        text.push_str(&r.content);
        text.push('\n');
        let metadata: Map<String, Value> = r
            .metadata
            .iter()
            .filter(|(key, _)| !META_INJECTED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !metadata.is_empty() {
            // Serializing a Map<String, Value> cannot fail
            text.push_str(&serde_json::to_string(&metadata).unwrap_or_default());
            text.push('\n');
        }
    }
    text.to_lowercase()
}

pub struct QualityCritic {
    thresholds: CriticThresholds,
    weights: CriticWeights,
    escalate: bool,
    routing_hints: BTreeMap<String, RetrieverKind>,
    evaluator: Option<Arc<dyn AnswerEvaluator>>,
}

impl QualityCritic {
    pub fn new(settings: &CriticSettings, routing_hints: BTreeMap<String, RetrieverKind>) -> Self {
        let mut ordered = [
            settings.thresholds.retry,
            settings.thresholds.partial,
            settings.thresholds.complete,
        ];
        ordered.sort_unstable();
        if ordered
            != [
                settings.thresholds.retry,
                settings.thresholds.partial,
                settings.thresholds.complete,
            ]
        {
            warn!(?settings.thresholds, "Critic thresholds out of order, sorting them");
        }

        Self {
            thresholds: CriticThresholds {
                retry: ordered[0],
                partial: ordered[1],
                complete: ordered[2],
            },
            weights: settings.weights,
            escalate: settings.escalate,
            routing_hints,
            evaluator: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.critic, config.agentic_loop.routing_hints.clone())
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn AnswerEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn thresholds(&self) -> CriticThresholds {
        self.thresholds
    }

    pub fn classify(&self, score: u32) -> Verdict {
        if score >= self.thresholds.complete {
            Verdict::Complete
        } else if score >= self.thresholds.partial {
            Verdict::Partial
        } else if score >= self.thresholds.retry {
            Verdict::Retry
        } else {
            Verdict::Insufficient
        }
    }

    /// Retrievers whose routing keyword appears in the question
    pub fn suggest_retrievers(&self, question: &str) -> Vec<RetrieverKind> {
        let lower = question.to_lowercase();
        let mut suggested = Vec::new();
        for (keyword, kind) in &self.routing_hints {
            if lower.contains(keyword.as_str()) && !suggested.contains(kind) {
                suggested.push(*kind);
            }
        }
        suggested.truncate(MAX_SUGGESTIONS);
        suggested
    }

    /// Heuristic assessment; deterministic for fixed inputs and settings
    pub fn assess(&self, question: &str, results: &[RetrievalResult]) -> QualityAssessment {
        let usable: Vec<&RetrievalResult> = results.iter().filter(|r| !r.is_error()).collect();
        let count = usable.len();
        let w = &self.weights;

        let mut score = 0u32;
        if count > 0 {
            score += w.has_results;
        }

        if is_list_question(question) {
            if count >= 3 {
                score += w.list_many;
            } else if count >= 1 {
                score += w.list_some;
            }
        } else if count >= 1 {
            score += w.specific;
        }

        let keywords = question_keywords(question);
        let serialized = if count > 0 {
            serialize_results(&usable)
        } else {
            String::new()
        };
        let (found, missing): (Vec<String>, Vec<String>) = keywords
            .iter()
            .cloned()
            .partition(|kw| serialized.contains(kw.as_str()));
        if !keywords.is_empty() {
            let ratio = found.len() as f64 / keywords.len() as f64;
            score += (ratio * w.keywords as f64) as u32;
        }

        let score = score.min(100);
        let verdict = self.classify(score);
        let needs_followup = score < self.thresholds.complete;
        let followup_query =
            needs_followup.then(|| followup_for(question, count, &missing));

        debug!(score, verdict = verdict.as_str(), count, "Heuristic assessment");

        QualityAssessment {
            score,
            verdict,
            needs_followup,
            followup_query,
            result_count: count,
            suggested_retrievers: self.suggest_retrievers(question),
            missing_keywords: missing,
            escalated: false,
            reasoning: None,
        }
    }

    /// Heuristic assessment, escalated to the evaluator when ambiguous.
    /// Evaluator failures keep the heuristic result.
    pub async fn review(&self, question: &str, results: &[RetrievalResult]) -> QualityAssessment {
        let heuristic = self.assess(question, results);
        if !heuristic.verdict.is_ambiguous() || !self.escalate {
            return heuristic;
        }
        let Some(evaluator) = &self.evaluator else {
            return heuristic;
        };

        match evaluator.evaluate(question, results, &heuristic).await {
            Ok(evaluation) => {
                let score = evaluation.score.min(100);
                let verdict = self.classify(score);
                let needs_followup = score < self.thresholds.complete;
                info!(
                    heuristic = heuristic.score,
                    evaluated = score,
                    verdict = verdict.as_str(),
                    "Escalated assessment"
                );
                QualityAssessment {
                    score,
                    verdict,
                    needs_followup,
                    followup_query: if needs_followup {
                        evaluation
                            .followup_query
                            .filter(|q| !q.trim().is_empty())
                            .or_else(|| heuristic.followup_query.clone())
                    } else {
                        None
                    },
                    escalated: true,
                    reasoning: evaluation.reasoning,
                    ..heuristic
                }
            }
            Err(err) => {
                warn!("Evaluator failed, keeping heuristic score: {}", err);
                heuristic
            }
        }
    }
}

fn significant_terms(question: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in tokens(question) {
        if !STOPWORDS.contains(&token.as_str()) && !terms.contains(&token) {
            terms.push(token);
        }
    }
    terms
}

/// Deterministic follow-up query.
///
/// Missing keywords come first so the next round targets them; with no
/// results at all the question is reduced to its significant terms.
pub fn followup_for(question: &str, result_count: usize, missing: &[String]) -> String {
    let terms = significant_terms(question);

    if result_count == 0 {
        return if terms.is_empty() {
            question.trim().to_string()
        } else {
            format!("{} overview", terms.join(" "))
        };
    }

    if !missing.is_empty() {
        let mut focused: Vec<String> = missing
            .iter()
            .filter(|kw| !STOPWORDS.contains(&kw.as_str()))
            .cloned()
            .collect();
        focused.extend(terms.into_iter().filter(|t| !missing.contains(t)));
        if focused.is_empty() {
            return question.trim().to_string();
        }
        return focused.join(" ");
    }

    if terms.is_empty() {
        question.trim().to_string()
    } else {
        format!("all {} details", terms.join(" "))
    }
}

/// One retriever's output for synthesis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisSource {
    pub tool: String,
    pub results: Vec<RetrievalResult>,
}

/// Most items rendered per source
const SYNTHESIS_ITEMS_PER_SOURCE: usize = 5;

/// Render gathered evidence as a synthesis prompt body
pub fn format_for_synthesis(
    question: &str,
    sources: &[SynthesisSource],
    notes: Option<&str>,
) -> String {
    let mut output = vec![
        format!("Question: {}", question),
        String::new(),
        "Retrieved Information:".to_string(),
    ];

    for (i, source) in sources.iter().enumerate() {
        output.push(format!("\n--- Source {} ({}) ---", i + 1, source.tool));
        for item in source.results.iter().take(SYNTHESIS_ITEMS_PER_SOURCE) {
            output.push(
                serde_json::to_string_pretty(item).unwrap_or_else(|_| item.content.clone()),
            );
        }
    }

    if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
        output.push(format!("\nSynthesis Notes: {}", notes));
    }

    output.join("\n")
}
