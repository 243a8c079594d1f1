//! OpenAI-compatible chat client used as the critic's answer evaluator.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::EvaluatorSettings;
use crate::critic::{AnswerEvaluator, Evaluation, QualityAssessment};
use crate::models::RetrievalResult;
use crate::{Error, Result};

/// Results shown to the evaluator
const MAX_EVIDENCE_ITEMS: usize = 8;
/// Characters kept per evidence item
const MAX_EVIDENCE_CHARS: usize = 600;

const SYSTEM_PROMPT: &str = "You judge whether retrieved information fully answers a question. \
Reply with a single JSON object: {\"score\": <0-100>, \"needs_followup\": <bool>, \
\"followup_query\": <string or null>, \"reasoning\": <short string>}. \
Score 80 or more only when the evidence answers every part of the question. \
When information is missing, propose a focused follow-up search query.";

#[derive(Debug, Clone)]
pub struct OpenAiEvaluator {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiEvaluator {
    pub fn new(settings: &EvaluatorSettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            return Err(Error::ConfigError("OPENAI_API_KEY is empty".to_string()));
        }

        let http = Client::builder()
            .user_agent(concat!("graphrag_router/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::HttpError(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    /// Chat completion returning the first choice's content.
    pub async fn chat_completion(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::EvaluatorError(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::EvaluatorError(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::EvaluatorError(format!(
                "OpenAI error {}: {}",
                status, text
            )));
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| Error::EvaluatorError(format!("Invalid response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::EvaluatorError("Empty response from OpenAI".to_string()))
    }
}

fn evidence_block(results: &[RetrievalResult]) -> String {
    let usable: Vec<&RetrievalResult> = results.iter().filter(|r| !r.is_error()).collect();
    if usable.is_empty() {
        return "(no results)".to_string();
    }
    usable
        .iter()
        .take(MAX_EVIDENCE_ITEMS)
        .enumerate()
        .map(|(i, r)| {
            let content: String = r.content.chars().take(MAX_EVIDENCE_CHARS).collect();
            format!("[{}] ({}) {}", i + 1, r.source().unwrap_or("unknown"), content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull the JSON object out of a reply that may be fenced or wrapped in prose
fn parse_evaluation(reply: &str) -> Result<Evaluation> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => {
            return Err(Error::EvaluatorError(format!(
                "No JSON object in evaluator reply: {}",
                reply
            )))
        }
    };
    serde_json::from_str(body)
        .map_err(|e| Error::EvaluatorError(format!("Invalid evaluation: {}", e)))
}

#[async_trait]
impl AnswerEvaluator for OpenAiEvaluator {
    async fn evaluate(
        &self,
        question: &str,
        results: &[RetrievalResult],
        heuristic: &QualityAssessment,
    ) -> Result<Evaluation> {
        let user = format!(
            "Question: {}\n\nHeuristic score: {} ({})\nMissing keywords: {}\n\nEvidence:\n{}",
            question,
            heuristic.score,
            heuristic.verdict.as_str(),
            if heuristic.missing_keywords.is_empty() {
                "none".to_string()
            } else {
                heuristic.missing_keywords.join(", ")
            },
            evidence_block(results)
        );

        let reply = self
            .chat_completion(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)])
            .await?;
        debug!("Evaluator reply: {}", reply);

        parse_evaluation(&reply)
    }
}

/// Chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
