//! Data models shared by the retrieval pipeline

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::backends::BackendError;

/// Metadata keys with a fixed meaning
pub const META_SOURCE: &str = "source";
pub const META_ERROR: &str = "error";
pub const META_ERROR_TYPE: &str = "error_type";
pub const META_HINTS: &str = "hints";
pub const META_SEARCH_MODE: &str = "search_mode";

/// Keys the backend clients add to every result; they say nothing about the
/// content itself
pub const META_INJECTED: &[&str] = &[
    META_SOURCE,
    META_ERROR,
    META_ERROR_TYPE,
    META_HINTS,
    META_SEARCH_MODE,
];

/// Question text plus its refinement lineage.
///
/// Refining never mutates: it produces a new `Query` whose lineage records
/// every text that was dispatched before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Text dispatched in the current round
    pub text: String,
    /// Question as the user asked it
    pub original: String,
    /// Earlier texts, oldest first (excludes the current one)
    pub refinements: Vec<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            original: text.clone(),
            text,
            refinements: Vec::new(),
        }
    }

    /// New query replacing the text and extending the lineage
    pub fn refine(&self, text: impl Into<String>) -> Self {
        let mut refinements = self.refinements.clone();
        refinements.push(self.text.clone());
        Self {
            text: text.into(),
            original: self.original.clone(),
            refinements,
        }
    }

    /// Number of refinements applied so far
    pub fn depth(&self) -> usize {
        self.refinements.len()
    }
}

/// A ranked passage or record returned by a retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RetrievalResult {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Result standing in for a failed retriever call
    pub fn from_error(err: &BackendError, source: &str) -> Self {
        Self::new(err.message.clone(), 0.0)
            .with_metadata(META_SOURCE, source)
            .with_metadata(META_ERROR, true)
            .with_metadata(META_ERROR_TYPE, err.error_type.clone())
            .with_metadata(META_HINTS, err.hints.clone())
    }

    pub fn is_error(&self) -> bool {
        self.metadata
            .get(META_ERROR)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE).and_then(Value::as_str)
    }
}

/// Sort results by descending score, keeping backend order for ties
pub fn sort_by_score(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// A literal pattern found in retrieved text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityMention {
    pub category: String,
    pub pattern: String,
}

/// Mentions grouped by category.
///
/// Categories iterate in sorted order and patterns keep the order of the
/// pattern table, so the same input always yields the same mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityMentions(BTreeMap<String, Vec<String>>);

impl EntityMentions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mention; returns false if it was already present
    pub fn insert(&mut self, category: &str, pattern: &str) -> bool {
        let patterns = self.0.entry(category.to_string()).or_default();
        if patterns.iter().any(|p| p == pattern) {
            return false;
        }
        patterns.push(pattern.to_string());
        true
    }

    pub fn merge(&mut self, other: &EntityMentions) {
        for (category, patterns) in &other.0 {
            for pattern in patterns {
                self.insert(category, pattern);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of mentions across categories
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn get(&self, category: &str) -> Option<&[String]> {
        self.0.get(category).map(Vec::as_slice)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Flatten into individual mentions in deterministic order
    pub fn mentions(&self) -> Vec<EntityMention> {
        self.0
            .iter()
            .flat_map(|(category, patterns)| {
                patterns.iter().map(move |pattern| EntityMention {
                    category: category.clone(),
                    pattern: pattern.clone(),
                })
            })
            .collect()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Vec<String>> {
        &self.0
    }
}

impl From<BTreeMap<String, Vec<String>>> for EntityMentions {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        let mut mentions = Self::new();
        for (category, patterns) in &map {
            for pattern in patterns {
                mentions.insert(category, pattern);
            }
        }
        mentions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One relationship of an expanded entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub relationship: String,
    pub direction: Direction,
    pub related_entity: String,
    pub related_type: String,
}

/// Graph neighborhood summary for one matched entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphContextRecord {
    pub entity_type: String,
    pub entity_name: String,
    pub data: Map<String, Value>,
    pub connections: Vec<Connection>,
}

impl GraphContextRecord {
    /// Render as a retrieval result so graph context can be scored
    pub fn to_result(&self) -> RetrievalResult {
        let mut content = format!("{} {}", self.entity_type, self.entity_name);

        if !self.data.is_empty() {
            content.push_str(":");
            for (key, value) in &self.data {
                match value {
                    Value::String(s) => {
                        let _ = write!(content, " {}={};", key, s);
                    }
                    other => {
                        let _ = write!(content, " {}={};", key, other);
                    }
                }
            }
        }

        for conn in &self.connections {
            let arrow = match conn.direction {
                Direction::Outgoing => "->",
                Direction::Incoming => "<-",
            };
            let _ = write!(
                content,
                " [{} {} {} {}]",
                conn.relationship, arrow, conn.related_type, conn.related_entity
            );
        }

        RetrievalResult::new(content, 1.0)
            .with_metadata(META_SOURCE, "graph")
            .with_metadata("entity_type", self.entity_type.clone())
            .with_metadata("entity_name", self.entity_name.clone())
    }
}
