use std::collections::BTreeMap;

use crate::config::Config;
use crate::models::{EntityMentions, RetrievalResult};

/// Pattern-table entity extractor (no network calls).
///
/// Matching is a case-insensitive substring test of each configured pattern
/// against the concatenated text of all non-error results.
#[derive(Debug, Default, Clone)]
pub struct EntityExtractor {
    /// category -> (pattern as configured, lowercased pattern)
    patterns: Vec<(String, Vec<(String, String)>)>,
}

impl EntityExtractor {
    pub fn new(patterns: &BTreeMap<String, Vec<String>>) -> Self {
        let patterns = patterns
            .iter()
            .map(|(category, list)| {
                let mut seen = Vec::new();
                let mut entries = Vec::new();
                for raw in list {
                    let pattern = raw.trim();
                    let lowered = pattern.to_lowercase();
                    if lowered.is_empty() || seen.contains(&lowered) {
                        continue;
                    }
                    seen.push(lowered.clone());
                    entries.push((pattern.to_string(), lowered));
                }
                (category.clone(), entries)
            })
            .filter(|(_, entries)| !entries.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.graphrag.entity_patterns)
    }

    /// Number of distinct patterns across categories
    pub fn pattern_count(&self) -> usize {
        self.patterns.iter().map(|(_, p)| p.len()).sum()
    }

    /// Extract mentions from retrieved results
    pub fn extract(&self, results: &[RetrievalResult]) -> EntityMentions {
        let combined = results
            .iter()
            .filter(|r| !r.is_error())
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        self.extract_text(&combined)
    }

    /// Extract mentions from free text (used for questions)
    pub fn extract_text(&self, text: &str) -> EntityMentions {
        let mut mentions = EntityMentions::new();
        if text.trim().is_empty() {
            return mentions;
        }

        let haystack = text.to_lowercase();
        for (category, entries) in &self.patterns {
            for (pattern, lowered) in entries {
                if haystack.contains(lowered.as_str()) {
                    mentions.insert(category, pattern);
                }
            }
        }
        mentions
    }
}

/// Extract mentions with a one-off pattern table
pub fn extract(
    results: &[RetrievalResult],
    patterns: &BTreeMap<String, Vec<String>>,
) -> EntityMentions {
    EntityExtractor::new(patterns).extract(results)
}
