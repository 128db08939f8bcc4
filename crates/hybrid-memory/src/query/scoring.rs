//! Relevance scoring for federated and context-aware queries

use crate::adapter::cosine_similarity;
use crate::context::ContextMap;
use crate::item::{value_text, MemoryItem};
use std::collections::HashSet;

/// What an item is scored against
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInput<'a> {
    pub text: Option<&'a str>,
    pub embedding: Option<&'a [f32]>,
    /// Session context, present for context-aware queries
    pub context: Option<&'a ContextMap>,
    /// Drop items that score zero. Set only when the caller supplied text or
    /// an embedding; context alone re-ranks and never filters.
    pub filtering: bool,
}

impl ScoreInput<'_> {
    /// Whether caller-supplied text or an embedding constrains the result
    pub fn caller_criteria(text: Option<&str>, embedding: Option<&[f32]>) -> bool {
        text.map_or(false, |t| !t.trim().is_empty()) || embedding.is_some()
    }
}

/// Pluggable ranking function
pub trait RelevanceScorer: Send + Sync {
    /// Higher is more relevant; must be deterministic for fixed inputs
    fn score(&self, input: &ScoreInput<'_>, item: &MemoryItem) -> f32;
}

/// Weighted semantic similarity plus term overlap, with a context boost
#[derive(Debug, Clone)]
pub struct DefaultScorer {
    pub similarity_weight: f32,
    pub term_weight: f32,
    pub context_boost: f32,
    pub max_context_boost: f32,
}

impl Default for DefaultScorer {
    fn default() -> Self {
        Self {
            similarity_weight: 0.6,
            term_weight: 0.4,
            context_boost: 0.25,
            max_context_boost: 0.75,
        }
    }
}

impl DefaultScorer {
    /// Share of query terms present in the item's content or metadata
    pub fn term_overlap(query: &str, item: &MemoryItem) -> f32 {
        let wanted: HashSet<String> = tokenize(query).collect();
        if wanted.is_empty() {
            return 0.0;
        }

        let mut present: HashSet<String> = tokenize(&item.content_text()).collect();
        for value in item.metadata.values() {
            present.extend(tokenize(&value_text(value)));
        }

        let hits = wanted.iter().filter(|term| present.contains(*term)).count();
        hits as f32 / wanted.len() as f32
    }

    /// Number of context entries the item matches
    pub fn context_matches(context: &ContextMap, item: &MemoryItem) -> usize {
        let content = item.content_text().to_lowercase();
        context
            .iter()
            .filter(|(key, value)| {
                let needle = value_text(value).trim().to_lowercase();
                if needle.is_empty() {
                    return false;
                }
                let by_key = item
                    .metadata
                    .get(key.as_str())
                    .map_or(false, |v| value_text(v).to_lowercase() == needle);
                by_key
                    || item
                        .metadata
                        .values()
                        .any(|v| value_text(v).to_lowercase() == needle)
                    || content.contains(&needle)
            })
            .count()
    }
}

impl RelevanceScorer for DefaultScorer {
    fn score(&self, input: &ScoreInput<'_>, item: &MemoryItem) -> f32 {
        let similarity = match (input.embedding, item.embedding.as_deref()) {
            (Some(query), Some(embedding)) => cosine_similarity(query, embedding).max(0.0),
            _ => 0.0,
        };
        let terms = input
            .text
            .map(|text| Self::term_overlap(text, item))
            .unwrap_or(0.0);

        let boost = input
            .context
            .map(|context| {
                (Self::context_matches(context, item) as f32 * self.context_boost)
                    .min(self.max_context_boost)
            })
            .unwrap_or(0.0);

        self.similarity_weight * similarity + self.term_weight * terms + boost
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
}
