//! Scoring for unified search.
//!
//! Each candidate gets four signals in [0, 1]:
//! - **lexical**: FTS5 bm25, negated and divided by the best hit of its kind
//! - **semantic**: cosine similarity of stored vector vs query vector
//! - **recency**: `exp(-ln2 * age_hours / half_life_hours)`
//! - **importance**: STM importance / 3, atom confidence, or message priority weight
//!
//! The composite score is the weighted sum, weights from `[search.weights]`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use cortex_config::SearchWeights;

use crate::types::MatchType;

/// Per-candidate signals before weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signals {
    pub lexical: f64,
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
}

impl Signals {
    pub fn composite(&self, weights: &SearchWeights) -> f64 {
        weights.lexical * self.lexical
            + weights.semantic * self.semantic
            + weights.recency * self.recency
            + weights.importance * self.importance
    }

    /// Lexical wins ties so that exact term hits are reported as such.
    pub fn match_type(&self, weights: &SearchWeights) -> MatchType {
        if weights.lexical * self.lexical >= weights.semantic * self.semantic {
            MatchType::Lexical
        } else {
            MatchType::Semantic
        }
    }
}

/// Build an FTS5 MATCH expression: each word quoted, joined with OR.
///
/// Returns `None` when the query has no searchable words.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Exponential decay with the given half-life. Future timestamps count as age 0.
pub fn recency_decay(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    let age_hours = (now - created_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
    (-std::f64::consts::LN_2 * age_hours / half_life_hours).exp()
}

/// Normalize raw lexical scores (higher = better) by the best score.
pub fn normalize_lexical(raw: Vec<(String, f64)>) -> HashMap<String, f64> {
    let max = raw.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
    raw.into_iter()
        .map(|(id, score)| {
            let normalized = if max > 0.0 { score / max } else { 1.0 };
            (id, normalized.clamp(0.0, 1.0))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query() {
        assert_eq!(
            fts_query("Trading patterns").as_deref(),
            Some("\"trading\" OR \"patterns\"")
        );
        // Operators and quotes in user input are neutralized
        assert_eq!(
            fts_query("a\" OR NOT b*").as_deref(),
            Some("\"a\" OR \"or\" OR \"not\" OR \"b\"")
        );
        assert_eq!(fts_query("  ?! "), None);
    }

    #[test]
    fn test_recency_decay() {
        let now = Utc::now();
        assert!((recency_decay(now, now, 24.0) - 1.0).abs() < 1e-9);
        let day_ago = now - chrono::Duration::hours(24);
        assert!((recency_decay(day_ago, now, 24.0) - 0.5).abs() < 1e-6);
        let future = now + chrono::Duration::hours(1);
        assert_eq!(recency_decay(future, now, 24.0), 1.0);
    }

    #[test]
    fn test_normalize_lexical() {
        let scores = normalize_lexical(vec![("a".into(), 4.0), ("b".into(), 1.0)]);
        assert_eq!(scores["a"], 1.0);
        assert_eq!(scores["b"], 0.25);
        assert!(normalize_lexical(Vec::new()).is_empty());
    }

    #[test]
    fn test_composite_and_match_type() {
        let weights = SearchWeights::default();
        let lexical = Signals {
            lexical: 1.0,
            semantic: 0.3,
            recency: 1.0,
            importance: 0.5,
        };
        assert!((lexical.composite(&weights) - (0.4 + 0.12 + 0.1 + 0.05)).abs() < 1e-9);
        assert_eq!(lexical.match_type(&weights), MatchType::Lexical);

        let semantic = Signals {
            lexical: 0.0,
            semantic: 0.8,
            ..Default::default()
        };
        assert_eq!(semantic.match_type(&weights), MatchType::Semantic);
    }
}
