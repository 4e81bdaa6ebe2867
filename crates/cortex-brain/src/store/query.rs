//! Aggregate result types returned by store queries.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::SourceKind;

/// Database statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub message_count: usize,
    pub thread_count: usize,
    pub stm_count: usize,
    pub atom_count: usize,
    pub link_count: usize,
    /// Unified embedding rows.
    pub embedding_count: usize,
    /// Per-field atom embedding rows.
    pub field_embedding_count: usize,
    pub pin_count: usize,
    /// Records still waiting for a vector.
    pub pending_embeddings: usize,
    pub schema_version: i32,
    /// Model tag of the most recent vector write.
    pub embedding_model: Option<String>,
    pub embedding_dimensions: Option<usize>,
}

/// Records created on one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyActivity {
    pub date: NaiveDate,
    pub messages: usize,
    pub stm_entries: usize,
    pub atoms: usize,
}

/// How much of one record kind has a unified embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCoverage {
    pub kind: SourceKind,
    pub total: usize,
    pub embedded: usize,
    /// 0-100; 100 when there are no records.
    pub percent: f64,
}

/// Knowledge graph statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtomStats {
    pub total_atoms: usize,
    pub total_links: usize,
    /// 0 when there are no atoms.
    pub avg_confidence: f64,
    pub by_source: BTreeMap<String, usize>,
    pub links_by_type: BTreeMap<String, usize>,
    /// Atoms with all four field embeddings.
    pub atoms_with_embeddings: usize,
}
