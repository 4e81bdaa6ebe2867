//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [brain]              # store file and write behavior
//! [embedding]          # vector collaborator settings
//! [search]             # unified search ranking
//! [search.weights]
//! [links]              # causal-link policy for new atoms
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default database file name inside the data directory.
pub const DEFAULT_DATABASE_FILE: &str = "brain.db";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged. Use the accessor methods to get a
/// section with defaults filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexConfig {
    /// Store settings.
    pub brain: Option<BrainConfig>,
    /// Embedding collaborator settings.
    pub embedding: Option<EmbeddingConfig>,
    /// Unified search ranking settings.
    pub search: Option<SearchConfig>,
    /// Causal-link creation policy.
    pub links: Option<LinkConfig>,
}

impl CortexConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: CortexConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: CortexConfig) {
        if other.brain.is_some() {
            self.brain = other.brain;
        }
        if other.embedding.is_some() {
            self.embedding = other.embedding;
        }
        if other.search.is_some() {
            self.search = other.search;
        }
        if other.links.is_some() {
            self.links = other.links;
        }
    }

    /// Store settings with defaults applied.
    pub fn brain(&self) -> BrainConfig {
        self.brain.clone().unwrap_or_default()
    }

    /// Embedding settings with defaults applied.
    pub fn embedding(&self) -> EmbeddingConfig {
        self.embedding.clone().unwrap_or_default()
    }

    /// Search settings with defaults applied.
    pub fn search(&self) -> SearchConfig {
        self.search.clone().unwrap_or_default()
    }

    /// Link policy settings with defaults applied.
    pub fn links(&self) -> LinkConfig {
        self.links.clone().unwrap_or_default()
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref brain) = self.brain {
            if brain.write_retries == 0 {
                return Err(invalid("brain.write_retries", "must be at least 1"));
            }
            if brain.working_memory_capacity == 0 {
                return Err(invalid(
                    "brain.working_memory_capacity",
                    "must be at least 1",
                ));
            }
        }
        if let Some(ref embedding) = self.embedding {
            if embedding.dimensions == 0 {
                return Err(invalid("embedding.dimensions", "must be at least 1"));
            }
            if embedding.batch_size == 0 {
                return Err(invalid("embedding.batch_size", "must be at least 1"));
            }
        }
        if let Some(ref search) = self.search {
            search.weights.validate()?;
            if !(search.recency_half_life_hours.is_finite() && search.recency_half_life_hours > 0.0)
            {
                return Err(invalid(
                    "search.recency_half_life_hours",
                    "must be a positive number",
                ));
            }
        }
        if let Some(ref links) = self.links
            && !(0.0..=1.0).contains(&links.threshold)
        {
            return Err(invalid("links.threshold", "must be within [0.0, 1.0]"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Brain Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Store configuration.
///
/// ```toml
/// [brain]
/// database = "brain.db"
/// busy_timeout_ms = 5000
/// write_retries = 8
/// working_memory_capacity = 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Path to the store file. Relative paths are resolved from the data directory.
    pub database: Option<PathBuf>,
    /// How long SQLite waits on a locked database before reporting busy.
    pub busy_timeout_ms: u64,
    /// Attempts for a contended write before giving up.
    pub write_retries: u32,
    /// Initial backoff between write attempts (doubles each retry).
    pub retry_backoff_ms: u64,
    /// Compute embeddings synchronously on write when an embedder is attached.
    pub auto_embed: bool,
    /// Maximum characters of content kept in an embedding's snippet.
    pub snippet_chars: usize,
    /// Maximum characters in search result and provenance previews.
    pub preview_chars: usize,
    /// Maximum number of working memory pins.
    pub working_memory_capacity: usize,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            database: None,
            busy_timeout_ms: 5000,
            write_retries: 8,
            retry_backoff_ms: 10,
            auto_embed: true,
            snippet_chars: 500,
            preview_chars: 160,
            working_memory_capacity: 10,
        }
    }
}

impl BrainConfig {
    /// Resolve the database path against a data directory.
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        match self.database {
            Some(ref p) if p.is_absolute() => p.clone(),
            Some(ref p) => data_dir.join(p),
            None => data_dir.join(DEFAULT_DATABASE_FILE),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding collaborator configuration.
///
/// ```toml
/// [embedding]
/// model = "all-MiniLM-L6-v2"
/// dimensions = 384
/// batch_size = 32
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model tag recorded with every stored vector.
    pub model: String,
    /// Vector dimension agreed with the collaborator.
    pub dimensions: usize,
    /// Default batch size for the pending-embedding sweep.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "all-MiniLM-L6-v2".to_string(),
            dimensions: 384,
            batch_size: 32,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Search Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Unified search configuration.
///
/// ```toml
/// [search]
/// recency_half_life_hours = 72.0
/// min_similarity = 0.25
///
/// [search.weights]
/// lexical = 0.4
/// semantic = 0.4
/// recency = 0.1
/// importance = 0.1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Composite score weights.
    pub weights: SearchWeights,
    /// Age at which the recency term has decayed to one half.
    pub recency_half_life_hours: f64,
    /// Cosine similarity below which a vector match is not a candidate.
    pub min_similarity: f32,
    /// Candidates fetched per signal, as a multiple of the requested limit.
    pub candidate_multiplier: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            weights: SearchWeights::default(),
            recency_half_life_hours: 72.0,
            min_similarity: 0.25,
            candidate_multiplier: 3,
        }
    }
}

/// Weights of the four unified search signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchWeights {
    pub lexical: f64,
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            lexical: 0.4,
            semantic: 0.4,
            recency: 0.1,
            importance: 0.1,
        }
    }
}

impl SearchWeights {
    /// Weights must be finite, non-negative, and not all zero.
    pub fn validate(&self) -> Result<()> {
        let all = [self.lexical, self.semantic, self.recency, self.importance];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(invalid(
                "search.weights",
                "weights must be finite and non-negative",
            ));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(invalid("search.weights", "at least one weight must be positive"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Link Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Policy used to link a newly created atom to existing atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPolicyKind {
    /// Never create links automatically.
    #[default]
    None,
    /// Link antecedents whose consequences resemble the new atom's subject and action.
    ConsequenceSimilarity,
}

/// Causal-link policy configuration.
///
/// ```toml
/// [links]
/// policy = "consequence_similarity"
/// threshold = 0.7
/// max_links = 5
/// relation = "causes"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub policy: LinkPolicyKind,
    /// Minimum similarity for an automatic link.
    pub threshold: f32,
    /// Maximum automatic links per new atom.
    pub max_links: usize,
    /// Relation label written on automatic links.
    pub relation: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            policy: LinkPolicyKind::None,
            threshold: 0.7,
            max_links: 5,
            relation: "causes".to_string(),
        }
    }
}
