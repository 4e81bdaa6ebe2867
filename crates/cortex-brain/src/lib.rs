//! Unified knowledge store for multi-agent systems.
//!
//! One SQLite file holds everything a team of agents remembers:
//! - **Messaging**: messages between agents, threads, read receipts and acks
//! - **Short-term memory**: categorized, importance-weighted recall entries
//! - **Working memory**: a small set of pinned entries and atoms
//! - **Knowledge graph**: causal atoms linked by weighted edges, with provenance walks
//! - **Embedding index**: vectors via **sqlite-vec**, filled on write or by a sweep
//! - **Unified search**: FTS5 and vector similarity fused with recency and importance
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Brain (one handle = one connection, any number per file)               │
//! │  - WAL mode, BEGIN IMMEDIATE writes retried on contention               │
//! │  - messages / threads / read_receipts / acks                            │
//! │  - stm / working_memory                                                 │
//! │  - atoms / atom_links                                                   │
//! │  - embeddings / atom_field_embeddings  ←  Embedder (pluggable)          │
//! │  - messages_fts / stm_fts / atoms_fts (external content, triggers)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cortex_brain::{Brain, MockEmbedder, NewMemory, NewMessage};
//!
//! let brain = Brain::open("/tmp/brain.db")?
//!     .with_embedder(Arc::new(MockEmbedder::default()));
//!
//! let msg = brain.send(NewMessage::new("scout", "BTC breakout", "price above 70k").to("trader"))?;
//! brain.remember(NewMemory::new("BTC broke 70k").with_source_message(&msg.id))?;
//!
//! for hit in brain.unified_search("breakout", 10, None)? {
//!     println!("{:?} {} {:.3}", hit.kind, hit.preview, hit.score);
//! }
//! # Ok::<(), cortex_brain::BrainError>(())
//! ```

pub mod backup;
pub mod embedding;
pub mod error;
pub mod links;
pub mod search;
pub mod store;
pub mod types;
pub mod validation;
pub mod vector;

// Re-export the store
pub use store::{
    AtomStats, Brain, DailyActivity, EmbeddingCoverage, MAX_ACTIVITY_DAYS, SCHEMA_VERSION, StoreStats,
};

// Re-export error types
pub use error::{BrainError, Result};

// Re-export types
pub use types::{
    Atom, AtomField, CategoryInfo, CausalLink, Categories, ChainNode, DEFAULT_CATEGORY,
    HistoryFilter, Lookback, MatchType, Message, NewAtom, NewMemory, NewMessage, PinKind,
    Priority, RankedRootCause, RootCause, SearchResult, SourceKind, StmEntry, Thread,
    WorkingMemoryPin,
};

// Re-export embedding collaborator
pub use embedding::{Embedder, MockEmbedder, SharedEmbedder};

// Re-export link policies
pub use links::{ConsequenceSimilarity, LinkContext, LinkPolicy, NoLinks, ProposedLink};

// Re-export backup
pub use backup::{ExportSummary, ImportSummary, export, export_synapse, import};

// Re-export validation
pub use validation::ValidationError;
