//! Causal-link policies for newly created atoms.
//!
//! When [`crate::Brain::create_atom`] inserts an atom, the handle's
//! [`LinkPolicy`] proposes edges to pre-existing atoms. Proposals are written
//! in the same transaction as the atom itself.

use std::sync::Arc;

use cortex_config::{LinkConfig, LinkPolicyKind};
use rusqlite::Connection;

use crate::error::Result;
use crate::types::{Atom, AtomField};
use crate::vector::{SimilarityResult, search_field_embeddings};

/// Relation label written by [`ConsequenceSimilarity`] unless configured otherwise.
pub const DEFAULT_RELATION: &str = "causes";

/// An edge a policy wants created.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedLink {
    pub from_atom_id: String,
    pub to_atom_id: String,
    pub relation: String,
    pub strength: f64,
}

/// What a policy may look at while deciding links for a new atom.
pub struct LinkContext<'a> {
    conn: &'a Connection,
    /// The atom being created (already visible inside the transaction).
    pub atom: &'a Atom,
    /// Vector of the atom's `subject action` text, if an embedder produced one.
    pub cause_vector: Option<&'a [f32]>,
}

impl<'a> LinkContext<'a> {
    pub(crate) fn new(conn: &'a Connection, atom: &'a Atom, cause_vector: Option<&'a [f32]>) -> Self {
        Self {
            conn,
            atom,
            cause_vector,
        }
    }

    /// Atoms whose `field` embedding is most similar to `vector`, excluding the new atom.
    pub fn similar_by_field(
        &self,
        field: AtomField,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SimilarityResult>> {
        let mut hits = search_field_embeddings(self.conn, field, vector, limit + 1)?;
        hits.retain(|hit| hit.id != self.atom.id);
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Decides which causal links to create for a new atom.
pub trait LinkPolicy: Send + Sync {
    fn propose(&self, ctx: &LinkContext<'_>) -> Result<Vec<ProposedLink>>;

    fn name(&self) -> &str;
}

/// Never links automatically.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLinks;

impl LinkPolicy for NoLinks {
    fn propose(&self, _ctx: &LinkContext<'_>) -> Result<Vec<ProposedLink>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Links antecedents whose consequences resemble what the new atom describes.
///
/// For a new atom N, every existing atom A whose *consequences* embedding has
/// cosine similarity `>= threshold` with N's `subject action` text yields the
/// edge `A -> N` with strength equal to that similarity.
#[derive(Debug, Clone)]
pub struct ConsequenceSimilarity {
    pub threshold: f64,
    pub max_links: usize,
    pub relation: String,
}

impl Default for ConsequenceSimilarity {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            max_links: 5,
            relation: DEFAULT_RELATION.to_string(),
        }
    }
}

impl LinkPolicy for ConsequenceSimilarity {
    fn propose(&self, ctx: &LinkContext<'_>) -> Result<Vec<ProposedLink>> {
        let Some(vector) = ctx.cause_vector else {
            return Ok(Vec::new());
        };
        if self.max_links == 0 {
            return Ok(Vec::new());
        }

        let hits = ctx.similar_by_field(AtomField::Consequences, vector, self.max_links)?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.similarity >= self.threshold)
            .map(|hit| ProposedLink {
                from_atom_id: hit.id,
                to_atom_id: ctx.atom.id.clone(),
                relation: self.relation.clone(),
                strength: hit.similarity.clamp(0.0, 1.0),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "consequence_similarity"
    }
}

/// Build the policy selected by the `[links]` config section.
pub fn policy_from_config(config: &LinkConfig) -> Arc<dyn LinkPolicy> {
    match config.policy {
        LinkPolicyKind::None => Arc::new(NoLinks),
        LinkPolicyKind::ConsequenceSimilarity => Arc::new(ConsequenceSimilarity {
            threshold: config.threshold as f64,
            max_links: config.max_links,
            relation: config.relation.clone(),
        }),
    }
}
