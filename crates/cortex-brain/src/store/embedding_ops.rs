//! Embedding index operations: auto-embed on write and the pending sweep.
//!
//! A record is *pending* when it has no row in `embeddings` (or, for atoms,
//! is missing any of its four field rows). Writes never wait on or fail
//! because of the embedder; `embed_pending` reconciles afterwards.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::embedding::SharedEmbedder;
use crate::error::{BrainError, Result};
use crate::types::{AtomField, SourceKind, truncate_chars};
use crate::validation::validate_embedding;
use crate::vector::{upsert_embedding, upsert_field_embedding};

use super::Brain;

/// Vectors computed ahead of a write transaction, in input order.
#[derive(Debug, Clone)]
pub(crate) struct PreparedVectors {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
}

/// A record missing some or all of its vectors.
#[derive(Debug, Clone)]
struct PendingItem {
    kind: SourceKind,
    id: String,
    /// Text for the unified row, when that row is missing.
    unified: Option<String>,
    /// Missing atom field rows.
    fields: Vec<(AtomField, String)>,
}

impl PendingItem {
    fn texts(&self) -> impl Iterator<Item = &str> {
        self.unified
            .as_deref()
            .into_iter()
            .chain(self.fields.iter().map(|(_, text)| text.as_str()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers used by write paths
// ─────────────────────────────────────────────────────────────────────────────

impl Brain {
    /// Best-effort vectors for new content. `None` leaves the record pending.
    pub(crate) fn auto_embed(&self, texts: &[&str]) -> Option<PreparedVectors> {
        if !self.settings.auto_embed {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        match embed_checked(embedder, texts) {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                warn!("{}; record left pending for embed_pending", e);
                None
            }
        }
    }

    /// Vector for a search query. `None` when no embedder or it failed.
    pub(crate) fn query_vector(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embed_checked(embedder, &[query]) {
            Ok(mut prepared) => prepared.vectors.pop(),
            Err(e) => {
                warn!("{}; searching without semantic signal", e);
                None
            }
        }
    }

    /// Vector for a query that cannot proceed without one.
    pub(crate) fn require_query_vector(&self, query: &str) -> Result<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| BrainError::EmbeddingUnavailable("no embedder attached".into()))?;
        let mut prepared = embed_checked(embedder, &[query])?;
        prepared
            .vectors
            .pop()
            .ok_or_else(|| BrainError::EmbeddingUnavailable("embedder returned nothing".into()))
    }

    /// Write the unified vector of a record inside an open transaction.
    pub(crate) fn store_vector(
        &self,
        conn: &Connection,
        kind: SourceKind,
        id: &str,
        text: &str,
        vector: &[f32],
        model: &str,
    ) -> Result<()> {
        let snippet = truncate_chars(text, self.settings.snippet_chars);
        upsert_embedding(conn, kind, id, &snippet, vector, model)?;
        record_vector_meta(conn, model, vector.len())
    }
}

/// Embed and validate: one finite vector of the embedder's dimension per text.
fn embed_checked(embedder: &SharedEmbedder, texts: &[&str]) -> Result<PreparedVectors> {
    let vectors = embedder.embed_batch(texts).map_err(|e| match e {
        BrainError::EmbeddingUnavailable(_) => e,
        other => BrainError::EmbeddingUnavailable(other.to_string()),
    })?;
    if vectors.len() != texts.len() {
        return Err(BrainError::EmbeddingUnavailable(format!(
            "embedder returned {} vectors for {} texts",
            vectors.len(),
            texts.len()
        )));
    }
    for vector in &vectors {
        validate_embedding(vector, embedder.dimensions())
            .map_err(|e| BrainError::EmbeddingUnavailable(e.to_string()))?;
    }
    Ok(PreparedVectors {
        model: embedder.name().to_string(),
        vectors,
    })
}

fn record_vector_meta(conn: &Connection, model: &str, dims: usize) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding.model', ?1)",
        params![model],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding.dimensions', ?1)",
        params![dims.to_string()],
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Pending sweep
// ─────────────────────────────────────────────────────────────────────────────

impl Brain {
    /// Number of records missing one or more vectors.
    pub fn pending_embeddings(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let mut total = 0usize;
        for kind in SourceKind::ALL {
            let sql = match kind {
                SourceKind::Atom => format!(
                    "SELECT COUNT(*) FROM atoms t WHERE {} OR {}",
                    missing_unified_clause(kind),
                    MISSING_FIELDS_CLAUSE
                ),
                _ => format!(
                    "SELECT COUNT(*) FROM {} t WHERE {}",
                    kind.table(),
                    missing_unified_clause(kind)
                ),
            };
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            total += n as usize;
        }
        Ok(total)
    }

    /// Embed every pending record, `batch_size` records per transaction.
    ///
    /// Returns the number of records embedded; a second call with no writes
    /// in between returns 0. A `batch_size` of 0 uses `[embedding].batch_size`.
    pub fn embed_pending(&self, batch_size: usize) -> Result<usize> {
        let embedder = self
            .embedder
            .clone()
            .ok_or_else(|| BrainError::EmbeddingUnavailable("no embedder attached".into()))?;
        let batch_size = if batch_size == 0 {
            self.embedding_config.batch_size.max(1)
        } else {
            batch_size
        };

        let pending = self.collect_pending()?;
        if pending.is_empty() {
            debug!("No pending embeddings");
            return Ok(0);
        }
        info!("Embedding {} pending records", pending.len());

        let mut embedded = 0;
        for batch in pending.chunks(batch_size) {
            let texts: Vec<&str> = batch.iter().flat_map(PendingItem::texts).collect();
            let prepared = embed_checked(&embedder, &texts)?;

            embedded += self.write(|tx| {
                let mut vectors = prepared.vectors.iter();
                let mut written = 0;
                for item in batch {
                    let item_vectors: Vec<&Vec<f32>> =
                        vectors.by_ref().take(item.texts().count()).collect();
                    if !record_exists(tx, item.kind, &item.id)? {
                        continue;
                    }
                    let mut item_vectors = item_vectors.into_iter();
                    if let Some(ref text) = item.unified
                        && let Some(vector) = item_vectors.next()
                    {
                        self.store_vector(tx, item.kind, &item.id, text, vector, &prepared.model)?;
                    }
                    for ((field, _), vector) in item.fields.iter().zip(item_vectors) {
                        upsert_field_embedding(tx, &item.id, *field, vector, &prepared.model)?;
                    }
                    written += 1;
                }
                Ok(written)
            })?;
        }

        info!("Embedded {} pending records", embedded);
        Ok(embedded)
    }

    fn collect_pending(&self) -> Result<Vec<PendingItem>> {
        let conn = self.conn.lock();
        let mut pending = Vec::new();

        let mut stmt = conn.prepare(&format!(
            "SELECT id, subject, body FROM messages t WHERE {} ORDER BY seq",
            missing_unified_clause(SourceKind::Message)
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingItem {
                kind: SourceKind::Message,
                id: row.get(0)?,
                unified: Some(message_text(&row.get::<_, String>(1)?, &row.get::<_, String>(2)?)),
                fields: Vec::new(),
            })
        })?;
        for row in rows {
            pending.push(row?);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT id, content FROM stm t WHERE {} ORDER BY seq",
            missing_unified_clause(SourceKind::Stm)
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingItem {
                kind: SourceKind::Stm,
                id: row.get(0)?,
                unified: Some(row.get(1)?),
                fields: Vec::new(),
            })
        })?;
        for row in rows {
            pending.push(row?);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT id, subject, action, outcome, consequences, {} AS needs_unified \
             FROM atoms t WHERE {} OR {} ORDER BY seq",
            missing_unified_clause(SourceKind::Atom),
            missing_unified_clause(SourceKind::Atom),
            MISSING_FIELDS_CLAUSE
        ))?;
        let mut rows = stmt.query([])?;
        let mut field_stmt =
            conn.prepare("SELECT 1 FROM atom_field_embeddings WHERE atom_id = ?1 AND field = ?2")?;
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let values: [String; 4] = [row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?];
            let needs_unified: bool = row.get(5)?;

            let mut fields = Vec::new();
            for (field, text) in AtomField::ALL.iter().zip(values.iter()) {
                let present = field_stmt
                    .query_row(params![id, field.as_str()], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !present {
                    fields.push((*field, text.clone()));
                }
            }
            let unified = needs_unified.then(|| values.join("\n"));
            pending.push(PendingItem {
                kind: SourceKind::Atom,
                id,
                unified,
                fields,
            });
        }

        Ok(pending)
    }
}

/// Text embedded for a message.
pub(crate) fn message_text(subject: &str, body: &str) -> String {
    format!("{}\n{}", subject, body)
}

const MISSING_FIELDS_CLAUSE: &str =
    "(SELECT COUNT(*) FROM atom_field_embeddings f WHERE f.atom_id = t.id) < 4";

fn missing_unified_clause(kind: SourceKind) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.source_type = '{}' AND e.source_id = t.id)",
        kind.as_str()
    )
}

fn record_exists(conn: &Connection, kind: SourceKind, id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", kind.table()),
            params![id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}
