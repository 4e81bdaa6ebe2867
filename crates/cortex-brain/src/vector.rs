//! Vector storage and similarity search using sqlite-vec.
//!
//! Vectors live in plain tables as little-endian f32 BLOBs next to their
//! dimension count. Similarity is computed with sqlite-vec's
//! `vec_distance_cosine`, restricted to rows whose `dims` match the query so
//! that vectors from a different model never break a search.

use std::sync::Once;

use rusqlite::{Connection, params};
use tracing::{debug, info};
use zerocopy::IntoBytes;

use crate::error::Result;
use crate::types::{AtomField, SourceKind, format_timestamp};

// ─────────────────────────────────────────────────────────────────────────────
// Extension
// ─────────────────────────────────────────────────────────────────────────────

static VEC_INIT: Once = Once::new();

/// Register sqlite-vec for every connection opened afterwards in this process.
pub fn init_vector_extension() {
    VEC_INIT.call_once(|| {
        use rusqlite::ffi::sqlite3_auto_extension;
        use sqlite_vec::sqlite3_vec_init;

        unsafe {
            #[allow(clippy::missing_transmute_annotations)]
            sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
        }
        info!("sqlite-vec registered");
    });
}

/// Check if sqlite-vec extension is loaded.
pub fn check_vector_extension(conn: &Connection) -> Result<String> {
    let version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
    Ok(version)
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────────────

/// Store the unified embedding for a record, replacing any existing vector.
pub fn upsert_embedding(
    conn: &Connection,
    kind: SourceKind,
    source_id: &str,
    snippet: &str,
    embedding: &[f32],
    model: &str,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO embeddings (source_type, source_id, content, vector, dims, model, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(source_type, source_id) DO UPDATE SET
            content = excluded.content,
            vector = excluded.vector,
            dims = excluded.dims,
            model = excluded.model,
            created_at = excluded.created_at
        "#,
        params![
            kind.as_str(),
            source_id,
            snippet,
            embedding.as_bytes(),
            embedding.len() as i64,
            model,
            format_timestamp(&chrono::Utc::now()),
        ],
    )?;

    debug!("Stored {} embedding for {}", kind, source_id);
    Ok(())
}

/// Store one per-field embedding of an atom, replacing any existing vector.
pub fn upsert_field_embedding(
    conn: &Connection,
    atom_id: &str,
    field: AtomField,
    embedding: &[f32],
    model: &str,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO atom_field_embeddings (atom_id, field, vector, dims, model, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(atom_id, field) DO UPDATE SET
            vector = excluded.vector,
            dims = excluded.dims,
            model = excluded.model,
            created_at = excluded.created_at
        "#,
        params![
            atom_id,
            field.as_str(),
            embedding.as_bytes(),
            embedding.len() as i64,
            model,
            format_timestamp(&chrono::Utc::now()),
        ],
    )?;
    Ok(())
}

/// Delete the unified embedding of a record. Returns whether one existed.
pub fn delete_embedding(conn: &Connection, kind: SourceKind, source_id: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM embeddings WHERE source_type = ?1 AND source_id = ?2",
        params![kind.as_str(), source_id],
    )?;
    Ok(rows > 0)
}

/// Get the count of stored unified embeddings.
pub fn count_embeddings(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
    Ok(count as usize)
}

// ─────────────────────────────────────────────────────────────────────────────
// Search
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityResult {
    /// Id of the matching record (or atom for field searches).
    pub id: String,
    /// Cosine similarity to the query (higher = more similar).
    pub similarity: f64,
}

/// Search unified embeddings of one record kind, most similar first.
pub fn search_embeddings(
    conn: &Connection,
    kind: SourceKind,
    query: &[f32],
    limit: usize,
) -> Result<Vec<SimilarityResult>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT source_id, 1.0 - vec_distance_cosine(vector, ?1) AS similarity
        FROM embeddings
        WHERE source_type = ?2 AND dims = ?3
        ORDER BY similarity DESC
        LIMIT ?4
        "#,
    )?;
    let rows = stmt.query(params![
        query.as_bytes(),
        kind.as_str(),
        query.len() as i64,
        limit as i64
    ])?;
    collect_similarities(rows)
}

/// Search one atom field's embeddings, most similar first.
pub fn search_field_embeddings(
    conn: &Connection,
    field: AtomField,
    query: &[f32],
    limit: usize,
) -> Result<Vec<SimilarityResult>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT atom_id, 1.0 - vec_distance_cosine(vector, ?1) AS similarity
        FROM atom_field_embeddings
        WHERE field = ?2 AND dims = ?3
        ORDER BY similarity DESC
        LIMIT ?4
        "#,
    )?;
    let rows = stmt.query(params![
        query.as_bytes(),
        field.as_str(),
        query.len() as i64,
        limit as i64
    ])?;
    collect_similarities(rows)
}

fn collect_similarities(mut rows: rusqlite::Rows<'_>) -> Result<Vec<SimilarityResult>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        // Zero vectors yield NaN, which SQLite hands back as NULL.
        let similarity: Option<f64> = row.get(1)?;
        if let Some(similarity) = similarity.filter(|s| s.is_finite()) {
            results.push(SimilarityResult { id, similarity });
        }
    }
    Ok(results)
}
