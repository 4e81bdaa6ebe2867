//! Short-term memory operations.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{BrainError, Result};
use crate::types::{
    Categories, CategoryInfo, NewMemory, SourceKind, StmEntry, format_timestamp, new_id,
    parse_timestamp,
};
use crate::validation::{validate_importance, validate_required};
use crate::vector::delete_embedding;

use super::Brain;

const DEFAULT_SOURCE: &str = "manual";
const DEFAULT_IMPORTANCE: f64 = 1.0;

const STM_COLUMNS: &str =
    "id, content, categories, importance, access_count, created_at, source, source_message_id";

impl Brain {
    /// Store a short-term memory and return its id.
    ///
    /// Without explicit categories the entry is filed under every registered
    /// category with a keyword in its content, else under `general`.
    /// Remembering a caller-supplied id that already exists changes nothing
    /// and returns that id.
    pub fn remember(&self, memory: NewMemory) -> Result<String> {
        validate_required("content", &memory.content)?;
        let categories = match memory.categories {
            Some(ref raw) => Categories::new(raw.iter().cloned())?,
            None => self.categorize(&memory.content)?,
        };
        let importance = memory.importance.unwrap_or(DEFAULT_IMPORTANCE);
        validate_importance(importance)?;
        if let Some(ref source) = memory.source {
            validate_required("source", source)?;
        }
        if let Some(ref id) = memory.id {
            validate_required("id", id)?;
            if self.get_stm_entry(id)?.is_some() {
                debug!("STM entry {} already exists", id);
                return Ok(id.clone());
            }
        }

        let id = memory.id.clone().unwrap_or_else(|| new_id("stm"));
        let source = memory.source.as_deref().unwrap_or(DEFAULT_SOURCE);
        let categories_json = categories.to_json();
        let prepared = self.auto_embed(&[memory.content.as_str()]);
        let ts = format_timestamp(&Utc::now());

        let inserted = self.write(|tx| {
            let rows = tx.execute(
                r#"
                INSERT OR IGNORE INTO stm (id, content, categories, importance, access_count, created_at, source, source_message_id)
                VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)
                "#,
                params![
                    id,
                    memory.content,
                    categories_json,
                    importance,
                    ts,
                    source,
                    memory.source_message_id,
                ],
            )?;
            if rows == 0 {
                return Ok(false);
            }
            if let Some(ref p) = prepared
                && let Some(vector) = p.vectors.first()
            {
                self.store_vector(tx, SourceKind::Stm, &id, &memory.content, vector, &p.model)?;
            }
            Ok(true)
        })?;

        if inserted {
            debug!("Remembered STM entry {}", id);
        }
        Ok(id)
    }

    /// Newest entries first, optionally restricted to one category.
    ///
    /// Each returned entry's `access_count` is incremented in the same
    /// transaction and the post-increment value is returned. Read-only
    /// handles return entries without access accounting.
    pub fn get_stm(&self, limit: usize, category: Option<&str>) -> Result<Vec<StmEntry>> {
        if self.read_only {
            let conn = self.conn.lock();
            return select_stm(&conn, limit, category);
        }

        self.write(|tx| {
            let mut entries = select_stm(tx, limit, category)?;
            let mut stmt =
                tx.prepare("UPDATE stm SET access_count = access_count + 1 WHERE id = ?1")?;
            for entry in &mut entries {
                stmt.execute(params![entry.id])?;
                entry.access_count += 1;
            }
            Ok(entries)
        })
    }

    /// Get an STM entry by ID without touching its access count.
    pub fn get_stm_entry(&self, id: &str) -> Result<Option<StmEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {STM_COLUMNS} FROM stm WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_stm(row)?))
        } else {
            Ok(None)
        }
    }

    /// Replace an entry's content and re-embed it.
    ///
    /// If no fresh vector can be computed the old one is dropped so the
    /// entry becomes pending instead of searchable under stale text.
    pub fn edit_stm(&self, id: &str, content: &str) -> Result<()> {
        validate_required("content", content)?;
        let prepared = self.auto_embed(&[content]);

        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE stm SET content = ?2 WHERE id = ?1",
                params![id, content],
            )?;
            if rows == 0 {
                return Err(BrainError::NotFound(format!("STM entry {}", id)));
            }
            match prepared {
                Some(ref p) if !p.vectors.is_empty() => {
                    self.store_vector(tx, SourceKind::Stm, id, content, &p.vectors[0], &p.model)?;
                }
                _ => {
                    delete_embedding(tx, SourceKind::Stm, id)?;
                }
            }
            Ok(())
        })?;

        debug!("Edited STM entry {}", id);
        Ok(())
    }

    /// Change importance and/or categories; `None` leaves a value unchanged.
    pub fn update_stm(
        &self,
        id: &str,
        importance: Option<f64>,
        categories: Option<Vec<String>>,
    ) -> Result<StmEntry> {
        if let Some(importance) = importance {
            validate_importance(importance)?;
        }
        let categories_json = match categories {
            Some(raw) => Some(Categories::new(raw)?.to_json()),
            None => None,
        };

        self.write(|tx| {
            let rows = tx.execute(
                r#"
                UPDATE stm
                SET importance = COALESCE(?2, importance),
                    categories = COALESCE(?3, categories)
                WHERE id = ?1
                "#,
                params![id, importance, categories_json],
            )?;
            if rows == 0 {
                return Err(BrainError::NotFound(format!("STM entry {}", id)));
            }
            Ok(())
        })?;

        self.get_stm_entry(id)?
            .ok_or_else(|| BrainError::NotFound(format!("STM entry {}", id)))
    }

    /// Administrative delete. Cascades to the entry's vector and pin.
    pub fn delete_stm(&self, id: &str) -> Result<bool> {
        let deleted = self.write(|tx| {
            delete_embedding(tx, SourceKind::Stm, id)?;
            tx.execute("DELETE FROM working_memory WHERE item_id = ?1", params![id])?;
            let rows = tx.execute("DELETE FROM stm WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })?;
        if deleted {
            debug!("Deleted STM entry {}", id);
        }
        Ok(deleted)
    }

    /// Convert a database row (STM_COLUMNS) to an StmEntry.
    pub(crate) fn row_to_stm(row: &rusqlite::Row) -> Result<StmEntry> {
        let categories_json: String = row.get(2)?;
        let access_count: i64 = row.get(4)?;
        let created_at_str: String = row.get(5)?;

        Ok(StmEntry {
            id: row.get(0)?,
            content: row.get(1)?,
            categories: Categories::from_json(&categories_json)?,
            importance: row.get(3)?,
            access_count: access_count.max(0) as u64,
            created_at: parse_timestamp(&created_at_str)?,
            source: row.get(6)?,
            source_message_id: row.get(7)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Category Registry
// ─────────────────────────────────────────────────────────────────────────────

impl Brain {
    /// Register a category, or replace the keywords of a registered one.
    ///
    /// Keywords are matched case-insensitively against the content of
    /// memories remembered without explicit categories.
    pub fn create_category<I, S>(&self, name: &str, keywords: I) -> Result<CategoryInfo>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_required("category", name)?;
        let name = name.trim();
        let keywords_json = serde_json::to_string(&normalize_keywords(keywords))?;
        let ts = Self::now_timestamp();

        self.write(|tx| {
            tx.execute(
                r#"
                INSERT INTO categories (name, keywords, created_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET keywords = excluded.keywords
                "#,
                params![name, keywords_json, ts],
            )?;
            Ok(())
        })?;
        debug!("Registered category {}", name);

        self.list_categories()?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| BrainError::NotFound(format!("Category {}", name)))
    }

    /// Registered categories and categories in use, by name.
    pub fn list_categories(&self) -> Result<Vec<CategoryInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            WITH used AS (
                SELECT c.value AS name, COUNT(*) AS n
                FROM stm s, json_each(s.categories) c
                GROUP BY c.value
            )
            SELECT r.name, r.keywords, r.created_at, COALESCE(u.n, 0)
            FROM categories r LEFT JOIN used u ON u.name = r.name
            UNION ALL
            SELECT u.name, NULL, NULL, u.n
            FROM used u
            WHERE u.name NOT IN (SELECT name FROM categories)
            ORDER BY 1
            "#,
        )?;
        let mut rows = stmt.query([])?;

        let mut categories = Vec::new();
        while let Some(row) = rows.next()? {
            let keywords: Option<String> = row.get(1)?;
            let created_at: Option<String> = row.get(2)?;
            let entry_count: i64 = row.get(3)?;
            categories.push(CategoryInfo {
                name: row.get(0)?,
                registered: keywords.is_some(),
                keywords: match keywords {
                    Some(ref json) => serde_json::from_str(json)?,
                    None => Vec::new(),
                },
                entry_count: entry_count.max(0) as usize,
                created_at: created_at.as_deref().map(parse_timestamp).transpose()?,
            });
        }
        Ok(categories)
    }

    /// Registered categories whose keywords occur in `content`, else the default.
    fn categorize(&self, content: &str) -> Result<Categories> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name, keywords FROM categories ORDER BY name")?;
        let mut rows = stmt.query([])?;

        let haystack = content.to_lowercase();
        let mut matched = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let keywords: Vec<String> = serde_json::from_str(&row.get::<_, String>(1)?)?;
            if keywords.iter().any(|k| haystack.contains(k.as_str())) {
                matched.push(name);
            }
        }

        if matched.is_empty() {
            return Ok(Categories::default());
        }
        Ok(Categories::new(matched)?)
    }
}

/// Lowercased, trimmed, de-duplicated, blanks dropped; first-seen order.
fn normalize_keywords<I, S>(keywords: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for keyword in keywords {
        let keyword = keyword.into().trim().to_lowercase();
        if !keyword.is_empty() && !out.contains(&keyword) {
            out.push(keyword);
        }
    }
    out
}

fn select_stm(conn: &Connection, limit: usize, category: Option<&str>) -> Result<Vec<StmEntry>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {STM_COLUMNS} FROM stm s
        WHERE ?1 IS NULL
           OR EXISTS (SELECT 1 FROM json_each(s.categories) c WHERE c.value = ?1)
        ORDER BY s.created_at DESC, s.seq DESC
        LIMIT ?2
        "#
    ))?;
    let mut rows = stmt.query(params![category, limit as i64])?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(Brain::row_to_stm(row)?);
    }
    Ok(entries)
}

/// Whether `id` names an STM entry.
pub(crate) fn stm_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM stm WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}
