//! Unified search across messages, STM and atoms.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::Result;
use crate::search::{Signals, fts_query, normalize_lexical, recency_decay};
use crate::types::{
    Lookback, MatchType, Priority, SearchResult, SourceKind, format_timestamp, parse_timestamp,
};
use crate::validation::{MAX_IMPORTANCE, validate_required};
use crate::vector::search_embeddings;

use super::Brain;

/// What ranking needs to know about one candidate record.
struct Candidate {
    preview: String,
    created_at: DateTime<Utc>,
    /// Normalized to [0, 1].
    importance: f64,
}

impl Brain {
    /// Hybrid lexical + semantic search, ranked by the weighted composite score.
    ///
    /// `types` restricts the record kinds searched (all kinds when `None`).
    /// Without an embedder, or when it fails, ranking uses the lexical,
    /// recency and importance signals only.
    pub fn unified_search(
        &self,
        query: &str,
        limit: usize,
        types: Option<&[SourceKind]>,
    ) -> Result<Vec<SearchResult>> {
        validate_required("query", query)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let kinds = requested_kinds(types);
        let weights = self.search_config.weights;
        let half_life = self.search_config.recency_half_life_hours;
        let min_similarity = f64::from(self.search_config.min_similarity);
        let candidates = limit.saturating_mul(self.search_config.candidate_multiplier.max(1));
        let match_expr = fts_query(query);
        let query_vector = self.query_vector(query);

        let now = Utc::now();
        let conn = self.conn.lock();
        let mut results = Vec::new();

        for kind in kinds {
            let lexical = match match_expr {
                Some(ref expr) => normalize_lexical(lexical_hits(&conn, kind, expr, candidates)?),
                None => HashMap::new(),
            };
            let semantic: HashMap<String, f64> = match query_vector {
                Some(ref vector) => search_embeddings(&conn, kind, vector, candidates)?
                    .into_iter()
                    .filter(|hit| hit.similarity >= min_similarity)
                    .map(|hit| (hit.id, hit.similarity.clamp(0.0, 1.0)))
                    .collect(),
                None => HashMap::new(),
            };

            let mut seen = HashSet::new();
            for id in lexical.keys().chain(semantic.keys()) {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let Some(candidate) = self.load_candidate(&conn, kind, id)? else {
                    continue;
                };
                let signals = Signals {
                    lexical: lexical.get(id).copied().unwrap_or(0.0),
                    semantic: semantic.get(id).copied().unwrap_or(0.0),
                    recency: recency_decay(candidate.created_at, now, half_life),
                    importance: candidate.importance,
                };
                results.push(SearchResult {
                    kind,
                    id: id.clone(),
                    preview: candidate.preview,
                    created_at: candidate.created_at,
                    score: signals.composite(&weights),
                    match_type: signals.match_type(&weights),
                    lexical: signals.lexical,
                    semantic: signals.semantic,
                });
            }
        }

        rank(&mut results);
        results.truncate(limit);
        debug!(
            "Unified search '{}' returned {} results (semantic: {})",
            query,
            results.len(),
            query_vector.is_some()
        );
        Ok(results)
    }

    /// Records created in the last `hours`, newest first, scored by recency decay alone.
    ///
    /// A window reaching back past the earliest representable timestamp
    /// covers every record.
    pub fn recent(
        &self,
        hours: u32,
        types: Option<&[SourceKind]>,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let window = TimeWindow {
            start: window_start(now, hours),
            end: None,
        };
        let conn = self.conn.lock();
        self.records_in_window(&conn, &requested_kinds(types), &window, now, limit, None)
    }

    /// What led up to an event: records from the `hours_before` preceding it.
    ///
    /// The event is the best unified-search match for `event`. Preceding
    /// records are scored by closeness to the event's time, newest first.
    /// Returns `None` when nothing matches `event`.
    pub fn what_happened_before(
        &self,
        event: &str,
        hours_before: u32,
        limit: usize,
    ) -> Result<Option<Lookback>> {
        let Some(anchor) = self.unified_search(event, 1, None)?.into_iter().next() else {
            debug!("No record matches event '{}'", event);
            return Ok(None);
        };

        let at = anchor.created_at;
        let window = TimeWindow {
            start: window_start(at, hours_before),
            end: Some(at),
        };
        let preceding = if limit == 0 {
            Vec::new()
        } else {
            let conn = self.conn.lock();
            self.records_in_window(&conn, &SourceKind::ALL, &window, at, limit, Some(&anchor.id))?
        };

        Ok(Some(Lookback {
            window_start: window.start,
            event: anchor,
            preceding,
        }))
    }

    /// Records created inside `window`, scored by recency decay relative to `reference`.
    fn records_in_window(
        &self,
        conn: &Connection,
        kinds: &[SourceKind],
        window: &TimeWindow,
        reference: DateTime<Utc>,
        limit: usize,
        exclude: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let half_life = self.search_config.recency_half_life_hours;
        let start = window.start.as_ref().map(format_timestamp);
        let end = window.end.as_ref().map(format_timestamp);

        let mut results = Vec::new();
        for kind in kinds {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT id FROM {}
                WHERE (?1 IS NULL OR created_at >= ?1) AND (?2 IS NULL OR created_at <= ?2)
                ORDER BY created_at DESC, seq DESC
                LIMIT ?3
                "#,
                kind.table()
            ))?;
            // One extra row leaves room for the excluded record.
            let fetch = limit.saturating_add(1) as i64;
            let ids = stmt.query_map(params![start, end, fetch], |row| row.get::<_, String>(0))?;
            for id in ids {
                let id = id?;
                if exclude == Some(id.as_str()) {
                    continue;
                }
                let Some(candidate) = self.load_candidate(conn, *kind, &id)? else {
                    continue;
                };
                results.push(SearchResult {
                    kind: *kind,
                    id,
                    preview: candidate.preview,
                    created_at: candidate.created_at,
                    score: recency_decay(candidate.created_at, reference, half_life),
                    match_type: MatchType::Recency,
                    lexical: 0.0,
                    semantic: 0.0,
                });
            }
        }

        rank(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    fn load_candidate(
        &self,
        conn: &Connection,
        kind: SourceKind,
        id: &str,
    ) -> Result<Option<Candidate>> {
        let row = match kind {
            SourceKind::Message => conn
                .query_row(
                    "SELECT subject, body, created_at, priority FROM messages WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            format!("{}: {}", row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?
                .map(|(text, created_at, priority)| {
                    let weight = priority.parse::<Priority>().map(|p| p.weight());
                    (text, created_at, weight.unwrap_or(0.0))
                }),
            SourceKind::Stm => conn
                .query_row(
                    "SELECT content, created_at, importance FROM stm WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)? / MAX_IMPORTANCE,
                        ))
                    },
                )
                .optional()?,
            SourceKind::Atom => conn
                .query_row(
                    "SELECT subject, action, outcome, consequences, created_at, confidence FROM atoms WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            format!(
                                "{} {} -> {} ({})",
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?
                            ),
                            row.get::<_, String>(4)?,
                            row.get::<_, f64>(5)?,
                        ))
                    },
                )
                .optional()?,
        };

        let Some((text, created_at, importance)) = row else {
            return Ok(None);
        };
        Ok(Some(Candidate {
            preview: self.preview(&text),
            created_at: parse_timestamp(&created_at)?,
            importance: importance.clamp(0.0, 1.0),
        }))
    }
}

/// Inclusive bounds on `created_at`; `None` leaves that side open.
struct TimeWindow {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// `at` minus `hours`, or `None` when that lies before the earliest stored timestamp.
fn window_start(at: DateTime<Utc>, hours: u32) -> Option<DateTime<Utc>> {
    let start = Duration::try_hours(i64::from(hours)).and_then(|d| at.checked_sub_signed(d))?;
    // Stored timestamps have four-digit years.
    (start.year() >= 1).then_some(start)
}

fn requested_kinds(types: Option<&[SourceKind]>) -> Vec<SourceKind> {
    let mut kinds = Vec::new();
    for kind in types.unwrap_or(&SourceKind::ALL) {
        if !kinds.contains(kind) {
            kinds.push(*kind);
        }
    }
    kinds
}

/// Raw bm25 hits for one kind; higher is better.
fn lexical_hits(
    conn: &Connection,
    kind: SourceKind,
    expr: &str,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let table = kind.table();
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT t.id, -bm25({table}_fts) AS score
        FROM {table}_fts
        JOIN {table} t ON t.seq = {table}_fts.rowid
        WHERE {table}_fts MATCH ?1
        ORDER BY bm25({table}_fts)
        LIMIT ?2
        "#
    ))?;
    let rows = stmt.query_map(params![expr, limit as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut hits = Vec::new();
    for row in rows {
        hits.push(row?);
    }
    Ok(hits)
}

/// Score descending; ties go to the newer record.
fn rank(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}
