//! Knowledge graph operations: atoms and causal links.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::error::{BrainError, Result};
use crate::links::{LinkContext, ProposedLink};
use crate::types::{
    Atom, AtomField, CausalLink, NewAtom, SourceKind, format_timestamp, new_id, parse_timestamp,
};
use crate::validation::{validate_confidence, validate_required, validate_strength};
use crate::vector::{delete_embedding, search_field_embeddings, upsert_field_embedding};

use super::Brain;
use super::query::AtomStats;

const DEFAULT_SOURCE: &str = "manual";

pub(crate) const ATOM_COLUMNS: &str = "id, subject, action, outcome, consequences, confidence, \
                                       source, access_count, created_at, source_message_id";

const LINK_COLUMNS: &str =
    "from_atom_id, to_atom_id, link_type, strength, observation_count, last_observed, created_at";

impl Brain {
    /// Create an atom and return its id.
    ///
    /// The atom, its unified and per-field vectors, and any links proposed by
    /// the handle's link policy are written in one transaction.
    pub fn create_atom(&self, new: NewAtom) -> Result<String> {
        validate_required("subject", &new.subject)?;
        validate_required("action", &new.action)?;
        validate_required("outcome", &new.outcome)?;
        validate_required("consequences", &new.consequences)?;
        validate_confidence(new.confidence)?;
        if let Some(ref source) = new.source {
            validate_required("source", source)?;
        }

        let atom = Atom {
            id: new_id("atom"),
            subject: new.subject,
            action: new.action,
            outcome: new.outcome,
            consequences: new.consequences,
            confidence: new.confidence,
            source: new.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            access_count: 0,
            created_at: Utc::now(),
            source_message_id: new.source_message_id,
        };

        // unified, four fields, then the "subject action" text links are matched on
        let unified = atom.embedding_text();
        let cause_text = format!("{} {}", atom.subject, atom.action);
        let prepared = self.auto_embed(&[
            unified.as_str(),
            atom.subject.as_str(),
            atom.action.as_str(),
            atom.outcome.as_str(),
            atom.consequences.as_str(),
            cause_text.as_str(),
        ]);
        let ts = format_timestamp(&atom.created_at);

        let linked = self.write(|tx| {
            tx.execute(
                &format!(
                    "INSERT INTO atoms ({ATOM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)"
                ),
                params![
                    atom.id,
                    atom.subject,
                    atom.action,
                    atom.outcome,
                    atom.consequences,
                    atom.confidence,
                    atom.source,
                    ts,
                    atom.source_message_id,
                ],
            )?;

            let mut cause_vector = None;
            if let Some(ref p) = prepared
                && let [unified_vec, field_vecs @ .., cause_vec] = p.vectors.as_slice()
            {
                self.store_vector(tx, SourceKind::Atom, &atom.id, &unified, unified_vec, &p.model)?;
                for (field, vector) in AtomField::ALL.iter().zip(field_vecs) {
                    upsert_field_embedding(tx, &atom.id, *field, vector, &p.model)?;
                }
                cause_vector = Some(cause_vec.as_slice());
            }

            let proposals = self
                .link_policy
                .propose(&LinkContext::new(tx, &atom, cause_vector))?;
            let mut linked = 0;
            for link in proposals {
                if apply_proposal(tx, &link, &ts)? {
                    linked += 1;
                }
            }
            Ok(linked)
        })?;

        debug!(
            "Created atom {} ({} links via {})",
            atom.id,
            linked,
            self.link_policy.name()
        );
        Ok(atom.id)
    }

    /// Record a causal link `from -> to`.
    ///
    /// Re-linking the same triple averages the strength into a running mean
    /// and increments `observation_count`.
    pub fn link_atoms(
        &self,
        from: &str,
        to: &str,
        relation: &str,
        strength: f64,
    ) -> Result<CausalLink> {
        validate_required("relation", relation)?;
        validate_strength(strength)?;
        let ts = Self::now_timestamp();

        let link = self.write(|tx| {
            for id in [from, to] {
                if !atom_exists(tx, id)? {
                    return Err(BrainError::NotFound(format!("Atom {}", id)));
                }
            }
            upsert_link(tx, from, to, relation, strength, &ts)?;
            load_link(tx, from, to, relation)
        })?;

        debug!(
            "Linked {} -[{}]-> {} (strength {:.3}, {} observations)",
            from, relation, to, link.strength, link.observation_count
        );
        Ok(link)
    }

    /// Get an atom by ID, counting the access.
    pub fn get_atom(&self, id: &str) -> Result<Option<Atom>> {
        if self.read_only {
            let conn = self.conn.lock();
            return load_atom(&conn, id);
        }

        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE atoms SET access_count = access_count + 1 WHERE id = ?1",
                params![id],
            )?;
            if rows == 0 {
                return Ok(None);
            }
            load_atom(tx, id)
        })
    }

    /// Outgoing links of an atom, strongest first.
    pub fn links_from(&self, id: &str) -> Result<Vec<CausalLink>> {
        let conn = self.conn.lock();
        query_links(
            &conn,
            &format!(
                "SELECT {LINK_COLUMNS} FROM atom_links WHERE from_atom_id = ?1 ORDER BY strength DESC, created_at ASC"
            ),
            id,
        )
    }

    /// Incoming links of an atom, strongest first.
    pub fn links_to(&self, id: &str) -> Result<Vec<CausalLink>> {
        let conn = self.conn.lock();
        query_links(
            &conn,
            &format!(
                "SELECT {LINK_COLUMNS} FROM atom_links WHERE to_atom_id = ?1 ORDER BY strength DESC, created_at ASC"
            ),
            id,
        )
    }

    /// Atoms whose `field` embedding is most similar to `query`.
    ///
    /// Requires an embedder; fails with `EmbeddingUnavailable` otherwise.
    pub fn search_atoms(
        &self,
        field: AtomField,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(Atom, f64)>> {
        validate_required("query", query)?;
        let vector = self.require_query_vector(query)?;

        let conn = self.conn.lock();
        let hits = search_field_embeddings(&conn, field, &vector, limit)?;
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(atom) = load_atom(&conn, &hit.id)? {
                results.push((atom, hit.similarity));
            }
        }
        Ok(results)
    }

    /// Aggregate statistics over the knowledge graph.
    pub fn atom_stats(&self) -> Result<AtomStats> {
        let conn = self.conn.lock();

        let (total_atoms, avg_confidence): (i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(confidence), 0.0) FROM atoms",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total_links: i64 =
            conn.query_row("SELECT COUNT(*) FROM atom_links", [], |row| row.get(0))?;
        let atoms_with_embeddings: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM atoms a
            WHERE (SELECT COUNT(*) FROM atom_field_embeddings f WHERE f.atom_id = a.id) = 4
            "#,
            [],
            |row| row.get(0),
        )?;

        let grouped = |sql: &str| -> Result<BTreeMap<String, usize>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut map = BTreeMap::new();
            for row in rows {
                let (key, n) = row?;
                map.insert(key, n as usize);
            }
            Ok(map)
        };

        Ok(AtomStats {
            total_atoms: total_atoms as usize,
            total_links: total_links as usize,
            avg_confidence,
            by_source: grouped("SELECT source, COUNT(*) FROM atoms GROUP BY source")?,
            links_by_type: grouped(
                "SELECT link_type, COUNT(*) FROM atom_links GROUP BY link_type",
            )?,
            atoms_with_embeddings: atoms_with_embeddings as usize,
        })
    }

    /// Administrative delete. Cascades to vectors, links and the atom's pin.
    pub fn delete_atom(&self, id: &str) -> Result<bool> {
        let deleted = self.write(|tx| {
            delete_embedding(tx, SourceKind::Atom, id)?;
            tx.execute("DELETE FROM working_memory WHERE item_id = ?1", params![id])?;
            let rows = tx.execute("DELETE FROM atoms WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })?;
        if deleted {
            debug!("Deleted atom {}", id);
        }
        Ok(deleted)
    }

    /// Convert a database row (ATOM_COLUMNS) to an Atom.
    pub(crate) fn row_to_atom(row: &rusqlite::Row) -> Result<Atom> {
        let access_count: i64 = row.get(7)?;
        let created_at_str: String = row.get(8)?;

        Ok(Atom {
            id: row.get(0)?,
            subject: row.get(1)?,
            action: row.get(2)?,
            outcome: row.get(3)?,
            consequences: row.get(4)?,
            confidence: row.get(5)?,
            source: row.get(6)?,
            access_count: access_count.max(0) as u64,
            created_at: parse_timestamp(&created_at_str)?,
            source_message_id: row.get(9)?,
        })
    }
}

/// Whether `id` names an atom.
pub(crate) fn atom_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM atoms WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Load an atom without access accounting.
pub(crate) fn load_atom(conn: &Connection, id: &str) -> Result<Option<Atom>> {
    let mut stmt = conn.prepare(&format!("SELECT {ATOM_COLUMNS} FROM atoms WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(Brain::row_to_atom(row)?)),
        None => Ok(None),
    }
}

/// Apply one policy proposal. Invalid proposals are skipped with a warning.
fn apply_proposal(conn: &Connection, link: &ProposedLink, ts: &str) -> Result<bool> {
    if link.from_atom_id == link.to_atom_id {
        return Ok(false);
    }
    if let Err(e) = validate_required("relation", &link.relation)
        .and_then(|_| validate_strength(link.strength))
    {
        warn!(
            "Ignoring proposed link {} -> {}: {}",
            link.from_atom_id, link.to_atom_id, e
        );
        return Ok(false);
    }
    if !atom_exists(conn, &link.from_atom_id)? || !atom_exists(conn, &link.to_atom_id)? {
        warn!(
            "Ignoring proposed link {} -> {}: unknown atom",
            link.from_atom_id, link.to_atom_id
        );
        return Ok(false);
    }
    upsert_link(
        conn,
        &link.from_atom_id,
        &link.to_atom_id,
        &link.relation,
        link.strength,
        ts,
    )?;
    Ok(true)
}

fn upsert_link(
    conn: &Connection,
    from: &str,
    to: &str,
    relation: &str,
    strength: f64,
    ts: &str,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO atom_links (from_atom_id, to_atom_id, link_type, strength, observation_count, last_observed, created_at)
        VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
        ON CONFLICT(from_atom_id, to_atom_id, link_type) DO UPDATE SET
            strength = (atom_links.strength * atom_links.observation_count + excluded.strength)
                       / (atom_links.observation_count + 1),
            observation_count = atom_links.observation_count + 1,
            last_observed = excluded.last_observed
        "#,
        params![from, to, relation, strength, ts],
    )?;
    Ok(())
}

fn load_link(conn: &Connection, from: &str, to: &str, relation: &str) -> Result<CausalLink> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LINK_COLUMNS} FROM atom_links WHERE from_atom_id = ?1 AND to_atom_id = ?2 AND link_type = ?3"
    ))?;
    let mut rows = stmt.query(params![from, to, relation])?;
    match rows.next()? {
        Some(row) => row_to_link(row),
        None => Err(BrainError::NotFound(format!("Link {} -> {}", from, to))),
    }
}

fn query_links(conn: &Connection, sql: &str, id: &str) -> Result<Vec<CausalLink>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![id])?;
    let mut links = Vec::new();
    while let Some(row) = rows.next()? {
        links.push(row_to_link(row)?);
    }
    Ok(links)
}

fn row_to_link(row: &rusqlite::Row) -> Result<CausalLink> {
    let observation_count: i64 = row.get(4)?;
    let last_observed_str: String = row.get(5)?;
    let created_at_str: String = row.get(6)?;
    Ok(CausalLink {
        from_atom_id: row.get(0)?,
        to_atom_id: row.get(1)?,
        relation: row.get(2)?,
        strength: row.get(3)?,
        observation_count: observation_count.max(0) as u64,
        last_observed: parse_timestamp(&last_observed_str)?,
        created_at: parse_timestamp(&created_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::links::ConsequenceSimilarity;
    use crate::validation::ValidationError;
    use std::sync::Arc;

    fn create_test_store() -> Brain {
        Brain::open_in_memory().unwrap()
    }

    fn embedded_store() -> Brain {
        create_test_store().with_embedder(Arc::new(MockEmbedder::new(128)))
    }

    #[test]
    fn test_create_and_get_atom() {
        let brain = create_test_store();
        let id = brain
            .create_atom(
                NewAtom::new("rates", "rise", "bonds fall", "refinancing slows")
                    .with_confidence(0.8)
                    .with_source("analyst"),
            )
            .unwrap();
        assert!(id.starts_with("atom_"));

        let atom = brain.get_atom(&id).unwrap().unwrap();
        assert_eq!(atom.subject, "rates");
        assert_eq!(atom.consequences, "refinancing slows");
        assert_eq!(atom.confidence, 0.8);
        assert_eq!(atom.source, "analyst");
        assert_eq!(atom.access_count, 1);
        assert_eq!(brain.get_atom(&id).unwrap().unwrap().access_count, 2);

        assert!(brain.get_atom("atom_missing").unwrap().is_none());
    }

    #[test]
    fn test_create_atom_validation() {
        let brain = create_test_store();
        assert!(matches!(
            brain.create_atom(NewAtom::new("s", "", "o", "c")).unwrap_err(),
            BrainError::Validation(ValidationError::EmptyField("action"))
        ));
        assert!(matches!(
            brain
                .create_atom(NewAtom::new("s", "a", "o", "c").with_confidence(1.5))
                .unwrap_err(),
            BrainError::Validation(ValidationError::ConfidenceOutOfRange(_))
        ));
        assert_eq!(brain.atom_stats().unwrap().total_atoms, 0);
    }

    #[test]
    fn test_create_atom_embeds_unified_and_fields() {
        let brain = embedded_store();
        brain
            .create_atom(NewAtom::new("market", "crashes", "losses", "panic selling"))
            .unwrap();

        let stats = brain.stats().unwrap();
        assert_eq!(stats.embedding_count, 1);
        assert_eq!(stats.field_embedding_count, 4);
        assert_eq!(stats.pending_embeddings, 0);
        assert_eq!(brain.atom_stats().unwrap().atoms_with_embeddings, 1);
    }

    #[test]
    fn test_no_links_by_default() {
        let brain = embedded_store();
        let a = brain
            .create_atom(NewAtom::new("rain", "falls", "ground wet", "prices drop sharply"))
            .unwrap();
        let b = brain
            .create_atom(NewAtom::new("prices", "drop sharply", "panic", "selloff"))
            .unwrap();
        assert!(brain.links_from(&a).unwrap().is_empty());
        assert!(brain.links_to(&b).unwrap().is_empty());
    }

    #[test]
    fn test_consequence_similarity_links_antecedent() {
        let brain = embedded_store().with_link_policy(Arc::new(ConsequenceSimilarity::default()));
        let a = brain
            .create_atom(NewAtom::new("fed", "hikes rates", "yields rise", "prices drop sharply"))
            .unwrap();
        let unrelated = brain
            .create_atom(NewAtom::new("team", "ships release", "users happy", "morale improves"))
            .unwrap();
        let b = brain
            .create_atom(NewAtom::new("prices", "drop sharply", "panic", "selloff"))
            .unwrap();

        let incoming = brain.links_to(&b).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].from_atom_id, a);
        assert_eq!(incoming[0].relation, "causes");
        assert!(incoming[0].strength > 0.99 && incoming[0].strength <= 1.0);
        assert!(brain.links_from(&unrelated).unwrap().is_empty());
    }

    #[test]
    fn test_link_atoms_averages_strength() {
        let brain = create_test_store();
        let a = brain.create_atom(NewAtom::new("a", "b", "c", "d")).unwrap();
        let b = brain.create_atom(NewAtom::new("e", "f", "g", "h")).unwrap();

        let first = brain.link_atoms(&a, &b, "causes", 0.4).unwrap();
        assert_eq!(first.observation_count, 1);
        assert!((first.strength - 0.4).abs() < 1e-9);

        let second = brain.link_atoms(&a, &b, "causes", 0.8).unwrap();
        assert_eq!(second.observation_count, 2);
        assert!((second.strength - 0.6).abs() < 1e-9);
        assert_eq!(second.created_at, first.created_at);

        // Different relation is a separate edge
        brain.link_atoms(&a, &b, "enables", 0.5).unwrap();
        assert_eq!(brain.links_from(&a).unwrap().len(), 2);

        let stats = brain.atom_stats().unwrap();
        assert_eq!(stats.total_links, 2);
        assert_eq!(stats.links_by_type.get("causes"), Some(&1));
    }

    #[test]
    fn test_link_atoms_requires_endpoints() {
        let brain = create_test_store();
        let a = brain.create_atom(NewAtom::new("a", "b", "c", "d")).unwrap();
        assert!(matches!(
            brain.link_atoms(&a, "atom_missing", "causes", 0.5).unwrap_err(),
            BrainError::NotFound(_)
        ));
        assert!(matches!(
            brain.link_atoms(&a, &a, "causes", 1.2).unwrap_err(),
            BrainError::Validation(ValidationError::StrengthOutOfRange(_))
        ));
    }

    #[test]
    fn test_search_atoms_by_field() {
        let brain = embedded_store();
        let crash = brain
            .create_atom(NewAtom::new("market", "crashes", "losses", "panic selling"))
            .unwrap();
        brain
            .create_atom(NewAtom::new("garden", "blooms", "flowers", "bees arrive"))
            .unwrap();

        let results = brain
            .search_atoms(AtomField::Consequences, "panic selling", 5)
            .unwrap();
        assert_eq!(results[0].0.id, crash);
        assert!(results[0].1 > 0.99);
        assert!(results.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_search_atoms_without_embedder() {
        let brain = create_test_store();
        assert!(matches!(
            brain
                .search_atoms(AtomField::Subject, "anything", 5)
                .unwrap_err(),
            BrainError::EmbeddingUnavailable(_)
        ));
    }

    #[test]
    fn test_atom_stats() {
        let brain = create_test_store();
        assert_eq!(brain.atom_stats().unwrap(), AtomStats::default());

        brain
            .create_atom(NewAtom::new("a", "b", "c", "d").with_confidence(0.5))
            .unwrap();
        brain
            .create_atom(NewAtom::new("e", "f", "g", "h").with_source("extractor"))
            .unwrap();

        let stats = brain.atom_stats().unwrap();
        assert_eq!(stats.total_atoms, 2);
        assert!((stats.avg_confidence - 0.75).abs() < 1e-9);
        assert_eq!(stats.by_source.get("manual"), Some(&1));
        assert_eq!(stats.by_source.get("extractor"), Some(&1));
        assert_eq!(stats.atoms_with_embeddings, 0);
    }

    #[test]
    fn test_delete_atom_cascades() {
        let brain = embedded_store();
        let a = brain.create_atom(NewAtom::new("a", "b", "c", "d")).unwrap();
        let b = brain.create_atom(NewAtom::new("e", "f", "g", "h")).unwrap();
        brain.link_atoms(&a, &b, "causes", 0.9).unwrap();
        brain.pin(&a, None).unwrap();

        assert!(brain.delete_atom(&a).unwrap());
        let stats = brain.stats().unwrap();
        assert_eq!(stats.atom_count, 1);
        assert_eq!(stats.link_count, 0);
        assert_eq!(stats.embedding_count, 1);
        assert_eq!(stats.field_embedding_count, 4);
        assert_eq!(stats.pin_count, 0);
    }
}
