//! Provenance walks: from any record back to what produced it.
//!
//! A node's back-pointer is its `source_message_id` when set (STM entries and
//! atoms), otherwise for atoms the strongest incoming causal link whose
//! source has not been visited yet. Walks never revisit an id.
//!
//! A source message that no longer exists is not a back-pointer: an atom
//! falls back to its links, an STM entry's walk ends there.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{BrainError, Result};
use crate::types::{AtomField, ChainNode, RankedRootCause, RootCause, SourceKind, parse_timestamp};

use super::Brain;
use super::atom_ops::load_atom;

/// Relation reported for the hop from a record to its source message.
const SOURCE_MESSAGE_RELATION: &str = "source_message";

/// Outcome atoms considered by [`Brain::find_all_paths_to_outcome`].
const OUTCOME_CANDIDATES: usize = 50;

/// A resolved record plus its outgoing back-pointer.
struct Located {
    node: ChainNode,
    source_message_id: Option<String>,
}

impl Brain {
    /// Walk from `id` back to its origin.
    ///
    /// The chain starts at the queried record and ends at the first node with
    /// no back-pointer (usually the originating message). Returns `None` for
    /// unknown ids and for records with no provenance edge at all.
    pub fn find_provenance(&self, id: &str) -> Result<Option<Vec<ChainNode>>> {
        let conn = self.conn.lock();

        let Some(start) = self.locate(&conn, id)? else {
            return Ok(None);
        };

        let mut visited = HashSet::from([start.node.id.clone()]);
        let mut chain = Vec::new();
        let mut current = start;

        loop {
            let next = self.next_hop(&conn, &current, &visited)?;
            chain.push(current.node);
            let Some(next) = next else {
                break;
            };
            visited.insert(next.node.id.clone());
            current = next;
        }

        if chain.len() < 2 {
            return Ok(None);
        }
        Ok(Some(chain))
    }

    /// Atoms with no further known causes, reached walking incoming links from `atom_id`.
    ///
    /// An atom with no causes is its own root at depth 0. Branches deeper
    /// than `max_depth` hops are cut off.
    pub fn find_root_causes(&self, atom_id: &str, max_depth: usize) -> Result<Vec<RootCause>> {
        let conn = self.conn.lock();
        if load_atom(&conn, atom_id)?.is_none() {
            return Err(BrainError::NotFound(format!("Atom {}", atom_id)));
        }

        let mut visited = HashSet::new();
        let mut roots = Vec::new();
        collect_roots(&conn, atom_id, 0, max_depth, &mut visited, &mut roots)?;
        Ok(roots)
    }

    /// Root causes behind every atom whose outcome resembles `outcome`.
    ///
    /// Roots reached from several matching atoms rank first; ties go to the
    /// root closest to an outcome. Requires an embedder.
    pub fn find_all_paths_to_outcome(
        &self,
        outcome: &str,
        max_depth: usize,
    ) -> Result<Vec<RankedRootCause>> {
        let min_similarity = f64::from(self.search_config.min_similarity);
        let matches = self.search_atoms(AtomField::Outcome, outcome, OUTCOME_CANDIDATES)?;

        let mut ranked: Vec<RankedRootCause> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (atom, similarity) in matches {
            if similarity < min_similarity {
                continue;
            }
            for root in self.find_root_causes(&atom.id, max_depth)? {
                match index.get(&root.atom.id) {
                    Some(&i) => {
                        ranked[i].occurrences += 1;
                        ranked[i].depth = ranked[i].depth.min(root.depth);
                    }
                    None => {
                        index.insert(root.atom.id.clone(), ranked.len());
                        ranked.push(RankedRootCause {
                            atom: root.atom,
                            occurrences: 1,
                            depth: root.depth,
                        });
                    }
                }
            }
        }

        ranked.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.depth.cmp(&b.depth))
        });
        Ok(ranked)
    }

    fn locate(&self, conn: &Connection, id: &str) -> Result<Option<Located>> {
        let message = conn
            .query_row(
                "SELECT subject, created_at FROM messages WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        if let Some((subject, created_at)) = message {
            return Ok(Some(Located {
                node: ChainNode {
                    kind: SourceKind::Message,
                    id: id.to_string(),
                    preview: self.preview(&subject),
                    created_at: parse_timestamp(&created_at)?,
                    relation: None,
                },
                source_message_id: None,
            }));
        }

        let stm = conn
            .query_row(
                "SELECT content, created_at, source_message_id FROM stm WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        if let Some((content, created_at, source_message_id)) = stm {
            return Ok(Some(Located {
                node: ChainNode {
                    kind: SourceKind::Stm,
                    id: id.to_string(),
                    preview: self.preview(&content),
                    created_at: parse_timestamp(&created_at)?,
                    relation: None,
                },
                source_message_id,
            }));
        }

        Ok(load_atom(conn, id)?.map(|atom| Located {
            node: ChainNode {
                kind: SourceKind::Atom,
                id: atom.id.clone(),
                preview: self.preview(&atom.summary()),
                created_at: atom.created_at,
                relation: None,
            },
            source_message_id: atom.source_message_id,
        }))
    }

    fn next_hop(
        &self,
        conn: &Connection,
        current: &Located,
        visited: &HashSet<String>,
    ) -> Result<Option<Located>> {
        if let Some(ref message_id) = current.source_message_id
            && !visited.contains(message_id)
            && let Some(mut next) = self.locate(conn, message_id)?
            && next.node.kind == SourceKind::Message
        {
            next.node.relation = Some(SOURCE_MESSAGE_RELATION.to_string());
            return Ok(Some(next));
        }

        if current.node.kind != SourceKind::Atom {
            return Ok(None);
        }
        for (from_id, relation) in incoming_links(conn, &current.node.id)? {
            if visited.contains(&from_id) {
                continue;
            }
            if let Some(mut next) = self.locate(conn, &from_id)? {
                next.node.relation = Some(relation);
                return Ok(Some(next));
            }
        }
        Ok(None)
    }
}

/// Sources and relations of an atom's incoming links, strongest first.
fn incoming_links(conn: &Connection, atom_id: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT from_atom_id, link_type FROM atom_links
        WHERE to_atom_id = ?1
        ORDER BY strength DESC, observation_count DESC, created_at ASC
        "#,
    )?;
    let rows = stmt.query_map(params![atom_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut links = Vec::new();
    for row in rows {
        links.push(row?);
    }
    Ok(links)
}

fn collect_roots(
    conn: &Connection,
    atom_id: &str,
    depth: usize,
    max_depth: usize,
    visited: &mut HashSet<String>,
    roots: &mut Vec<RootCause>,
) -> Result<()> {
    if depth > max_depth || !visited.insert(atom_id.to_string()) {
        return Ok(());
    }

    let causes: Vec<String> = incoming_links(conn, atom_id)?
        .into_iter()
        .map(|(from, _)| from)
        .filter(|from| !visited.contains(from))
        .collect();

    if causes.is_empty() {
        if let Some(atom) = load_atom(conn, atom_id)? {
            roots.push(RootCause { atom, depth });
        }
        return Ok(());
    }

    for cause in causes {
        collect_roots(conn, &cause, depth + 1, max_depth, visited, roots)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::types::{NewAtom, NewMemory, NewMessage};
    use std::sync::Arc;

    fn create_test_store() -> Brain {
        Brain::open_in_memory().unwrap()
    }

    #[test]
    fn test_stm_chain_ends_at_source_message() {
        let brain = create_test_store();
        let msg = brain
            .send(NewMessage::new("scout", "BTC breakout", "price above 70k"))
            .unwrap();
        let stm = brain
            .remember(NewMemory::new("BTC broke 70k").with_source_message(&msg.id))
            .unwrap();

        let chain = brain.find_provenance(&stm).unwrap().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].kind, SourceKind::Stm);
        assert_eq!(chain[0].id, stm);
        assert!(chain[0].relation.is_none());
        assert_eq!(chain[1].kind, SourceKind::Message);
        assert_eq!(chain[1].id, msg.id);
        assert_eq!(chain[1].relation.as_deref(), Some("source_message"));
        assert_eq!(chain[1].preview, "BTC breakout");
    }

    #[test]
    fn test_no_back_pointer_is_none() {
        let brain = create_test_store();
        let stm = brain.remember(NewMemory::new("orphan")).unwrap();
        let atom = brain.create_atom(NewAtom::new("a", "b", "c", "d")).unwrap();
        let msg = brain.send(NewMessage::new("x", "y", "z")).unwrap();

        assert!(brain.find_provenance(&stm).unwrap().is_none());
        assert!(brain.find_provenance(&atom).unwrap().is_none());
        assert!(brain.find_provenance(&msg.id).unwrap().is_none());
        assert!(brain.find_provenance("nope").unwrap().is_none());
    }

    #[test]
    fn test_atom_chain_follows_strongest_link_to_message() {
        let brain = create_test_store();
        let msg = brain.send(NewMessage::new("scout", "report", "rates up")).unwrap();
        let origin = brain
            .create_atom(NewAtom::new("fed", "hikes", "yields rise", "stocks fall").with_source_message(&msg.id))
            .unwrap();
        let weak = brain.create_atom(NewAtom::new("rumor", "spreads", "noise", "stocks fall")).unwrap();
        let effect = brain.create_atom(NewAtom::new("stocks", "fall", "losses", "panic")).unwrap();

        brain.link_atoms(&origin, &effect, "causes", 0.9).unwrap();
        brain.link_atoms(&weak, &effect, "causes", 0.3).unwrap();

        let chain = brain.find_provenance(&effect).unwrap().unwrap();
        let ids: Vec<&str> = chain.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![effect.as_str(), origin.as_str(), msg.id.as_str()]);
        assert_eq!(chain[1].relation.as_deref(), Some("causes"));
        assert_eq!(chain[2].kind, SourceKind::Message);
    }

    #[test]
    fn test_provenance_survives_cycles() {
        let brain = create_test_store();
        let a = brain.create_atom(NewAtom::new("a", "b", "c", "d")).unwrap();
        let b = brain.create_atom(NewAtom::new("e", "f", "g", "h")).unwrap();
        brain.link_atoms(&a, &b, "causes", 0.9).unwrap();
        brain.link_atoms(&b, &a, "causes", 0.9).unwrap();

        let chain = brain.find_provenance(&a).unwrap().unwrap();
        let ids: Vec<&str> = chain.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);
    }

    #[test]
    fn test_find_root_causes() {
        let brain = create_test_store();
        let root1 = brain.create_atom(NewAtom::new("r1", "x", "x", "x")).unwrap();
        let root2 = brain.create_atom(NewAtom::new("r2", "x", "x", "x")).unwrap();
        let mid = brain.create_atom(NewAtom::new("mid", "x", "x", "x")).unwrap();
        let leaf = brain.create_atom(NewAtom::new("leaf", "x", "x", "x")).unwrap();

        brain.link_atoms(&root1, &mid, "causes", 0.8).unwrap();
        brain.link_atoms(&mid, &leaf, "causes", 0.9).unwrap();
        brain.link_atoms(&root2, &leaf, "causes", 0.5).unwrap();

        let roots = brain.find_root_causes(&leaf, 10).unwrap();
        let found: Vec<(&str, usize)> = roots.iter().map(|r| (r.atom.id.as_str(), r.depth)).collect();
        assert_eq!(found, vec![(root1.as_str(), 2), (root2.as_str(), 1)]);

        // Depth cut-off drops branches that go too deep
        let shallow = brain.find_root_causes(&leaf, 1).unwrap();
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[0].atom.id, root2);

        // An atom with no causes is its own root
        let own = brain.find_root_causes(&root1, 10).unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].depth, 0);
    }

    #[test]
    fn test_root_causes_cycle_and_unknown() {
        let brain = create_test_store();
        let a = brain.create_atom(NewAtom::new("a", "x", "x", "x")).unwrap();
        let b = brain.create_atom(NewAtom::new("b", "x", "x", "x")).unwrap();
        brain.link_atoms(&a, &b, "causes", 0.5).unwrap();
        brain.link_atoms(&b, &a, "causes", 0.5).unwrap();

        let roots = brain.find_root_causes(&b, 10).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].atom.id, a);
        assert_eq!(roots[0].depth, 1);

        assert!(matches!(
            brain.find_root_causes("atom_missing", 3).unwrap_err(),
            BrainError::NotFound(_)
        ));
    }

    #[test]
    fn test_dangling_source_message() {
        let brain = create_test_store();
        let stm = brain
            .remember(NewMemory::new("orphaned note").with_source_message("syn_gone"))
            .unwrap();
        assert!(brain.find_provenance(&stm).unwrap().is_none());

        // Atoms fall back to their strongest incoming link
        let cause = brain.create_atom(NewAtom::new("miner", "capitulates", "sell-off", "price drop")).unwrap();
        let atom = brain
            .create_atom(NewAtom::new("price", "drops", "fear", "outflows").with_source_message("syn_gone"))
            .unwrap();
        brain.link_atoms(&cause, &atom, "causes", 0.8).unwrap();

        let chain = brain.find_provenance(&atom).unwrap().unwrap();
        let ids: Vec<&str> = chain.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![atom.as_str(), cause.as_str()]);
        assert_eq!(chain[1].relation.as_deref(), Some("causes"));
    }

    #[test]
    fn test_find_all_paths_to_outcome() {
        let brain = create_test_store().with_embedder(Arc::new(MockEmbedder::default()));
        let whale = brain
            .create_atom(NewAtom::new("whale", "sells", "supply rises", "pressure"))
            .unwrap();
        let funding = brain
            .create_atom(NewAtom::new("funding", "flips", "shorts pile in", "squeeze risk"))
            .unwrap();
        let dump = brain
            .create_atom(NewAtom::new("market", "dumps", "price drops", "liquidations"))
            .unwrap();
        let halt = brain
            .create_atom(NewAtom::new("exchange", "halts", "price drops", "panic"))
            .unwrap();
        brain
            .create_atom(NewAtom::new("forecast", "clears", "sunny weather", "picnics"))
            .unwrap();

        brain.link_atoms(&whale, &dump, "causes", 0.8).unwrap();
        brain.link_atoms(&whale, &halt, "causes", 0.6).unwrap();
        brain.link_atoms(&funding, &halt, "causes", 0.7).unwrap();

        let roots = brain.find_all_paths_to_outcome("price drops", 10).unwrap();
        let found: Vec<(&str, usize, usize)> = roots
            .iter()
            .map(|r| (r.atom.id.as_str(), r.occurrences, r.depth))
            .collect();
        assert_eq!(found, vec![(whale.as_str(), 2, 1), (funding.as_str(), 1, 1)]);
    }

    #[test]
    fn test_paths_to_outcome_requires_embedder() {
        let brain = create_test_store();
        brain.create_atom(NewAtom::new("a", "b", "price drops", "d")).unwrap();
        assert!(matches!(
            brain.find_all_paths_to_outcome("price drops", 5).unwrap_err(),
            BrainError::EmbeddingUnavailable(_)
        ));
    }
}
