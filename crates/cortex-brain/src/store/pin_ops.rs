//! Working memory: a small, count-bounded set of pinned STM entries and atoms.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::error::{BrainError, Result};
use crate::types::{PinKind, WorkingMemoryPin, parse_timestamp};
use crate::validation::validate_required;

use super::Brain;
use super::atom_ops::atom_exists;
use super::stm_ops::stm_exists;

impl Brain {
    /// Pin an STM entry or atom.
    ///
    /// Pinning an already pinned item keeps its position and replaces the
    /// label when one is given. When the set is full the oldest pin is evicted.
    pub fn pin(&self, item_id: &str, label: Option<&str>) -> Result<WorkingMemoryPin> {
        validate_required("item_id", item_id)?;
        let capacity = self.settings.working_memory_capacity.max(1);
        let now = Self::now_timestamp();

        let (pin, evicted) = self.write(|tx| {
            let kind = resolve_kind(tx, item_id)?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT pinned_at FROM working_memory WHERE item_id = ?1",
                    params![item_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                tx.execute(
                    "UPDATE working_memory SET label = COALESCE(?2, label) WHERE item_id = ?1",
                    params![item_id, label],
                )?;
                return Ok((load_pin(tx, item_id)?, Vec::new()));
            }

            let count: i64 =
                tx.query_row("SELECT COUNT(*) FROM working_memory", [], |row| row.get(0))?;
            let overflow = (count as usize + 1).saturating_sub(capacity);
            let mut evicted = Vec::new();
            if overflow > 0 {
                let mut stmt = tx.prepare(
                    "SELECT item_id FROM working_memory ORDER BY pinned_at ASC, rowid ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![overflow as i64], |row| row.get::<_, String>(0))?;
                for row in rows {
                    evicted.push(row?);
                }
                for id in &evicted {
                    tx.execute("DELETE FROM working_memory WHERE item_id = ?1", params![id])?;
                }
            }

            tx.execute(
                "INSERT INTO working_memory (item_id, item_kind, label, pinned_at) VALUES (?1, ?2, ?3, ?4)",
                params![item_id, kind.as_str(), label, now],
            )?;
            Ok((load_pin(tx, item_id)?, evicted))
        })?;

        for id in &evicted {
            warn!("Working memory full ({} pins), evicted {}", capacity, id);
        }
        debug!("Pinned {} {}", pin.item_kind.as_str(), pin.item_id);
        Ok(pin)
    }

    /// Current pins, oldest first.
    pub fn pins(&self) -> Result<Vec<WorkingMemoryPin>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT item_id, item_kind, label, pinned_at FROM working_memory ORDER BY pinned_at ASC, rowid ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut pins = Vec::new();
        while let Some(row) = rows.next()? {
            pins.push(row_to_pin(row)?);
        }
        Ok(pins)
    }

    /// Remove a pin. Returns whether one existed.
    pub fn unpin(&self, item_id: &str) -> Result<bool> {
        self.write(|tx| {
            let rows = tx.execute(
                "DELETE FROM working_memory WHERE item_id = ?1",
                params![item_id],
            )?;
            Ok(rows > 0)
        })
    }

    /// Remove every pin. Returns how many were removed.
    pub fn clear_pins(&self) -> Result<usize> {
        let cleared = self.write(|tx| Ok(tx.execute("DELETE FROM working_memory", [])?))?;
        debug!("Cleared {} pins", cleared);
        Ok(cleared)
    }
}

fn resolve_kind(conn: &Connection, item_id: &str) -> Result<PinKind> {
    if stm_exists(conn, item_id)? {
        Ok(PinKind::Stm)
    } else if atom_exists(conn, item_id)? {
        Ok(PinKind::Atom)
    } else {
        Err(BrainError::NotFound(format!("STM entry or atom {}", item_id)))
    }
}

fn load_pin(conn: &Connection, item_id: &str) -> Result<WorkingMemoryPin> {
    let mut stmt = conn.prepare(
        "SELECT item_id, item_kind, label, pinned_at FROM working_memory WHERE item_id = ?1",
    )?;
    let mut rows = stmt.query(params![item_id])?;
    match rows.next()? {
        Some(row) => row_to_pin(row),
        None => Err(BrainError::NotFound(format!("Pin {}", item_id))),
    }
}

fn row_to_pin(row: &rusqlite::Row) -> Result<WorkingMemoryPin> {
    let kind_str: String = row.get(1)?;
    let pinned_at_str: String = row.get(3)?;
    Ok(WorkingMemoryPin {
        item_id: row.get(0)?,
        item_kind: kind_str.parse()?,
        label: row.get(2)?,
        pinned_at: parse_timestamp(&pinned_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewAtom, NewMemory};
    use cortex_config::{BrainConfig, CortexConfig};

    fn create_test_store() -> Brain {
        Brain::open_in_memory().unwrap()
    }

    fn store_with_capacity(capacity: usize) -> Brain {
        let config = CortexConfig {
            brain: Some(BrainConfig {
                working_memory_capacity: capacity,
                ..Default::default()
            }),
            ..Default::default()
        };
        Brain::open_in_memory_with_config(&config).unwrap()
    }

    #[test]
    fn test_pin_stm_and_atom() {
        let brain = create_test_store();
        let stm = brain.remember(NewMemory::new("note")).unwrap();
        let atom = brain
            .create_atom(NewAtom::new("s", "a", "o", "c"))
            .unwrap();

        let p1 = brain.pin(&stm, Some("current task")).unwrap();
        assert_eq!(p1.item_kind, PinKind::Stm);
        assert_eq!(p1.label.as_deref(), Some("current task"));

        let p2 = brain.pin(&atom, None).unwrap();
        assert_eq!(p2.item_kind, PinKind::Atom);

        let pins = brain.pins().unwrap();
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[0].item_id, stm);
        assert_eq!(pins[1].item_id, atom);
    }

    #[test]
    fn test_pin_unknown_item() {
        let brain = create_test_store();
        assert!(matches!(
            brain.pin("stm_missing", None).unwrap_err(),
            BrainError::NotFound(_)
        ));
        assert!(brain.pins().unwrap().is_empty());
    }

    #[test]
    fn test_repin_updates_label_keeps_position() {
        let brain = create_test_store();
        let a = brain.remember(NewMemory::new("a")).unwrap();
        let b = brain.remember(NewMemory::new("b")).unwrap();

        let first = brain.pin(&a, Some("old")).unwrap();
        brain.pin(&b, None).unwrap();
        let again = brain.pin(&a, Some("new")).unwrap();
        assert_eq!(again.label.as_deref(), Some("new"));
        assert_eq!(again.pinned_at, first.pinned_at);

        // No label keeps the current one
        let kept = brain.pin(&a, None).unwrap();
        assert_eq!(kept.label.as_deref(), Some("new"));

        let pins = brain.pins().unwrap();
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[0].item_id, a);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let brain = store_with_capacity(2);
        let ids: Vec<String> = (0..3)
            .map(|i| brain.remember(NewMemory::new(format!("m{}", i))).unwrap())
            .collect();

        for id in &ids {
            brain.pin(id, None).unwrap();
        }

        let pinned: Vec<String> = brain.pins().unwrap().into_iter().map(|p| p.item_id).collect();
        assert_eq!(pinned, vec![ids[1].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_unpin_and_clear() {
        let brain = create_test_store();
        let a = brain.remember(NewMemory::new("a")).unwrap();
        let b = brain.remember(NewMemory::new("b")).unwrap();
        brain.pin(&a, None).unwrap();
        brain.pin(&b, None).unwrap();

        assert!(brain.unpin(&a).unwrap());
        assert!(!brain.unpin(&a).unwrap());
        assert_eq!(brain.pins().unwrap().len(), 1);

        assert_eq!(brain.clear_pins().unwrap(), 1);
        assert_eq!(brain.clear_pins().unwrap(), 0);
    }
}
