//! Snapshot export and import.
//!
//! A snapshot is one JSON document holding every row of every base table.
//! Derived data is left out and rebuilt on import: the surrogate `seq`
//! column, the FTS5 tables and the per-field atom embeddings (recomputed by
//! [`Brain::embed_pending`]).
//!
//! ```json
//! {
//!   "format": "cortex-brain-snapshot",
//!   "version": 1,
//!   "schema_version": 2,
//!   "exported_at": "2025-01-01T00:00:00.000000Z",
//!   "tables": { "messages": [ { "id": "syn_...", ... } ], ... }
//! }
//! ```
//!
//! BLOB values are written as `{"$encoding": "base64", "data": "..."}`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::error::{BrainError, Result};
use crate::store::Brain;
use crate::store::schema::{BASE_TABLES, FTS_TABLES, SCHEMA_VERSION, SURROGATE_COLUMN, table_columns};
use crate::types::format_timestamp;

/// Value of the snapshot `format` field.
pub const SNAPSHOT_FORMAT: &str = "cortex-brain-snapshot";

/// Snapshot layout version written by [`export`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// Layout version of the legacy SYNAPSE message file.
pub const SYNAPSE_VERSION: u32 = 1;

const ENCODING_KEY: &str = "$encoding";
const BASE64_ENCODING: &str = "base64";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    format: String,
    version: u32,
    schema_version: i32,
    exported_at: String,
    tables: BTreeMap<String, Vec<Map<String, JsonValue>>>,
}

/// Rows written per table by [`export`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub tables: BTreeMap<String, usize>,
}

impl ExportSummary {
    pub fn total_rows(&self) -> usize {
        self.tables.values().sum()
    }
}

/// Rows present per table after [`import`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub path: PathBuf,
    pub tables: BTreeMap<String, usize>,
}

impl ImportSummary {
    pub fn total_rows(&self) -> usize {
        self.tables.values().sum()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Export
// ─────────────────────────────────────────────────────────────────────────────

/// Write a snapshot of `brain` to `path`, read under a single transaction.
pub fn export(brain: &Brain, path: impl AsRef<Path>) -> Result<ExportSummary> {
    let path = path.as_ref();
    let snapshot = {
        let conn = brain.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut tables = BTreeMap::new();
        for table in BASE_TABLES {
            tables.insert(table.to_string(), dump_table(&tx, table)?);
        }
        tx.commit()?;
        Snapshot {
            format: SNAPSHOT_FORMAT.to_string(),
            version: SNAPSHOT_VERSION,
            schema_version: SCHEMA_VERSION,
            exported_at: format_timestamp(&Utc::now()),
            tables,
        }
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &snapshot)?;
    writer.flush()?;

    let tables: BTreeMap<String, usize> = snapshot
        .tables
        .iter()
        .map(|(name, rows)| (name.clone(), rows.len()))
        .collect();
    let summary = ExportSummary {
        path: path.to_path_buf(),
        tables,
    };
    info!(
        "Exported {} rows from {} tables to {:?}",
        summary.total_rows(),
        summary.tables.len(),
        path
    );
    Ok(summary)
}

fn dump_table(conn: &Connection, table: &str) -> Result<Vec<Map<String, JsonValue>>> {
    let columns: Vec<String> = table_columns(conn, table)?
        .into_iter()
        .filter(|c| c != SURROGATE_COLUMN)
        .collect();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY rowid",
        columns.join(", "),
        table
    ))?;
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            object.insert(column.clone(), to_json(row.get_ref(i)?));
        }
        out.push(object);
    }
    debug!("Dumped {} rows from {}", out.len(), table);
    Ok(out)
}

fn to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            let mut tagged = Map::with_capacity(2);
            tagged.insert(ENCODING_KEY.to_string(), JsonValue::from(BASE64_ENCODING));
            tagged.insert("data".to_string(), JsonValue::from(STANDARD.encode(bytes)));
            JsonValue::Object(tagged)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Import
// ─────────────────────────────────────────────────────────────────────────────

/// Rows of one table, decoded and ready to insert.
struct TableRows {
    table: &'static str,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Restore a snapshot into a new store at `target`.
///
/// The snapshot is fully validated before anything is written. `target`
/// must not exist; on failure no store is left behind.
pub fn import(snapshot: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<ImportSummary> {
    let snapshot_path = snapshot.as_ref();
    let target = target.as_ref();
    if target.exists() {
        return Err(BrainError::TargetExists(target.display().to_string()));
    }

    let reader = BufReader::new(File::open(snapshot_path)?);
    let snapshot: Snapshot = serde_json::from_reader(reader)
        .map_err(|e| BrainError::SnapshotFormat(format!("unreadable snapshot: {}", e)))?;
    let prepared = validate_snapshot(snapshot)?;

    match restore(&prepared, target) {
        Ok(summary) => {
            info!(
                "Imported {} rows into {:?} from {:?}",
                summary.total_rows(),
                target,
                snapshot_path
            );
            Ok(summary)
        }
        Err(e) => {
            warn!("Import into {:?} failed, removing partial store: {}", target, e);
            remove_store_files(target);
            Err(e)
        }
    }
}

fn validate_snapshot(snapshot: Snapshot) -> Result<Vec<TableRows>> {
    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(BrainError::SnapshotFormat(format!(
            "unknown format '{}'",
            snapshot.format
        )));
    }
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(BrainError::SnapshotFormat(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    if snapshot.schema_version > SCHEMA_VERSION {
        return Err(BrainError::SnapshotFormat(format!(
            "schema version {} is newer than supported version {}",
            snapshot.schema_version, SCHEMA_VERSION
        )));
    }
    if let Some(unknown) = snapshot
        .tables
        .keys()
        .find(|name| !BASE_TABLES.contains(&name.as_str()))
    {
        return Err(BrainError::SnapshotFormat(format!("unknown table '{}'", unknown)));
    }

    // Column lists come from a scratch store with the current schema.
    let reference = Brain::open_in_memory()?;
    let reference_conn = reference.conn.lock();

    let mut tables = snapshot.tables;
    let mut prepared = Vec::with_capacity(BASE_TABLES.len());
    for table in BASE_TABLES {
        let Some(raw_rows) = tables.remove(table) else {
            continue;
        };
        let known: Vec<String> = table_columns(&reference_conn, table)?
            .into_iter()
            .filter(|c| c != SURROGATE_COLUMN)
            .collect();

        let mut rows = Vec::with_capacity(raw_rows.len());
        for (index, raw) in raw_rows.into_iter().enumerate() {
            if let Some(column) = raw.keys().find(|k| !known.iter().any(|c| c == *k)) {
                return Err(BrainError::SnapshotFormat(format!(
                    "unknown column '{}' in table '{}'",
                    column, table
                )));
            }
            let mut row = Vec::with_capacity(known.len());
            for column in &known {
                let value = raw.get(column).unwrap_or(&JsonValue::Null);
                row.push(from_json(value).map_err(|reason| {
                    BrainError::SnapshotFormat(format!(
                        "{}[{}].{}: {}",
                        table, index, column, reason
                    ))
                })?);
            }
            rows.push(row);
        }

        prepared.push(TableRows {
            table,
            columns: known,
            rows,
        });
    }
    Ok(prepared)
}

fn from_json(value: &JsonValue) -> std::result::Result<Value, String> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Integer(i64::from(*b))),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Integer(i)),
            None => n
                .as_f64()
                .map(Value::Real)
                .ok_or_else(|| format!("unrepresentable number {}", n)),
        },
        JsonValue::String(s) => Ok(Value::Text(s.clone())),
        JsonValue::Object(object) => {
            let encoding = object.get(ENCODING_KEY).and_then(JsonValue::as_str);
            let data = object.get("data").and_then(JsonValue::as_str);
            match (encoding, data) {
                (Some(BASE64_ENCODING), Some(data)) => STANDARD
                    .decode(data)
                    .map(Value::Blob)
                    .map_err(|e| format!("invalid base64: {}", e)),
                _ => Err("unsupported object value".to_string()),
            }
        }
        JsonValue::Array(_) => Err("unsupported array value".to_string()),
    }
}

fn restore(prepared: &[TableRows], target: &Path) -> Result<ImportSummary> {
    let brain = Brain::open(target)?;

    brain.write(|tx| {
        for table in prepared {
            let placeholders: Vec<String> =
                (1..=table.columns.len()).map(|i| format!("?{}", i)).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                table.table,
                table.columns.join(", "),
                placeholders.join(", ")
            ))?;
            for row in &table.rows {
                stmt.execute(params_from_iter(row.iter()))?;
            }
            debug!("Loaded {} rows into {}", table.rows.len(), table.table);
        }
        for fts in FTS_TABLES {
            tx.execute(&format!("INSERT INTO {fts}({fts}) VALUES ('rebuild')"), [])?;
        }
        Ok(())
    })?;

    let conn = brain.conn.lock();
    let mut tables = BTreeMap::new();
    for table in BASE_TABLES {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        tables.insert(table.to_string(), n as usize);
    }
    Ok(ImportSummary {
        path: target.to_path_buf(),
        tables,
    })
}

fn remove_store_files(target: &Path) {
    let mut paths = vec![target.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = target.as_os_str().to_owned();
        name.push(suffix);
        paths.push(PathBuf::from(name));
    }
    for path in paths {
        if path.exists()
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Legacy SYNAPSE export
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SynapseFile {
    version: u32,
    messages: Vec<SynapseMessage>,
}

#[derive(Debug, Serialize)]
struct SynapseMessage {
    id: String,
    thread_id: String,
    from: String,
    to: Option<String>,
    priority: String,
    subject: String,
    body: String,
    timestamp: String,
    read_by: Vec<String>,
    status: &'static str,
    ack_body: Option<String>,
}

/// Write every message in the legacy SYNAPSE JSON layout. Returns the message count.
pub fn export_synapse(brain: &Brain, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let messages = {
        let conn = brain.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let messages = synapse_messages(&tx)?;
        tx.commit()?;
        messages
    };
    let count = messages.len();

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(
        &mut writer,
        &SynapseFile {
            version: SYNAPSE_VERSION,
            messages,
        },
    )?;
    writer.flush()?;

    info!("Exported {} messages in SYNAPSE layout to {:?}", count, path);
    Ok(count)
}

fn synapse_messages(conn: &Connection) -> Result<Vec<SynapseMessage>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, thread_id, from_agent, to_agent, priority, subject, body, created_at
        FROM messages ORDER BY created_at ASC, seq ASC
        "#,
    )?;
    let mut readers_stmt = conn.prepare(
        "SELECT agent_id FROM read_receipts WHERE message_id = ?1 ORDER BY read_at ASC, agent_id ASC",
    )?;
    let mut acks_stmt = conn.prepare(
        "SELECT ack_body FROM acks WHERE message_id = ?1 ORDER BY acked_at ASC, agent_id ASC",
    )?;

    let mut rows = stmt.query([])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;

        let read_by = readers_stmt
            .query_map(params![id], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let ack_bodies = acks_stmt
            .query_map(params![id], |r| r.get::<_, Option<String>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let status = if !ack_bodies.is_empty() {
            "acknowledged"
        } else if !read_by.is_empty() {
            "read"
        } else {
            "unread"
        };

        messages.push(SynapseMessage {
            thread_id: row.get(1)?,
            from: row.get(2)?,
            to: row.get(3)?,
            priority: row.get(4)?,
            subject: row.get(5)?,
            body: row.get(6)?,
            timestamp: row.get(7)?,
            read_by,
            status,
            ack_body: ack_bodies.into_iter().flatten().next(),
            id,
        });
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::types::{NewAtom, NewMemory, NewMessage, SearchResult};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn seeded_store(dir: &TempDir) -> Brain {
        let brain = Brain::open(dir.path().join("source.db"))
            .unwrap()
            .with_embedder(Arc::new(MockEmbedder::new(64)));
        let msg = brain
            .send(NewMessage::new("a", "deploy window", "friday evening").to("b"))
            .unwrap();
        brain.ack(&msg.id, "b", Some("ok")).unwrap();
        let stm = brain
            .remember(NewMemory::new("deploys slip on fridays").with_source_message(&msg.id))
            .unwrap();
        let a1 = brain
            .create_atom(NewAtom::new("deploy", "slips", "late release", "weekend pages"))
            .unwrap();
        let a2 = brain
            .create_atom(NewAtom::new("weekend", "pages", "tired team", "more bugs"))
            .unwrap();
        brain.link_atoms(&a1, &a2, "causes", 0.8).unwrap();
        brain.pin(&stm, Some("lesson")).unwrap();
        brain
    }

    fn write_snapshot(dir: &TempDir, name: &str, value: &JsonValue) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, serde_json::to_vec(value).unwrap()).unwrap();
        path
    }

    fn minimal_snapshot() -> JsonValue {
        json!({
            "format": SNAPSHOT_FORMAT,
            "version": SNAPSHOT_VERSION,
            "schema_version": SCHEMA_VERSION,
            "exported_at": "2025-01-01T00:00:00.000000Z",
            "tables": {}
        })
    }

    #[test]
    fn test_export_layout() {
        let dir = TempDir::new().unwrap();
        let brain = seeded_store(&dir);
        let path = dir.path().join("snap.json");

        let summary = export(&brain, &path).unwrap();
        assert_eq!(summary.tables.len(), BASE_TABLES.len());
        assert_eq!(summary.tables["messages"], 1);
        assert_eq!(summary.tables["atom_links"], 1);

        let value: JsonValue = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["format"], SNAPSHOT_FORMAT);
        assert_eq!(value["version"], 1);
        assert!(value["tables"].get("atom_field_embeddings").is_none());

        let message = &value["tables"]["messages"][0];
        assert!(message.get("seq").is_none());
        assert_eq!(message["subject"], "deploy window");

        let embedding = &value["tables"]["embeddings"][0];
        assert_eq!(embedding["vector"]["$encoding"], "base64");
        assert!(embedding["vector"]["data"].is_string());
    }

    #[test]
    fn test_round_trip_preserves_rows_and_search() {
        let dir = TempDir::new().unwrap();
        let brain = seeded_store(&dir);
        let snap = dir.path().join("snap.json");
        let exported = export(&brain, &snap).unwrap();

        let target = dir.path().join("restored.db");
        let imported = import(&snap, &target).unwrap();
        assert_eq!(imported.tables, exported.tables);

        // Compare lexical ranking; neither handle has an embedder
        let source = Brain::open(dir.path().join("source.db")).unwrap();
        let restored = Brain::open(&target).unwrap();
        let before = source.unified_search("fridays", 5, None).unwrap();
        let after = restored.unified_search("fridays", 5, None).unwrap();
        let ids = |r: &[SearchResult]| r.iter().map(|x| x.id.clone()).collect::<Vec<_>>();
        assert!(!before.is_empty());
        assert_eq!(ids(&before), ids(&after));

        // Field vectors are derived and come back through embed_pending
        let restored = restored.with_embedder(Arc::new(MockEmbedder::new(64)));
        assert_eq!(restored.stats().unwrap().field_embedding_count, 0);
        assert_eq!(restored.embed_pending(0).unwrap(), 2);
        assert_eq!(restored.stats().unwrap().field_embedding_count, 8);
    }

    #[test]
    fn test_import_refuses_existing_target() {
        let dir = TempDir::new().unwrap();
        let snap = write_snapshot(&dir, "snap.json", &minimal_snapshot());
        let target = dir.path().join("exists.db");
        std::fs::write(&target, b"").unwrap();

        assert!(matches!(
            import(&snap, &target).unwrap_err(),
            BrainError::TargetExists(_)
        ));
    }

    #[test]
    fn test_import_rejects_bad_snapshots() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("never.db");

        let mut bad_format = minimal_snapshot();
        bad_format["format"] = json!("something-else");
        let mut bad_version = minimal_snapshot();
        bad_version["version"] = json!(99);
        let mut bad_table = minimal_snapshot();
        bad_table["tables"] = json!({ "invoices": [] });
        let mut bad_column = minimal_snapshot();
        bad_column["tables"] = json!({ "meta": [{ "key": "k", "value": "v", "extra": 1 }] });
        let mut bad_blob = minimal_snapshot();
        bad_blob["tables"] = json!({ "meta": [{ "key": "k", "value": { "$encoding": "base64", "data": "***" } }] });

        for (i, snapshot) in [bad_format, bad_version, bad_table, bad_column, bad_blob]
            .iter()
            .enumerate()
        {
            let snap = write_snapshot(&dir, &format!("bad{}.json", i), snapshot);
            assert!(
                matches!(import(&snap, &target).unwrap_err(), BrainError::SnapshotFormat(_)),
                "case {}",
                i
            );
            assert!(!target.exists());
        }

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, b"not json").unwrap();
        assert!(matches!(
            import(&garbage, &target).unwrap_err(),
            BrainError::SnapshotFormat(_)
        ));
        assert!(!target.exists());
    }

    #[test]
    fn test_failed_import_leaves_no_store() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("partial.db");
        let mut snapshot = minimal_snapshot();
        // Message pointing at a thread that does not exist violates the foreign key
        snapshot["tables"] = json!({
            "messages": [{
                "id": "syn_1", "thread_id": "thr_missing", "from_agent": "a",
                "priority": "info", "subject": "s", "body": "b",
                "created_at": "2025-01-01T00:00:00.000000Z"
            }]
        });
        let snap = write_snapshot(&dir, "fk.json", &snapshot);

        assert!(import(&snap, &target).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_export_synapse() {
        let dir = TempDir::new().unwrap();
        let brain = seeded_store(&dir);
        brain.send(NewMessage::new("c", "fyi", "nothing urgent")).unwrap();
        let path = dir.path().join("synapse.json");

        assert_eq!(export_synapse(&brain, &path).unwrap(), 2);

        let value: JsonValue = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        let first = &value["messages"][0];
        assert_eq!(first["from"], "a");
        assert_eq!(first["to"], "b");
        assert_eq!(first["status"], "acknowledged");
        assert_eq!(first["ack_body"], "ok");
        assert_eq!(first["read_by"], json!(["b"]));
        let second = &value["messages"][1];
        assert_eq!(second["status"], "unread");
        assert!(second["to"].is_null());
    }
}
