//! Table, index and full-text definitions.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{BrainError, Result};

/// Current schema version, stored in `PRAGMA user_version` and `meta.schema_version`.
pub const SCHEMA_VERSION: i32 = 2;

/// Base tables in dependency order (parents before children).
///
/// Excludes `atom_field_embeddings`; `embed_pending` regenerates it.
pub const BASE_TABLES: [&str; 11] = [
    "meta",
    "categories",
    "threads",
    "messages",
    "read_receipts",
    "acks",
    "stm",
    "atoms",
    "atom_links",
    "embeddings",
    "working_memory",
];

/// External-content FTS5 tables rebuilt after a bulk load.
pub const FTS_TABLES: [&str; 3] = ["messages_fts", "stm_fts", "atoms_fts"];

/// Surrogate row-id column of content tables; never leaves the store.
pub const SURROGATE_COLUMN: &str = "seq";

const SCHEMA_SQL: &str = r#"
-- Key/value metadata
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Category registry (version 2)
CREATE TABLE IF NOT EXISTS categories (
    name TEXT PRIMARY KEY,
    keywords TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

-- Messaging
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    subject TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_message_at TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active'
);
CREATE INDEX IF NOT EXISTS idx_threads_last_message_at ON threads(last_message_at);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    thread_id TEXT NOT NULL REFERENCES threads(id),
    from_agent TEXT NOT NULL,
    to_agent TEXT,
    priority TEXT NOT NULL DEFAULT 'info',
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    task_status TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_agent);
CREATE INDEX IF NOT EXISTS idx_messages_from ON messages(from_agent);
CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);

CREATE TABLE IF NOT EXISTS read_receipts (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    agent_id TEXT NOT NULL,
    read_at TEXT NOT NULL,
    PRIMARY KEY (message_id, agent_id)
);

CREATE TABLE IF NOT EXISTS acks (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    agent_id TEXT NOT NULL,
    ack_body TEXT,
    acked_at TEXT NOT NULL,
    PRIMARY KEY (message_id, agent_id)
);

-- Short-term memory
CREATE TABLE IF NOT EXISTS stm (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    categories TEXT NOT NULL DEFAULT '["general"]',
    importance REAL NOT NULL DEFAULT 1.0,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'manual',
    source_message_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_stm_created_at ON stm(created_at);

-- Knowledge graph
CREATE TABLE IF NOT EXISTS atoms (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    subject TEXT NOT NULL,
    action TEXT NOT NULL,
    outcome TEXT NOT NULL,
    consequences TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    source TEXT NOT NULL DEFAULT 'manual',
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    source_message_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_atoms_created_at ON atoms(created_at);

CREATE TABLE IF NOT EXISTS atom_links (
    from_atom_id TEXT NOT NULL REFERENCES atoms(id) ON DELETE CASCADE,
    to_atom_id TEXT NOT NULL REFERENCES atoms(id) ON DELETE CASCADE,
    link_type TEXT NOT NULL,
    strength REAL NOT NULL,
    observation_count INTEGER NOT NULL DEFAULT 1,
    last_observed TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (from_atom_id, to_atom_id, link_type)
);
CREATE INDEX IF NOT EXISTS idx_atom_links_to ON atom_links(to_atom_id);

-- Embedding index
CREATE TABLE IF NOT EXISTS embeddings (
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    content TEXT NOT NULL,
    vector BLOB NOT NULL,
    dims INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_type, source_id)
);

CREATE TABLE IF NOT EXISTS atom_field_embeddings (
    atom_id TEXT NOT NULL REFERENCES atoms(id) ON DELETE CASCADE,
    field TEXT NOT NULL,
    vector BLOB NOT NULL,
    dims INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (atom_id, field)
);

-- Working memory
CREATE TABLE IF NOT EXISTS working_memory (
    item_id TEXT PRIMARY KEY,
    item_kind TEXT NOT NULL,
    label TEXT,
    pinned_at TEXT NOT NULL
);

-- Full-text shadow tables
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    subject, body, content='messages', content_rowid='seq'
);
CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, subject, body) VALUES (new.seq, new.subject, new.body);
END;
CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, body)
    VALUES ('delete', old.seq, old.subject, old.body);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS stm_fts USING fts5(
    content, content='stm', content_rowid='seq'
);
CREATE TRIGGER IF NOT EXISTS stm_fts_ai AFTER INSERT ON stm BEGIN
    INSERT INTO stm_fts(rowid, content) VALUES (new.seq, new.content);
END;
CREATE TRIGGER IF NOT EXISTS stm_fts_ad AFTER DELETE ON stm BEGIN
    INSERT INTO stm_fts(stm_fts, rowid, content) VALUES ('delete', old.seq, old.content);
END;
CREATE TRIGGER IF NOT EXISTS stm_fts_au AFTER UPDATE OF content ON stm BEGIN
    INSERT INTO stm_fts(stm_fts, rowid, content) VALUES ('delete', old.seq, old.content);
    INSERT INTO stm_fts(rowid, content) VALUES (new.seq, new.content);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS atoms_fts USING fts5(
    subject, action, outcome, consequences, content='atoms', content_rowid='seq'
);
CREATE TRIGGER IF NOT EXISTS atoms_fts_ai AFTER INSERT ON atoms BEGIN
    INSERT INTO atoms_fts(rowid, subject, action, outcome, consequences)
    VALUES (new.seq, new.subject, new.action, new.outcome, new.consequences);
END;
CREATE TRIGGER IF NOT EXISTS atoms_fts_ad AFTER DELETE ON atoms BEGIN
    INSERT INTO atoms_fts(atoms_fts, rowid, subject, action, outcome, consequences)
    VALUES ('delete', old.seq, old.subject, old.action, old.outcome, old.consequences);
END;
"#;

/// Read `PRAGMA user_version`; a non-database file fails here.
pub(crate) fn read_user_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| BrainError::StoreOpen(format!("not a readable store: {}", e)))
}

/// Refuse files written by a newer schema or belonging to another application.
pub(crate) fn check_compatibility(conn: &Connection) -> Result<i32> {
    let version = read_user_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(BrainError::StoreOpen(format!(
            "schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    let table_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
        [],
        |row| row.get(0),
    )?;
    let has_meta: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if table_count > 0 && !has_meta {
        return Err(BrainError::StoreOpen(
            "file is a database of an unknown schema".to_string(),
        ));
    }

    Ok(version)
}

/// Create every table, index, FTS table and trigger that is missing.
pub(crate) fn create_schema(conn: &Connection, current_version: i32) -> Result<()> {
    if current_version >= SCHEMA_VERSION {
        debug!("Schema up to date (version {})", current_version);
        return Ok(());
    }

    info!(
        "Creating schema (version {} -> {})",
        current_version, SCHEMA_VERSION
    );
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Column names of a table, in declaration order.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        crate::vector::init_vector_extension();
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_schema_idempotent() {
        let conn = fresh();
        create_schema(&conn, 0).unwrap();
        let version = check_compatibility(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        // A second pass is a no-op; forcing it re-runs IF NOT EXISTS cleanly
        create_schema(&conn, version).unwrap();
        create_schema(&conn, 0).unwrap();

        for table in BASE_TABLES.iter().chain(FTS_TABLES.iter()) {
            assert!(!table_columns(&conn, table).unwrap().is_empty(), "{}", table);
        }
    }

    #[test]
    fn test_version_one_store_gains_category_registry() {
        let conn = fresh();
        create_schema(&conn, 0).unwrap();
        conn.execute_batch("DROP TABLE categories").unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        let version = check_compatibility(&conn).unwrap();
        assert_eq!(version, 1);
        create_schema(&conn, version).unwrap();

        assert_eq!(read_user_version(&conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(
            table_columns(&conn, "categories").unwrap(),
            vec!["name", "keywords", "created_at"]
        );
    }

    #[test]
    fn test_foreign_database_rejected() {
        let conn = fresh();
        conn.execute_batch("CREATE TABLE invoices (id INTEGER PRIMARY KEY)")
            .unwrap();
        let err = check_compatibility(&conn).unwrap_err();
        assert!(matches!(err, BrainError::StoreOpen(_)));
    }

    #[test]
    fn test_newer_schema_rejected() {
        let conn = fresh();
        create_schema(&conn, 0).unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let err = check_compatibility(&conn).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn test_fts_sync_triggers() {
        let conn = fresh();
        create_schema(&conn, 0).unwrap();
        conn.execute(
            "INSERT INTO stm (id, content, created_at) VALUES ('s1', 'alpha beta', 'now')",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM stm_fts WHERE stm_fts MATCH 'alpha'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("UPDATE stm SET content = 'gamma' WHERE id = 's1'", [])
            .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM stm_fts WHERE stm_fts MATCH 'alpha'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);

        // Access accounting does not touch the index
        conn.execute(
            "UPDATE stm SET access_count = access_count + 1 WHERE id = 's1'",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM stm_fts WHERE stm_fts MATCH 'gamma'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
