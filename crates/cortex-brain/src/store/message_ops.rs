//! Messaging operations: messages, threads, read receipts and acknowledgements.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{BrainError, Result};
use crate::types::{
    HistoryFilter, Message, NewMessage, Priority, SourceKind, Thread, format_timestamp, new_id,
    parse_timestamp,
};
use crate::validation::validate_required;
use crate::vector::delete_embedding;

use super::Brain;
use super::embedding_ops::message_text;

const MESSAGE_COLUMNS: &str = "m.id, m.thread_id, m.from_agent, m.to_agent, m.subject, m.body, \
                               m.priority, m.created_at, m.task_status";

/// Read/ack flags across all agents.
const FLAGS_ANY: &str = "EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id), \
                         EXISTS (SELECT 1 FROM acks a WHERE a.message_id = m.id)";

/// Read/ack flags for the agent bound to `?1`.
const FLAGS_FOR_AGENT: &str =
    "EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.agent_id = ?1), \
     EXISTS (SELECT 1 FROM acks a WHERE a.message_id = m.id AND a.agent_id = ?1)";

const THREAD_COLUMNS: &str =
    "id, subject, created_by, created_at, last_message_at, message_count, status";

impl Brain {
    /// Send a message, creating its thread if needed.
    ///
    /// Without a thread id a new thread is started; an unknown thread id
    /// creates that thread. The thread's counters are updated in the same
    /// transaction as the insert.
    pub fn send(&self, msg: NewMessage) -> Result<Message> {
        validate_required("from", &msg.from)?;
        validate_required("subject", &msg.subject)?;
        validate_required("body", &msg.body)?;
        if let Some(ref to) = msg.to {
            validate_required("to", to)?;
        }
        if let Some(ref thread_id) = msg.thread_id {
            validate_required("thread_id", thread_id)?;
        }

        let id = new_id("syn");
        let thread_id = msg.thread_id.clone().unwrap_or_else(|| new_id("thr"));
        let text = message_text(&msg.subject, &msg.body);
        let prepared = self.auto_embed(&[text.as_str()]);
        let created_at = Utc::now();
        let ts = format_timestamp(&created_at);

        self.write(|tx| {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO threads (id, subject, created_by, created_at, last_message_at, message_count, status)
                VALUES (?1, ?2, ?3, ?4, ?4, 0, 'active')
                "#,
                params![thread_id, msg.subject, msg.from, ts],
            )?;
            tx.execute(
                r#"
                INSERT INTO messages (id, thread_id, from_agent, to_agent, priority, subject, body, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    id,
                    thread_id,
                    msg.from,
                    msg.to,
                    msg.priority.as_str(),
                    msg.subject,
                    msg.body,
                    ts,
                ],
            )?;
            tx.execute(
                r#"
                UPDATE threads
                SET message_count = message_count + 1,
                    last_message_at = MAX(last_message_at, ?2)
                WHERE id = ?1
                "#,
                params![thread_id, ts],
            )?;
            if let Some(ref p) = prepared
                && let Some(vector) = p.vectors.first()
            {
                self.store_vector(tx, SourceKind::Message, &id, &text, vector, &p.model)?;
            }
            Ok(())
        })?;

        debug!("Sent message {} in thread {}", id, thread_id);
        Ok(Message {
            id,
            thread_id,
            from_agent: msg.from,
            to_agent: msg.to,
            subject: msg.subject,
            body: msg.body,
            priority: msg.priority,
            created_at,
            read: false,
            acknowledged: false,
            task_status: None,
        })
    }

    /// Messages addressed to `agent` or broadcast by someone else, newest first.
    ///
    /// Unless `include_read`, messages `agent` has a read receipt for are skipped.
    /// `read`/`acknowledged` on the results are from `agent`'s point of view.
    pub fn inbox(&self, agent: &str, include_read: bool) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}, {FLAGS_FOR_AGENT}
            FROM messages m
            WHERE (m.to_agent = ?1 OR (m.to_agent IS NULL AND m.from_agent != ?1))
              AND (?2 OR NOT EXISTS (
                    SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.agent_id = ?1))
            ORDER BY m.created_at DESC, m.seq DESC
            "#
        ))?;
        let mut rows = stmt.query(params![agent, include_read])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(Self::row_to_message(row)?);
        }
        Ok(messages)
    }

    /// Record that `agent` read a message and return it.
    pub fn read_message(&self, id: &str, agent: &str) -> Result<Message> {
        validate_required("agent", agent)?;
        let ts = Self::now_timestamp();
        self.write(|tx| {
            ensure_message(tx, id)?;
            tx.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, agent_id, read_at) VALUES (?1, ?2, ?3)",
                params![id, agent, ts],
            )?;
            Ok(())
        })?;
        debug!("Message {} read by {}", id, agent);
        self.message_for_agent(id, agent)
    }

    /// Acknowledge a message on behalf of `agent`. Implies a read receipt; idempotent.
    pub fn ack(&self, id: &str, agent: &str, ack_body: Option<&str>) -> Result<Message> {
        validate_required("agent", agent)?;
        let ts = Self::now_timestamp();
        self.write(|tx| {
            ensure_message(tx, id)?;
            tx.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, agent_id, read_at) VALUES (?1, ?2, ?3)",
                params![id, agent, ts],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO acks (message_id, agent_id, ack_body, acked_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, agent, ack_body, ts],
            )?;
            Ok(())
        })?;
        debug!("Message {} acknowledged by {}", id, agent);
        self.message_for_agent(id, agent)
    }

    /// Set or clear the task status carried by a message.
    pub fn set_task_status(&self, id: &str, status: Option<&str>) -> Result<()> {
        if let Some(status) = status {
            validate_required("task_status", status)?;
        }
        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE messages SET task_status = ?2 WHERE id = ?1",
                params![id, status],
            )?;
            if rows == 0 {
                return Err(BrainError::NotFound(format!("Message {}", id)));
            }
            Ok(())
        })
    }

    /// Get a message by ID. Flags reflect any agent.
    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}, {FLAGS_ANY} FROM messages m WHERE m.id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_message(row)?))
        } else {
            Ok(None)
        }
    }

    /// The newest `limit` matching messages, returned oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT * FROM (
                SELECT {MESSAGE_COLUMNS}, {FLAGS_ANY}, m.seq AS seq_order
                FROM messages m
                WHERE (?1 IS NULL OR m.from_agent = ?1 OR m.to_agent = ?1)
                  AND (?2 IS NULL OR m.thread_id = ?2)
                ORDER BY m.created_at DESC, m.seq DESC
                LIMIT ?3
            )
            ORDER BY created_at ASC, seq_order ASC
            "#
        ))?;
        let mut rows = stmt.query(params![filter.agent, filter.thread, filter.limit as i64])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(Self::row_to_message(row)?);
        }
        Ok(messages)
    }

    /// Most recently active threads first.
    pub fn list_threads(&self, limit: usize) -> Result<Vec<Thread>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads ORDER BY last_message_at DESC, created_at DESC LIMIT ?1"
        ))?;
        let mut rows = stmt.query(params![limit as i64])?;

        let mut threads = Vec::new();
        while let Some(row) = rows.next()? {
            threads.push(Self::row_to_thread(row)?);
        }
        Ok(threads)
    }

    /// Get a thread by ID.
    pub fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_thread(row)?))
        } else {
            Ok(None)
        }
    }

    /// Administrative delete. Cascades to receipts, acks and the message's vector.
    pub fn delete_message(&self, id: &str) -> Result<bool> {
        let deleted = self.write(|tx| {
            let thread_id: Option<String> = tx
                .query_row(
                    "SELECT thread_id FROM messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(thread_id) = thread_id else {
                return Ok(false);
            };

            delete_embedding(tx, SourceKind::Message, id)?;
            tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
            tx.execute(
                r#"
                UPDATE threads
                SET message_count = (SELECT COUNT(*) FROM messages WHERE thread_id = ?1),
                    last_message_at = COALESCE(
                        (SELECT MAX(created_at) FROM messages WHERE thread_id = ?1), created_at)
                WHERE id = ?1
                "#,
                params![thread_id],
            )?;
            Ok(true)
        })?;

        if deleted {
            debug!("Deleted message {}", id);
        }
        Ok(deleted)
    }

    fn message_for_agent(&self, id: &str, agent: &str) -> Result<Message> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}, {FLAGS_FOR_AGENT} FROM messages m WHERE m.id = ?2"
        ))?;
        let mut rows = stmt.query(params![agent, id])?;
        match rows.next()? {
            Some(row) => Self::row_to_message(row),
            None => Err(BrainError::NotFound(format!("Message {}", id))),
        }
    }

    /// Convert a database row (MESSAGE_COLUMNS + two flags) to a Message.
    pub(crate) fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
        let priority_str: String = row.get(6)?;
        let created_at_str: String = row.get(7)?;

        Ok(Message {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            from_agent: row.get(2)?,
            to_agent: row.get(3)?,
            subject: row.get(4)?,
            body: row.get(5)?,
            priority: priority_str.parse::<Priority>()?,
            created_at: parse_timestamp(&created_at_str)?,
            task_status: row.get(8)?,
            read: row.get(9)?,
            acknowledged: row.get(10)?,
        })
    }

    fn row_to_thread(row: &rusqlite::Row) -> Result<Thread> {
        let created_at_str: String = row.get(3)?;
        let last_message_at_str: String = row.get(4)?;
        let message_count: i64 = row.get(5)?;

        Ok(Thread {
            id: row.get(0)?,
            subject: row.get(1)?,
            created_by: row.get(2)?,
            created_at: parse_timestamp(&created_at_str)?,
            last_message_at: parse_timestamp(&last_message_at_str)?,
            message_count: message_count.max(0) as u64,
            status: row.get(6)?,
        })
    }
}

fn ensure_message(conn: &Connection, id: &str) -> Result<()> {
    let found = conn
        .query_row("SELECT 1 FROM messages WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    found.ok_or_else(|| BrainError::NotFound(format!("Message {}", id)))
}
