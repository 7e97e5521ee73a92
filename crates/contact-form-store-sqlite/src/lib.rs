#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use contact_form_core::{format_rfc3339, parse_rfc3339_utc, ContactError, MessageRecord, NewMessage};
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA_CONTACT_V1: &str = r"
CREATE TABLE IF NOT EXISTS contact_messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  email TEXT NOT NULL,
  message TEXT NOT NULL,
  ip TEXT,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_contact_messages_no_update
BEFORE UPDATE ON contact_messages
BEGIN
  SELECT RAISE(FAIL, 'contact_messages is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_contact_messages_no_delete
BEFORE DELETE ON contact_messages
BEGIN
  SELECT RAISE(FAIL, 'contact_messages is append-only');
END;
";

/// Append-only storage for accepted contact messages.
pub struct SqliteContactStore {
    conn: Connection,
}

impl SqliteContactStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Creates the message table and its append-only triggers when absent.
    /// Only `IF NOT EXISTS` DDL is used, so concurrent first-time callers and
    /// repeated calls are both harmless.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_CONTACT_V1)
            .context("failed to apply contact schema")
    }

    pub fn insert(&mut self, input: &NewMessage) -> Result<MessageRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("message validation failed: {err}"))?;

        let created_at = format_rfc3339(input.created_at).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start message transaction")?;

        tx.execute(
            "INSERT INTO contact_messages(name, email, message, ip, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![input.name, input.email, input.message, input.client_ip, created_at],
        )
        .context("failed to insert contact message")?;

        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit message transaction")?;

        Ok(MessageRecord {
            id,
            name: input.name.clone(),
            email: input.email.clone(),
            message: input.message.clone(),
            client_ip: Some(input.client_ip.clone()),
            created_at: input.created_at,
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRecord>> {
        self.conn
            .query_row(
                "SELECT id, name, email, message, ip, created_at
                 FROM contact_messages
                 WHERE id = ?1",
                params![id],
                parse_message_row,
            )
            .optional()
            .with_context(|| format!("failed to load contact message {id}"))
    }

    pub fn count_messages(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM contact_messages", [], |row| row.get(0))
            .context("failed to count contact messages")?;
        u64::try_from(count).with_context(|| format!("invalid message count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let created_at_raw: String = row.get(5)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        message: row.get(3)?,
        client_ip: row.get(4)?,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(to_sql_error)?,
    })
}

fn to_sql_error(err: ContactError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
}
