//! Chat Log
//!
//! Der Anrufverlauf erscheint als Systemzeile im Chat der jeweiligen Route
//! (`route_messages`). Schreibfehler werden nur geloggt.

use super::calls::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Eine Zeile im Chat einer Route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub context_id: String,
    pub sender_tag: String,
    pub text: String,
}

/// Append-only Chat Log
#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn append(&self, message: ChatMessage) -> Result<(), StoreError>;
}

/// SQLite-Implementierung des Chat Logs
pub struct SqliteChatLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChatLog {
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 2000;

            CREATE TABLE IF NOT EXISTS route_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route_id TEXT NOT NULL,
                sender_type TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_route_messages_route ON route_messages(route_id);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Alle Zeilen einer Route in Einfügereihenfolge
    pub fn messages_for(&self, context_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT route_id, sender_type, message
            FROM route_messages
            WHERE route_id = ?1
            ORDER BY id ASC
            "#,
        )?;

        let messages = stmt
            .query_map(params![context_id], |row| {
                Ok(ChatMessage {
                    context_id: row.get(0)?,
                    sender_tag: row.get(1)?,
                    text: row.get(2)?,
                })
            })?
            .collect::<SqliteResult<Vec<ChatMessage>>>()?;

        Ok(messages)
    }
}

#[async_trait]
impl ChatLog for SqliteChatLog {
    async fn append(&self, message: ChatMessage) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            conn.lock().execute(
                r#"
                INSERT INTO route_messages (route_id, sender_type, message)
                VALUES (?1, ?2, ?3)
                "#,
                params![message.context_id, message.sender_tag, message.text],
            )
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(())
    }
}
