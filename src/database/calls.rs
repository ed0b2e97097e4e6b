//! Call Record Store
//!
//! SQLite-Tabelle `calls` mit allen Anrufversuchen zwischen Zentrale und
//! Fahrern. Der Store ist die einzige gemeinsame Wahrheit beider Endpunkte:
//! Offer, Answer und Status werden hier geschrieben und per Push oder
//! Polling wieder gelesen.

use super::notify::{ChangeEvent, ChangeFilter, ChangeKind, Subscription, CHANGE_CHANNEL_CAPACITY};
use crate::signaling::SessionDescription;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call record not found: {0}")]
    NotFound(String),

    #[error("Corrupt call record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// Bedingtes Update, der Record hatte inzwischen einen anderen Status
    #[error("Call {id} is already {current}")]
    StatusConflict { id: String, current: CallStatus },

    #[error("Database task failed: {0}")]
    Task(String),
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Status eines Anrufversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    Calling,
    Answered,
    Rejected,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Calling => "calling",
            CallStatus::Answered => "answered",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        }
    }

    /// `rejected` und `ended` sind endgültig
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Rejected | CallStatus::Ended)
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calling" => Ok(CallStatus::Calling),
            "answered" => Ok(CallStatus::Answered),
            "rejected" => Ok(CallStatus::Rejected),
            // Ältere Clients schreiben "canceled" statt "ended"
            "ended" | "canceled" => Ok(CallStatus::Ended),
            other => Err(format!("unknown call status '{}'", other)),
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ein Anrufversuch wie er im Store liegt
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub id: String,
    pub context_id: String,
    pub from_user: String,
    pub to_user: String,
    pub status: CallStatus,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    /// Älter als das erlaubte Fenster?
    pub fn is_stale(&self, window: std::time::Duration, now: DateTime<Utc>) -> bool {
        match ChronoDuration::from_std(window) {
            Ok(window) => now.signed_duration_since(self.created_at) > window,
            Err(_) => false,
        }
    }
}

/// Neuer Anrufversuch ohne ID (für INSERT)
#[derive(Debug, Clone)]
pub struct NewCallRecord {
    pub context_id: String,
    pub from_user: String,
    pub to_user: String,
    pub offer: SessionDescription,
}

/// Änderung an einem bestehenden Record (für UPDATE)
#[derive(Debug, Clone)]
pub struct CallUpdate {
    pub status: CallStatus,
    pub answer: Option<SessionDescription>,
    /// Nur schreiben, wenn der Record noch diesen Status hat
    pub expected: Option<CallStatus>,
}

impl CallUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status,
            answer: None,
            expected: None,
        }
    }

    /// Answer schreiben, solange der Anruf noch klingelt
    pub fn answered(answer: SessionDescription) -> Self {
        Self {
            status: CallStatus::Answered,
            answer: Some(answer),
            expected: Some(CallStatus::Calling),
        }
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Persistenter Store für Call Records mit Change Notifications
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Legt einen neuen Record mit `status = calling` an
    async fn insert(&self, record: NewCallRecord) -> Result<CallRecord, StoreError>;

    /// Ändert Status (und optional Answer) eines Records
    ///
    /// Mit `expected` schlägt das Update mit [`StoreError::StatusConflict`]
    /// fehl, wenn der Record einen anderen Status hat.
    async fn update(&self, id: &str, update: CallUpdate) -> Result<CallRecord, StoreError>;

    /// Point Read
    async fn get(&self, id: &str) -> Result<Option<CallRecord>, StoreError>;

    /// Neueste Records an `to_user` mit `status`, jünger als `since`
    async fn find_recent(
        &self,
        to_user: &str,
        status: CallStatus,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallRecord>, StoreError>;

    /// Live-Subscription auf Inserts und Updates
    fn subscribe(&self, filter: ChangeFilter) -> Subscription;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SQLite-Implementierung des Call Record Stores (Thread-safe durch Mutex)
///
/// Change Notifications erreichen nur Subscriber im selben Prozess.
/// Endpunkte in anderen Prozessen sehen Änderungen nur über Polling.
/// Abfragen laufen im Blocking-Pool, ein gesperrtes File (`busy_timeout`)
/// hält keinen Runtime-Worker auf.
pub struct SqliteCallStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteCallStore {
    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!("Opening call store at {:?}", path);

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-Memory Datenbank für Tests und Demos
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Standard-Pfad im App-Datenverzeichnis
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let proj_dirs =
            directories::ProjectDirs::from("com", "fleetcall", "fleet-call").ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 2000;

            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                context_id TEXT NOT NULL,
                from_user TEXT NOT NULL,
                to_user TEXT NOT NULL,
                status TEXT NOT NULL,
                offer TEXT,
                answer TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_calls_inbox ON calls(to_user, status, created_at);
            CREATE INDEX IF NOT EXISTS idx_calls_context ON calls(context_id);
            "#,
        )?;
        Ok(())
    }

    /// Führt `f` mit der Connection im Blocking-Pool aus
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Interne Hilfsfunktion mit Connection-Referenz
    fn get_inner(conn: &Connection, id: &str) -> Result<Option<CallRecord>, StoreError> {
        let raw = conn
            .query_row(
                r#"
                SELECT id, context_id, from_user, to_user, status, offer, answer, created_at
                FROM calls
                WHERE id = ?1
                "#,
                params![id],
                RawCallRow::from_row,
            )
            .optional()?;

        raw.map(CallRecord::try_from).transpose()
    }

    /// Setzt `created_at` zurück (für Tests mit veralteten Records)
    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, created_at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE calls SET created_at = ?2 WHERE id = ?1",
            params![id, format_timestamp(&created_at)],
        )?;
        Ok(())
    }

    fn publish(&self, kind: ChangeKind, record: &CallRecord) {
        // Ohne Subscriber schlägt send fehl, das ist kein Fehler
        let _ = self.changes.send(ChangeEvent {
            kind,
            record: record.clone(),
        });
    }
}

#[async_trait]
impl CallStore for SqliteCallStore {
    async fn insert(&self, record: NewCallRecord) -> Result<CallRecord, StoreError> {
        let created = CallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            context_id: record.context_id,
            from_user: record.from_user,
            to_user: record.to_user,
            status: CallStatus::Calling,
            offer: Some(record.offer),
            answer: None,
            created_at: Utc::now(),
        };

        let offer_blob = encode_blob(&created.id, created.offer.as_ref())?;

        let row = created.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO calls (id, context_id, from_user, to_user, status, offer, answer, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)
                "#,
                params![
                    row.id,
                    row.context_id,
                    row.from_user,
                    row.to_user,
                    row.status.as_str(),
                    offer_blob,
                    format_timestamp(&row.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            "Inserted call {} ({} -> {}, context {})",
            created.id,
            created.from_user,
            created.to_user,
            created.context_id
        );

        self.publish(ChangeKind::Insert, &created);
        Ok(created)
    }

    async fn update(&self, id: &str, update: CallUpdate) -> Result<CallRecord, StoreError> {
        let answer_blob = encode_blob(id, update.answer.as_ref())?;
        let expected = update.expected.map(|status| status.as_str());

        let key = id.to_string();
        let record = self
            .with_conn(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE calls
                    SET status = ?2, answer = COALESCE(?3, answer)
                    WHERE id = ?1 AND (?4 IS NULL OR status = ?4)
                    "#,
                    params![key, update.status.as_str(), answer_blob, expected],
                )?;

                let current = Self::get_inner(conn, &key)?
                    .ok_or_else(|| StoreError::NotFound(key.clone()))?;

                if changed == 0 {
                    return Err(StoreError::StatusConflict {
                        id: key,
                        current: current.status,
                    });
                }
                Ok(current)
            })
            .await?;

        tracing::debug!("Updated call {} to status {}", id, record.status);

        self.publish(ChangeKind::Update, &record);
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<CallRecord>, StoreError> {
        let key = id.to_string();
        self.with_conn(move |conn| Self::get_inner(conn, &key)).await
    }

    async fn find_recent(
        &self,
        to_user: &str,
        status: CallStatus,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallRecord>, StoreError> {
        let to_user = to_user.to_string();
        let since = format_timestamp(&since);

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, context_id, from_user, to_user, status, offer, answer, created_at
                    FROM calls
                    WHERE to_user = ?1 AND status = ?2 AND created_at > ?3
                    ORDER BY created_at DESC
                    LIMIT ?4
                    "#,
                )?;

                let rows = stmt
                    .query_map(
                        params![to_user, status.as_str(), since, limit as i64],
                        RawCallRow::from_row,
                    )?
                    .collect::<SqliteResult<Vec<RawCallRow>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(CallRecord::try_from).collect()
    }

    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        Subscription::new(self.changes.subscribe(), filter)
    }
}

impl std::fmt::Debug for SqliteCallStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCallStore")
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Rohe Tabellenzeile, wird außerhalb der rusqlite-Closure validiert
struct RawCallRow {
    id: String,
    context_id: String,
    from_user: String,
    to_user: String,
    status: String,
    offer: Option<String>,
    answer: Option<String>,
    created_at: String,
}

impl RawCallRow {
    fn from_row(row: &Row<'_>) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            context_id: row.get(1)?,
            from_user: row.get(2)?,
            to_user: row.get(3)?,
            status: row.get(4)?,
            offer: row.get(5)?,
            answer: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl TryFrom<RawCallRow> for CallRecord {
    type Error = StoreError;

    fn try_from(raw: RawCallRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: raw.id.clone(),
            reason,
        };

        let status = raw.status.parse::<CallStatus>().map_err(corrupt)?;
        let offer = decode_blob(raw.offer.as_deref()).map_err(|e| corrupt(e.to_string()))?;
        let answer = decode_blob(raw.answer.as_deref()).map_err(|e| corrupt(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&raw.created_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);

        Ok(CallRecord {
            id: raw.id,
            context_id: raw.context_id,
            from_user: raw.from_user,
            to_user: raw.to_user,
            status,
            offer,
            answer,
            created_at,
        })
    }
}

/// Einheitliches Format, damit Zeitstempel als Text vergleichbar bleiben
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn encode_blob(id: &str, desc: Option<&SessionDescription>) -> Result<Option<String>, StoreError> {
    desc.map(SessionDescription::to_blob)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
}

fn decode_blob(blob: Option<&str>) -> Result<Option<SessionDescription>, serde_json::Error> {
    blob.map(SessionDescription::from_blob).transpose()
}

// ============================================================================
// TESTS
// ============================================================================
