// Persistent message log using SQLite

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::message::{unix_millis, Message, UserId};
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Append-only message log, the source of truth for history
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message; the store assigns `id` and `created_at`
    async fn insert_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> RelayResult<Message>;

    /// Every message between `a` and `b` in either direction, oldest first
    async fn select_messages(&self, a: UserId, b: UserId) -> RelayResult<Vec<Message>>;
}

/// SQLite-backed message store
#[derive(Clone)]
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMessageStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: &Path) -> RelayResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RelayError::Persistence(format!(
                        "failed to create database directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, gone when the store is dropped
    pub fn open_in_memory() -> RelayResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> RelayResult<Self> {
        initialize_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> RelayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| RelayError::Persistence("database lock poisoned".to_string()))?;
            f(&guard).map_err(RelayError::from)
        })
        .await?
    }
}

/// Initialize database schema
fn initialize_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL,
            receiver_id INTEGER NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_id, receiver_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at)",
        [],
    )?;

    Ok(())
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> RelayResult<Message> {
        let content = content.to_string();
        let now = unix_millis::to_millis(SystemTime::now());

        self.with_conn(move |conn| {
            // created_at never goes backwards, even if the wall clock does
            conn.query_row(
                "INSERT INTO messages (sender_id, receiver_id, content, created_at)
                 VALUES (?1, ?2, ?3, MAX(?4, COALESCE((SELECT MAX(created_at) FROM messages), 0)))
                 RETURNING id, sender_id, receiver_id, content, created_at",
                params![sender_id.get(), receiver_id.get(), content, now],
                message_from_row,
            )
        })
        .await
    }

    async fn select_messages(&self, a: UserId, b: UserId) -> RelayResult<Vec<Message>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, created_at
                 FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC, id ASC",
            )?;

            let messages = stmt
                .query_map(params![a.get(), b.get()], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(messages)
        })
        .await
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        sender_id: user_id_column(row, 1)?,
        receiver_id: user_id_column(row, 2)?,
        content: row.get(3)?,
        created_at: unix_millis::from_millis(row.get(4)?),
    })
}

fn user_id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<UserId> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .ok()
        .and_then(UserId::new)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}
