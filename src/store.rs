//! Conversation Store
//!
//! Membership and message persistence consumed by the dispatcher.
//!
//! The dispatcher only sees the [`MembershipStore`] and [`MessageStore`]
//! traits. [`SqliteStore`] implements both over a SQLite database; every
//! query is authoritative, nothing is cached here.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::Principal;
use crate::protocol::ConversationId;

/// Identifier assigned to a persisted message
pub type MessageId = i64;

/// Default email identifying the bot user
pub const DEFAULT_BOT_EMAIL: &str = "bot@local";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out")]
    Timeout,
}

/// Answers membership and bot-setting questions
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Is `principal` a member of `conversation_id`
    async fn is_member(
        &self,
        principal: &Principal,
        conversation_id: ConversationId,
    ) -> Result<bool, StoreError>;

    /// Is the bot enabled for `conversation_id` (no setting means enabled)
    async fn is_bot_enabled(&self, conversation_id: ConversationId) -> Result<bool, StoreError>;
}

/// Durable message log
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message; `author` is `None` when the author could not be resolved
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        author: Option<&Principal>,
        content: &str,
    ) -> Result<MessageId, StoreError>;

    /// Principal the bot posts as, if one exists
    async fn resolve_bot_principal(&self) -> Result<Option<Principal>, StoreError>;
}

/// A persisted message
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author: Option<Principal>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    bot_email: String,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path, bot_email: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn, bot_email)?;

        info!("Conversation store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database (tests, demos)
    pub fn open_in_memory(bot_email: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, bot_email)
    }

    fn from_connection(conn: Connection, bot_email: &str) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            bot_email: bot_email.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL DEFAULT '',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT,
                is_group INTEGER DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS conversation_users (
                conversation_id INTEGER,
                user_id INTEGER,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                user_id INTEGER,
                content TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, id);

            CREATE TABLE IF NOT EXISTS conversation_bot_settings (
                conversation_id INTEGER PRIMARY KEY,
                bot_enabled INTEGER DEFAULT 1
            );
            "#,
        )?;

        Ok(())
    }

    /// Run a blocking query off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&*conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map_err(StoreError::from)
    }

    /// Create a user, returning its principal
    pub fn add_user(&self, name: &str, email: &str) -> Result<Principal, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (name, email) VALUES (?1, ?2)",
            params![name, email],
        )?;
        Ok(Principal::from(conn.last_insert_rowid()))
    }

    /// Make sure the bot user exists
    pub fn ensure_bot_user(&self) -> Result<Principal, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (name, email) VALUES ('Bot', ?1)",
            params![self.bot_email],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM users WHERE email = ?1",
            params![self.bot_email],
            |row| row.get(0),
        )?;
        Ok(Principal::from(id))
    }

    /// Create a conversation
    pub fn create_conversation(&self, title: &str, is_group: bool) -> Result<ConversationId, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (title, is_group) VALUES (?1, ?2)",
            params![title, is_group],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Add a member to a conversation (idempotent)
    pub fn add_member(&self, conversation_id: ConversationId, principal: &Principal) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO conversation_users (conversation_id, user_id) VALUES (?1, ?2)",
            params![conversation_id, principal.as_str()],
        )?;
        Ok(())
    }

    /// Set the bot flag for a conversation
    pub fn set_bot_enabled(&self, conversation_id: ConversationId, enabled: bool) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO conversation_bot_settings (conversation_id, bot_enabled) VALUES (?1, ?2)
             ON CONFLICT(conversation_id) DO UPDATE SET bot_enabled = excluded.bot_enabled",
            params![conversation_id, enabled],
        )?;
        Ok(())
    }

    /// Most recent messages of a conversation, oldest first
    pub fn recent_messages(&self, conversation_id: ConversationId, limit: usize) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, CAST(user_id AS TEXT), content, created_at FROM messages
             WHERE conversation_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let mut messages = stmt
            .query_map(params![conversation_id, limit as i64], |row| {
                let created_at: String = row.get(4)?;
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    author: row.get::<_, Option<String>>(2)?.map(Principal::new),
                    content: row.get(3)?,
                    created_at: parse_timestamp(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        messages.reverse();
        Ok(messages)
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .unwrap_or_default()
}

#[async_trait]
impl MembershipStore for SqliteStore {
    async fn is_member(
        &self,
        principal: &Principal,
        conversation_id: ConversationId,
    ) -> Result<bool, StoreError> {
        let user_id = principal.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM conversation_users WHERE conversation_id = ?1 AND user_id = ?2 LIMIT 1",
                params![conversation_id, user_id],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    async fn is_bot_enabled(&self, conversation_id: ConversationId) -> Result<bool, StoreError> {
        let setting: Option<bool> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT bot_enabled FROM conversation_bot_settings WHERE conversation_id = ?1 LIMIT 1",
                    params![conversation_id],
                    |row| row.get::<_, Option<bool>>(0),
                )
                .optional()
                .map(Option::flatten)
            })
            .await?;

        Ok(setting.unwrap_or(true))
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        author: Option<&Principal>,
        content: &str,
    ) -> Result<MessageId, StoreError> {
        let author = author.map(|p| p.as_str().to_string());
        let content = content.to_string();
        let created_at = Utc::now().format(TIMESTAMP_FORMAT).to_string();

        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO messages (conversation_id, user_id, content, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![conversation_id, author, content, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(conversation_id, message_id = id, "Message appended");
        Ok(id)
    }

    async fn resolve_bot_principal(&self) -> Result<Option<Principal>, StoreError> {
        let email = self.bot_email.clone();
        let id: Option<i64> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id FROM users WHERE email = ?1 LIMIT 1",
                    params![email],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        Ok(id.map(Principal::from))
    }
}
