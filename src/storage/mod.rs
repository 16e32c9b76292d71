//! Storage implementations.
//!
//! Two narrow seams face the outside world: [`NotificationStore`] persists
//! validated notification records and [`SessionResolver`] maps an opaque
//! session token to a user. Both are backed by SQLite in production and by
//! in-memory mocks in tests.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::events::{NotificationKind, NotificationRecord};

pub mod mock;
pub mod schema;
pub mod sqlite;

pub use mock::{InMemoryNotificationStore, InMemorySessionResolver};
pub use sqlite::{SqliteNotificationStore, SqliteSessionResolver};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid session record: {0}")]
    InvalidSession(String),

    #[error("Invalid notification record: {0}")]
    InvalidRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An authenticated user session, as issued elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Page of one recipient's notifications of a single kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecipientQuery {
    pub recipient: Uuid,
    /// Only read (`Some(true)`) or unread (`Some(false)`) notifications.
    pub was_read: Option<bool>,
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl RecipientQuery {
    pub fn new(recipient: Uuid) -> Self {
        Self {
            recipient,
            was_read: None,
            page: 1,
            limit: 10,
        }
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }
}

/// A persisted notification as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNotification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub payload: Value,
    pub was_read: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredNotification {
    /// Event payload with the stored `id` and `createdAt` merged in.
    pub fn into_document(self) -> Value {
        let mut document = self.payload;
        if let Value::Object(fields) = &mut document {
            fields.insert("id".to_string(), Value::String(self.id.to_string()));
            fields.insert(
                "createdAt".to_string(),
                Value::String(self.created_at.to_rfc3339()),
            );
        }
        document
    }
}

/// Persistence sink for validated notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Store a batch of records atomically: either all are written or none.
    async fn insert_many(&self, records: Vec<NotificationRecord>) -> Result<()>;

    /// Notifications of `kind` addressed to `query.recipient`, newest first.
    async fn find_by_recipient(
        &self,
        kind: NotificationKind,
        query: &RecipientQuery,
    ) -> Result<Vec<StoredNotification>>;
}

/// Read-only view of the session issuer's records.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Resolve a token to its session. Unknown and expired tokens yield `None`.
    async fn resolve(&self, token: &str) -> Result<Option<Session>>;
}

/// Open storage based on configuration.
///
/// Returns the (NotificationStore, SessionResolver) pair sharing one pool.
pub async fn open(
    config: &StorageConfig,
) -> Result<(Arc<dyn NotificationStore>, Arc<dyn SessionResolver>)> {
    info!(url = %config.url, "Opening notification storage");

    let opts = SqliteConnectOptions::from_str(&config.url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .create_if_missing(true);

    if let Some(parent) = opts.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(opts)
        .await?;

    let store = SqliteNotificationStore::new(pool.clone());
    store.init().await?;

    let sessions = SqliteSessionResolver::new(pool);
    sessions.init().await?;

    Ok((Arc::new(store), Arc::new(sessions)))
}
