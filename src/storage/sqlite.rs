//! SQLite implementations of storage interfaces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::{Acquire, Row, SqlitePool};
use uuid::Uuid;

use crate::events::{NotificationKind, NotificationRecord};

use super::schema::{
    NotificationRecipients, Notifications, Sessions, CREATE_NOTIFICATIONS_TABLE,
    CREATE_SESSIONS_TABLE,
};
use super::{
    NotificationStore, RecipientQuery, Result, Session, SessionResolver, StorageError,
    StoredNotification,
};

/// SQLite implementation of NotificationStore.
pub struct SqliteNotificationStore {
    pool: SqlitePool,
}

impl SqliteNotificationStore {
    /// Create a new SQLite notification store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_NOTIFICATIONS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for SqliteNotificationStore {
    async fn insert_many(&self, records: Vec<NotificationRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let created_at = Utc::now().to_rfc3339();

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        for record in &records {
            let id = Uuid::new_v4().to_string();
            let recipients: Vec<String> = record
                .recipients()
                .iter()
                .map(Uuid::to_string)
                .collect();
            let recipient_ids = serde_json::to_string(&recipients)?;
            let payload = record.payload()?.to_string();

            let query = Query::insert()
                .into_table(Notifications::Table)
                .columns([
                    Notifications::Id,
                    Notifications::Kind,
                    Notifications::RecipientIds,
                    Notifications::Payload,
                    Notifications::WasRead,
                    Notifications::CreatedAt,
                ])
                .values_panic([
                    id.clone().into(),
                    record.kind().as_str().into(),
                    recipient_ids.into(),
                    payload.into(),
                    record.was_read().into(),
                    created_at.clone().into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query).execute(&mut *tx).await?;

            for recipient in recipients {
                let query = Query::insert()
                    .into_table(NotificationRecipients::Table)
                    .columns([
                        NotificationRecipients::NotificationId,
                        NotificationRecipients::UserId,
                    ])
                    .values_panic([id.clone().into(), recipient.into()])
                    .to_string(SqliteQueryBuilder);

                sqlx::query(&query).execute(&mut *tx).await?;
            }
        }

        tx.commit().await?;

        Ok(())
    }

    async fn find_by_recipient(
        &self,
        kind: NotificationKind,
        query: &RecipientQuery,
    ) -> Result<Vec<StoredNotification>> {
        let sql = Query::select()
            .columns([
                (Notifications::Table, Notifications::Id),
                (Notifications::Table, Notifications::Payload),
                (Notifications::Table, Notifications::WasRead),
                (Notifications::Table, Notifications::CreatedAt),
            ])
            .from(Notifications::Table)
            .inner_join(
                NotificationRecipients::Table,
                Expr::col((
                    NotificationRecipients::Table,
                    NotificationRecipients::NotificationId,
                ))
                .equals((Notifications::Table, Notifications::Id)),
            )
            .and_where(
                Expr::col((NotificationRecipients::Table, NotificationRecipients::UserId))
                    .eq(query.recipient.to_string()),
            )
            .and_where(Expr::col((Notifications::Table, Notifications::Kind)).eq(kind.as_str()))
            .and_where_option(
                query
                    .was_read
                    .map(|read| Expr::col((Notifications::Table, Notifications::WasRead)).eq(read)),
            )
            .order_by((Notifications::Table, Notifications::CreatedAt), Order::Desc)
            .order_by_expr(Expr::cust("notifications.rowid"), Order::Desc)
            .limit(u64::from(query.limit))
            .offset(query.offset())
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let payload: String = row.get("payload");
                let created_at: String = row.get("created_at");

                Ok(StoredNotification {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| StorageError::InvalidRecord(format!("id: {}", e)))?,
                    kind,
                    payload: serde_json::from_str(&payload)?,
                    was_read: row.get("was_read"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| StorageError::InvalidRecord(format!("created_at: {}", e)))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }
}

/// SQLite implementation of SessionResolver.
pub struct SqliteSessionResolver {
    pool: SqlitePool,
}

impl SqliteSessionResolver {
    /// Create a new SQLite session resolver.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_SESSIONS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionResolver for SqliteSessionResolver {
    async fn resolve(&self, token: &str) -> Result<Option<Session>> {
        let query = Query::select()
            .columns([Sessions::UserId, Sessions::ExpiresAt])
            .from(Sessions::Table)
            .and_where(Expr::col(Sessions::Token).eq(token))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let user_id: String = row.get("user_id");
        let expires_at: String = row.get("expires_at");

        let session = Session {
            user_id: Uuid::parse_str(&user_id)
                .map_err(|e| StorageError::InvalidSession(format!("user_id: {}", e)))?,
            expires_at: DateTime::parse_from_rfc3339(&expires_at)
                .map_err(|e| StorageError::InvalidSession(format!("expires_at: {}", e)))?
                .with_timezone(&Utc),
        };

        if session.is_expired_at(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(session))
    }
}
