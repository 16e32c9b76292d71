//! Mock storage implementations for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::{NotificationKind, NotificationRecord};

use super::{
    NotificationStore, RecipientQuery, Result, Session, SessionResolver, StorageError,
    StoredNotification,
};

/// Notification store that keeps records in memory.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<Vec<(StoredNotification, NotificationRecord)>>,
    insert_calls: RwLock<usize>,
    fail_on_insert: RwLock<bool>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.fail_on_insert.write().await = fail;
    }

    pub async fn records(&self) -> Vec<NotificationRecord> {
        self.records
            .read()
            .await
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Number of `insert_many` calls, failed ones included.
    pub async fn insert_calls(&self) -> usize {
        *self.insert_calls.read().await
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert_many(&self, records: Vec<NotificationRecord>) -> Result<()> {
        *self.insert_calls.write().await += 1;
        if *self.fail_on_insert.read().await {
            return Err(StorageError::Database(sqlx::Error::PoolClosed));
        }

        let created_at = Utc::now();
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            let row = StoredNotification {
                id: Uuid::new_v4(),
                kind: record.kind(),
                payload: record.payload()?,
                was_read: record.was_read(),
                created_at,
            };
            stored.push((row, record));
        }
        self.records.write().await.extend(stored);
        Ok(())
    }

    async fn find_by_recipient(
        &self,
        kind: NotificationKind,
        query: &RecipientQuery,
    ) -> Result<Vec<StoredNotification>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|(row, record)| {
                row.kind == kind
                    && record.recipients().contains(&query.recipient)
                    && query.was_read.map_or(true, |read| row.was_read == read)
            })
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .map(|(row, _)| row.clone())
            .collect())
    }
}

/// Session resolver backed by a token map.
#[derive(Default)]
pub struct InMemorySessionResolver {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: impl Into<String>, session: Session) {
        self.sessions.write().await.insert(token.into(), session);
    }
}

#[async_trait]
impl SessionResolver for InMemorySessionResolver {
    async fn resolve(&self, token: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(token)
            .filter(|s| !s.is_expired_at(Utc::now()))
            .cloned())
    }
}
