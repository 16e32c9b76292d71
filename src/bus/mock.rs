//! Mock acknowledger for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Acknowledger, BusError, Result};

/// Broker verdict recorded by [`MockAcknowledger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    Acked,
    Requeued,
}

/// Acknowledger that records every settlement instead of talking to a broker.
///
/// Clones share the same record, so a test can keep one copy while the other
/// travels inside an envelope.
#[derive(Clone, Default)]
pub struct MockAcknowledger {
    records: Arc<RwLock<Vec<AckRecord>>>,
    fail_on_settle: Arc<RwLock<bool>>,
}

impl MockAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_settle(&self, fail: bool) {
        *self.fail_on_settle.write().await = fail;
    }

    pub async fn records(&self) -> Vec<AckRecord> {
        self.records.read().await.clone()
    }

    pub async fn ack_count(&self) -> usize {
        self.count(AckRecord::Acked).await
    }

    pub async fn requeue_count(&self) -> usize {
        self.count(AckRecord::Requeued).await
    }

    async fn count(&self, wanted: AckRecord) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| **r == wanted)
            .count()
    }

    async fn record(&self, record: AckRecord) -> Result<()> {
        if *self.fail_on_settle.read().await {
            return Err(BusError::Settle("Mock settle failure".to_string()));
        }
        self.records.write().await.push(record);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MockAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.record(AckRecord::Acked).await
    }

    async fn requeue(&self) -> Result<()> {
        self.record(AckRecord::Requeued).await
    }
}
