//! Per-message settlement.
//!
//! Every message handed to a queue processor gets a [`SettlementSlot`] (kept by
//! the processor) and a [`Receipt`] (kept by whoever owns the broker handle).
//! The slot is consumed when the message's fate is known, so it can be
//! fulfilled at most once; dropping an unfulfilled slot settles it as
//! [`HandlerError::Abandoned`], so it is never fulfilled zero times either.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::error;

use super::HandlerError;
use crate::bus::{self, Acknowledger};

/// Final fate of one delivered message.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Accepted and processed by the batch handler.
    Processed,
    /// Dropped without processing (undecodable or rejected by schema).
    Discarded(String),
    /// Batch handler failed; the broker should redeliver.
    Requeue(Arc<HandlerError>),
}

impl Settlement {
    /// Whether the broker should consider the message consumed.
    pub fn is_ack(&self) -> bool {
        !matches!(self, Settlement::Requeue(_))
    }
}

/// Processor-side half of a message's settlement.
#[derive(Debug)]
pub struct SettlementSlot {
    tx: Option<oneshot::Sender<Settlement>>,
}

impl SettlementSlot {
    /// Create a slot and the receipt it fulfils.
    pub fn pair() -> (SettlementSlot, Receipt) {
        let (tx, rx) = oneshot::channel();
        (SettlementSlot { tx: Some(tx) }, Receipt { rx })
    }

    pub fn resolve(self) {
        self.settle(Settlement::Processed);
    }

    pub fn discard(self, reason: impl Into<String>) {
        self.settle(Settlement::Discarded(reason.into()));
    }

    pub fn reject(self, cause: Arc<HandlerError>) {
        self.settle(Settlement::Requeue(cause));
    }

    fn settle(mut self, settlement: Settlement) {
        if let Some(tx) = self.tx.take() {
            // Receiver gone means nobody is waiting on the verdict.
            let _ = tx.send(settlement);
        }
    }
}

impl Drop for SettlementSlot {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Settlement::Requeue(Arc::new(HandlerError::Abandoned)));
        }
    }
}

/// Owner-side half of a message's settlement.
#[derive(Debug)]
pub struct Receipt {
    rx: oneshot::Receiver<Settlement>,
}

impl Receipt {
    /// A receipt whose outcome is already known.
    pub fn ready(settlement: Settlement) -> Self {
        let (slot, receipt) = SettlementSlot::pair();
        slot.settle(settlement);
        receipt
    }

    /// Wait for the message's fate.
    pub async fn outcome(self) -> Settlement {
        self.rx
            .await
            .unwrap_or_else(|_| Settlement::Requeue(Arc::new(HandlerError::Abandoned)))
    }
}

/// Slots of every accepted record in one batch, resolved together.
///
/// All-or-nothing: either every slot resolves or every slot is rejected with
/// the same cause.
#[derive(Debug, Default)]
pub struct SettlementGroup {
    slots: Vec<SettlementSlot>,
}

impl SettlementGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, slot: SettlementSlot) {
        self.slots.push(slot);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Settle every slot from the batch handler's single outcome.
    pub fn complete(self, outcome: Result<(), HandlerError>) {
        match outcome {
            Ok(()) => self.slots.into_iter().for_each(SettlementSlot::resolve),
            Err(e) => {
                let cause = Arc::new(e);
                for slot in self.slots {
                    slot.reject(Arc::clone(&cause));
                }
            }
        }
    }
}

/// Translate a settlement into the broker-level verdict.
pub async fn apply<A: Acknowledger>(handle: &A, settlement: &Settlement) -> bus::Result<()> {
    if settlement.is_ack() {
        handle.ack().await
    } else {
        handle.requeue().await
    }
}

/// Wait for a receipt and settle the message with the broker.
pub fn settle_with<A: Acknowledger>(
    queue: String,
    handle: A,
    receipt: Receipt,
) -> impl Future<Output = Settlement> + Send + 'static {
    async move {
        let settlement = receipt.outcome().await;
        if let Err(e) = apply(&handle, &settlement).await {
            error!(queue = %queue, error = %e, "Failed to settle message with broker");
        }
        settlement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{AckRecord, MockAcknowledger};

    #[tokio::test]
    async fn test_resolve_settles_processed() {
        let (slot, receipt) = SettlementSlot::pair();
        slot.resolve();
        assert!(matches!(receipt.outcome().await, Settlement::Processed));
    }

    #[tokio::test]
    async fn test_dropped_slot_settles_abandoned() {
        let (slot, receipt) = SettlementSlot::pair();
        drop(slot);
        match receipt.outcome().await {
            Settlement::Requeue(cause) => assert!(matches!(*cause, HandlerError::Abandoned)),
            other => panic!("expected requeue, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_receipt() {
        let receipt = Receipt::ready(Settlement::Discarded("bad".to_string()));
        let outcome = receipt.outcome().await;
        assert!(outcome.is_ack());
        assert!(matches!(outcome, Settlement::Discarded(reason) if reason == "bad"));
    }

    #[tokio::test]
    async fn test_group_failure_rejects_every_slot_with_same_cause() {
        let mut group = SettlementGroup::new();
        let mut receipts = Vec::new();
        for _ in 0..3 {
            let (slot, receipt) = SettlementSlot::pair();
            group.push(slot);
            receipts.push(receipt);
        }
        assert_eq!(group.len(), 3);

        group.complete(Err(HandlerError::Other("boom".to_string())));

        for receipt in receipts {
            match receipt.outcome().await {
                Settlement::Requeue(cause) => assert_eq!(cause.to_string(), "boom"),
                other => panic!("expected requeue, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_settle_with_applies_verdict() {
        let acker = MockAcknowledger::new();

        let (slot, receipt) = SettlementSlot::pair();
        slot.reject(Arc::new(HandlerError::ShuttingDown));
        let settlement = settle_with("q".to_string(), acker.clone(), receipt).await;

        assert!(!settlement.is_ack());
        assert_eq!(acker.records().await, vec![AckRecord::Requeued]);
    }
}
