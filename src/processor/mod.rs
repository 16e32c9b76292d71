//! Queue processors.
//!
//! A queue processor turns individually delivered broker messages into
//! validated batches for a domain handler and settles every message once the
//! batch's fate is known:
//!
//! ```text
//! [Envelope] -> decode -> [Accumulator] -> [Schema gate] -> BatchHandler::on_batch
//!                  |                            |                  |
//!                  v                            v                  v
//!              discarded                    discarded       processed / requeue
//! ```
//!
//! Per queue the processor moves through `Idle -> Accumulating -> Flushing ->
//! Idle`. Flushing a batch does not block accumulation of the next one, so
//! handlers must not assume batches are processed strictly in sequence.

pub mod accumulator;
pub mod schema;
pub mod settlement;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bus::{Acknowledger, Body, Envelope};
use crate::storage::StorageError;

pub use accumulator::{Accumulator, BatchLimits, FlushFn, PendingBatch};
pub use schema::{FieldRules, PassThrough, Schema, SchemaError, Typed};
pub use settlement::{Receipt, Settlement, SettlementGroup, SettlementSlot};

/// Failure of a batch as a whole. Every accepted message of the batch is
/// requeued with this cause.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("settlement slot dropped before a verdict was reached")]
    Abandoned,

    #[error("queue processor is shutting down")]
    ShuttingDown,

    /// Failure of a handler defined outside this crate that has no
    /// dedicated variant.
    #[error("{0}")]
    Other(String),
}

/// Domain logic for one queue.
///
/// Returning an error requeues every record of the batch, so implementations
/// must tolerate seeing the same records again.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Validated record type this handler consumes.
    type Record: Send + 'static;

    /// Process one validated batch. Never called with an empty batch.
    async fn on_batch(&self, records: Vec<Self::Record>) -> Result<(), HandlerError>;
}

/// Static description of a queue: its name, broker bindings and batch bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub routing_keys: Vec<String>,
    pub limits: BatchLimits,
}

/// Batches, validates and settles the messages of one queue.
pub struct QueueProcessor {
    definition: QueueDefinition,
    accumulator: Accumulator,
}

impl QueueProcessor {
    /// Create a processor validating bodies with `schema` before `handler`
    /// sees them. Must be called within a tokio runtime.
    pub fn new<S, H>(definition: QueueDefinition, schema: S, handler: H) -> Self
    where
        S: Schema,
        H: BatchHandler<Record = S::Record>,
    {
        let schema = Arc::new(schema);
        let handler = Arc::new(handler);
        let queue = definition.name.clone();

        let flush: FlushFn = Arc::new(move |batch: PendingBatch| -> BoxFuture<'static, ()> {
            Box::pin(process_batch(
                queue.clone(),
                Arc::clone(&schema),
                Arc::clone(&handler),
                batch,
            ))
        });

        let accumulator = Accumulator::spawn(definition.name.clone(), definition.limits, flush);

        Self {
            definition,
            accumulator,
        }
    }

    /// Create a processor that hands every decoded body to `handler` unchecked.
    pub fn without_schema<H>(definition: QueueDefinition, handler: H) -> Self
    where
        H: BatchHandler<Record = Value>,
    {
        Self::new(definition, PassThrough, handler)
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn queue(&self) -> &str {
        &self.definition.name
    }

    /// Hand a message body to the processor.
    ///
    /// Bodies that cannot be decoded are discarded immediately, outside of
    /// batching.
    pub fn submit(&self, body: Body) -> Receipt {
        match body.decode() {
            Ok(value) => self.accumulator.enqueue(value),
            Err(e) => {
                warn!(queue = %self.definition.name, error = %e, "Discarding undecodable message");
                Receipt::ready(Settlement::Discarded(e.to_string()))
            }
        }
    }

    /// Submit an envelope and return a future that settles it with the broker
    /// once its fate is known.
    ///
    /// The body is enqueued before this returns, so arrival order is the
    /// order of `accept` calls.
    pub fn accept<A: Acknowledger>(
        &self,
        envelope: Envelope<A>,
    ) -> impl Future<Output = Settlement> + Send + 'static {
        let Envelope { handle, body } = envelope;
        let receipt = self.submit(body);
        settlement::settle_with(self.definition.name.clone(), handle, receipt)
    }

    /// Flush the pending batch and wait until every flushed batch is settled.
    pub async fn stop(&self) {
        self.accumulator.shutdown().await;
        info!(queue = %self.definition.name, "Queue processor stopped");
    }
}

async fn process_batch<S, H>(queue: String, schema: Arc<S>, handler: Arc<H>, batch: PendingBatch)
where
    S: Schema,
    H: BatchHandler<Record = S::Record>,
{
    let schema::Partition {
        accepted,
        slots,
        rejected,
    } = schema::partition(schema.as_ref(), &queue, batch);

    if accepted.is_empty() {
        debug!(queue = %queue, rejected, "No valid messages in batch");
        return;
    }

    let batch_size = accepted.len();
    let outcome = handler.on_batch(accepted).await;
    match &outcome {
        Ok(()) => debug!(queue = %queue, batch_size, rejected, "Batch processed"),
        Err(e) => error!(
            queue = %queue,
            batch_size,
            error = %e,
            "Batch handler failed, requeueing batch"
        ),
    }
    slots.complete(outcome);
}
