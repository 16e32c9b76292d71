//! Batch accumulator.
//!
//! Groups individually arriving messages into batches bounded by a size and a
//! maximum wait. A single worker task owns the pending batch; producers talk
//! to it over a channel, so appending, arming the deadline and swapping the
//! batch out at flush time never interleave.
//!
//! The deadline is armed by the first message of a batch and is never pushed
//! back by later arrivals. Flushed batches are handed to the flush function
//! and run concurrently with accumulation of the next batch.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

use super::settlement::{Receipt, SettlementSlot};
use super::HandlerError;

/// One decoded message waiting in a batch.
#[derive(Debug)]
pub struct Pending {
    pub body: Value,
    pub slot: SettlementSlot,
}

/// The batch currently being filled.
#[derive(Debug, Default)]
pub struct PendingBatch {
    items: Vec<Pending>,
    deadline: Option<Instant>,
}

impl PendingBatch {
    pub fn push(&mut self, pending: Pending) {
        self.items.push(pending);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<Pending> {
        self.items
    }
}

/// Size and time bounds of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Flush as soon as this many messages are pending.
    pub messages_per_batch: usize,
    /// Flush this long after the first message of a batch arrived.
    pub max_wait: Duration,
}

impl BatchLimits {
    pub fn new(messages_per_batch: usize, max_wait: Duration) -> Self {
        Self {
            messages_per_batch: messages_per_batch.max(1),
            max_wait,
        }
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Deadline,
    Shutdown,
}

/// Called with every flushed batch; the returned future is driven by the
/// accumulator alongside accumulation of the next batch.
pub type FlushFn = Arc<dyn Fn(PendingBatch) -> BoxFuture<'static, ()> + Send + Sync>;

enum Command {
    Enqueue(Pending),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to an accumulator worker.
pub struct Accumulator {
    tx: mpsc::UnboundedSender<Command>,
}

impl Accumulator {
    /// Start the worker task.
    pub fn spawn(queue: impl Into<String>, limits: BatchLimits, flush: FlushFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            queue: queue.into(),
            limits,
            batch: PendingBatch::default(),
            flush,
            inflight: JoinSet::new(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    /// Append a message to the current batch.
    ///
    /// After shutdown the message is settled for redelivery instead.
    pub fn enqueue(&self, body: Value) -> Receipt {
        let (slot, receipt) = SettlementSlot::pair();
        if let Err(mpsc::error::SendError(command)) =
            self.tx.send(Command::Enqueue(Pending { body, slot }))
        {
            if let Command::Enqueue(pending) = command {
                pending.slot.reject(Arc::new(HandlerError::ShuttingDown));
            }
        }
        receipt
    }

    /// Flush whatever is pending, wait for every in-flight flush to finish and
    /// stop the worker. Idempotent.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Worker {
    queue: String,
    limits: BatchLimits,
    batch: PendingBatch,
    flush: FlushFn,
    inflight: JoinSet<()>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.batch.deadline;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Enqueue(pending)) => self.push(pending),
                    Some(Command::Shutdown(done)) => {
                        let waiters = self.close(&mut rx, done);
                        self.drain().await;
                        for waiter in waiters {
                            let _ = waiter.send(());
                        }
                        return;
                    }
                    None => {
                        self.flush(FlushTrigger::Shutdown);
                        self.drain().await;
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(FlushTrigger::Deadline);
                }
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!(queue = %self.queue, error = %e, "Batch task failed");
                    }
                }
            }
        }
    }

    fn push(&mut self, pending: Pending) {
        self.batch.push(pending);
        if self.batch.len() >= self.limits.messages_per_batch {
            self.flush(FlushTrigger::Size);
        } else if self.batch.deadline.is_none() {
            self.batch.deadline = Some(Instant::now() + self.limits.max_wait);
        }
    }

    fn flush(&mut self, trigger: FlushTrigger) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        debug!(
            queue = %self.queue,
            batch_size = batch.len(),
            trigger = ?trigger,
            "Flushing batch"
        );
        self.inflight.spawn((self.flush)(batch));
    }

    /// Stop accepting messages, absorb anything already queued and flush it.
    fn close(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Command>,
        done: oneshot::Sender<()>,
    ) -> Vec<oneshot::Sender<()>> {
        rx.close();
        let mut waiters = vec![done];
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Enqueue(pending) => self.push(pending),
                Command::Shutdown(waiter) => waiters.push(waiter),
            }
        }
        self.flush(FlushTrigger::Shutdown);
        waiters
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.inflight.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.queue, error = %e, "Batch task failed");
            }
        }
    }
}
