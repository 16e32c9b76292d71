//! Schema gate.
//!
//! Splits a flushed batch into accepted records and rejected messages.
//! Rejections are settled on the spot as discarded: a message that does not
//! fit the queue's schema will never fit it, so redelivery would only loop.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use super::accumulator::PendingBatch;
use super::settlement::SettlementGroup;

/// Errors raised when a body does not satisfy a queue's schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("body does not match {schema}: {source}")]
    Shape {
        schema: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("field '{field}' {reason}")]
    Field { field: &'static str, reason: String },
}

impl SchemaError {
    pub fn field(field: &'static str, reason: impl Into<String>) -> Self {
        SchemaError::Field {
            field,
            reason: reason.into(),
        }
    }
}

/// Per-queue record schema.
pub trait Schema: Send + Sync + 'static {
    /// Validated form handed to the batch handler.
    type Record: Send + 'static;

    /// Accept or reject one decoded body.
    fn validate(&self, body: Value) -> Result<Self::Record, SchemaError>;
}

/// No schema: every decoded body is accepted as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Schema for PassThrough {
    type Record = Value;

    fn validate(&self, body: Value) -> Result<Value, SchemaError> {
        Ok(body)
    }
}

/// Field-level rules checked after a record deserialized successfully.
pub trait FieldRules {
    fn check(&self) -> Result<(), SchemaError> {
        Ok(())
    }
}

impl FieldRules for Map<String, Value> {}

/// Schema backed by a serde record type plus its [`FieldRules`].
pub struct Typed<T> {
    name: &'static str,
    _record: PhantomData<fn() -> T>,
}

impl<T> Typed<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            _record: PhantomData,
        }
    }
}

impl<T> Schema for Typed<T>
where
    T: DeserializeOwned + FieldRules + Send + 'static,
{
    type Record = T;

    fn validate(&self, body: Value) -> Result<T, SchemaError> {
        let record: T = serde_json::from_value(body).map_err(|source| SchemaError::Shape {
            schema: self.name,
            source,
        })?;
        record.check()?;
        Ok(record)
    }
}

/// Outcome of running a batch through the gate.
pub struct Partition<R> {
    /// Accepted records, in arrival order.
    pub accepted: Vec<R>,
    /// Slots of the accepted records, index-aligned with `accepted`.
    pub slots: SettlementGroup,
    /// Number of messages discarded by the schema.
    pub rejected: usize,
}

/// Validate every message of a batch, settling rejections immediately.
pub fn partition<S: Schema + ?Sized>(
    schema: &S,
    queue: &str,
    batch: PendingBatch,
) -> Partition<S::Record> {
    let items = batch.into_items();
    let mut accepted = Vec::with_capacity(items.len());
    let mut slots = SettlementGroup::new();
    let mut rejected = 0;

    for pending in items {
        match schema.validate(pending.body) {
            Ok(record) => {
                accepted.push(record);
                slots.push(pending.slot);
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Discarding message that failed schema validation");
                pending.slot.discard(e.to_string());
                rejected += 1;
            }
        }
    }

    Partition {
        accepted,
        slots,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::accumulator::Pending;
    use crate::processor::settlement::{Settlement, SettlementSlot};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Ping {
        id: u32,
    }

    impl FieldRules for Ping {
        fn check(&self) -> Result<(), SchemaError> {
            if self.id == 0 {
                return Err(SchemaError::field("id", "must be positive"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_pass_through_accepts_anything() {
        assert_eq!(PassThrough.validate(json!("x")).unwrap(), json!("x"));
    }

    #[test]
    fn test_typed_rejects_wrong_shape() {
        let schema = Typed::<Ping>::new("Ping");
        let err = schema.validate(json!({"id": "nope"})).unwrap_err();
        assert!(matches!(err, SchemaError::Shape { schema: "Ping", .. }));
    }

    #[test]
    fn test_typed_applies_field_rules() {
        let schema = Typed::<Ping>::new("Ping");
        let err = schema.validate(json!({"id": 0})).unwrap_err();
        assert_eq!(err.to_string(), "field 'id' must be positive");
    }

    #[test]
    fn test_object_schema_rejects_non_objects() {
        let schema = Typed::<Map<String, Value>>::new("object");
        assert!(schema.validate(json!({"a": 1})).is_ok());
        assert!(schema.validate(json!([1])).is_err());
        assert!(schema.validate(json!("text")).is_err());
    }

    #[tokio::test]
    async fn test_partition_settles_rejections_and_keeps_order() {
        let mut batch = PendingBatch::default();
        let mut receipts = Vec::new();
        for body in [json!({"id": 1}), json!({"id": 0}), json!({"id": 3})] {
            let (slot, receipt) = SettlementSlot::pair();
            batch.push(Pending { body, slot });
            receipts.push(receipt);
        }

        let schema = Typed::<Ping>::new("Ping");
        let partition = partition(&schema, "pings", batch);

        let ids: Vec<u32> = partition.accepted.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(partition.slots.len(), 2);
        assert_eq!(partition.rejected, 1);

        partition.slots.complete(Ok(()));
        let outcomes: Vec<Settlement> =
            futures::future::join_all(receipts.into_iter().map(|r| r.outcome())).await;
        assert!(matches!(outcomes[0], Settlement::Processed));
        assert!(matches!(outcomes[1], Settlement::Discarded(_)));
        assert!(matches!(outcomes[2], Settlement::Processed));
    }
}
