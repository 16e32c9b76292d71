//! The concrete queue processors of the notification service.
//!
//! Three queues persist typed notifications; the global queue fans every
//! event out to the live channels of the users it names.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::QueuesConfig;
use crate::events::{FriendInvite, NewPostComment, NewPostLike, NotificationRecord};
use crate::live::{Frame, LivePublisher};
use crate::processor::{BatchHandler, HandlerError, QueueDefinition, QueueProcessor, Typed};
use crate::routing::resolve_channels;
use crate::storage::NotificationStore;

/// Stores every validated record of a batch with a single `insert_many`.
pub struct PersistingHandler<T> {
    queue: String,
    store: Arc<dyn NotificationStore>,
    _record: PhantomData<fn(T)>,
}

impl<T> PersistingHandler<T> {
    pub fn new(queue: impl Into<String>, store: Arc<dyn NotificationStore>) -> Self {
        Self {
            queue: queue.into(),
            store,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<T> BatchHandler for PersistingHandler<T>
where
    T: Into<NotificationRecord> + Send + 'static,
{
    type Record = T;

    async fn on_batch(&self, records: Vec<T>) -> Result<(), HandlerError> {
        let records: Vec<NotificationRecord> = records.into_iter().map(Into::into).collect();
        let count = records.len();
        self.store.insert_many(records).await?;
        info!(queue = %self.queue, count, "Persisted notifications");
        Ok(())
    }
}

/// Publishes each payload to every live channel it resolves to.
pub struct FanoutHandler {
    queue: String,
    publisher: Arc<LivePublisher>,
}

impl FanoutHandler {
    pub fn new(queue: impl Into<String>, publisher: Arc<LivePublisher>) -> Self {
        Self {
            queue: queue.into(),
            publisher,
        }
    }
}

#[async_trait]
impl BatchHandler for FanoutHandler {
    type Record = Map<String, Value>;

    async fn on_batch(&self, records: Vec<Map<String, Value>>) -> Result<(), HandlerError> {
        for payload in records {
            let channels = resolve_channels(&payload);
            if channels.is_empty() {
                warn!(
                    queue = %self.queue,
                    fields = ?payload.keys().collect::<Vec<_>>(),
                    "Could not resolve a live channel for payload"
                );
                continue;
            }

            let frame: Frame = serde_json::to_string(&payload)?.into();
            for channel in &channels {
                self.publisher.publish(channel, Arc::clone(&frame)).await;
            }
        }
        Ok(())
    }
}

pub fn friend_invites(definition: QueueDefinition, store: Arc<dyn NotificationStore>) -> QueueProcessor {
    let handler = PersistingHandler::<FriendInvite>::new(definition.name.clone(), store);
    QueueProcessor::new(definition, Typed::<FriendInvite>::new("FriendInvite"), handler)
}

pub fn new_post_comments(
    definition: QueueDefinition,
    store: Arc<dyn NotificationStore>,
) -> QueueProcessor {
    let handler = PersistingHandler::<NewPostComment>::new(definition.name.clone(), store);
    QueueProcessor::new(
        definition,
        Typed::<NewPostComment>::new("NewPostComment"),
        handler,
    )
}

pub fn new_post_likes(definition: QueueDefinition, store: Arc<dyn NotificationStore>) -> QueueProcessor {
    let handler = PersistingHandler::<NewPostLike>::new(definition.name.clone(), store);
    QueueProcessor::new(definition, Typed::<NewPostLike>::new("NewPostLike"), handler)
}

/// Global events accept any JSON object.
pub fn global_events(definition: QueueDefinition, publisher: Arc<LivePublisher>) -> QueueProcessor {
    let handler = FanoutHandler::new(definition.name.clone(), publisher);
    QueueProcessor::new(
        definition,
        Typed::<Map<String, Value>>::new("object"),
        handler,
    )
}

/// Build every processor of the service. Must be called within a tokio runtime.
pub fn build_all(
    queues: &QueuesConfig,
    store: Arc<dyn NotificationStore>,
    publisher: Arc<LivePublisher>,
) -> Vec<QueueProcessor> {
    vec![
        friend_invites(queues.friend_invites.definition(), Arc::clone(&store)),
        new_post_comments(queues.new_post_comments.definition(), Arc::clone(&store)),
        new_post_likes(queues.new_post_likes.definition(), store),
        global_events(queues.global_events.definition(), publisher),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockAcknowledger;
    use crate::bus::Envelope;
    use crate::live::SubscriptionRegistry;
    use crate::processor::{BatchLimits, Settlement};
    use crate::routing::ChannelKey;
    use crate::storage::InMemoryNotificationStore;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn definition(name: &str, messages_per_batch: usize) -> QueueDefinition {
        QueueDefinition {
            name: name.to_string(),
            routing_keys: vec!["event.#".to_string()],
            limits: BatchLimits::new(messages_per_batch, Duration::from_millis(100)),
        }
    }

    fn invite() -> Value {
        json!({
            "senderUserId": Uuid::new_v4(),
            "receiverUserId": Uuid::new_v4(),
            "requestSentAt": "2024-03-01T12:00:00Z",
        })
    }

    fn envelope(acker: &MockAcknowledger, body: Value) -> Envelope<MockAcknowledger> {
        Envelope::new(acker.clone(), body)
    }

    #[tokio::test(start_paused = true)]
    async fn test_friend_invites_persist_batch_in_one_insert() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let processor = friend_invites(definition("friend_invites", 2), store.clone());
        let acker = MockAcknowledger::new();

        let (a, b) = tokio::join!(
            processor.accept(envelope(&acker, invite())),
            processor.accept(envelope(&acker, invite())),
        );

        assert!(matches!(a, Settlement::Processed));
        assert!(matches!(b, Settlement::Processed));
        assert_eq!(store.insert_calls().await, 1);
        assert_eq!(store.records().await.len(), 2);
        assert_eq!(acker.ack_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_requeues_batch() {
        let store = Arc::new(InMemoryNotificationStore::new());
        store.set_fail_on_insert(true).await;
        let processor = new_post_likes(definition("new_post_likes", 1), store.clone());
        let acker = MockAcknowledger::new();

        let like = json!({
            "postId": Uuid::new_v4(),
            "postAuthorId": Uuid::new_v4(),
            "likerUserId": Uuid::new_v4(),
            "totalLikes": "3",
        });
        let settlement = processor.accept(envelope(&acker, like)).await;

        match settlement {
            Settlement::Requeue(cause) => assert!(matches!(*cause, HandlerError::Storage(_))),
            other => panic!("expected requeue, got {:?}", other),
        }
        assert_eq!(acker.requeue_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_comment_is_discarded_not_stored() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let processor = new_post_comments(definition("new_post_comments", 1), store.clone());
        let acker = MockAcknowledger::new();

        let settlement = processor
            .accept(envelope(&acker, json!({"postId": "nope"})))
            .await;

        assert!(matches!(settlement, Settlement::Discarded(_)));
        assert_eq!(store.insert_calls().await, 0);
        assert_eq!(acker.ack_count().await, 1);
    }

    async fn attached_publisher() -> (Arc<LivePublisher>, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let publisher = Arc::new(LivePublisher::new());
        publisher.attach(registry.clone()).unwrap();
        (publisher, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_event_fans_out_to_each_recipient() {
        let (publisher, registry) = attached_publisher().await;
        let mut post_author = registry.subscribe(ChannelKey::for_user("A")).await;
        let mut parent_author = registry.subscribe(ChannelKey::for_user("B")).await;
        let processor = global_events(definition("global_events", 1), publisher);
        let acker = MockAcknowledger::new();

        let body = json!({"postAuthorId": "A", "parentCommentAuthorId": "B", "text": "hi"});
        let settlement = processor.accept(envelope(&acker, body.clone())).await;

        assert!(matches!(settlement, Settlement::Processed));
        for rx in [&mut post_author, &mut parent_author] {
            let frame = rx.recv().await.unwrap();
            let received: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(received, body);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_event_without_recipient_is_acked_and_skipped() {
        let (publisher, registry) = attached_publisher().await;
        let mut bystander = registry.subscribe(ChannelKey::for_user("A")).await;
        let processor = global_events(definition("global_events", 1), publisher);
        let acker = MockAcknowledger::new();

        let settlement = processor
            .accept(envelope(&acker, json!({"foo": "bar"})))
            .await;

        assert!(matches!(settlement, Settlement::Processed));
        assert!(bystander.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_event_rejects_non_object() {
        let (publisher, _registry) = attached_publisher().await;
        let processor = global_events(definition("global_events", 1), publisher);
        let acker = MockAcknowledger::new();

        let settlement = processor.accept(envelope(&acker, json!([1, 2, 3]))).await;

        assert!(matches!(settlement, Settlement::Discarded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_all_uses_configured_queues() {
        let processors = build_all(
            &QueuesConfig::default(),
            Arc::new(InMemoryNotificationStore::new()),
            Arc::new(LivePublisher::new()),
        );

        let names: Vec<&str> = processors.iter().map(|p| p.queue()).collect();
        assert_eq!(
            names,
            vec!["friend_invites", "new_post_comments", "new_post_likes", "global_events"]
        );
        for processor in &processors {
            processor.stop().await;
        }
    }
}
