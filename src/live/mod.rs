//! Live delivery.
//!
//! [`LivePublisher`] is the fire-and-forget entry point used by queue
//! handlers. It forwards to a [`LiveTransport`] installed once at startup,
//! normally the [`SubscriptionRegistry`] that tracks connected clients per
//! channel.

pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::routing::ChannelKey;
use crate::storage::{self, SessionResolver};

/// Serialized payload as sent to every subscriber of a channel.
pub type Frame = Arc<str>;

/// Per-connection buffer before frames are dropped for a slow client.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 32;

/// Errors from wiring the live delivery layer.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("Live transport already attached")]
    AlreadyAttached,
}

/// Transport that can reach live connections.
#[async_trait]
pub trait LiveTransport: Send + Sync + 'static {
    /// Send `payload` to every connection on `channel`, returning how many
    /// received it. Zero receivers is not an error.
    async fn broadcast(&self, channel: &ChannelKey, payload: Frame) -> usize;
}

/// Broadcasts serialized payloads to live channels.
///
/// The transport is attached once, after the listener is bound. Publishing
/// before that is logged and dropped.
#[derive(Default)]
pub struct LivePublisher {
    transport: OnceLock<Arc<dyn LiveTransport>>,
}

impl LivePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the transport. Only the first call succeeds.
    pub fn attach(&self, transport: Arc<dyn LiveTransport>) -> Result<(), LiveError> {
        self.transport.set(transport).map_err(|_| {
            warn!("Live transport already attached, ignoring second attach");
            LiveError::AlreadyAttached
        })?;
        info!("Live transport attached");
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.transport.get().is_some()
    }

    /// Publish a payload to a channel without waiting for delivery.
    pub async fn publish(&self, channel: &ChannelKey, payload: impl Into<Frame>) {
        let Some(transport) = self.transport.get() else {
            warn!(channel = %channel, "Live transport not attached, cannot publish");
            return;
        };
        let receivers = transport.broadcast(channel, payload.into()).await;
        debug!(channel = %channel, receivers, "Published live payload");
    }
}

/// One connected client.
struct Subscriber {
    sender: mpsc::Sender<Frame>,
}

type Subscriptions = Arc<RwLock<HashMap<ChannelKey, Vec<Subscriber>>>>;

/// Registry of live connections, keyed by channel.
///
/// Delivery never waits on a client: a full buffer drops the frame for that
/// client only. Disconnected clients are pruned during delivery and by a
/// cleanup task spawned per subscription.
pub struct SubscriptionRegistry {
    subscriptions: Subscriptions,
    capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register a connection on `channel`. Dropping the receiver unsubscribes.
    pub async fn subscribe(&self, channel: ChannelKey) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let cleanup_tx = tx.clone();

        {
            let mut subs = self.subscriptions.write().await;
            subs.entry(channel.clone())
                .or_default()
                .push(Subscriber { sender: tx });
        }
        debug!(channel = %channel, "Subscriber registered");

        let subscriptions = Arc::clone(&self.subscriptions);
        tokio::spawn(async move {
            cleanup_tx.closed().await;
            drop(cleanup_tx);
            let mut subs = subscriptions.write().await;
            if let Some(subscribers) = subs.get_mut(&channel) {
                subscribers.retain(|s| !s.sender.is_closed());
                if subscribers.is_empty() {
                    subs.remove(&channel);
                }
            }
            debug!(channel = %channel, "Subscriber disconnected, subscription cleaned up");
        });

        rx
    }

    /// Number of live connections on `channel`.
    pub async fn subscriber_count(&self, channel: &ChannelKey) -> usize {
        self.subscriptions
            .read()
            .await
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    async fn deliver(&self, channel: &ChannelKey, payload: Frame) -> usize {
        let mut subs = self.subscriptions.write().await;
        let Some(subscribers) = subs.get_mut(channel) else {
            return 0;
        };

        let mut sent = 0;
        subscribers.retain(|sub| match sub.sender.try_send(Arc::clone(&payload)) {
            Ok(()) => {
                sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel = %channel, "Subscriber buffer full, dropping frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            subs.remove(channel);
        }
        sent
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveTransport for SubscriptionRegistry {
    async fn broadcast(&self, channel: &ChannelKey, payload: Frame) -> usize {
        self.deliver(channel, payload).await
    }
}

/// Who a streaming connection belongs to and where it listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIdentity {
    pub channel: ChannelKey,
    pub user_id: Uuid,
}

/// Derive the streaming identity of a session token, if the session is valid.
pub async fn resolve_stream(
    sessions: &dyn SessionResolver,
    token: &str,
) -> storage::Result<Option<StreamIdentity>> {
    Ok(sessions.resolve(token).await?.map(|session| StreamIdentity {
        channel: ChannelKey::for_user(session.user_id),
        user_id: session.user_id,
    }))
}
