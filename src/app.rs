//! Composition root.
//!
//! ```text
//! [RabbitMQ] -> AmqpConsumer -> QueueProcessor x4 -> NotificationStore
//!                                      |
//!                                      v (global_events)
//!                               LivePublisher -> SubscriptionRegistry -> WebSocket clients
//! ```
//!
//! Every dependency is constructed here and handed to its users explicitly.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::bus::{AmqpConsumer, AmqpConsumerConfig, BusError};
use crate::config::{Config, ConfigError};
use crate::consumers;
use crate::live::ws::{self, LiveState};
use crate::live::{LiveError, LivePublisher, SubscriptionRegistry};
use crate::processor::QueueProcessor;
use crate::storage::{self, NotificationStore, SessionResolver, StorageError};
use crate::utils::bootstrap::connect_with_retry;

/// Errors that stop the service.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Broker error: {0}")]
    Bus(#[from] BusError),

    #[error("Live delivery error: {0}")]
    Live(#[from] LiveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The wired service, ready to run.
pub struct Application {
    config: Config,
    store: Arc<dyn NotificationStore>,
    sessions: Arc<dyn SessionResolver>,
    registry: Arc<SubscriptionRegistry>,
    publisher: Arc<LivePublisher>,
    processors: Vec<Arc<QueueProcessor>>,
    consumer: AmqpConsumer,
}

impl Application {
    /// Validate the configuration, open storage and wire every component.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        config.validate()?;
        let (store, sessions) =
            connect_with_retry("storage", || storage::open(&config.storage)).await?;
        Self::from_parts(config, store, sessions)
    }

    /// Wire the service around already opened storage.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn NotificationStore>,
        sessions: Arc<dyn SessionResolver>,
    ) -> Result<Self, AppError> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let publisher = Arc::new(LivePublisher::new());
        let processors = consumers::build_all(
            &config.queues,
            Arc::clone(&store),
            Arc::clone(&publisher),
        )
            .into_iter()
            .map(Arc::new)
            .collect();
        let consumer = AmqpConsumer::new(AmqpConsumerConfig::from(&config.amqp))?;

        Ok(Self {
            config,
            store,
            sessions,
            registry,
            publisher,
            processors,
            consumer,
        })
    }

    pub fn processors(&self) -> &[Arc<QueueProcessor>] {
        &self.processors
    }

    pub fn publisher(&self) -> &Arc<LivePublisher> {
        &self.publisher
    }

    /// HTTP routes: health, the notification listing and the live stream.
    pub fn router(&self) -> Router {
        ws::router(LiveState {
            registry: Arc::clone(&self.registry),
            sessions: Arc::clone(&self.sessions),
            store: Arc::clone(&self.store),
        })
    }

    /// Serve until `shutdown` completes, then stop every consumer, draining
    /// their pending batches before returning.
    pub async fn run<F>(self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        connect_with_retry("rabbitmq", || self.consumer.verify()).await?;

        let listener = TcpListener::bind(self.config.server.bind_address()).await?;
        info!(address = %listener.local_addr()?, "HTTP listener bound");
        self.publisher.attach(self.registry.clone())?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let consumers: Vec<_> = self
            .processors
            .iter()
            .map(|processor| self.consumer.spawn(Arc::clone(processor), stop_rx.clone()))
            .collect();
        info!(queues = consumers.len(), "Consumers started");

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        info!("Shutting down consumers");
        let _ = stop_tx.send(true);
        for handle in consumers {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer task failed");
            }
        }
        info!("Shutdown complete");

        served?;
        Ok(())
    }
}
