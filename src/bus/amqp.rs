//! AMQP (RabbitMQ) consumption.
//!
//! Each queue processor gets its own consumer task. The task declares the
//! durable topic exchange and queue, binds every routing key of the queue,
//! sets the prefetch to the batch size and feeds deliveries to the processor.
//! Lost connections are re-established with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, ExchangeKind,
};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{Acknowledger, Body, BusError, Envelope, Result};
use crate::config::AmqpSettings;
use crate::processor::{QueueDefinition, QueueProcessor, Settlement};

/// Configuration for AMQP consumption.
#[derive(Clone, Debug)]
pub struct AmqpConsumerConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange the queues bind to.
    pub exchange: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl From<&AmqpSettings> for AmqpConsumerConfig {
    fn from(settings: &AmqpSettings) -> Self {
        Self {
            url: settings.url.clone(),
            exchange: settings.exchange.clone(),
            pool_size: settings.pool_size.max(1),
        }
    }
}

/// Consumer tag announced to the broker for a queue.
pub fn consumer_tag(queue: &str) -> String {
    format!("notifyd-{}", queue)
}

/// Prefetch matching the batch size, so a full batch can be in flight.
fn prefetch_count(messages_per_batch: usize) -> u16 {
    u16::try_from(messages_per_batch).unwrap_or(u16::MAX)
}

/// Broker handle of one delivery.
pub struct AmqpAcknowledger {
    acker: Acker,
}

impl AmqpAcknowledger {
    pub fn new(acker: Acker) -> Self {
        Self { acker }
    }
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Settle(format!("Failed to ack: {}", e)))
    }

    async fn requeue(&self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Settle(format!("Failed to nack: {}", e)))
    }
}

/// Pooled RabbitMQ connection shared by every queue consumer.
pub struct AmqpConsumer {
    pool: Pool,
    config: AmqpConsumerConfig,
}

impl AmqpConsumer {
    /// Create the connection pool. Connections are opened lazily.
    pub fn new(config: AmqpConsumerConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        Ok(Self { pool, config })
    }

    /// Open a connection and declare the exchange.
    pub async fn verify(&self) -> Result<()> {
        let channel = Self::channel(&self.pool).await?;
        Self::declare_exchange(&channel, &self.config.exchange).await?;
        let _ = channel.close(200, "verified").await;

        info!(exchange = %self.config.exchange, "Connected to AMQP");
        Ok(())
    }

    /// Start consuming into `processor` until `shutdown` flips.
    ///
    /// On shutdown the task stops pulling deliveries, stops the processor
    /// (flushing its pending batch), waits for every outstanding settlement
    /// and then closes the channel.
    pub fn spawn(
        &self,
        processor: Arc<QueueProcessor>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let exchange = self.config.exchange.clone();
        tokio::spawn(Self::consume_with_reconnect(pool, exchange, processor, shutdown))
    }

    async fn consume_with_reconnect(
        pool: Pool,
        exchange: String,
        processor: Arc<QueueProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let queue = processor.queue().to_string();

        // Exponential backoff with jitter to prevent thundering herd
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();

        let mut settles = JoinSet::new();

        while !*shutdown.borrow() {
            match Self::bind(&pool, &exchange, processor.definition()).await {
                Ok((channel, mut consumer)) => {
                    info!(queue = %queue, "Consumer connected, processing messages");
                    backoff_iter = backoff_builder.build();

                    let stopping = loop {
                        tokio::select! {
                            _ = shutdown.changed() => break true,
                            delivery = consumer.next() => match delivery {
                                Some(Ok(delivery)) => {
                                    let envelope = Envelope::new(
                                        AmqpAcknowledger::new(delivery.acker),
                                        Body::from(delivery.data),
                                    );
                                    settles.spawn(processor.accept(envelope));
                                }
                                Some(Err(e)) => {
                                    error!(queue = %queue, error = %e, "Consumer delivery error, will reconnect");
                                    break false;
                                }
                                None => {
                                    warn!(queue = %queue, "Consumer stream ended, reconnecting");
                                    break false;
                                }
                            },
                            Some(joined) = settles.join_next(), if !settles.is_empty() => {
                                if let Err(e) = joined {
                                    error!(queue = %queue, error = %e, "Settlement task failed");
                                }
                            }
                        }
                    };

                    if stopping {
                        let tag = consumer_tag(&queue);
                        if let Err(e) = channel
                            .basic_cancel(&tag, BasicCancelOptions::default())
                            .await
                        {
                            warn!(queue = %queue, error = %e, "Failed to cancel consumer");
                        }
                        Self::drain(&processor, &mut settles).await;
                        if let Err(e) = channel.close(200, "shutdown").await {
                            debug!(queue = %queue, error = %e, "Channel close failed");
                        }
                        info!(queue = %queue, "Consumer stopped");
                        return;
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to set up consumer, retrying after backoff");
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            debug!(queue = %queue, backoff_ms = %delay.as_millis(), "Waiting before reconnect");
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Self::drain(&processor, &mut settles).await;
        info!(queue = %queue, "Consumer stopped while disconnected");
    }

    async fn drain(processor: &QueueProcessor, settles: &mut JoinSet<Settlement>) {
        processor.stop().await;
        while let Some(joined) = settles.join_next().await {
            if let Err(e) = joined {
                error!(queue = %processor.queue(), error = %e, "Settlement task failed");
            }
        }
    }

    async fn channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))
    }

    /// Declare, bind and start consuming one queue.
    async fn bind(
        pool: &Pool,
        exchange: &str,
        definition: &QueueDefinition,
    ) -> Result<(Channel, lapin::Consumer)> {
        let queue = definition.name.as_str();
        let channel = Self::channel(pool).await?;
        Self::declare_exchange(&channel, exchange).await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        for routing_key in &definition.routing_keys {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

            info!(queue = %queue, routing_key = %routing_key, "Bound queue to exchange");
        }

        channel
            .basic_qos(
                prefetch_count(definition.limits.messages_per_batch),
                BasicQosOptions::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag(queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok((channel, consumer))
    }
}
