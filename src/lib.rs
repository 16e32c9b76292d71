//! notifyd - Notification Service
//!
//! Consumes notification events from a message broker in validated,
//! acknowledged batches, persists them, and fans events out to live
//! WebSocket subscribers.

#[cfg(feature = "amqp")]
pub mod app;
pub mod bus;
pub mod config;
pub mod consumers;
pub mod events;
pub mod live;
pub mod processor;
pub mod routing;
pub mod storage;
pub mod utils;
