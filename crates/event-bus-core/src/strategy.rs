//! Strategy traits for the event bus
//!
//! Components talk to the pub/sub system only through [`Transport`], so the
//! gateway and flow monitor run unchanged over NATS or the in-memory
//! transport used by tests.
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     └── Transport (publish bytes / subscribe to a topic)
//!             └── NatsTransport, MemoryTransport
//! ```

use crate::error::Result;
use crate::message::EventMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Raw payloads delivered to a subscriber
pub type PayloadStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Lifecycle management for long-running components
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start background work. Called once.
    async fn start(&self) -> Result<()>;

    /// Stop gracefully, letting in-flight work finish. Safe to call twice.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Ok(()) if healthy
    async fn health_check(&self) -> Result<()>;

    fn component_name(&self) -> &'static str;
}

/// Pub/sub transport.
///
/// Delivers published payloads to all current subscribers of a topic, at
/// least once, with no ordering guarantee across topics.
#[async_trait]
pub trait Transport: HealthCheck {
    /// Publish raw bytes to `topic`
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `topic`; the stream ends when the transport closes
    async fn subscribe(&self, topic: &str) -> Result<PayloadStream>;

    /// Encode and publish an envelope to its own topic
    async fn publish_message(&self, message: &EventMessage) -> Result<()> {
        let payload = message.to_bytes()?;
        self.publish(&message.topic, payload).await
    }
}
