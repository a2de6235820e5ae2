//! In-process transport
//!
//! Broadcast channel per topic with pub/sub semantics inside a single
//! process. Every publication is recorded so tests can assert on what went
//! out, and publishes to chosen topics can be made to fail.

use crate::error::{GatewayError, Result};
use crate::message::EventMessage;
use crate::strategy::{HealthCheck, Lifecycle, PayloadStream, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// How long an injected publish failure lasts
#[derive(Debug, Clone, Copy)]
enum FailureMode {
    Always,
    Times(u32),
}

/// Tokio broadcast based transport
pub struct MemoryTransport {
    channels: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
    published: RwLock<Vec<(String, Bytes)>>,
    failures: RwLock<HashMap<String, FailureMode>>,
    capacity: usize,
    running: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Per-topic channel capacity; slow subscribers skip lagged payloads
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            published: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            running: AtomicBool::new(true),
        }
    }

    /// Every successful publication, in order
    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.published.read().await.clone()
    }

    /// Decoded envelopes published to `topic`
    pub async fn published_to(&self, topic: &str) -> Vec<EventMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, bytes)| EventMessage::from_bytes(bytes).ok())
            .collect()
    }

    pub async fn clear(&self) {
        self.published.write().await.clear();
    }

    /// Make every publish to `topic` fail
    pub async fn fail_publishes_to(&self, topic: impl Into<String>) {
        self.failures
            .write()
            .await
            .insert(topic.into(), FailureMode::Always);
    }

    /// Make the next `times` publishes to `topic` fail
    pub async fn fail_next_publishes_to(&self, topic: impl Into<String>, times: u32) {
        self.failures
            .write()
            .await
            .insert(topic.into(), FailureMode::Times(times));
    }

    pub async fn heal(&self, topic: &str) {
        self.failures.write().await.remove(topic);
    }

    /// Drop all channels; open subscriptions end
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.channels.write().await.clear();
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        if let Some(tx) = self.channels.read().await.get(topic) {
            return tx.clone();
        }
        self.channels
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    async fn injected_failure(&self, topic: &str) -> bool {
        let mut failures = self.failures.write().await;
        match failures.get_mut(topic) {
            Some(FailureMode::Always) => true,
            Some(FailureMode::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            Some(FailureMode::Times(_)) => {
                failures.remove(topic);
                false
            }
            None => false,
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lifecycle for MemoryTransport {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.close().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for MemoryTransport {
    async fn health_check(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(GatewayError::transport("memory transport is closed"))
        }
    }

    fn component_name(&self) -> &'static str {
        "memory_transport"
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_running() {
            return Err(GatewayError::transport("memory transport is closed"));
        }
        if self.injected_failure(topic).await {
            return Err(GatewayError::transport(format!(
                "injected publish failure on '{}'",
                topic
            )));
        }

        let tx = self.sender(topic).await;
        // No subscribers is not an error for pub/sub
        let receivers = tx.send(payload.clone()).unwrap_or(0);
        debug!(topic = %topic, receivers, "Published to memory transport");

        self.published
            .write()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream> {
        if !self.is_running() {
            return Err(GatewayError::transport("memory transport is closed"));
        }
        let rx = self.sender(topic).await.subscribe();
        let topic = topic.to_string();

        let stream = futures::stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => return Some((bytes, (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Subscriber lagged, payloads skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
