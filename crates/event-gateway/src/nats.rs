//! NATS transport
//!
//! Core NATS pub/sub over a small pool of client connections. Publishes are
//! retried with backoff; connecting keeps retrying for a startup grace
//! period before giving up.

use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use event_bus_core::metrics::TransportMetrics;
use event_bus_core::prelude::*;
use event_bus_core::{PayloadStream, TransportConfig};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Pooled NATS client implementing [`Transport`]
pub struct NatsTransport {
    clients: Vec<async_nats::Client>,
    next: AtomicUsize,
    retry: RetryPolicy,
    metrics: TransportMetrics,
    running: AtomicBool,
}

impl NatsTransport {
    /// Open `pool_size` connections, retrying each until the grace period ends
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        let deadline = Instant::now() + config.connect_grace_period;
        let backoff = RetryPolicy {
            max_retries: u32::MAX,
            initial_delay: config.publish_backoff,
            max_delay: std::time::Duration::from_secs(5),
            multiplier: 2.0,
        };
        let metrics = TransportMetrics::new(config.connection_name.clone());

        let pool_size = config.pool_size.max(1);
        let mut clients = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let name = format!("{}-{}", config.connection_name, index);
            let mut attempt = 0u32;
            let client = loop {
                attempt += 1;
                match async_nats::ConnectOptions::new()
                    .name(&name)
                    .connect(config.url.as_str())
                    .await
                {
                    Ok(client) => break client,
                    Err(e) if Instant::now() < deadline => {
                        let delay = backoff.delay(attempt);
                        warn!(
                            url = %config.url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "NATS connect failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        metrics.set_connected(false);
                        return Err(GatewayError::transport_with_source(
                            format!("Failed to connect to {}", config.url),
                            e,
                        ));
                    }
                }
            };
            clients.push(client);
        }

        metrics.set_connected(true);
        info!(url = %config.url, pool_size, "Connected to NATS");

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            retry: RetryPolicy {
                max_retries: config.publish_attempts.saturating_sub(1),
                initial_delay: config.publish_backoff,
                ..Default::default()
            },
            metrics,
            running: AtomicBool::new(true),
        })
    }

    /// Round-robin over the pool
    fn client(&self) -> &async_nats::Client {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[index]
    }
}

#[async_trait]
impl Lifecycle for NatsTransport {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        for client in &self.clients {
            client
                .flush()
                .await
                .map_err(|e| GatewayError::transport_with_source("Failed to flush", e))?;
        }
        self.metrics.set_connected(false);
        info!("NATS transport stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for NatsTransport {
    async fn health_check(&self) -> Result<()> {
        let connected = self
            .clients
            .iter()
            .any(|c| c.connection_state() == async_nats::connection::State::Connected);
        if connected {
            Ok(())
        } else {
            Err(GatewayError::transport("No pooled NATS connection is connected"))
        }
    }

    fn component_name(&self) -> &'static str {
        "nats_transport"
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.client().publish(topic.to_string(), payload.clone()).await {
                Ok(()) => {
                    self.metrics.record_published(topic);
                    self.metrics.record_publish_latency(start.elapsed());
                    trace!(topic, bytes = payload.len(), "Published");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    self.metrics.record_publish_error(topic);
                    if !self.retry.should_retry(attempt) {
                        return Err(GatewayError::transport_with_source(
                            format!("Publish to '{}' failed after {} attempts", topic, attempt),
                            e,
                        ));
                    }
                    let delay = self.retry.delay(attempt);
                    debug!(topic, attempt, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream> {
        let subscriber = self
            .client()
            .subscribe(topic.to_string())
            .await
            .map_err(|e| {
                GatewayError::transport_with_source(format!("Failed to subscribe to '{}'", topic), e)
            })?;

        info!(topic, "Subscribed");
        Ok(Box::pin(subscriber.map(|message| message.payload)))
    }
}
