//! # Event Gateway
//!
//! Validates, filters, transforms and routes pub/sub event messages, with
//! retry and dead-letter handling.
//!
//! ## Features
//!
//! - Named filter rule sets per topic
//! - Schema-keyed routing with fan-out and payload transforms
//! - One bounded queue and worker per topic
//! - Retry with backoff, then `<topic>.dlq`
//! - NATS or in-memory transport
//!
//! Outbound messages are published with status `processed`; ingress only
//! admits `pending` envelopes, so routed copies are never processed twice.

pub mod dlq;
pub mod nats;
pub mod processor;
pub mod retry;
pub mod router;
pub mod stats;
pub mod transform;

pub use dlq::*;
pub use nats::NatsTransport;
pub use processor::*;
pub use retry::RetryPolicy;
pub use router::*;
pub use stats::*;

use async_trait::async_trait;
use event_bus_core::prelude::*;
use event_bus_core::{ErrorContext, ErrorContextExt, PayloadStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Boundary request to publish a new event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub event_type: String,
    pub schema_version: String,
    #[serde(default)]
    pub payload: Payload,
    /// Resolved from the schema id when absent
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub producer: Option<String>,
    /// A fresh trace id is minted when absent
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl PublishRequest {
    pub fn new(event_type: impl Into<String>, schema_version: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version: schema_version.into(),
            payload,
            topic: None,
            producer: None,
            trace_id: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Boundary response; failures are reported, never raised
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishResponse {
    fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Gateway orchestrator: ingress subscribers plus one worker per topic
pub struct Gateway {
    config: GatewayConfig,
    pipeline: Arc<Pipeline>,
    transport: Arc<dyn Transport>,
    receivers: Mutex<QueueReceivers>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl Gateway {
    /// Validate configuration and build the processing pipeline
    pub fn new(config: GatewayConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(config.topic_registry()?);
        let filters = config.filter_engine()?;
        let router = Router::new(config.routing.clone())?;
        let cancel = CancellationToken::new();

        info!(
            topics = registry.len(),
            rule_sets = filters.len(),
            routed_schemas = router.schema_count(),
            "Gateway configured"
        );

        let (pipeline, receivers) = Pipeline::new(
            registry,
            filters,
            router,
            transport.clone(),
            config.gateway.clone(),
            cancel.clone(),
        );

        Ok(Self {
            config,
            pipeline,
            transport,
            receivers: Mutex::new(receivers),
            handles: Mutex::new(Vec::new()),
            cancel,
            running: AtomicBool::new(false),
        })
    }

    /// Spawn topic workers and subscribe to every registered topic
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let receivers = std::mem::take(&mut *self.receivers.lock().await);
        let mut handles = self.handles.lock().await;

        for (topic, receiver) in receivers {
            let worker = TopicProcessor::new(
                topic,
                receiver,
                self.pipeline.clone(),
                self.cancel.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        for topic in self.pipeline.registry().names() {
            let stream = self
                .transport
                .subscribe(&topic)
                .await
                .with_context(ErrorContext::new("gateway", "subscribe").with_topic(topic.clone()))?;
            handles.push(tokio::spawn(ingress(
                topic,
                stream,
                self.pipeline.clone(),
                self.cancel.clone(),
            )));
        }

        info!(tasks = handles.len(), "Gateway started");
        Ok(())
    }

    /// Admit a message directly into its topic queue
    pub async fn enqueue(&self, message: EventMessage) -> Result<()> {
        self.pipeline.enqueue(message).await
    }

    /// Build, validate and enqueue a new event
    pub async fn publish_event(&self, request: PublishRequest) -> PublishResponse {
        let schema = event_bus_core::schema_id(&request.event_type, &request.schema_version);
        let topic = match request.topic {
            Some(topic) => topic,
            None => match self.pipeline.registry().resolve_by_schema(&schema) {
                Some(config) => config.name.clone(),
                None => {
                    return PublishResponse::failure(format!("no topic declares schema {}", schema))
                }
            },
        };
        if !self.pipeline.registry().contains(&topic) {
            return PublishResponse::failure(GatewayError::UnknownTopic(topic));
        }

        let trace_id = request
            .trace_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut message = EventMessage::new(
            topic.clone(),
            request.event_type,
            request.schema_version,
            request.payload,
        )
        .with_trace_id(trace_id.clone());
        message.producer = request.producer;
        let message_id = message.id.clone();

        match self.pipeline.enqueue(message).await {
            Ok(()) => {
                debug!(topic = %topic, message_id = %message_id, "Event accepted");
                PublishResponse {
                    success: true,
                    message_id: Some(message_id),
                    topic: Some(topic),
                    trace_id: Some(trace_id),
                    error: None,
                }
            }
            Err(e) => PublishResponse {
                success: false,
                message_id: Some(message_id),
                topic: Some(topic),
                trace_id: Some(trace_id),
                error: Some(e.to_string()),
            },
        }
    }

    /// Configuration and live counters for one topic
    pub fn topic_metrics(&self, topic: &str) -> Option<TopicMetrics> {
        let registry = self.pipeline.registry();
        let config = registry.get(topic)?;
        let counters = self
            .pipeline
            .topic_stats(topic)
            .map(|s| s.snapshot())
            .unwrap_or_default();

        Some(TopicMetrics {
            topic: config.name.clone(),
            schema_id: config.schema_id.clone(),
            producers: config.producers.iter().cloned().collect(),
            consumers: config.consumers.iter().cloned().collect(),
            retention: config.retention,
            max_message_size: config.max_message_size,
            queue_capacity: config.queue_capacity,
            queue_depth: self.pipeline.queue_depth(topic),
            dead_letter_topic: registry.dlq_topic(topic),
            counters,
        })
    }

    /// Most recent dead-lettered messages, newest first
    pub async fn dead_letter_messages(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.pipeline.dead_letters().recent(limit).await
    }

    pub fn stats(&self) -> GatewayStats {
        let names = self.pipeline.registry().names();
        let mut stats = GatewayStats {
            topics: names.len(),
            ..Default::default()
        };
        for name in &names {
            if let Some(topic) = self.pipeline.topic_stats(name) {
                stats.totals += topic.snapshot();
            }
            stats.queued += self.pipeline.queue_depth(name);
        }
        stats
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop admission, let in-flight batches finish, then join all tasks
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Gateway shutting down");
        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let timeout = self.config.gateway.shutdown_timeout;
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Gateway tasks did not stop in time");
        }

        info!(stats = ?self.stats(), "Gateway stopped");
    }
}

#[async_trait]
impl Lifecycle for Gateway {
    async fn start(&self) -> Result<()> {
        Gateway::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        Gateway::is_running(self)
    }
}

#[async_trait]
impl HealthCheck for Gateway {
    async fn health_check(&self) -> Result<()> {
        if !self.is_running() {
            return Err(GatewayError::Internal("gateway is not running".into()));
        }
        self.transport.health_check().await
    }

    fn component_name(&self) -> &'static str {
        "event_gateway"
    }
}

/// Decode inbound payloads for one topic and admit pending envelopes
async fn ingress(
    topic: String,
    mut stream: PayloadStream,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(bytes) => bytes,
                None => {
                    warn!(topic = %topic, "Subscription ended");
                    break;
                }
            },
        };

        let mut message = match EventMessage::from_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                if let Some(stats) = pipeline.topic_stats(&topic) {
                    TopicStats::incr(&stats.dropped);
                }
                warn!(topic = %topic, error = %e, "Undecodable envelope dropped");
                continue;
            }
        };

        if message.status != MessageStatus::Pending {
            trace!(topic = %topic, message_id = %message.id, status = %message.status, "Skipping non-pending envelope");
            continue;
        }
        if message.topic != topic {
            debug!(
                subject = %topic,
                envelope_topic = %message.topic,
                "Envelope topic differs from subject, using subject"
            );
            message.topic = topic.clone();
        }

        if let Err(e) = pipeline.enqueue(message).await {
            match e {
                GatewayError::Shutdown => break,
                other => error!(topic = %topic, error = %other, "Ingress rejected message"),
            }
        }
    }
    debug!(topic = %topic, "Ingress stopped");
}
