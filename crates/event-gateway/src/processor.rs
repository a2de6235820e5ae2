//! Per-topic processing
//!
//! Each topic owns a bounded FIFO queue drained by a single worker. The
//! shared [`Pipeline`] holds everything a worker needs: filter rule sets,
//! the router, the transport, retry policy and dead-letter handling.

use crate::dlq::{DeadLetterEntry, DeadLetterStore};
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::stats::TopicStats;
use chrono::Utc;
use event_bus_core::metrics::{GatewayMetrics, LatencyTimer};
use event_bus_core::prelude::*;
use event_bus_core::{ErrorContext, ErrorContextExt, ProcessorConfig, FAILURE_INFO_KEY};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Terminal result of one processing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed { deliveries: usize },
    Filtered,
}

/// Shared processing state, one per gateway
pub struct Pipeline {
    registry: Arc<TopicRegistry>,
    filters: FilterEngine,
    router: Router,
    transport: Arc<dyn Transport>,
    config: ProcessorConfig,
    retry: RetryPolicy,
    dead_letters: DeadLetterStore,
    stats: HashMap<String, Arc<TopicStats>>,
    queues: HashMap<String, mpsc::Sender<EventMessage>>,
    metrics: GatewayMetrics,
    cancel: CancellationToken,
}

/// Receiving halves of the topic queues, handed to workers at start
pub type QueueReceivers = HashMap<String, mpsc::Receiver<EventMessage>>;

impl Pipeline {
    /// Build the pipeline and one bounded queue per registered topic
    pub fn new(
        registry: Arc<TopicRegistry>,
        filters: FilterEngine,
        router: Router,
        transport: Arc<dyn Transport>,
        config: ProcessorConfig,
        cancel: CancellationToken,
    ) -> (Arc<Self>, QueueReceivers) {
        let mut queues = HashMap::with_capacity(registry.len());
        let mut receivers = HashMap::with_capacity(registry.len());
        let mut stats = HashMap::with_capacity(registry.len());

        for topic in registry.iter() {
            let (tx, rx) = mpsc::channel(topic.queue_capacity);
            queues.insert(topic.name.clone(), tx);
            receivers.insert(topic.name.clone(), rx);
            stats.insert(topic.name.clone(), Arc::new(TopicStats::default()));
        }

        let pipeline = Self {
            retry: RetryPolicy::from_processor(&config),
            dead_letters: DeadLetterStore::new(config.dead_letter_history),
            registry,
            filters,
            router,
            transport,
            config,
            stats,
            queues,
            metrics: GatewayMetrics::new("event_gateway"),
            cancel,
        };

        (Arc::new(pipeline), receivers)
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    pub fn topic_stats(&self, topic: &str) -> Option<&Arc<TopicStats>> {
        self.stats.get(topic)
    }

    /// Messages currently waiting in `topic`'s queue
    pub fn queue_depth(&self, topic: &str) -> usize {
        self.queues
            .get(topic)
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Admit a message into its topic queue.
    ///
    /// Oversized messages and full queues are dead-lettered (or dropped when
    /// dead-lettering is disabled) and reported as errors.
    pub async fn enqueue(&self, message: EventMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Shutdown);
        }

        let topic = self
            .registry
            .get(&message.topic)
            .ok_or_else(|| GatewayError::UnknownTopic(message.topic.clone()))?;
        let sender = self
            .queues
            .get(&topic.name)
            .ok_or_else(|| GatewayError::UnknownTopic(topic.name.clone()))?;

        let size = message.size_bytes();
        if size > topic.max_message_size {
            let err = GatewayError::MessageTooLarge {
                topic: topic.name.clone(),
                size,
                limit: topic.max_message_size,
            };
            self.dead_letter(message, err.kind(), err.to_string()).await;
            return Err(err);
        }

        match sender.try_send(message) {
            Ok(()) => {
                if let Some(stats) = self.stats.get(&topic.name) {
                    TopicStats::incr(&stats.received);
                }
                self.metrics.record_received(&topic.name);
                Ok(())
            }
            Err(TrySendError::Full(message)) => {
                let err = GatewayError::Backpressure {
                    message: format!("queue for '{}' is full", topic.name),
                };
                self.dead_letter(message, err.kind(), err.kind().to_string()).await;
                Err(err)
            }
            Err(TrySendError::Closed(_)) => Err(GatewayError::Shutdown),
        }
    }

    /// Run one message through the pipeline, retrying or dead-lettering on error
    pub async fn handle(self: &Arc<Self>, mut message: EventMessage) {
        if message.status != MessageStatus::Pending {
            warn!(
                message_id = %message.id,
                status = %message.status,
                "Dequeued message is not pending, dropping"
            );
            return;
        }

        let _timer = LatencyTimer::start(|d| self.metrics.record_processing_latency(d));
        let ctx = ErrorContext::new("processor", "process")
            .with_topic(message.topic.clone())
            .with_message_id(message.id.clone());

        match self.process(&mut message).await.with_context(ctx) {
            Ok(outcome) => {
                trace!(message_id = %message.id, ?outcome, "Message done");
            }
            Err(err) => self.handle_failure(message, err).await,
        }
    }

    /// Schema check, filter, route, transform and publish
    pub async fn process(&self, message: &mut EventMessage) -> Result<ProcessOutcome> {
        message.advance(MessageStatus::Processing)?;

        let topic = self
            .registry
            .get(&message.topic)
            .ok_or_else(|| GatewayError::UnknownTopic(message.topic.clone()))?;
        let stats = self.stats.get(&topic.name).cloned().unwrap_or_default();

        let schema = message.schema_id();
        if schema != topic.schema_id {
            if self.config.strict_schema {
                message.advance(MessageStatus::Filtered)?;
                TopicStats::incr(&stats.filtered);
                self.metrics.record_filtered(&topic.name, "schema");
                debug!(
                    message_id = %message.id,
                    expected = %topic.schema_id,
                    actual = %schema,
                    "Schema mismatch, message filtered"
                );
                return Ok(ProcessOutcome::Filtered);
            }
            warn!(
                topic = %topic.name,
                message_id = %message.id,
                expected = %topic.schema_id,
                actual = %schema,
                "Schema mismatch"
            );
        }

        if let FilterResult::Reject { rule_set, field } =
            self.filters.evaluate(message, &topic.filters)
        {
            message.advance(MessageStatus::Filtered)?;
            TopicStats::incr(&stats.filtered);
            self.metrics.record_filtered(&topic.name, &rule_set);
            debug!(message_id = %message.id, rule_set = %rule_set, field = %field, "Message filtered");
            return Ok(ProcessOutcome::Filtered);
        }

        let outcome = self.router.route(message);
        let deliveries = outcome.deliveries.len();

        for delivery in outcome.deliveries {
            let outbound = mark_processed(delivery.message)?;
            self.transport
                .publish(&delivery.target, outbound.to_bytes()?)
                .await?;
            TopicStats::incr(&stats.published);
            self.metrics.record_routed(&delivery.target, 1);
        }

        if outcome.routed {
            TopicStats::incr(&stats.routed);
        } else {
            TopicStats::incr(&stats.not_routed);
        }

        message.advance(MessageStatus::Processed)?;
        TopicStats::incr(&stats.processed);
        self.metrics.record_processed(&topic.name);

        Ok(ProcessOutcome::Processed { deliveries })
    }

    /// Count the failure, then schedule a retry or dead-letter the message
    pub async fn handle_failure(self: &Arc<Self>, mut message: EventMessage, err: GatewayError) {
        if let Some(stats) = self.stats.get(&message.topic) {
            TopicStats::incr(&stats.errors);
        }
        if let Err(e) = message.advance(MessageStatus::Failed) {
            warn!(error = %e, message_id = %message.id, "Could not mark message failed");
        }
        message.retry_count += 1;

        if !self.retry.should_retry(message.retry_count) {
            let reason = err.to_string();
            self.dead_letter(message, err.kind(), reason).await;
            return;
        }

        if let Err(e) = message.advance(MessageStatus::Pending) {
            warn!(error = %e, message_id = %message.id, "Could not reset message for retry");
            return;
        }
        if let Some(stats) = self.stats.get(&message.topic) {
            TopicStats::incr(&stats.retried);
        }
        self.metrics.record_retry(&message.topic);

        let delay = self.retry.delay(message.retry_count);
        debug!(
            message_id = %message.id,
            retry_count = message.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Scheduling retry"
        );

        // Sleep off the worker so the rest of the batch is not held up
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = pipeline.cancel.cancelled() => {
                    warn!(message_id = %message.id, "Shutdown before retry, dropping message");
                    if let Some(stats) = pipeline.stats.get(&message.topic) {
                        TopicStats::incr(&stats.dropped);
                    }
                }
                _ = tokio::time::sleep(delay) => pipeline.requeue(message).await,
            }
        });
    }

    async fn requeue(&self, message: EventMessage) {
        let Some(sender) = self.queues.get(&message.topic) else {
            return;
        };
        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.dead_letter(message, "queue_full", "queue_full".to_string()).await;
            }
            Err(TrySendError::Closed(message)) => {
                warn!(message_id = %message.id, "Queue closed before retry, dropping message");
            }
        }
    }

    /// Mark terminal, attach failure info and publish to the dead-letter topic
    pub async fn dead_letter(&self, mut message: EventMessage, kind: &str, reason: String) {
        let topic = message.topic.clone();
        let stats = self.stats.get(&topic).cloned().unwrap_or_default();

        if !self.config.dead_letter_enabled {
            TopicStats::incr(&stats.dropped);
            self.metrics.record_dropped(&topic, kind);
            warn!(
                topic = %topic,
                message_id = %message.id,
                reason = %reason,
                "Dead-lettering disabled, dropping message"
            );
            return;
        }

        if let Err(e) = message.advance(MessageStatus::DeadLetter) {
            warn!(error = %e, message_id = %message.id, "Forcing dead-letter status");
            message.status = MessageStatus::DeadLetter;
        }

        let failed_at = Utc::now();
        message.payload.insert(
            FAILURE_INFO_KEY.to_string(),
            json!({
                "reason": reason,
                "original_topic": topic,
                "retry_count": message.retry_count,
                "failed_at": failed_at.to_rfc3339(),
            }),
        );

        let dlq_topic = self.registry.dlq_topic(&topic);
        let published = match message.to_bytes() {
            Ok(bytes) => self.transport.publish(&dlq_topic, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            TopicStats::incr(&stats.errors);
            error!(
                error = %e,
                dlq_topic = %dlq_topic,
                message_id = %message.id,
                "Failed to publish dead letter"
            );
        }

        TopicStats::incr(&stats.dead_lettered);
        self.metrics.record_dead_letter(&topic, kind);
        warn!(
            topic = %topic,
            message_id = %message.id,
            retry_count = message.retry_count,
            reason = %reason,
            "Message dead-lettered"
        );

        self.dead_letters
            .add(DeadLetterEntry {
                message,
                reason,
                dead_letter_topic: dlq_topic,
                failed_at,
            })
            .await;
    }
}

/// Outbound copies are published as processed so ingress does not re-admit them
fn mark_processed(mut message: EventMessage) -> Result<EventMessage> {
    if message.status == MessageStatus::Pending {
        message.advance(MessageStatus::Processing)?;
    }
    message.advance(MessageStatus::Processed)?;
    Ok(message)
}

/// Single worker draining one topic queue
pub struct TopicProcessor {
    topic: String,
    receiver: mpsc::Receiver<EventMessage>,
    pipeline: Arc<Pipeline>,
    batch_size: usize,
    interval: Duration,
    cancel: CancellationToken,
}

impl TopicProcessor {
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::Receiver<EventMessage>,
        pipeline: Arc<Pipeline>,
        cancel: CancellationToken,
    ) -> Self {
        let batch_size = pipeline.config().batch_size.max(1);
        let interval = pipeline.config().processing_interval;
        Self {
            topic: topic.into(),
            receiver,
            pipeline,
            batch_size,
            interval,
            cancel,
        }
    }

    /// Wait up to the processing interval for one message, then drain up to
    /// `batch_size` more without blocking. A started batch always finishes.
    pub async fn run(mut self) {
        info!(topic = %self.topic, "Topic processor started");
        let metrics = GatewayMetrics::new("event_gateway");
        let mut batch = Vec::with_capacity(self.batch_size + 1);

        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = tokio::time::timeout(self.interval, self.receiver.recv()) => {
                    match received {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(_) => continue,
                    }
                }
            };

            batch.push(first);
            while batch.len() <= self.batch_size {
                match self.receiver.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }

            trace!(topic = %self.topic, size = batch.len(), "Processing batch");
            for message in batch.drain(..) {
                self.pipeline.handle(message).await;
            }
            metrics.set_queue_depth(&self.topic, self.pipeline.queue_depth(&self.topic));
        }

        self.receiver.close();
        let mut abandoned = 0u64;
        while self.receiver.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            if let Some(stats) = self.pipeline.topic_stats(&self.topic) {
                TopicStats::add(&stats.dropped, abandoned);
            }
            warn!(topic = %self.topic, abandoned, "Queued messages abandoned at shutdown");
        }
        info!(topic = %self.topic, "Topic processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus_core::MemoryTransport;
    use serde_json::json;

    fn pipeline(
        transport: Arc<MemoryTransport>,
        config: ProcessorConfig,
        topics: Vec<TopicConfig>,
        rules: Vec<RoutingRule>,
    ) -> (Arc<Pipeline>, QueueReceivers) {
        let registry = Arc::new(TopicRegistry::new(topics, config.dlq_suffix.clone()).unwrap());
        let mut sets = HashMap::new();
        sets.insert(
            "positive_bid".to_string(),
            vec![FilterRule::new("bid", Operator::Gt, Some(json!(0)))],
        );
        Pipeline::new(
            registry,
            FilterEngine::new(sets).unwrap(),
            Router::new(rules).unwrap(),
            transport,
            config,
            CancellationToken::new(),
        )
    }

    fn tick(bid: f64) -> EventMessage {
        let payload = json!({"symbol": "EURUSD", "bid": bid}).as_object().cloned().unwrap();
        EventMessage::new("ticks", "PriceTick", "1.0", payload)
    }

    #[tokio::test]
    async fn test_process_filters_and_publishes() {
        let transport = Arc::new(MemoryTransport::new());
        let (pipeline, _rx) = pipeline(
            transport.clone(),
            ProcessorConfig::default(),
            vec![TopicConfig::new("ticks", "PriceTick@1.0").with_filters(["positive_bid"])],
            vec![],
        );

        let mut rejected = tick(-1.0);
        assert_eq!(pipeline.process(&mut rejected).await.unwrap(), ProcessOutcome::Filtered);
        assert_eq!(rejected.status, MessageStatus::Filtered);

        let mut accepted = tick(1.1);
        assert_eq!(
            pipeline.process(&mut accepted).await.unwrap(),
            ProcessOutcome::Processed { deliveries: 1 }
        );
        assert_eq!(accepted.status, MessageStatus::Processed);

        let out = transport.published_to("ticks").await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, accepted.id);
        assert_eq!(out[0].status, MessageStatus::Processed);

        let counters = pipeline.topic_stats("ticks").unwrap().snapshot();
        assert_eq!(counters.filtered, 1);
        assert_eq!(counters.not_routed, 1);
    }

    #[tokio::test]
    async fn test_strict_schema_filters_mismatch() {
        let transport = Arc::new(MemoryTransport::new());
        let config = ProcessorConfig {
            strict_schema: true,
            ..Default::default()
        };
        let (pipeline, _rx) = pipeline(
            transport.clone(),
            config,
            vec![TopicConfig::new("ticks", "PriceTick@2.0")],
            vec![],
        );

        let mut msg = tick(1.0);
        assert_eq!(pipeline.process(&mut msg).await.unwrap(), ProcessOutcome::Filtered);
        assert!(transport.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_full_queue_dead_letters() {
        let transport = Arc::new(MemoryTransport::new());
        let (pipeline, _rx) = pipeline(
            transport.clone(),
            ProcessorConfig::default(),
            vec![TopicConfig::new("ticks", "PriceTick@1.0").with_queue_capacity(1)],
            vec![],
        );

        pipeline.enqueue(tick(1.0)).await.unwrap();
        let err = pipeline.enqueue(tick(1.0)).await.unwrap_err();
        assert_eq!(err.kind(), "queue_full");

        let dead = transport.published_to("ticks.dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, MessageStatus::DeadLetter);
        assert_eq!(dead[0].payload[FAILURE_INFO_KEY]["reason"], "queue_full");
        assert_eq!(dead[0].payload[FAILURE_INFO_KEY]["original_topic"], "ticks");
        assert_eq!(pipeline.queue_depth("ticks"), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_oversized_and_unknown() {
        let transport = Arc::new(MemoryTransport::new());
        let config = ProcessorConfig {
            dead_letter_enabled: false,
            ..Default::default()
        };
        let (pipeline, _rx) = pipeline(
            transport.clone(),
            config,
            vec![TopicConfig::new("ticks", "PriceTick@1.0").with_max_message_size(16)],
            vec![],
        );

        let err = pipeline.enqueue(tick(1.0)).await.unwrap_err();
        assert!(matches!(err, GatewayError::MessageTooLarge { .. }));
        assert!(transport.published().await.is_empty());
        assert_eq!(pipeline.topic_stats("ticks").unwrap().snapshot().dropped, 1);

        let mut other = tick(1.0);
        other.topic = "nope".into();
        assert!(matches!(
            pipeline.enqueue(other).await,
            Err(GatewayError::UnknownTopic(_))
        ));
    }
}
