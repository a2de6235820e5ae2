//! Metrics for the event bus
//!
//! Emitted through the `metrics` facade; without an installed recorder
//! every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Gateway metrics
    pub const GATEWAY_MESSAGES_RECEIVED: &str = "event_gateway_messages_received_total";
    pub const GATEWAY_MESSAGES_PROCESSED: &str = "event_gateway_messages_processed_total";
    pub const GATEWAY_MESSAGES_FILTERED: &str = "event_gateway_messages_filtered_total";
    pub const GATEWAY_MESSAGES_ROUTED: &str = "event_gateway_messages_routed_total";
    pub const GATEWAY_MESSAGES_RETRIED: &str = "event_gateway_messages_retried_total";
    pub const GATEWAY_MESSAGES_DEAD_LETTERED: &str = "event_gateway_messages_dead_lettered_total";
    pub const GATEWAY_MESSAGES_DROPPED: &str = "event_gateway_messages_dropped_total";
    pub const GATEWAY_PROCESSING_LATENCY: &str = "event_gateway_processing_latency_seconds";
    pub const GATEWAY_QUEUE_DEPTH: &str = "event_gateway_queue_depth";

    // Flow metrics
    pub const FLOW_TRACES_STARTED: &str = "flow_monitor_traces_started_total";
    pub const FLOW_TRACES_FINISHED: &str = "flow_monitor_traces_finished_total";
    pub const FLOW_TRACE_DURATION: &str = "flow_monitor_trace_duration_seconds";
    pub const FLOW_STAGE_DURATION: &str = "flow_monitor_stage_duration_seconds";
    pub const FLOW_ACTIVE_TRACES: &str = "flow_monitor_active_traces";
    pub const FLOW_ALERTS: &str = "flow_monitor_alerts_total";

    // Transport metrics
    pub const TRANSPORT_PUBLISHED: &str = "event_bus_transport_published_total";
    pub const TRANSPORT_PUBLISH_ERRORS: &str = "event_bus_transport_publish_errors_total";
    pub const TRANSPORT_PUBLISH_LATENCY: &str = "event_bus_transport_publish_latency_seconds";
    pub const CONNECTION_STATE: &str = "connection_state";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const TOPIC: &str = "topic";
    pub const RULE_SET: &str = "rule_set";
    pub const REASON: &str = "reason";
    pub const FLOW: &str = "flow";
    pub const STAGE: &str = "stage";
    pub const STATUS: &str = "status";
    pub const ALERT: &str = "alert";
    pub const SEVERITY: &str = "severity";
    pub const CONNECTION: &str = "connection";
}

/// Gateway processor metrics
#[derive(Clone)]
pub struct GatewayMetrics {
    component: String,
}

impl GatewayMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_received(&self, topic: &str) {
        counter!(
            names::GATEWAY_MESSAGES_RECEIVED,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => topic.to_string(),
        )
        .increment(1);
    }

    pub fn record_processed(&self, topic: &str) {
        counter!(
            names::GATEWAY_MESSAGES_PROCESSED,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => topic.to_string(),
        )
        .increment(1);
    }

    /// Record a message rejected by a filter rule set (or a schema mismatch)
    pub fn record_filtered(&self, topic: &str, rule_set: &str) {
        counter!(
            names::GATEWAY_MESSAGES_FILTERED,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => topic.to_string(),
            labels::RULE_SET => rule_set.to_string(),
        )
        .increment(1);
    }

    /// Record derived messages delivered to a target topic
    pub fn record_routed(&self, target: &str, count: u64) {
        counter!(
            names::GATEWAY_MESSAGES_ROUTED,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => target.to_string(),
        )
        .increment(count);
    }

    pub fn record_retry(&self, topic: &str) {
        counter!(
            names::GATEWAY_MESSAGES_RETRIED,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => topic.to_string(),
        )
        .increment(1);
    }

    pub fn record_dead_letter(&self, topic: &str, reason: &str) {
        counter!(
            names::GATEWAY_MESSAGES_DEAD_LETTERED,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => topic.to_string(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    pub fn record_dropped(&self, topic: &str, reason: &str) {
        counter!(
            names::GATEWAY_MESSAGES_DROPPED,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => topic.to_string(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    pub fn record_processing_latency(&self, duration: Duration) {
        histogram!(
            names::GATEWAY_PROCESSING_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn set_queue_depth(&self, topic: &str, depth: usize) {
        gauge!(
            names::GATEWAY_QUEUE_DEPTH,
            labels::COMPONENT => self.component.clone(),
            labels::TOPIC => topic.to_string(),
        )
        .set(depth as f64);
    }
}

/// Flow tracing metrics
#[derive(Clone)]
pub struct FlowMetrics {
    component: String,
}

impl FlowMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_trace_started(&self, flow: &str) {
        counter!(
            names::FLOW_TRACES_STARTED,
            labels::COMPONENT => self.component.clone(),
            labels::FLOW => flow.to_string(),
        )
        .increment(1);
    }

    /// Record a trace reaching a terminal status
    pub fn record_trace_finished(&self, flow: &str, status: &str, duration_ms: Option<f64>) {
        counter!(
            names::FLOW_TRACES_FINISHED,
            labels::COMPONENT => self.component.clone(),
            labels::FLOW => flow.to_string(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);

        if let Some(ms) = duration_ms {
            histogram!(
                names::FLOW_TRACE_DURATION,
                labels::COMPONENT => self.component.clone(),
                labels::FLOW => flow.to_string(),
            )
            .record(ms / 1000.0);
        }
    }

    pub fn record_stage_duration(&self, flow: &str, stage: &str, duration_ms: f64) {
        histogram!(
            names::FLOW_STAGE_DURATION,
            labels::COMPONENT => self.component.clone(),
            labels::FLOW => flow.to_string(),
            labels::STAGE => stage.to_string(),
        )
        .record(duration_ms / 1000.0);
    }

    pub fn set_active_traces(&self, count: usize) {
        gauge!(
            names::FLOW_ACTIVE_TRACES,
            labels::COMPONENT => self.component.clone(),
        )
        .set(count as f64);
    }

    pub fn record_alert(&self, alert: &str, severity: &str) {
        counter!(
            names::FLOW_ALERTS,
            labels::COMPONENT => self.component.clone(),
            labels::ALERT => alert.to_string(),
            labels::SEVERITY => severity.to_string(),
        )
        .increment(1);
    }
}

/// Transport metrics
#[derive(Clone)]
pub struct TransportMetrics {
    connection_name: String,
}

impl TransportMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            connection_name: name.into(),
        }
    }

    pub fn record_published(&self, topic: &str) {
        counter!(
            names::TRANSPORT_PUBLISHED,
            labels::CONNECTION => self.connection_name.clone(),
            labels::TOPIC => topic.to_string(),
        )
        .increment(1);
    }

    pub fn record_publish_error(&self, topic: &str) {
        counter!(
            names::TRANSPORT_PUBLISH_ERRORS,
            labels::CONNECTION => self.connection_name.clone(),
            labels::TOPIC => topic.to_string(),
        )
        .increment(1);
    }

    pub fn record_publish_latency(&self, duration: Duration) {
        histogram!(
            names::TRANSPORT_PUBLISH_LATENCY,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Set connection state (1 = connected, 0 = disconnected)
    pub fn set_connected(&self, connected: bool) {
        gauge!(
            names::CONNECTION_STATE,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .set(if connected { 1.0 } else { 0.0 });
    }
}

/// Timer guard that reports elapsed time when stopped or dropped
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
