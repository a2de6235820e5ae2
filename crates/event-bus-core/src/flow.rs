//! Flow definitions for end-to-end tracing

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Payload keys scanned, in priority order, to correlate events into traces
pub const CORRELATION_KEYS: [&str; 5] = [
    "trace_id",
    "correlation_id",
    "signal_id",
    "order_id",
    "execution_id",
];

/// One stage of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStageConfig {
    /// Stage identifier, unique within the flow
    pub stage_id: String,

    /// Service owning the stage
    pub service: String,

    /// Event type that completes the stage
    pub event_type: String,

    /// Event types that fail the stage (e.g. `OrderRejected`)
    #[serde(default)]
    pub failure_event_types: Vec<String>,

    /// Topic the stage event is observed on. `None` matches any monitored topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    #[serde(default = "default_stage_expected_ms")]
    pub expected_latency_ms: f64,

    #[serde(default = "default_stage_critical_ms")]
    pub critical_latency_ms: f64,
}

fn default_stage_expected_ms() -> f64 {
    50.0
}

fn default_stage_critical_ms() -> f64 {
    200.0
}

impl FlowStageConfig {
    pub fn new(
        stage_id: impl Into<String>,
        service: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            service: service.into(),
            event_type: event_type.into(),
            failure_event_types: Vec::new(),
            topic: None,
            expected_latency_ms: default_stage_expected_ms(),
            critical_latency_ms: default_stage_critical_ms(),
        }
    }

    pub fn on_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_failure_event(mut self, event_type: impl Into<String>) -> Self {
        self.failure_event_types.push(event_type.into());
        self
    }

    pub fn with_latency(mut self, expected_ms: f64, critical_ms: f64) -> Self {
        self.expected_latency_ms = expected_ms;
        self.critical_latency_ms = critical_ms;
        self
    }

    /// Whether an event of `event_type` observed on `topic` belongs to this stage
    pub fn matches(&self, event_type: &str, topic: &str) -> bool {
        let topic_ok = self.topic.as_deref().map_or(true, |t| t == topic);
        topic_ok && (self.event_type == event_type || self.is_failure(event_type))
    }

    pub fn is_failure(&self, event_type: &str) -> bool {
        self.failure_event_types.iter().any(|e| e == event_type)
    }
}

/// A named, ordered sequence of stages spanning services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub stages: Vec<FlowStageConfig>,

    #[serde(default = "default_flow_expected_ms")]
    pub expected_latency_ms: f64,

    #[serde(default = "default_flow_critical_ms")]
    pub critical_latency_ms: f64,

    /// Minimum fraction of completed stages (per trace) or completed traces (per window)
    #[serde(default = "default_success_rate")]
    pub success_rate_threshold: f64,
}

fn default_true() -> bool {
    true
}

fn default_flow_expected_ms() -> f64 {
    100.0
}

fn default_flow_critical_ms() -> f64 {
    500.0
}

fn default_success_rate() -> f64 {
    0.95
}

impl FlowConfig {
    pub fn new(name: impl Into<String>, stages: Vec<FlowStageConfig>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            stages,
            expected_latency_ms: default_flow_expected_ms(),
            critical_latency_ms: default_flow_critical_ms(),
            success_rate_threshold: default_success_rate(),
        }
    }

    pub fn with_latency(mut self, expected_ms: f64, critical_ms: f64) -> Self {
        self.expected_latency_ms = expected_ms;
        self.critical_latency_ms = critical_ms;
        self
    }

    pub fn with_success_rate_threshold(mut self, threshold: f64) -> Self {
        self.success_rate_threshold = threshold;
        self
    }

    /// Index of the stage matching the event, if any
    pub fn stage_index(&self, event_type: &str, topic: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.matches(event_type, topic))
    }

    /// Topics that must be subscribed to observe this flow
    pub fn topics(&self) -> BTreeSet<String> {
        self.stages.iter().filter_map(|s| s.topic.clone()).collect()
    }
}
