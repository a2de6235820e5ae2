//! Configuration types for the event bus
//!
//! Uses the `config` crate for layered configuration from files and environment.

use crate::error::{GatewayError, Result};
use crate::filter::{FilterEngine, FilterRule};
use crate::flow::FlowConfig;
use crate::routing::RoutingRule;
use crate::topic::{TopicConfig, TopicRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration shared by the gateway and the flow monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Pub/sub transport connection
    #[serde(default)]
    pub transport: TransportConfig,

    /// Per-topic processor settings
    #[serde(default)]
    pub gateway: ProcessorConfig,

    /// Topic registry
    #[serde(default)]
    pub topics: Vec<TopicConfig>,

    /// Named filter rule sets
    #[serde(default)]
    pub filters: HashMap<String, Vec<FilterRule>>,

    /// Routing rules, in declaration order
    #[serde(default)]
    pub routing: Vec<RoutingRule>,

    /// Flow tracing
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Transport connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Server URL
    #[serde(default = "default_transport_url")]
    pub url: String,

    /// Number of pooled client connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection name (for monitoring)
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Connect attempts keep retrying for this long before startup fails
    #[serde(with = "humantime_serde", default = "default_connect_grace")]
    pub connect_grace_period: Duration,

    /// Publish attempts before a transport error surfaces
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,

    /// Backoff between publish attempts
    #[serde(with = "humantime_serde", default = "default_publish_backoff")]
    pub publish_backoff: Duration,
}

fn default_transport_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_connection_name() -> String {
    "event-bus".to_string()
}

fn default_connect_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_publish_backoff() -> Duration {
    Duration::from_millis(100)
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_transport_url(),
            pool_size: default_pool_size(),
            connection_name: default_connection_name(),
            connect_grace_period: default_connect_grace(),
            publish_attempts: default_publish_attempts(),
            publish_backoff: default_publish_backoff(),
        }
    }
}

// ============================================================================
// Processor Configuration
// ============================================================================

/// Gateway processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Messages drained per worker iteration (after the first)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a worker waits for the first message of a batch
    #[serde(with = "humantime_serde", default = "default_processing_interval")]
    pub processing_interval: Duration,

    /// Retries before a message is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before a failed message is re-enqueued
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    #[serde(default = "default_true")]
    pub dead_letter_enabled: bool,

    /// Appended to a topic name to form its dead-letter topic
    #[serde(default = "default_dlq_suffix")]
    pub dlq_suffix: String,

    /// Filter (instead of warn about) messages whose schema id differs from the topic's
    #[serde(default)]
    pub strict_schema: bool,

    /// Dead-lettered messages kept in memory for inspection
    #[serde(default = "default_dead_letter_history")]
    pub dead_letter_history: usize,

    /// Upper bound on waiting for workers during shutdown
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_batch_size() -> usize {
    100
}

fn default_processing_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_dlq_suffix() -> String {
    ".dlq".to_string()
}

fn default_dead_letter_history() -> usize {
    1000
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            processing_interval: default_processing_interval(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            dead_letter_enabled: true,
            dlq_suffix: default_dlq_suffix(),
            strict_schema: false,
            dead_letter_history: default_dead_letter_history(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

// ============================================================================
// Monitor Configuration
// ============================================================================

/// Flow monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Window p95 above this raises a warning alert
    #[serde(default = "default_latency_warning_ms")]
    pub latency_warning_ms: f64,

    /// Window p95 above this raises a critical alert
    #[serde(default = "default_latency_critical_ms")]
    pub latency_critical_ms: f64,

    /// Trailing window summarized by each analysis run
    #[serde(with = "humantime_serde", default = "default_analysis_window")]
    pub analysis_window: Duration,

    /// Period of the analysis task
    #[serde(with = "humantime_serde", default = "default_analysis_interval")]
    pub analysis_interval: Duration,

    /// Active traces older than this are finalized as timed out
    #[serde(with = "humantime_serde", default = "default_max_trace_duration")]
    pub max_trace_duration: Duration,

    /// Finalized traces kept in memory
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Relative slowdown over expected latency that counts as degradation
    #[serde(default = "default_degradation_threshold")]
    pub degradation_threshold: f64,

    /// Topic alerts are published to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerts_topic: Option<String>,

    #[serde(default)]
    pub flows: Vec<FlowConfig>,
}

fn default_latency_warning_ms() -> f64 {
    100.0
}

fn default_latency_critical_ms() -> f64 {
    500.0
}

fn default_analysis_window() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_analysis_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_trace_duration() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_history_size() -> usize {
    10_000
}

fn default_degradation_threshold() -> f64 {
    0.2
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            latency_warning_ms: default_latency_warning_ms(),
            latency_critical_ms: default_latency_critical_ms(),
            analysis_window: default_analysis_window(),
            analysis_interval: default_analysis_interval(),
            max_trace_duration: default_max_trace_duration(),
            history_size: default_history_size(),
            degradation_threshold: default_degradation_threshold(),
            alerts_topic: None,
            flows: Vec::new(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl GatewayConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // EVENT_BUS__GATEWAY__MAX_RETRIES=5 etc.
        builder = builder.add_source(
            config::Environment::with_prefix("EVENT_BUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Build the topic registry and check routing targets against it
    pub fn topic_registry(&self) -> Result<TopicRegistry> {
        let registry = TopicRegistry::new(self.topics.clone(), self.gateway.dlq_suffix.clone())?;
        registry.validate(&self.routing)?;

        for topic in registry.iter() {
            for set in &topic.filters {
                if !self.filters.contains_key(set) {
                    tracing::warn!(
                        topic = %topic.name,
                        rule_set = %set,
                        "Topic references unknown filter rule set"
                    );
                }
            }
        }

        Ok(registry)
    }

    /// Compile the named filter rule sets
    pub fn filter_engine(&self) -> Result<FilterEngine> {
        FilterEngine::new(self.filters.clone())
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.gateway.batch_size == 0 {
            return Err(GatewayError::config("gateway.batch_size must be at least 1"));
        }
        if self.transport.pool_size == 0 {
            return Err(GatewayError::config("transport.pool_size must be at least 1"));
        }
        if self.monitor.history_size == 0 {
            return Err(GatewayError::config("monitor.history_size must be at least 1"));
        }
        let mut names = std::collections::HashSet::new();
        for flow in &self.monitor.flows {
            if !names.insert(flow.name.as_str()) {
                return Err(GatewayError::config(format!("duplicate flow '{}'", flow.name)));
            }
            if flow.stages.is_empty() {
                return Err(GatewayError::config(format!("flow '{}' has no stages", flow.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Condition;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.gateway.max_retries, 3);
        assert_eq!(config.gateway.dlq_suffix, ".dlq");
        assert!(config.gateway.dead_letter_enabled);
        assert_eq!(config.monitor.analysis_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = GatewayConfig::load(None).unwrap();
        assert_eq!(config.transport.pool_size, 4);
        assert_eq!(config.gateway.processing_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_deserialize_full_document() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "gateway": {"max_retries": 1, "retry_backoff": "50ms"},
            "topics": [
                {"name": "eafix.price.tick", "schema_id": "PriceTick@1.0", "filters": ["valid_prices"]},
                {"name": "eafix.price.tick.eurusd", "schema_id": "PriceTick@1.0"}
            ],
            "filters": {
                "valid_prices": [{"field": "bid", "operator": ">", "value": 0}]
            },
            "routing": [
                {"schema_id": "PriceTick@1.0", "condition": "symbol == 'EURUSD'",
                 "targets": ["eafix.price.tick.eurusd"], "transform": "add_timestamp"}
            ],
            "monitor": {"max_trace_duration": "30s", "flows": []}
        }))
        .unwrap();

        assert_eq!(config.gateway.retry_backoff, Duration::from_millis(50));
        assert_eq!(config.monitor.max_trace_duration, Duration::from_secs(30));
        assert!(matches!(config.routing[0].condition, Condition::Rule(_)));

        let registry = config.topic_registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(config.filter_engine().unwrap().contains("valid_prices"));
    }

    #[test]
    fn test_unknown_routing_target_fails_startup() {
        let mut config = GatewayConfig::default();
        config.topics.push(TopicConfig::new("a", "E@1.0"));
        config
            .routing
            .push(RoutingRule::new("E@1.0", Condition::Always, vec!["b".into()]));
        assert!(config.topic_registry().is_err());
    }
}
