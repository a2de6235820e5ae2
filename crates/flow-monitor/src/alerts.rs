//! Performance alerts and where they go

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Too few stages of a trace completed
    LowSuccessRate,
    /// Trace duration above the flow's critical latency
    CriticalLatency,
    /// Duration above expected latency by more than the degradation threshold
    PerformanceDegradation,
    /// A single stage above its critical latency
    StageCriticalLatency,
    /// Trace finalized by the timeout sweep
    TraceTimeout,
    /// Window p95 above the configured warning or critical latency
    WindowLatency,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowSuccessRate => "low_success_rate",
            Self::CriticalLatency => "critical_latency",
            Self::PerformanceDegradation => "performance_degradation",
            Self::StageCriticalLatency => "stage_critical_latency",
            Self::TraceTimeout => "trace_timeout",
            Self::WindowLatency => "window_latency",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub flow_name: String,
    /// Set for per-trace alerts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    pub message: String,
    /// Observed value
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        flow_name: impl Into<String>,
        value: f64,
        threshold: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity,
            flow_name: flow_name.into(),
            trace_id: None,
            stage_id: None,
            message: message.into(),
            value,
            threshold,
            raised_at: Utc::now(),
        }
    }

    pub fn for_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn for_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }
}

/// Destination for raised alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &Alert) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Logs alerts at a level matching their severity
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<()> {
        let trace_id = alert.trace_id.as_deref().unwrap_or("-");
        match alert.severity {
            Severity::Critical => error!(
                kind = %alert.kind,
                flow = %alert.flow_name,
                trace_id,
                value = alert.value,
                threshold = alert.threshold,
                "{}", alert.message
            ),
            Severity::Warning => warn!(
                kind = %alert.kind,
                flow = %alert.flow_name,
                trace_id,
                value = alert.value,
                threshold = alert.threshold,
                "{}", alert.message
            ),
            Severity::Info => info!(
                kind = %alert.kind,
                flow = %alert.flow_name,
                trace_id,
                "{}", alert.message
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Keeps alerts in memory for inspection
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    pub async fn of_kind(&self, kind: AlertKind) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Event type of alerts published on the bus
pub const ALERT_EVENT_TYPE: &str = "FlowAlert";

/// Publishes alerts as `FlowAlert` envelopes on a topic.
///
/// Envelopes are marked processed so a gateway on the same topic passes
/// them over.
pub struct TransportAlertSink {
    transport: Arc<dyn Transport>,
    topic: String,
}

impl TransportAlertSink {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl AlertSink for TransportAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<()> {
        let value = serde_json::to_value(alert)
            .map_err(|e| GatewayError::serialization("Failed to serialize alert", e))?;
        let payload = match value {
            serde_json::Value::Object(map) => map,
            _ => return Err(GatewayError::Internal("alert did not serialize to an object".into())),
        };

        let mut message = EventMessage::new(self.topic.clone(), ALERT_EVENT_TYPE, "1.0", payload)
            .with_producer("flow-monitor");
        if let Some(trace_id) = &alert.trace_id {
            message = message.with_trace_id(trace_id.clone());
        }
        message.advance(MessageStatus::Processing)?;
        message.advance(MessageStatus::Processed)?;

        self.transport.publish_message(&message).await
    }

    fn name(&self) -> &'static str {
        "transport"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_sink_publishes_processed_envelope() {
        let transport = Arc::new(MemoryTransport::new());
        let sink = TransportAlertSink::new(transport.clone(), "eafix.alerts");

        let alert = Alert::new(
            AlertKind::CriticalLatency,
            Severity::Critical,
            "order-flow",
            900.0,
            500.0,
            "too slow",
        )
        .for_trace("tr-1");
        sink.emit(&alert).await.unwrap();

        let published = transport.published_to("eafix.alerts").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, ALERT_EVENT_TYPE);
        assert_eq!(published[0].status, MessageStatus::Processed);
        assert_eq!(published[0].trace_id.as_deref(), Some("tr-1"));
        assert_eq!(published[0].payload["kind"], "critical_latency");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
