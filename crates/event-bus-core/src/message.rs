//! Message types for the event bus
//!
//! Defines the canonical `EventMessage` envelope that flows through the
//! gateway, onto the transport, and into the flow monitor.

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Open key/value payload carried by every message
pub type Payload = Map<String, Value>;

/// Payload key holding dead-letter diagnostics
pub const FAILURE_INFO_KEY: &str = "_failure_info";

/// Processing status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    DeadLetter,
    Filtered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
            Self::Filtered => "filtered",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::DeadLetter | Self::Filtered)
    }

    /// Allowed forward transitions.
    ///
    /// `Pending -> DeadLetter` covers rejection at enqueue (queue full), and
    /// `Failed -> Pending` is the retry loop.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, DeadLetter)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Processing, Filtered)
                | (Failed, Pending)
                | (Failed, DeadLetter)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical event envelope.
///
/// This is the JSON wire format published on every topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique message identifier
    pub id: String,

    /// Topic the message is addressed to
    pub topic: String,

    pub event_type: String,

    pub schema_version: String,

    #[serde(default)]
    pub payload: Payload,

    /// Creation time (ISO-8601 on the wire)
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default = "default_status")]
    pub status: MessageStatus,
}

fn default_status() -> MessageStatus {
    MessageStatus::Pending
}

impl EventMessage {
    /// Create a new pending message stamped with the current time
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        schema_version: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            topic: topic.into(),
            event_type: event_type.into(),
            schema_version: schema_version.into(),
            payload,
            timestamp: Utc::now(),
            producer: None,
            trace_id: None,
            retry_count: 0,
            status: MessageStatus::Pending,
        }
    }

    /// Builder: set producer
    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    /// Builder: set trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Builder: set timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Schema identifier, `event_type@schema_version`
    pub fn schema_id(&self) -> String {
        schema_id(&self.event_type, &self.schema_version)
    }

    /// Derive a child message addressed to `topic`.
    ///
    /// The child gets a fresh id and a cloned payload, and inherits the
    /// producer and trace id. Retry state is reset.
    pub fn derive(&self, topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            topic: topic.into(),
            event_type: self.event_type.clone(),
            schema_version: self.schema_version.clone(),
            payload: self.payload.clone(),
            timestamp: Utc::now(),
            producer: self.producer.clone(),
            trace_id: self.trace_id.clone(),
            retry_count: 0,
            status: MessageStatus::Pending,
        }
    }

    /// Move to `next`, enforcing the status state machine
    pub fn advance(&mut self, next: MessageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(GatewayError::InvalidTransition {
                message_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Look up a field: payload first (dotted paths allowed), then envelope attributes
    pub fn field(&self, name: &str) -> Option<Value> {
        if let Some(value) = payload_path(&self.payload, name) {
            return Some(value.clone());
        }
        self.envelope_field(name)
    }

    /// Envelope attribute by name
    pub fn envelope_field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "topic" => Some(Value::String(self.topic.clone())),
            "event_type" => Some(Value::String(self.event_type.clone())),
            "schema_version" => Some(Value::String(self.schema_version.clone())),
            "timestamp" => Some(Value::String(self.timestamp.to_rfc3339())),
            "producer" => self.producer.clone().map(Value::String),
            "trace_id" => self.trace_id.clone().map(Value::String),
            "retry_count" => Some(Value::from(self.retry_count)),
            "status" => Some(Value::String(self.status.to_string())),
            _ => None,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| GatewayError::serialization("Failed to encode message", e))
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::serialization("Failed to decode message", e))
    }

    /// Encoded size in bytes
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Build a schema id from its parts
pub fn schema_id(event_type: &str, schema_version: &str) -> String {
    format!("{}@{}", event_type, schema_version)
}

/// Resolve a dotted path inside a payload map
pub fn payload_path<'a>(payload: &'a Payload, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = payload.get(parts.next()?)?;

    for part in parts {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let idx: usize = part.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }

    Some(current)
}
