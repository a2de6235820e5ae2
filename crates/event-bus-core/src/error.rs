//! Error types for the event bus
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Primary error type for all gateway and monitor operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Pub/sub transport connection, publish or subscribe errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Message schema does not match the topic's declared schema
    #[error("Schema mismatch on {topic}: expected {expected}, got {actual}")]
    SchemaMismatch {
        topic: String,
        expected: String,
        actual: String,
    },

    /// Topic is not registered
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Routing or transform evaluation errors
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// Illegal message status transition
    #[error("Invalid status transition for {message_id}: {from} -> {to}")]
    InvalidTransition {
        message_id: String,
        from: String,
        to: String,
    },

    /// Message exceeds the topic size limit
    #[error("Message of {size} bytes exceeds limit of {limit} bytes on {topic}")]
    MessageTooLarge {
        topic: String,
        size: usize,
        limit: usize,
    },

    /// Bounded queue is full
    #[error("Backpressure: {message}")]
    Backpressure { message: String },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Retry limit exceeded
    #[error("Retry exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    /// Graceful shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error with source
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a routing error
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Backpressure { .. } | Self::Timeout { .. }
        )
    }

    /// Short machine-readable label used for metrics and failure info
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::UnknownTopic(_) => "unknown_topic",
            Self::Routing { .. } => "routing",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::Backpressure { .. } => "queue_full",
            Self::Timeout { .. } => "timeout",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub topic: Option<String>,
    pub message_id: Option<String>,
    pub trace_id: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            topic: None,
            message_id: None,
            trace_id: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref topic) = self.topic {
            write!(f, " topic={}", topic)?;
        }
        if let Some(ref id) = self.message_id {
            write!(f, " msg={}", id)?;
        }
        if let Some(ref trace) = self.trace_id {
            write!(f, " trace={}", trace)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                topic = ?ctx.topic,
                message_id = ?ctx.message_id,
                trace_id = ?ctx.trace_id,
                "Operation failed"
            );
            e
        })
    }
}
