//! # Event Bus Core
//!
//! Core types and strategy traits shared by the event gateway and the flow
//! monitor:
//! - the `EventMessage` envelope and its JSON wire format
//! - the topic registry, filter rule sets and routing rules
//! - flow definitions for end-to-end tracing
//! - layered configuration, errors and metrics
//! - the `Transport` strategy and an in-process implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐     ┌─────────────┐     ┌──────────────┐
//! │ Producer │────►│  Transport  │────►│   Gateway    │──┐
//! └──────────┘     │  Strategy   │◄────│ filter/route │  │
//!                  └──────┬──────┘     └──────────────┘  │
//!                         │                  ▲  dead     │
//!                         ▼                  └──letter───┘
//!                  ┌──────────────┐
//!                  │ Flow Monitor │──► alerts
//!                  └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod flow;
pub mod message;
pub mod metrics;
pub mod routing;
pub mod strategy;
pub mod topic;
pub mod transport;

pub use config::*;
pub use error::*;
pub use filter::*;
pub use flow::*;
pub use message::*;
pub use routing::*;
pub use strategy::*;
pub use topic::*;
pub use transport::MemoryTransport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::error::{GatewayError, Result};
    pub use crate::filter::{FilterEngine, FilterResult, FilterRule, Operator};
    pub use crate::flow::{FlowConfig, FlowStageConfig};
    pub use crate::message::{EventMessage, MessageStatus, Payload};
    pub use crate::routing::{Condition, RoutingRule, TransformKind};
    pub use crate::strategy::{HealthCheck, Lifecycle, Transport};
    pub use crate::topic::{TopicConfig, TopicRegistry};
    pub use crate::transport::MemoryTransport;
}
