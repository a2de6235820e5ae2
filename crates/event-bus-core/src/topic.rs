//! Topic registry
//!
//! Static topic configuration: schema, producers/consumers, retention and
//! limits. Read-only after startup.

use crate::error::{GatewayError, Result};
use crate::routing::RoutingRule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Configuration of a single topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic name (unique)
    pub name: String,

    /// Declared schema, `event_type@schema_version`
    pub schema_id: String,

    #[serde(default)]
    pub producers: BTreeSet<String>,

    #[serde(default)]
    pub consumers: BTreeSet<String>,

    /// Retention window advertised to the transport
    #[serde(with = "humantime_serde", default = "default_retention")]
    pub retention: Duration,

    /// Maximum encoded message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Bounded queue capacity for this topic's processor
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Filter rule sets applied to every message on this topic
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_queue_capacity() -> usize {
    10_000
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, schema_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_id: schema_id.into(),
            producers: BTreeSet::new(),
            consumers: BTreeSet::new(),
            retention: default_retention(),
            max_message_size: default_max_message_size(),
            queue_capacity: default_queue_capacity(),
            filters: Vec::new(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.filters = filters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_producer(mut self, service: impl Into<String>) -> Self {
        self.producers.insert(service.into());
        self
    }

    pub fn with_consumer(mut self, service: impl Into<String>) -> Self {
        self.consumers.insert(service.into());
        self
    }
}

/// Lookup table of configured topics
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    topics: HashMap<String, TopicConfig>,
    dlq_suffix: String,
}

impl TopicRegistry {
    /// Build the registry; duplicate names are rejected
    pub fn new(topics: Vec<TopicConfig>, dlq_suffix: impl Into<String>) -> Result<Self> {
        let dlq_suffix = dlq_suffix.into();
        if dlq_suffix.is_empty() {
            return Err(GatewayError::config("dead-letter suffix must not be empty"));
        }

        let mut map = HashMap::with_capacity(topics.len());
        for topic in topics {
            if topic.queue_capacity == 0 {
                return Err(GatewayError::config(format!(
                    "topic '{}' has zero queue capacity",
                    topic.name
                )));
            }
            if topic.name.ends_with(&dlq_suffix) {
                return Err(GatewayError::config(format!(
                    "topic '{}' collides with the dead-letter suffix '{}'",
                    topic.name, dlq_suffix
                )));
            }
            let name = topic.name.clone();
            if map.insert(name.clone(), topic).is_some() {
                return Err(GatewayError::config(format!("duplicate topic '{}'", name)));
            }
        }

        Ok(Self {
            topics: map,
            dlq_suffix,
        })
    }

    /// Check that every routing target resolves to a configured topic
    pub fn validate(&self, rules: &[RoutingRule]) -> Result<()> {
        for rule in rules {
            if rule.targets.is_empty() {
                return Err(GatewayError::config(format!(
                    "routing rule '{}' for {} has no targets",
                    rule.name, rule.schema_id
                )));
            }
            for target in &rule.targets {
                if !self.topics.contains_key(target) {
                    return Err(GatewayError::config(format!(
                        "routing rule '{}' targets unknown topic '{}'",
                        rule.name, target
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    /// First topic (by name) declaring the schema id
    pub fn resolve_by_schema(&self, schema_id: &str) -> Option<&TopicConfig> {
        let mut candidates: Vec<&TopicConfig> = self
            .topics
            .values()
            .filter(|t| t.schema_id == schema_id)
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        candidates.into_iter().next()
    }

    /// Dead-letter topic for `topic`
    pub fn dlq_topic(&self, topic: &str) -> String {
        format!("{}{}", topic, self.dlq_suffix)
    }

    pub fn dlq_suffix(&self) -> &str {
        &self.dlq_suffix
    }

    /// Topic names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicConfig> {
        self.topics.values()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
