//! Dead-lettered message history

use chrono::{DateTime, Utc};
use event_bus_core::prelude::*;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::debug;

/// A dead-lettered message and why it was rejected
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub message: EventMessage,
    pub reason: String,
    pub dead_letter_topic: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded in-memory store of dead-lettered messages; oldest evicted first
pub struct DeadLetterStore {
    max_size: usize,
    entries: RwLock<VecDeque<DeadLetterEntry>>,
}

impl DeadLetterStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn add(&self, entry: DeadLetterEntry) {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_size {
            debug!(max_size = self.max_size, "Dead-letter history full, evicting oldest");
            entries.pop_front();
        }

        entries.push_back(entry);
    }

    /// Most recent entries first
    pub async fn recent(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn drain(&self) -> Vec<DeadLetterEntry> {
        self.entries.write().await.drain(..).collect()
    }
}
