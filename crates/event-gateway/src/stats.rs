//! Per-topic counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters for one topic
#[derive(Debug, Default)]
pub struct TopicStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub filtered: AtomicU64,
    pub routed: AtomicU64,
    pub not_routed: AtomicU64,
    pub published: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
}

impl TopicStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TopicCounters {
        TopicCounters {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            not_routed: self.not_routed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TopicStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicCounters {
    pub received: u64,
    pub processed: u64,
    pub filtered: u64,
    pub routed: u64,
    pub not_routed: u64,
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub errors: u64,
}

impl std::ops::AddAssign for TopicCounters {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.processed += other.processed;
        self.filtered += other.filtered;
        self.routed += other.routed;
        self.not_routed += other.not_routed;
        self.published += other.published;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.dropped += other.dropped;
        self.errors += other.errors;
    }
}

/// Topic configuration plus live counters
#[derive(Debug, Clone, Serialize)]
pub struct TopicMetrics {
    pub topic: String,
    pub schema_id: String,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    pub max_message_size: usize,
    pub queue_capacity: usize,
    pub queue_depth: usize,
    pub dead_letter_topic: String,
    pub counters: TopicCounters,
}

/// Totals across all topics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GatewayStats {
    pub topics: usize,
    pub queued: usize,
    pub totals: TopicCounters,
}
