//! Flow trace model
//!
//! A [`FlowTrace`] follows one business transaction across the stages of a
//! configured flow. Stage timing uses a hand-off model: the event that
//! starts stage *n* also completes every earlier stage still in progress,
//! and the final stage completes as soon as its event is seen.

use chrono::{DateTime, Utc};
use event_bus_core::{EventMessage, FlowConfig, Payload};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Active,
    Completed,
    Failed,
    Timeout,
    /// Timed out after at least one stage completed
    Partial,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing of one stage within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStageTrace {
    pub stage_id: String,
    pub service: String,
    pub event_type: String,
    pub status: StageStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub expected_latency_ms: f64,
    pub critical_latency_ms: f64,
}

impl FlowStageTrace {
    fn begin(&mut self, at: DateTime<Utc>) {
        self.status = StageStatus::Processing;
        self.start_time = Some(at);
    }

    fn finish(&mut self, status: StageStatus, at: DateTime<Utc>) {
        let start = *self.start_time.get_or_insert(at);
        self.status = status;
        self.end_time = Some(at);
        self.duration_ms = Some(millis_between(start, at));
    }
}

/// What an event did to a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageChange {
    Started,
    Completed,
    Failed,
    /// Stage was already terminal; nothing changed
    Ignored,
}

/// One end-to-end trace of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTrace {
    pub trace_id: String,
    pub flow_name: String,
    pub status: TraceStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<f64>,
    pub stages: Vec<FlowStageTrace>,
    /// Payload of the event that created the trace
    pub trigger_event: Payload,
    /// Correlation `(key, value)` pairs indexed for this trace
    pub correlation: Vec<(String, String)>,
    pub expected_latency_ms: f64,
    pub critical_latency_ms: f64,
    pub success_rate_threshold: f64,
    #[serde(skip)]
    seen: HashSet<String>,
}

impl FlowTrace {
    /// Create a trace with every stage pending, then apply the triggering event
    pub fn start(trace_id: impl Into<String>, flow: &FlowConfig, stage: usize, trigger: &EventMessage) -> Self {
        let stages = flow
            .stages
            .iter()
            .map(|s| FlowStageTrace {
                stage_id: s.stage_id.clone(),
                service: s.service.clone(),
                event_type: s.event_type.clone(),
                status: StageStatus::Pending,
                start_time: None,
                end_time: None,
                duration_ms: None,
                expected_latency_ms: s.expected_latency_ms,
                critical_latency_ms: s.critical_latency_ms,
            })
            .collect();

        let mut trace = Self {
            trace_id: trace_id.into(),
            flow_name: flow.name.clone(),
            status: TraceStatus::Active,
            start_time: trigger.timestamp,
            end_time: None,
            total_duration_ms: None,
            stages,
            trigger_event: trigger.payload.clone(),
            correlation: Vec::new(),
            expected_latency_ms: flow.expected_latency_ms,
            critical_latency_ms: flow.critical_latency_ms,
            success_rate_threshold: flow.success_rate_threshold,
            seen: HashSet::new(),
        };

        let failure = flow.stages[stage].is_failure(&trigger.event_type);
        trace.seen.insert(trigger.id.clone());
        trace.advance(stage, failure, trigger.timestamp);
        trace
    }

    /// Apply an event for `stage`. Duplicate message ids are ignored.
    pub fn record(&mut self, stage: usize, failure: bool, message: &EventMessage) -> StageChange {
        if self.status.is_terminal() || !self.seen.insert(message.id.clone()) {
            return StageChange::Ignored;
        }
        self.advance(stage, failure, message.timestamp)
    }

    fn advance(&mut self, stage: usize, failure: bool, at: DateTime<Utc>) -> StageChange {
        let Some(current) = self.stages.get(stage).map(|s| s.status) else {
            return StageChange::Ignored;
        };
        if current.is_terminal() {
            return StageChange::Ignored;
        }

        let change = if failure {
            self.hand_off(stage, at);
            self.stages[stage].finish(StageStatus::Failed, at);
            StageChange::Failed
        } else if current == StageStatus::Processing || stage + 1 == self.stages.len() {
            if current == StageStatus::Pending {
                self.stages[stage].begin(at);
            }
            self.hand_off(stage, at);
            self.stages[stage].finish(StageStatus::Completed, at);
            StageChange::Completed
        } else {
            self.stages[stage].begin(at);
            self.hand_off(stage, at);
            StageChange::Started
        };

        self.update_status(at);
        change
    }

    /// Earlier stages still in progress finish when a later stage reports
    fn hand_off(&mut self, stage: usize, at: DateTime<Utc>) {
        for earlier in &mut self.stages[..stage] {
            if earlier.status == StageStatus::Processing {
                earlier.finish(StageStatus::Completed, at);
            }
        }
    }

    fn update_status(&mut self, at: DateTime<Utc>) {
        if self.stages.iter().all(|s| s.status == StageStatus::Completed) {
            self.finalize(TraceStatus::Completed, at);
        } else if self
            .stages
            .iter()
            .all(|s| matches!(s.status, StageStatus::Completed | StageStatus::Failed))
        {
            self.finalize(TraceStatus::Failed, at);
        }
    }

    fn finalize(&mut self, status: TraceStatus, at: DateTime<Utc>) {
        let end = self
            .stages
            .iter()
            .filter_map(|s| s.end_time)
            .max()
            .unwrap_or(at);
        self.status = status;
        self.end_time = Some(end);
        self.total_duration_ms = Some(millis_between(self.start_time, end));
    }

    /// Finalize as timed out if older than `max_duration` at `now`
    pub fn expire(&mut self, now: DateTime<Utc>, max_duration: chrono::Duration) -> bool {
        if self.status.is_terminal() || now - self.start_time <= max_duration {
            return false;
        }

        let any_completed = self.completed_stages() > 0;
        for stage in &mut self.stages {
            if !stage.status.is_terminal() {
                stage.status = StageStatus::Timeout;
            }
        }

        self.status = if any_completed {
            TraceStatus::Partial
        } else {
            TraceStatus::Timeout
        };
        self.end_time = Some(now);
        self.total_duration_ms = Some(millis_between(self.start_time, now));
        true
    }

    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count()
    }

    /// Fraction of stages completed
    pub fn success_rate(&self) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        self.completed_stages() as f64 / self.stages.len() as f64
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&FlowStageTrace> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }
}

pub(crate) fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start)
        .num_microseconds()
        .map(|us| us as f64 / 1000.0)
        .unwrap_or_else(|| (end - start).num_milliseconds() as f64)
        .max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use event_bus_core::FlowStageConfig;

    fn flow() -> FlowConfig {
        FlowConfig::new(
            "order-flow",
            vec![
                FlowStageConfig::new("signal", "signal-generator", "SignalGenerated"),
                FlowStageConfig::new("order", "risk-manager", "OrderCreated")
                    .with_failure_event("OrderRejected"),
                FlowStageConfig::new("execution", "execution-engine", "ExecutionReport"),
            ],
        )
    }

    fn event(event_type: &str, at: DateTime<Utc>) -> EventMessage {
        EventMessage::new("t", event_type, "1.0", Payload::new()).with_timestamp(at)
    }

    #[test]
    fn test_stages_complete_in_order() {
        let t0 = Utc::now();
        let mut trace = FlowTrace::start("tr", &flow(), 0, &event("SignalGenerated", t0));
        assert_eq!(trace.stages[0].status, StageStatus::Processing);

        let t1 = t0 + Duration::milliseconds(20);
        assert_eq!(trace.record(1, false, &event("OrderCreated", t1)), StageChange::Started);
        assert_eq!(trace.stages[0].status, StageStatus::Completed);
        assert_eq!(trace.stages[0].duration_ms, Some(20.0));

        let t2 = t0 + Duration::milliseconds(50);
        assert_eq!(trace.record(2, false, &event("ExecutionReport", t2)), StageChange::Completed);

        assert_eq!(trace.status, TraceStatus::Completed);
        assert!(trace.stages.iter().all(|s| s.status == StageStatus::Completed));
        assert_eq!(trace.total_duration_ms, Some(50.0));
        assert_eq!(trace.end_time, Some(t2));
        assert_eq!(trace.success_rate(), 1.0);
    }

    #[test]
    fn test_failure_event_fails_trace() {
        let t0 = Utc::now();
        let mut trace = FlowTrace::start("tr", &flow(), 0, &event("SignalGenerated", t0));
        trace.record(1, true, &event("OrderRejected", t0 + Duration::milliseconds(5)));
        assert_eq!(trace.stages[0].status, StageStatus::Completed);
        assert_eq!(trace.stages[1].status, StageStatus::Failed);
        assert_eq!(trace.status, TraceStatus::Active);

        trace.record(2, false, &event("ExecutionReport", t0 + Duration::milliseconds(9)));
        assert_eq!(trace.status, TraceStatus::Failed);
    }

    #[test]
    fn test_duplicates_ignored() {
        let t0 = Utc::now();
        let first = event("SignalGenerated", t0);
        let mut trace = FlowTrace::start("tr", &flow(), 0, &first);
        assert_eq!(trace.record(0, false, &first), StageChange::Ignored);
        assert_eq!(trace.stages[0].status, StageStatus::Processing);
    }

    #[test]
    fn test_expiry_partial_and_timeout() {
        let t0 = Utc::now();
        let max = Duration::seconds(30);

        let mut lonely = FlowTrace::start("a", &flow(), 0, &event("SignalGenerated", t0));
        assert!(!lonely.expire(t0 + Duration::seconds(10), max));
        assert!(lonely.expire(t0 + Duration::seconds(31), max));
        assert_eq!(lonely.status, TraceStatus::Timeout);
        assert!(!lonely.expire(t0 + Duration::seconds(60), max));

        let mut partial = FlowTrace::start("b", &flow(), 0, &event("SignalGenerated", t0));
        partial.record(1, false, &event("OrderCreated", t0 + Duration::seconds(1)));
        assert!(partial.expire(t0 + Duration::seconds(31), max));
        assert_eq!(partial.status, TraceStatus::Partial);
        assert_eq!(partial.stages[1].status, StageStatus::Timeout);
        assert_eq!(partial.stages[2].status, StageStatus::Timeout);
    }
}
