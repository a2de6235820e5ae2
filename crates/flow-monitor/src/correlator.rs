//! Event correlation into flow traces

use crate::trace::{FlowTrace, StageChange};
use chrono::{DateTime, Utc};
use event_bus_core::metrics::FlowMetrics;
use event_bus_core::{EventMessage, FlowConfig, MonitorConfig, CORRELATION_KEYS};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

/// (flow, trace id)
type TraceKey = (String, String);

/// (flow, correlation key, correlation value)
type IndexKey = (String, String, String);

#[derive(Default)]
struct TraceState {
    active: HashMap<TraceKey, FlowTrace>,
    index: HashMap<IndexKey, String>,
    history: VecDeque<FlowTrace>,
}

impl TraceState {
    fn retire(&mut self, key: &TraceKey, history_size: usize) -> Option<FlowTrace> {
        let trace = self.active.remove(key)?;
        for (k, v) in &trace.correlation {
            let index_key = (trace.flow_name.clone(), k.clone(), v.clone());
            if self.index.get(&index_key) == Some(&trace.trace_id) {
                self.index.remove(&index_key);
            }
        }
        self.history.push_back(trace.clone());
        while self.history.len() > history_size {
            self.history.pop_front();
        }
        Some(trace)
    }
}

/// Groups events of configured flows into traces by shared correlation ids
pub struct FlowCorrelator {
    flows: Vec<FlowConfig>,
    max_trace_duration: chrono::Duration,
    history_size: usize,
    state: RwLock<TraceState>,
    metrics: FlowMetrics,
}

impl FlowCorrelator {
    pub fn new(config: &MonitorConfig) -> Self {
        let flows: Vec<FlowConfig> = config.flows.iter().filter(|f| f.enabled).cloned().collect();
        let max_trace_duration = chrono::Duration::from_std(config.max_trace_duration)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        info!(
            flows = flows.len(),
            max_trace_secs = config.max_trace_duration.as_secs(),
            "Flow correlator configured"
        );

        Self {
            flows,
            max_trace_duration,
            history_size: config.history_size.max(1),
            state: RwLock::new(TraceState::default()),
            metrics: FlowMetrics::new("flow_monitor"),
        }
    }

    /// Enabled flows
    pub fn flows(&self) -> &[FlowConfig] {
        &self.flows
    }

    pub fn flow(&self, name: &str) -> Option<&FlowConfig> {
        self.flows.iter().find(|f| f.name == name)
    }

    /// Topics named by any stage of an enabled flow
    pub fn topics(&self) -> BTreeSet<String> {
        self.flows.iter().flat_map(|f| f.topics()).collect()
    }

    /// Feed one event through every flow. Returns traces it finalized.
    pub async fn observe(&self, message: &EventMessage) -> Vec<FlowTrace> {
        let mut finished = Vec::new();
        let values = correlation_values(message);
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        for flow in &self.flows {
            let Some(stage) = flow.stage_index(&message.event_type, &message.topic) else {
                continue;
            };
            let failure = flow.stages[stage].is_failure(&message.event_type);

            let existing = values.iter().find_map(|(k, v)| {
                let id = state.index.get(&(flow.name.clone(), k.clone(), v.clone()))?;
                let key = (flow.name.clone(), id.clone());
                state.active.contains_key(&key).then_some(key)
            });

            let key = match existing {
                Some(key) => {
                    if let Some(active) = state.active.get_mut(&key) {
                        let change = active.record(stage, failure, message);
                        trace!(
                            flow = %flow.name,
                            trace_id = %key.1,
                            stage = %flow.stages[stage].stage_id,
                            ?change,
                            "Event correlated"
                        );
                        if change == StageChange::Ignored {
                            continue;
                        }
                    }
                    key
                }
                None => {
                    let trace_id = message
                        .trace_id
                        .clone()
                        .filter(|id| !state.active.contains_key(&(flow.name.clone(), id.clone())))
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let started = FlowTrace::start(trace_id.clone(), flow, stage, message);
                    debug!(
                        flow = %flow.name,
                        trace_id = %trace_id,
                        stage = %flow.stages[stage].stage_id,
                        "Trace started"
                    );
                    self.metrics.record_trace_started(&flow.name);
                    let key = (flow.name.clone(), trace_id);
                    state.active.insert(key.clone(), started);
                    key
                }
            };

            let Some(active) = state.active.get_mut(&key) else {
                continue;
            };
            for (k, v) in &values {
                let index_key = (flow.name.clone(), k.clone(), v.clone());
                if !state.index.contains_key(&index_key) {
                    state.index.insert(index_key, key.1.clone());
                    active.correlation.push((k.clone(), v.clone()));
                }
            }

            if active.is_terminal() {
                if let Some(done) = state.retire(&key, self.history_size) {
                    self.record_finished(&done);
                    finished.push(done);
                }
            }
        }

        self.metrics.set_active_traces(state.active.len());
        finished
    }

    /// Finalize active traces older than the maximum trace duration
    pub async fn expire(&self, now: DateTime<Utc>) -> Vec<FlowTrace> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let expired: Vec<TraceKey> = state
            .active
            .iter_mut()
            .filter_map(|(key, t)| t.expire(now, self.max_trace_duration).then(|| key.clone()))
            .collect();

        let mut finished = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(done) = state.retire(&key, self.history_size) {
                debug!(flow = %done.flow_name, trace_id = %done.trace_id, status = %done.status, "Trace expired");
                self.record_finished(&done);
                finished.push(done);
            }
        }

        self.metrics.set_active_traces(state.active.len());
        finished
    }

    fn record_finished(&self, trace: &FlowTrace) {
        self.metrics
            .record_trace_finished(&trace.flow_name, trace.status.as_str(), trace.total_duration_ms);
        for stage in &trace.stages {
            if let Some(ms) = stage.duration_ms {
                self.metrics.record_stage_duration(&trace.flow_name, &stage.stage_id, ms);
            }
        }
    }

    pub async fn active_traces(&self) -> Vec<FlowTrace> {
        let state = self.state.read().await;
        let mut traces: Vec<FlowTrace> = state.active.values().cloned().collect();
        traces.sort_by_key(|t| t.start_time);
        traces
    }

    pub async fn active_count(&self) -> usize {
        self.state.read().await.active.len()
    }

    /// Finalized traces, newest first, optionally for one flow
    pub async fn completed_traces(&self, limit: usize, flow: Option<&str>) -> Vec<FlowTrace> {
        let state = self.state.read().await;
        state
            .history
            .iter()
            .rev()
            .filter(|t| flow.map_or(true, |name| t.flow_name == name))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Finalized traces of `flow` that started at or after `since`
    pub async fn history_since(&self, flow: &str, since: DateTime<Utc>) -> Vec<FlowTrace> {
        let state = self.state.read().await;
        state
            .history
            .iter()
            .filter(|t| t.flow_name == flow && t.start_time >= since)
            .cloned()
            .collect()
    }
}

/// Correlation `(key, value)` pairs of an event in key priority order.
///
/// Payload values win; the envelope trace id stands in for a missing
/// `trace_id` payload field. Numbers are matched by their string form.
pub fn correlation_values(message: &EventMessage) -> Vec<(String, String)> {
    CORRELATION_KEYS
        .iter()
        .filter_map(|key| {
            let value = match message.payload.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ if *key == "trace_id" => message.trace_id.clone().filter(|t| !t.is_empty()),
                _ => None,
            }?;
            Some((key.to_string(), value))
        })
        .collect()
}
