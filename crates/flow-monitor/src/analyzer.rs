//! Latency statistics and alert rules over finalized traces

use crate::alerts::{Alert, AlertKind, Severity};
use crate::trace::{FlowTrace, TraceStatus};
use chrono::{DateTime, Utc};
use event_bus_core::{FlowConfig, MonitorConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Nearest-rank percentile of an ascending slice; `0.0` when empty
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn count_status(traces: &[FlowTrace], status: &[TraceStatus]) -> usize {
    traces.iter().filter(|t| status.contains(&t.status)).count()
}

/// Summary of one flow over a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPerformanceMetrics {
    pub flow_name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_traces: usize,
    pub completed_traces: usize,
    pub failed_traces: usize,
    /// Timed out, with or without completed stages
    pub timed_out_traces: usize,
    /// completed / total
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub median_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Traces above the flow's critical latency
    pub critical_breaches: usize,
    /// Average duration exceeds expected latency by more than the degradation threshold
    pub degraded: bool,
    /// Mean duration per stage id
    pub stage_avg_ms: BTreeMap<String, f64>,
}

/// Computes window metrics and evaluates alert rules
#[derive(Debug, Clone)]
pub struct PerformanceAnalyzer {
    latency_warning_ms: f64,
    latency_critical_ms: f64,
    degradation_threshold: f64,
}

impl PerformanceAnalyzer {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            latency_warning_ms: config.latency_warning_ms,
            latency_critical_ms: config.latency_critical_ms,
            degradation_threshold: config.degradation_threshold,
        }
    }

    fn degradation_limit(&self, expected_ms: f64) -> f64 {
        expected_ms * (1.0 + self.degradation_threshold)
    }

    /// Summarize finalized `traces` of `flow` for the window.
    ///
    /// Duration statistics cover every trace with a recorded total duration,
    /// whatever its outcome.
    pub fn analyze(
        &self,
        flow: &FlowConfig,
        traces: &[FlowTrace],
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> FlowPerformanceMetrics {
        let completed = count_status(traces, &[TraceStatus::Completed]);

        let mut durations: Vec<f64> = traces
            .iter()
            .filter_map(|t| t.total_duration_ms)
            .collect();
        durations.sort_by(|a, b| a.total_cmp(b));

        let avg = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        let mut stage_totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for stage in traces.iter().flat_map(|t| &t.stages) {
            if let Some(ms) = stage.duration_ms {
                let entry = stage_totals.entry(stage.stage_id.clone()).or_default();
                entry.0 += ms;
                entry.1 += 1;
            }
        }

        FlowPerformanceMetrics {
            flow_name: flow.name.clone(),
            window_start,
            window_end,
            total_traces: traces.len(),
            completed_traces: completed,
            failed_traces: count_status(traces, &[TraceStatus::Failed]),
            timed_out_traces: count_status(traces, &[TraceStatus::Timeout, TraceStatus::Partial]),
            success_rate: if traces.is_empty() {
                0.0
            } else {
                completed as f64 / traces.len() as f64
            },
            avg_duration_ms: avg,
            median_duration_ms: percentile(&durations, 50.0),
            p95_duration_ms: percentile(&durations, 95.0),
            p99_duration_ms: percentile(&durations, 99.0),
            min_duration_ms: durations.first().copied().unwrap_or(0.0),
            max_duration_ms: durations.last().copied().unwrap_or(0.0),
            critical_breaches: durations.iter().filter(|d| **d > flow.critical_latency_ms).count(),
            degraded: !durations.is_empty() && avg > self.degradation_limit(flow.expected_latency_ms),
            stage_avg_ms: stage_totals
                .into_iter()
                .map(|(id, (sum, n))| (id, sum / n as f64))
                .collect(),
        }
    }

    /// Alerts for a window summary. Empty windows raise nothing.
    pub fn window_alerts(&self, flow: &FlowConfig, metrics: &FlowPerformanceMetrics) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if metrics.total_traces == 0 {
            return alerts;
        }

        if metrics.success_rate < flow.success_rate_threshold {
            alerts.push(Alert::new(
                AlertKind::LowSuccessRate,
                Severity::Warning,
                &flow.name,
                metrics.success_rate,
                flow.success_rate_threshold,
                format!(
                    "Flow {} success rate {:.1}% below {:.1}% over {} traces",
                    flow.name,
                    metrics.success_rate * 100.0,
                    flow.success_rate_threshold * 100.0,
                    metrics.total_traces
                ),
            ));
        }

        if metrics.degraded {
            let limit = self.degradation_limit(flow.expected_latency_ms);
            alerts.push(Alert::new(
                AlertKind::PerformanceDegradation,
                Severity::Warning,
                &flow.name,
                metrics.avg_duration_ms,
                limit,
                format!(
                    "Flow {} average latency {:.1}ms exceeds {:.1}ms",
                    flow.name, metrics.avg_duration_ms, limit
                ),
            ));
        }

        let p95 = metrics.p95_duration_ms;
        let breach = if p95 > self.latency_critical_ms {
            Some((Severity::Critical, self.latency_critical_ms))
        } else if p95 > self.latency_warning_ms {
            Some((Severity::Warning, self.latency_warning_ms))
        } else {
            None
        };
        if let Some((severity, threshold)) = breach {
            alerts.push(Alert::new(
                AlertKind::WindowLatency,
                severity,
                &flow.name,
                p95,
                threshold,
                format!("Flow {} p95 latency {:.1}ms exceeds {:.1}ms", flow.name, p95, threshold),
            ));
        }

        alerts
    }

    /// Alerts for one finalized trace, in rule order
    pub fn evaluate_trace(&self, flow: &FlowConfig, trace: &FlowTrace) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let duration = trace.total_duration_ms.unwrap_or(0.0);

        let success_rate = trace.success_rate();
        if success_rate < trace.success_rate_threshold {
            let severity = if trace.status == TraceStatus::Failed {
                Severity::Critical
            } else {
                Severity::Warning
            };
            alerts.push(
                Alert::new(
                    AlertKind::LowSuccessRate,
                    severity,
                    &flow.name,
                    success_rate,
                    trace.success_rate_threshold,
                    format!(
                        "Trace {} completed {} of {} stages",
                        trace.trace_id,
                        trace.completed_stages(),
                        trace.stages.len()
                    ),
                )
                .for_trace(&trace.trace_id),
            );
        }

        if duration > trace.critical_latency_ms {
            alerts.push(
                Alert::new(
                    AlertKind::CriticalLatency,
                    Severity::Critical,
                    &flow.name,
                    duration,
                    trace.critical_latency_ms,
                    format!(
                        "Trace {} took {:.1}ms, critical is {:.1}ms",
                        trace.trace_id, duration, trace.critical_latency_ms
                    ),
                )
                .for_trace(&trace.trace_id),
            );
        }

        let limit = self.degradation_limit(trace.expected_latency_ms);
        if duration > limit {
            alerts.push(
                Alert::new(
                    AlertKind::PerformanceDegradation,
                    Severity::Warning,
                    &flow.name,
                    duration,
                    limit,
                    format!(
                        "Trace {} took {:.1}ms, expected {:.1}ms",
                        trace.trace_id, duration, trace.expected_latency_ms
                    ),
                )
                .for_trace(&trace.trace_id),
            );
        }

        for stage in &trace.stages {
            let Some(ms) = stage.duration_ms else { continue };
            if ms > stage.critical_latency_ms {
                alerts.push(
                    Alert::new(
                        AlertKind::StageCriticalLatency,
                        Severity::Warning,
                        &flow.name,
                        ms,
                        stage.critical_latency_ms,
                        format!(
                            "Stage {} ({}) took {:.1}ms, critical is {:.1}ms",
                            stage.stage_id, stage.service, ms, stage.critical_latency_ms
                        ),
                    )
                    .for_trace(&trace.trace_id)
                    .for_stage(&stage.stage_id),
                );
            }
        }

        if matches!(trace.status, TraceStatus::Timeout | TraceStatus::Partial) {
            alerts.push(
                Alert::new(
                    AlertKind::TraceTimeout,
                    Severity::Warning,
                    &flow.name,
                    duration,
                    trace.critical_latency_ms,
                    format!(
                        "Trace {} timed out with {} of {} stages completed",
                        trace.trace_id,
                        trace.completed_stages(),
                        trace.stages.len()
                    ),
                )
                .for_trace(&trace.trace_id),
            );
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use event_bus_core::{EventMessage, FlowStageConfig, Payload};

    fn flow() -> FlowConfig {
        FlowConfig::new(
            "order-flow",
            vec![
                FlowStageConfig::new("signal", "signal-generator", "SignalGenerated"),
                FlowStageConfig::new("order", "risk-manager", "OrderCreated").with_latency(50.0, 200.0),
            ],
        )
        .with_latency(100.0, 500.0)
    }

    fn completed_trace(duration_ms: i64) -> FlowTrace {
        let t0 = Utc::now();
        let first = EventMessage::new("t", "SignalGenerated", "1.0", Payload::new()).with_timestamp(t0);
        let last = EventMessage::new("t", "OrderCreated", "1.0", Payload::new())
            .with_timestamp(t0 + Duration::milliseconds(duration_ms));
        let mut trace = FlowTrace::start(uuid::Uuid::new_v4().to_string(), &flow(), 0, &first);
        trace.record(1, false, &last);
        trace
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|i| (i * 10) as f64).collect();
        assert_eq!(percentile(&values, 95.0), 950.0);
        assert_eq!(percentile(&values, 99.0), 990.0);
        assert_eq!(percentile(&values, 50.0), 500.0);
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn test_analyze_window() {
        let analyzer = PerformanceAnalyzer::new(&MonitorConfig::default());
        let traces: Vec<FlowTrace> = (1..=100).map(|i| completed_trace(i * 10)).collect();
        let now = Utc::now();

        let metrics = analyzer.analyze(&flow(), &traces, now - Duration::hours(1), now);
        assert_eq!(metrics.total_traces, 100);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.p95_duration_ms, 950.0);
        assert_eq!(metrics.p99_duration_ms, 990.0);
        assert_eq!(metrics.min_duration_ms, 10.0);
        assert_eq!(metrics.max_duration_ms, 1000.0);
        assert_eq!(metrics.avg_duration_ms, 505.0);
        assert_eq!(metrics.critical_breaches, 50);
        assert!(metrics.degraded);
        assert_eq!(metrics.stage_avg_ms["signal"], 505.0);

        let alerts = analyzer.window_alerts(&flow(), &metrics);
        let kinds: Vec<_> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::PerformanceDegradation, AlertKind::WindowLatency]);
        assert_eq!(alerts[1].severity, Severity::Critical);
    }

    #[test]
    fn test_empty_window_raises_nothing() {
        let analyzer = PerformanceAnalyzer::new(&MonitorConfig::default());
        let now = Utc::now();
        let metrics = analyzer.analyze(&flow(), &[], now, now);
        assert_eq!(metrics.success_rate, 0.0);
        assert!(analyzer.window_alerts(&flow(), &metrics).is_empty());
    }

    #[test]
    fn test_trace_alert_order() {
        let analyzer = PerformanceAnalyzer::new(&MonitorConfig::default());

        assert!(analyzer.evaluate_trace(&flow(), &completed_trace(40)).is_empty());

        let slow = completed_trace(600);
        let kinds: Vec<_> = analyzer
            .evaluate_trace(&flow(), &slow)
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::CriticalLatency,
                AlertKind::PerformanceDegradation,
                AlertKind::StageCriticalLatency,
            ]
        );
    }

    #[test]
    fn test_timed_out_trace_alerts() {
        let analyzer = PerformanceAnalyzer::new(&MonitorConfig::default());
        let t0 = Utc::now();
        let first = EventMessage::new("t", "SignalGenerated", "1.0", Payload::new()).with_timestamp(t0);
        let mut trace = FlowTrace::start("tr", &flow(), 0, &first);
        trace.expire(t0 + Duration::minutes(10), Duration::minutes(5));

        let alerts = analyzer.evaluate_trace(&flow(), &trace);
        let kinds: Vec<_> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::LowSuccessRate,
                AlertKind::CriticalLatency,
                AlertKind::PerformanceDegradation,
                AlertKind::TraceTimeout,
            ]
        );
        assert_eq!(alerts[3].trace_id.as_deref(), Some("tr"));
    }

    #[test]
    fn test_failed_trace_durations_count() {
        let analyzer = PerformanceAnalyzer::new(&MonitorConfig::default());
        let t0 = Utc::now();
        let first = EventMessage::new("t", "SignalGenerated", "1.0", Payload::new()).with_timestamp(t0);
        let rejected = EventMessage::new("t", "OrderRejected", "1.0", Payload::new())
            .with_timestamp(t0 + Duration::milliseconds(900));
        let mut trace = FlowTrace::start("tr-f", &flow(), 0, &first);
        trace.record(1, true, &rejected);
        assert_eq!(trace.status, TraceStatus::Failed);
        assert_eq!(trace.total_duration_ms, Some(900.0));

        let kinds: Vec<_> = analyzer
            .evaluate_trace(&flow(), &trace)
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::LowSuccessRate,
                AlertKind::CriticalLatency,
                AlertKind::PerformanceDegradation,
                AlertKind::StageCriticalLatency,
            ]
        );

        let now = Utc::now();
        let metrics = analyzer.analyze(&flow(), &[trace], now - Duration::hours(1), now);
        assert_eq!(metrics.failed_traces, 1);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.avg_duration_ms, 900.0);
        assert_eq!(metrics.max_duration_ms, 900.0);
        assert_eq!(metrics.p95_duration_ms, 900.0);
        assert_eq!(metrics.critical_breaches, 1);
        assert!(metrics.degraded);
    }
}
