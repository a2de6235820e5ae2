//! # Flow Monitor
//!
//! Correlates events across services into end-to-end flow traces and
//! analyzes their latency.
//!
//! ## Features
//!
//! - Traces keyed by shared correlation ids (`signal_id`, `order_id`, ...)
//! - Per-stage timing with success, failure and timeout tracking
//! - Window statistics: success rate, mean, median, p95, p99
//! - Alerts to logs, memory or a bus topic
//!
//! Only `processed` envelopes are observed, so each hop through the gateway
//! is counted once.

pub mod alerts;
pub mod analyzer;
pub mod correlator;
pub mod trace;

pub use alerts::*;
pub use analyzer::*;
pub use correlator::FlowCorrelator;
pub use trace::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus_core::metrics::FlowMetrics;
use event_bus_core::prelude::*;
use event_bus_core::{ErrorContext, ErrorContextExt, MonitorConfig, PayloadStream};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// State shared between the monitor handle and its background tasks
struct Shared {
    config: MonitorConfig,
    correlator: FlowCorrelator,
    analyzer: PerformanceAnalyzer,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    latest: RwLock<HashMap<String, FlowPerformanceMetrics>>,
    metrics: FlowMetrics,
}

impl Shared {
    async fn observe(&self, message: &EventMessage) -> Vec<FlowTrace> {
        let finished = self.correlator.observe(message).await;
        self.evaluate(&finished).await;
        finished
    }

    async fn evaluate(&self, traces: &[FlowTrace]) {
        for trace in traces {
            debug!(
                flow = %trace.flow_name,
                trace_id = %trace.trace_id,
                status = %trace.status,
                duration_ms = trace.total_duration_ms,
                "Trace finished"
            );
            if let Some(flow) = self.correlator.flow(&trace.flow_name) {
                let alerts = self.analyzer.evaluate_trace(flow, trace);
                self.raise(alerts).await;
            }
        }
    }

    async fn raise(&self, alerts: Vec<Alert>) {
        if alerts.is_empty() {
            return;
        }
        let sinks = self.sinks.read().await;
        for alert in &alerts {
            self.metrics.record_alert(alert.kind.as_str(), alert.severity.as_str());
            for sink in sinks.iter() {
                if let Err(e) = sink.emit(alert).await {
                    warn!(sink = sink.name(), kind = %alert.kind, error = %e, "Alert delivery failed");
                }
            }
        }
    }

    fn window_start(&self, now: DateTime<Utc>, window: std::time::Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    async fn metrics_for(
        &self,
        flow: &FlowConfig,
        window: std::time::Duration,
        now: DateTime<Utc>,
    ) -> FlowPerformanceMetrics {
        let start = self.window_start(now, window);
        let traces = self.correlator.history_since(&flow.name, start).await;
        self.analyzer.analyze(flow, &traces, start, now)
    }

    async fn run_analysis(&self, now: DateTime<Utc>) {
        let expired = self.correlator.expire(now).await;
        self.evaluate(&expired).await;

        for flow in self.correlator.flows() {
            let summary = self.metrics_for(flow, self.config.analysis_window, now).await;
            trace!(
                flow = %flow.name,
                traces = summary.total_traces,
                success_rate = summary.success_rate,
                p95_ms = summary.p95_duration_ms,
                "Flow analyzed"
            );
            let alerts = self.analyzer.window_alerts(flow, &summary);
            self.latest.write().await.insert(flow.name.clone(), summary);
            self.raise(alerts).await;
        }
    }
}

/// Flow monitor: topic observers plus a periodic analysis task
pub struct FlowMonitor {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl FlowMonitor {
    /// Validate flow definitions and build the monitor.
    ///
    /// Alerts are logged; when `alerts_topic` is set they are also published.
    pub fn new(config: MonitorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut names = HashSet::new();
        for flow in &config.flows {
            if !names.insert(flow.name.as_str()) {
                return Err(GatewayError::config(format!("duplicate flow '{}'", flow.name)));
            }
            if flow.stages.is_empty() {
                return Err(GatewayError::config(format!("flow '{}' has no stages", flow.name)));
            }
        }

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(TracingAlertSink)];
        if let Some(topic) = &config.alerts_topic {
            sinks.push(Arc::new(TransportAlertSink::new(transport.clone(), topic.clone())));
        }

        let shared = Shared {
            correlator: FlowCorrelator::new(&config),
            analyzer: PerformanceAnalyzer::new(&config),
            sinks: RwLock::new(sinks),
            latest: RwLock::new(HashMap::new()),
            metrics: FlowMetrics::new("flow_monitor"),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            transport,
            handles: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Register an additional alert destination
    pub async fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.shared.sinks.write().await.push(sink);
    }

    /// Subscribe to every flow topic and start the analysis task
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let topics = self.shared.correlator.topics();
        if topics.is_empty() {
            warn!("No flow stage names a topic, nothing will be observed");
        }

        let mut handles = self.handles.lock().await;
        for topic in topics {
            let stream = self
                .transport
                .subscribe(&topic)
                .await
                .with_context(ErrorContext::new("flow_monitor", "subscribe").with_topic(topic.clone()))?;
            handles.push(tokio::spawn(observe_topic(
                topic,
                stream,
                self.shared.clone(),
                self.cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(analysis_loop(self.shared.clone(), self.cancel.clone())));

        info!(
            flows = self.shared.correlator.flows().len(),
            tasks = handles.len(),
            "Flow monitor started"
        );
        Ok(())
    }

    /// Feed one event directly, bypassing the subscriptions.
    /// Returns the traces it finalized.
    pub async fn observe(&self, message: &EventMessage) -> Vec<FlowTrace> {
        self.shared.observe(message).await
    }

    pub async fn active_traces(&self) -> Vec<FlowTrace> {
        self.shared.correlator.active_traces().await
    }

    /// Finalized traces, newest first
    pub async fn completed_traces(&self, limit: usize, flow: Option<&str>) -> Vec<FlowTrace> {
        self.shared.correlator.completed_traces(limit, flow).await
    }

    /// Metrics for `flow` over the trailing `hours`; `None` for unknown flows
    pub async fn flow_performance_metrics(&self, flow: &str, hours: u32) -> Option<FlowPerformanceMetrics> {
        let config = self.shared.correlator.flow(flow)?;
        let window = std::time::Duration::from_secs(u64::from(hours) * 3600);
        Some(self.shared.metrics_for(config, window, Utc::now()).await)
    }

    /// Summary from the most recent analysis run
    pub async fn latest_metrics(&self, flow: &str) -> Option<FlowPerformanceMetrics> {
        self.shared.latest.read().await.get(flow).cloned()
    }

    /// Expire stale traces and refresh window metrics now
    pub async fn run_analysis(&self) {
        self.shared.run_analysis(Utc::now()).await;
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        futures::future::join_all(handles).await;
        let active_traces = self.shared.correlator.active_count().await;
        info!(active_traces, "Flow monitor stopped");
    }
}

#[async_trait]
impl Lifecycle for FlowMonitor {
    async fn start(&self) -> Result<()> {
        FlowMonitor::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        FlowMonitor::is_running(self)
    }
}

#[async_trait]
impl HealthCheck for FlowMonitor {
    async fn health_check(&self) -> Result<()> {
        if !self.is_running() {
            return Err(GatewayError::Internal("flow monitor is not running".into()));
        }
        self.transport.health_check().await
    }

    fn component_name(&self) -> &'static str {
        "flow_monitor"
    }
}

async fn observe_topic(
    topic: String,
    mut stream: PayloadStream,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(bytes) => bytes,
                None => {
                    warn!(topic = %topic, "Subscription ended");
                    break;
                }
            },
        };

        let message = match EventMessage::from_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(topic = %topic, error = %e, "Ignoring undecodable envelope");
                continue;
            }
        };

        if message.status != MessageStatus::Processed {
            trace!(topic = %topic, message_id = %message.id, status = %message.status, "Ignoring unprocessed envelope");
            continue;
        }

        shared.observe(&message).await;
    }
    debug!(topic = %topic, "Observer stopped");
}

async fn analysis_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = shared.config.analysis_interval.max(std::time::Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.run_analysis(Utc::now()).await,
        }
    }
    debug!("Analysis task stopped");
}
