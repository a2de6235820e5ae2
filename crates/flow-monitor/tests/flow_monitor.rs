use chrono::{Duration as ChronoDuration, Utc};
use event_bus_core::prelude::*;
use event_bus_core::MonitorConfig;
use event_gateway::{Gateway, PublishRequest};
use flow_monitor::{
    AlertKind, FlowMonitor, FlowTrace, MemoryAlertSink, StageStatus, TraceStatus, ALERT_EVENT_TYPE,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn order_flow() -> FlowConfig {
    FlowConfig::new(
        "order-flow",
        vec![
            FlowStageConfig::new("signal", "signal-generator", "SignalGenerated").on_topic("eafix.signals"),
            FlowStageConfig::new("order", "risk-manager", "OrderCreated")
                .on_topic("eafix.orders")
                .with_failure_event("OrderRejected"),
            FlowStageConfig::new("execution", "execution-engine", "ExecutionReport")
                .on_topic("eafix.executions"),
        ],
    )
}

fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        flows: vec![order_flow()],
        ..Default::default()
    }
}

fn processed(topic: &str, event_type: &str, body: Value, at: chrono::DateTime<Utc>) -> EventMessage {
    let mut message = EventMessage::new(topic, event_type, "1.0", payload(body)).with_timestamp(at);
    message.advance(MessageStatus::Processing).unwrap();
    message.advance(MessageStatus::Processed).unwrap();
    message
}

#[tokio::test]
async fn test_order_flow_through_gateway() {
    let transport = Arc::new(MemoryTransport::new());

    let mut gateway_config = GatewayConfig::default();
    gateway_config.gateway.processing_interval = Duration::from_millis(10);
    gateway_config.topics = vec![
        TopicConfig::new("eafix.signals", "SignalGenerated@1.0"),
        TopicConfig::new("eafix.orders", "OrderCreated@1.0"),
        TopicConfig::new("eafix.executions", "ExecutionReport@1.0"),
    ];
    let gateway = Gateway::new(gateway_config, transport.clone()).unwrap();
    let monitor = FlowMonitor::new(monitor_config(), transport.clone()).unwrap();
    monitor.start().await.unwrap();
    gateway.start().await.unwrap();

    let monitor = &monitor;
    let steps = [
        ("SignalGenerated", json!({"signal_id": "s-1", "symbol": "EURUSD"})),
        ("OrderCreated", json!({"signal_id": "s-1", "order_id": "o-1"})),
        ("ExecutionReport", json!({"order_id": "o-1", "fill_price": 1.0842})),
    ];
    for (step, (event_type, body)) in steps.into_iter().enumerate() {
        let response = gateway
            .publish_event(PublishRequest::new(event_type, "1.0", payload(body)))
            .await;
        assert!(response.success, "{:?}", response.error);

        eventually(move || async move {
            let seen = |traces: Vec<FlowTrace>| {
                traces
                    .iter()
                    .any(|t| t.stages[step].status != StageStatus::Pending)
            };
            seen(monitor.active_traces().await) || seen(monitor.completed_traces(1, None).await)
        })
        .await;
    }

    assert!(monitor.active_traces().await.is_empty());
    let traces = monitor.completed_traces(10, Some("order-flow")).await;
    assert_eq!(traces.len(), 1);

    let trace = &traces[0];
    assert_eq!(trace.status, TraceStatus::Completed);
    assert!(trace.stages.iter().all(|s| s.status == StageStatus::Completed));
    assert_eq!(trace.trigger_event["signal_id"], "s-1");

    let end = trace.end_time.unwrap();
    assert_eq!(Some(end), trace.stages[2].end_time);
    let expected = (end - trace.start_time).num_microseconds().unwrap() as f64 / 1000.0;
    assert_eq!(trace.total_duration_ms, Some(expected));

    gateway.shutdown().await;
    monitor.shutdown().await;
}

#[tokio::test]
async fn test_stale_trace_times_out_once() {
    let transport = Arc::new(MemoryTransport::new());
    let config = MonitorConfig {
        max_trace_duration: Duration::from_millis(50),
        analysis_interval: Duration::from_millis(20),
        ..monitor_config()
    };
    let monitor = FlowMonitor::new(config, transport).unwrap();
    let sink = Arc::new(MemoryAlertSink::new());
    monitor.add_sink(sink.clone()).await;
    monitor.start().await.unwrap();

    monitor
        .observe(&processed("eafix.signals", "SignalGenerated", json!({"signal_id": "s-9"}), Utc::now()))
        .await;
    assert_eq!(monitor.active_traces().await.len(), 1);

    let monitor_ref = &monitor;
    eventually(move || async move { !monitor_ref.completed_traces(1, None).await.is_empty() }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let traces = monitor.completed_traces(10, None).await;
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Timeout);
    assert!(monitor.active_traces().await.is_empty());
    assert_eq!(sink.of_kind(AlertKind::TraceTimeout).await.len(), 1);

    let latest = monitor.latest_metrics("order-flow").await.unwrap();
    assert_eq!(latest.timed_out_traces, 1);
    assert_eq!(latest.success_rate, 0.0);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_flow_performance_percentiles() {
    let transport = Arc::new(MemoryTransport::new());
    let monitor = FlowMonitor::new(monitor_config(), transport).unwrap();
    let base = Utc::now() - ChronoDuration::minutes(10);

    for i in 1..=100i64 {
        let start = base + ChronoDuration::seconds(i);
        let order = format!("o-{}", i);
        monitor
            .observe(&processed("eafix.signals", "SignalGenerated", json!({"signal_id": order}), start))
            .await;
        monitor
            .observe(&processed(
                "eafix.orders",
                "OrderCreated",
                json!({"signal_id": order, "order_id": order}),
                start + ChronoDuration::milliseconds(i * 5),
            ))
            .await;
        let finished = monitor
            .observe(&processed(
                "eafix.executions",
                "ExecutionReport",
                json!({"order_id": order}),
                start + ChronoDuration::milliseconds(i * 10),
            ))
            .await;
        assert_eq!(finished.len(), 1);
    }

    let metrics = monitor.flow_performance_metrics("order-flow", 1).await.unwrap();
    assert_eq!(metrics.total_traces, 100);
    assert_eq!(metrics.success_rate, 1.0);
    assert_eq!(metrics.p95_duration_ms, 950.0);
    assert_eq!(metrics.p99_duration_ms, 990.0);
    assert_eq!(metrics.median_duration_ms, 500.0);

    assert!(monitor.flow_performance_metrics("nope", 1).await.is_none());
}

#[tokio::test]
async fn test_rejected_order_fails_trace_and_publishes_alert() {
    let transport = Arc::new(MemoryTransport::new());
    let config = MonitorConfig {
        alerts_topic: Some("eafix.alerts".into()),
        ..monitor_config()
    };
    let monitor = FlowMonitor::new(config, transport.clone()).unwrap();
    let t0 = Utc::now();

    monitor
        .observe(&processed("eafix.signals", "SignalGenerated", json!({"signal_id": "s-2"}), t0))
        .await;
    monitor
        .observe(&processed(
            "eafix.orders",
            "OrderRejected",
            json!({"signal_id": "s-2", "order_id": "o-2"}),
            t0 + ChronoDuration::milliseconds(5),
        ))
        .await;
    let finished = monitor
        .observe(&processed(
            "eafix.executions",
            "ExecutionReport",
            json!({"order_id": "o-2"}),
            t0 + ChronoDuration::milliseconds(8),
        ))
        .await;

    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, TraceStatus::Failed);
    assert_eq!(finished[0].stages[1].status, StageStatus::Failed);

    let alerts = transport.published_to("eafix.alerts").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].event_type, ALERT_EVENT_TYPE);
    assert_eq!(alerts[0].payload["kind"], "low_success_rate");
    assert_eq!(alerts[0].payload["severity"], "critical");
}

#[test]
fn test_duplicate_flow_names_rejected() {
    let config = MonitorConfig {
        flows: vec![order_flow(), order_flow()],
        ..Default::default()
    };
    assert!(FlowMonitor::new(config, Arc::new(MemoryTransport::new())).is_err());
}

#[tokio::test]
async fn test_lifecycle_stop_from_spawned_task() {
    let transport = Arc::new(MemoryTransport::new());
    let monitor: Arc<dyn Lifecycle> = Arc::new(FlowMonitor::new(monitor_config(), transport).unwrap());
    monitor.start().await.unwrap();
    assert!(monitor.is_running());

    let stopper = monitor.clone();
    tokio::spawn(async move { stopper.stop().await })
        .await
        .unwrap()
        .unwrap();
    assert!(!monitor.is_running());
}
