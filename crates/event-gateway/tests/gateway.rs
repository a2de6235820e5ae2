use bytes::Bytes;
use event_bus_core::prelude::*;
use event_bus_core::{ProcessorConfig, FAILURE_INFO_KEY};
use event_gateway::{Gateway, PublishRequest};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

fn base_config() -> GatewayConfig {
    GatewayConfig {
        gateway: ProcessorConfig {
            processing_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
            max_retries: 2,
            ..Default::default()
        },
        ..Default::default()
    }
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

fn price_tick_config() -> GatewayConfig {
    let mut config = base_config();
    config.topics = vec![
        TopicConfig::new("eafix.price.tick", "PriceTick@1.0"),
        TopicConfig::new("eafix.price.tick.eurusd", "PriceTick@1.0"),
    ];
    config.routing = vec![
        RoutingRule::new(
            "PriceTick@1.0",
            Condition::parse("symbol == 'EURUSD'"),
            vec!["eafix.price.tick.eurusd".into()],
        )
        .with_name("eurusd")
        .with_transform(TransformKind::AddTimestamp),
        RoutingRule::new("PriceTick@1.0", Condition::Always, vec!["eafix.price.tick".into()])
            .with_name("default"),
    ];
    config
}

#[tokio::test]
async fn test_price_tick_routing_end_to_end() {
    let transport = Arc::new(MemoryTransport::new());
    let gateway = Gateway::new(price_tick_config(), transport.clone()).unwrap();
    gateway.start().await.unwrap();

    let tick = EventMessage::new(
        "eafix.price.tick",
        "PriceTick",
        "1.0",
        payload(json!({"symbol": "EURUSD", "bid": 1.0841, "ask": 1.0843})),
    )
    .with_producer("data-ingestor");
    transport.publish_message(&tick).await.unwrap();

    let (gateway, transport) = (&gateway, &transport);
    eventually(move || async move {
        transport.published_to("eafix.price.tick.eurusd").await.len() == 1
            && gateway.stats().totals.processed == 1
    })
    .await;

    let eurusd = transport.published_to("eafix.price.tick.eurusd").await;
    assert!(eurusd[0].payload.contains_key("processed_at"));
    assert_eq!(eurusd[0].status, MessageStatus::Processed);
    assert_eq!(eurusd[0].producer.as_deref(), Some("data-ingestor"));

    let defaults: Vec<_> = transport
        .published_to("eafix.price.tick")
        .await
        .into_iter()
        .filter(|m| m.status == MessageStatus::Processed)
        .collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].payload, tick.payload);

    let metrics = gateway.topic_metrics("eafix.price.tick").unwrap();
    assert_eq!(metrics.counters.received, 1);
    assert_eq!(metrics.counters.routed, 1);
    assert_eq!(metrics.counters.published, 2);
    assert_eq!(metrics.dead_letter_topic, "eafix.price.tick.dlq");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_non_matching_symbol_only_reaches_default_topic() {
    let transport = Arc::new(MemoryTransport::new());
    let gateway = Gateway::new(price_tick_config(), transport.clone()).unwrap();
    gateway.start().await.unwrap();

    let response = gateway
        .publish_event(PublishRequest::new(
            "PriceTick",
            "1.0",
            payload(json!({"symbol": "GBPUSD", "bid": 1.27})),
        ))
        .await;
    assert!(response.success);
    assert_eq!(response.topic.as_deref(), Some("eafix.price.tick"));

    let (gateway, transport) = (&gateway, &transport);
    eventually(move || async move { gateway.stats().totals.processed == 1 }).await;
    assert!(transport.published_to("eafix.price.tick.eurusd").await.is_empty());
    assert_eq!(transport.published_to("eafix.price.tick").await.len(), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_repeated_failure_ends_in_dead_letter() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_publishes_to("orders.out").await;

    let mut config = base_config();
    config.topics = vec![
        TopicConfig::new("orders", "OrderCreated@1.0"),
        TopicConfig::new("orders.out", "OrderCreated@1.0"),
    ];
    config.routing = vec![RoutingRule::new(
        "OrderCreated@1.0",
        Condition::Always,
        vec!["orders.out".into()],
    )];

    let gateway = Gateway::new(config, transport.clone()).unwrap();
    gateway.start().await.unwrap();

    let response = gateway
        .publish_event(
            PublishRequest::new("OrderCreated", "1.0", payload(json!({"order_id": "o-1"})))
                .with_topic("orders"),
        )
        .await;
    assert!(response.success);

    let (gateway, transport) = (&gateway, &transport);
    eventually(move || async move { !gateway.dead_letter_messages(1).await.is_empty() }).await;

    let entry = &gateway.dead_letter_messages(1).await[0];
    assert_eq!(entry.message.status, MessageStatus::DeadLetter);
    assert_eq!(entry.message.retry_count, 3);
    assert_eq!(entry.dead_letter_topic, "orders.dlq");

    let info = &entry.message.payload[FAILURE_INFO_KEY];
    assert_eq!(info["original_topic"], "orders");
    assert_eq!(info["retry_count"], 3);
    assert!(!info["reason"].as_str().unwrap().is_empty());
    assert!(info["failed_at"].is_string());

    let published = transport.published_to("orders.dlq").await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id, response.message_id.unwrap());

    let counters = gateway.topic_metrics("orders").unwrap().counters;
    assert_eq!(counters.retried, 2);
    assert_eq!(counters.dead_lettered, 1);
    assert_eq!(counters.errors, 3);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next_publishes_to("orders", 1).await;

    let mut config = base_config();
    config.topics = vec![TopicConfig::new("orders", "OrderCreated@1.0")];

    let gateway = Gateway::new(config, transport.clone()).unwrap();
    gateway.start().await.unwrap();

    gateway
        .publish_event(PublishRequest::new("OrderCreated", "1.0", Payload::new()))
        .await;

    let gateway = &gateway;
    eventually(move || async move { gateway.stats().totals.processed == 1 }).await;
    let counters = gateway.stats().totals;
    assert_eq!(counters.retried, 1);
    assert_eq!(counters.dead_lettered, 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_queue_full_is_dead_lettered() {
    let transport = Arc::new(MemoryTransport::new());
    let mut config = base_config();
    config.topics = vec![TopicConfig::new("signals", "SignalGenerated@1.0").with_queue_capacity(1)];

    // Not started: nothing drains the queue
    let gateway = Gateway::new(config, transport.clone()).unwrap();
    let request = PublishRequest::new("SignalGenerated", "1.0", payload(json!({"signal_id": "s-1"})));

    assert!(gateway.publish_event(request.clone()).await.success);
    let rejected = gateway.publish_event(request).await;
    assert!(!rejected.success);
    assert!(rejected.error.unwrap().contains("full"));

    let dead = gateway.dead_letter_messages(10).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.status, MessageStatus::DeadLetter);
    assert_eq!(dead[0].reason, "queue_full");
    assert_eq!(gateway.topic_metrics("signals").unwrap().queue_depth, 1);
}

#[tokio::test]
async fn test_publish_event_boundary_behaviour() {
    let transport = Arc::new(MemoryTransport::new());
    let mut config = base_config();
    config.topics = vec![TopicConfig::new("signals", "SignalGenerated@1.0")];
    let gateway = Gateway::new(config, transport).unwrap();

    let ok = gateway
        .publish_event(PublishRequest::new("SignalGenerated", "1.0", Payload::new()))
        .await;
    assert!(ok.success);
    assert!(ok.trace_id.is_some());
    assert!(ok.message_id.is_some());

    let kept = gateway
        .publish_event(
            PublishRequest::new("SignalGenerated", "1.0", Payload::new()).with_trace_id("tr-9"),
        )
        .await;
    assert_eq!(kept.trace_id.as_deref(), Some("tr-9"));

    let unknown_schema = gateway
        .publish_event(PublishRequest::new("Nope", "1.0", Payload::new()))
        .await;
    assert!(!unknown_schema.success);
    assert!(unknown_schema.error.is_some());

    let unknown_topic = gateway
        .publish_event(PublishRequest::new("SignalGenerated", "1.0", Payload::new()).with_topic("x"))
        .await;
    assert!(!unknown_topic.success);
}

#[tokio::test]
async fn test_ingress_ignores_processed_and_garbage() {
    let transport = Arc::new(MemoryTransport::new());
    let mut config = base_config();
    config.topics = vec![TopicConfig::new("signals", "SignalGenerated@1.0")];
    let gateway = Gateway::new(config, transport.clone()).unwrap();
    gateway.start().await.unwrap();

    transport
        .publish("signals", Bytes::from_static(b"{not json"))
        .await
        .unwrap();

    let mut processed = EventMessage::new("signals", "SignalGenerated", "1.0", Payload::new());
    processed.advance(MessageStatus::Processing).unwrap();
    processed.advance(MessageStatus::Processed).unwrap();
    transport.publish_message(&processed).await.unwrap();

    let pending = EventMessage::new("signals", "SignalGenerated", "1.0", Payload::new());
    transport.publish_message(&pending).await.unwrap();

    let gateway = &gateway;
    eventually(move || async move { gateway.stats().totals.processed == 1 }).await;
    let counters = gateway.topic_metrics("signals").unwrap().counters;
    assert_eq!(counters.received, 1);
    assert_eq!(counters.dropped, 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_admission() {
    let transport = Arc::new(MemoryTransport::new());
    let mut config = base_config();
    config.topics = vec![TopicConfig::new("signals", "SignalGenerated@1.0")];
    let gateway = Gateway::new(config, transport).unwrap();
    gateway.start().await.unwrap();
    assert!(gateway.is_running());

    gateway.shutdown().await;
    assert!(!gateway.is_running());

    let response = gateway
        .publish_event(PublishRequest::new("SignalGenerated", "1.0", Payload::new()))
        .await;
    assert!(!response.success);
}
