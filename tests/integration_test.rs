mod common;

use common::{container_metric, get_test_config, log_message, value_metric};
use kafka_firehose_nozzle::config::{KafkaConfig, TopicConfig};
use kafka_firehose_nozzle::firehose::{Envelope, Event, EventType};
use kafka_firehose_nozzle::nozzle::{KafkaProducer, NozzleProducer};
use kafka_firehose_nozzle::stats::{StatKind, Stats};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::test]
#[ignore] // Run with: cargo test --ignored integration_test::test_end_to_end_relay
async fn test_end_to_end_relay() {
    tracing_subscriber::fmt()
        .with_env_filter("kafka_firehose_nozzle=debug,rdkafka=info")
        .try_init()
        .ok();

    let suffix = std::process::id();
    let topic = TopicConfig {
        log_message_fmt: Some(format!("test-{}-app-log-%s", suffix)),
        value_metric: Some(format!("test-{}-value-metric", suffix)),
        container_metric: Some(format!("test-{}-container-metric", suffix)),
        ..Default::default()
    };
    let config = get_test_config(topic);

    let stats = Arc::new(Stats::new());
    let mut producer = KafkaProducer::new(&config, stats.clone()).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    tx.send(log_message("app-42", "boot ok")).await.unwrap();
    tx.send(value_metric("latency", 12.0)).await.unwrap();
    tx.send(container_metric("svc-1", 12.5)).await.unwrap();
    drop(tx);

    producer.produce(CancellationToken::new(), rx).await;
    producer.close().await.unwrap();
    assert_eq!(stats.get(StatKind::Consume), 3);

    let topics = [
        format!("test-{}-app-log-app-42", suffix),
        format!("test-{}-value-metric", suffix),
        format!("test-{}-container-metric", suffix),
    ];
    let consumer = create_test_consumer(&config, &topics);

    let mut received: HashMap<String, Envelope> = HashMap::new();
    let timeout_duration = Duration::from_secs(15);
    let start = tokio::time::Instant::now();

    while received.len() < topics.len() && start.elapsed() < timeout_duration {
        if let Ok(Ok(message)) = timeout(Duration::from_secs(1), consumer.recv()).await {
            if let Some(payload) = message.payload() {
                let envelope: Envelope = serde_json::from_slice(payload).unwrap();
                info!(
                    topic = message.topic(),
                    event_type = %envelope.event_type(),
                    "Received record"
                );
                received.insert(message.topic().to_string(), envelope);
            }
        }
    }

    assert_eq!(received.len(), 3, "not all records arrived: {:?}", received.keys());

    match &received[&topics[0]].event {
        Event::LogMessage(message) => {
            assert_eq!(message.app_id, "app-42");
            assert_eq!(message.message, b"boot ok");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(received[&topics[1]].event_type(), EventType::ValueMetric);
    assert_eq!(received[&topics[2]].event_type(), EventType::ContainerMetric);
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored integration_test::test_unreachable_brokers
async fn test_unreachable_brokers() {
    let mut config = get_test_config(TopicConfig::default());
    config.brokers = vec!["127.0.0.1:1".to_string()];
    config.connect_timeout_ms = 1_000;

    let result = KafkaProducer::new(&config, Arc::new(Stats::new())).await;
    assert!(matches!(
        result,
        Err(kafka_firehose_nozzle::Error::Connection(_))
    ));
}

fn create_test_consumer(config: &KafkaConfig, topics: &[String]) -> StreamConsumer {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", config.brokers.join(","))
        .set("group.id", format!("nozzle-test-{}", std::process::id()))
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .create()
        .expect("Failed to create consumer");

    let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topics)
        .expect("Failed to subscribe to topics");

    consumer
}
