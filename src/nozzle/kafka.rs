use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::{never, AckStream, ErrorStream, NozzleProducer};
use crate::config::KafkaConfig;
use crate::firehose::Envelope;
use crate::kafka::{
    AsyncProducer, ClientOptions, JsonEncoder, KafkaTransport, ProducerRecord, TopicKind,
    TopicResolver, Transport,
};
use crate::stats::{StatKind, Stats};
use crate::{Error, Result};

/// Producer that forwards log messages, value metrics and container metrics
/// to Kafka.
pub struct KafkaProducer {
    client: AsyncProducer,
    topics: TopicResolver,
    stats: Arc<Stats>,
    span: Span,
}

impl KafkaProducer {
    /// Connects to the configured brokers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBrokers`] when no broker is configured and
    /// [`Error::Connection`] when the cluster does not answer within the
    /// connect timeout.
    pub async fn new(config: &KafkaConfig, stats: Arc<Stats>) -> Result<Self> {
        let transport = KafkaTransport::connect(config).await?;
        Self::with_transport(config, transport, stats)
    }

    /// Builds the producer on top of an already established transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBrokers`] when no broker is configured.
    pub fn with_transport<T: Transport>(
        config: &KafkaConfig,
        transport: T,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(Error::NoBrokers);
        }

        let span = info_span!("kafka_producer", brokers = %config.brokers.join(","));
        let topics = TopicResolver::new(&config.topic);

        span.in_scope(|| {
            let ignored = config.topic.unforwarded();
            if !ignored.is_empty() {
                warn!(
                    settings = ?ignored,
                    "Topics are configured for event types that are never forwarded"
                );
            }
            info!(
                retry_max = config.retry_max(),
                retry_backoff_ms = config.retry_backoff().as_millis() as u64,
                log_message_topic = %topics.log_message_topic("<app-id>"),
                value_metric_topic = %topics.value_metric_topic(),
                container_metric_topic = %topics.container_metric_topic("<app-id>"),
                "Kafka producer configured"
            );
        });

        Ok(Self {
            client: AsyncProducer::new(transport, ClientOptions::from_config(config)),
            topics,
            stats,
            span,
        })
    }

    /// Maps an envelope to its record, or `None` for dropped event types.
    fn route(&self, envelope: Envelope) -> Option<ProducerRecord> {
        let (kind, app_id) = TopicKind::route(&envelope)?;
        let topic = self.topics.resolve(kind, app_id);
        Some(ProducerRecord::new(topic, JsonEncoder::new(envelope)))
    }

    async fn run(&self, cancel: CancellationToken, mut events: mpsc::Receiver<Envelope>) {
        let Some(input) = self.client.input() else {
            warn!("Producer is closed, not consuming events");
            return;
        };

        info!("Start loop to watch events");
        loop {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stop kafka producer");
                    return;
                }
                event = events.recv() => match event {
                    Some(envelope) => envelope,
                    None => {
                        warn!("Nozzle consumer event channel is closed");
                        return;
                    }
                },
            };

            let event_type = envelope.event_type();
            let Some(record) = self.route(envelope) else {
                continue;
            };
            debug!(%event_type, topic = %record.topic, "Enqueue record");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stop kafka producer");
                    return;
                }
                sent = input.send(record) => {
                    if sent.is_err() {
                        error!("Producer input queue is closed");
                        return;
                    }
                    // Only records handed to the broker client count as consumed
                    self.stats.inc(StatKind::Consume);
                }
            }
        }
    }
}

#[async_trait]
impl NozzleProducer for KafkaProducer {
    async fn produce(&self, cancel: CancellationToken, events: mpsc::Receiver<Envelope>) {
        self.run(cancel, events).instrument(self.span.clone()).await
    }

    fn errors(&mut self) -> ErrorStream {
        match self.client.take_errors() {
            Some(errors) => UnboundedReceiverStream::new(errors).boxed(),
            None => never(),
        }
    }

    fn successes(&mut self) -> AckStream {
        match self.client.take_successes() {
            Some(successes) => UnboundedReceiverStream::new(successes).boxed(),
            None => never(),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.client.close().instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::firehose::{
        ContainerMetric, CounterEvent, ErrorEvent, Event, HttpStart, HttpStartStop, HttpStop,
        LogMessage, MessageType, PeerType, ValueMetric,
    };
    use crate::kafka::{Delivered, PendingDelivery};
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(String, Bytes)>>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn submit(
            &self,
            topic: &str,
            _key: Option<&str>,
            payload: Bytes,
        ) -> Result<PendingDelivery> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(Box::pin(async { Ok(Delivered { partition: 0, offset: 0 }) }))
        }

        async fn flush(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn config(topic: TopicConfig) -> KafkaConfig {
        KafkaConfig {
            brokers: vec!["memory".to_string()],
            topic,
            retry_max: None,
            retry_backoff_ms: None,
            flush_frequency_ms: None,
            compression: "none".to_string(),
            queue_capacity: 1,
            connect_timeout_ms: 1_000,
            close_timeout_ms: 1_000,
        }
    }

    fn log_message(app_id: &str) -> Envelope {
        Envelope::new(
            "rep",
            Event::LogMessage(LogMessage {
                message: b"boot ok".to_vec(),
                message_type: MessageType::Out,
                timestamp: 1,
                app_id: app_id.to_string(),
                source_type: None,
                source_instance: None,
            }),
        )
    }

    fn value_metric() -> Envelope {
        Envelope::new(
            "router",
            Event::ValueMetric(ValueMetric {
                name: "latency".to_string(),
                value: 1.0,
                unit: "ms".to_string(),
            }),
        )
    }

    fn container_metric(app_id: &str) -> Envelope {
        Envelope::new(
            "rep",
            Event::ContainerMetric(ContainerMetric {
                application_id: app_id.to_string(),
                instance_index: 0,
                cpu_percentage: 12.5,
                memory_bytes: 1,
                disk_bytes: 1,
                memory_bytes_quota: None,
                disk_bytes_quota: None,
            }),
        )
    }

    fn dropped_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::new(
                "gorouter",
                Event::HttpStart(HttpStart {
                    timestamp: 1,
                    request_id: "r1".to_string(),
                    peer_type: PeerType::Client,
                    method: "GET".to_string(),
                    uri: "/".to_string(),
                    remote_address: "10.0.0.1".to_string(),
                    user_agent: "curl".to_string(),
                    application_id: Some("app".to_string()),
                    instance_index: None,
                    instance_id: None,
                }),
            ),
            Envelope::new(
                "gorouter",
                Event::HttpStop(HttpStop {
                    timestamp: 2,
                    uri: "/".to_string(),
                    request_id: "r1".to_string(),
                    peer_type: PeerType::Client,
                    status_code: 200,
                    content_length: 10,
                    application_id: None,
                }),
            ),
            Envelope::new(
                "gorouter",
                Event::HttpStartStop(HttpStartStop {
                    start_timestamp: 1,
                    stop_timestamp: 2,
                    request_id: "r1".to_string(),
                    peer_type: PeerType::Server,
                    method: "GET".to_string(),
                    uri: "/".to_string(),
                    remote_address: "10.0.0.1".to_string(),
                    user_agent: "curl".to_string(),
                    status_code: 200,
                    content_length: 10,
                    application_id: None,
                    instance_index: None,
                    instance_id: None,
                    forwarded: Vec::new(),
                }),
            ),
            Envelope::new(
                "doppler",
                Event::CounterEvent(CounterEvent {
                    name: "dropped".to_string(),
                    delta: 1,
                    total: 10,
                }),
            ),
            Envelope::new(
                "doppler",
                Event::Error(ErrorEvent {
                    source: "doppler".to_string(),
                    code: 1,
                    message: "boom".to_string(),
                }),
            ),
        ]
    }

    fn producer(
        topic: TopicConfig,
        transport: RecordingTransport,
    ) -> (KafkaProducer, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        let producer =
            KafkaProducer::with_transport(&config(topic), transport, stats.clone()).unwrap();
        (producer, stats)
    }

    #[tokio::test]
    async fn test_route_topics() {
        let topic = TopicConfig {
            log_message_fmt: Some("app-log-%s".to_string()),
            container_metric: Some("container-metric".to_string()),
            ..Default::default()
        };
        let (producer, stats) = producer(topic, RecordingTransport::default());

        let record = producer.route(log_message("abc")).unwrap();
        assert_eq!(record.topic, "app-log-abc");

        let record = producer.route(container_metric("svc-1")).unwrap();
        assert_eq!(record.topic, "container-metric");

        let record = producer.route(value_metric()).unwrap();
        assert_eq!(record.topic, "value-metric");

        // Counted once enqueued, not when routed
        assert_eq!(stats.get(StatKind::Consume), 0);
    }

    #[tokio::test]
    async fn test_enqueued_records_are_counted() {
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        let (mut producer, stats) = producer(TopicConfig::default(), transport);

        let (tx, rx) = mpsc::channel(8);
        tx.send(value_metric()).await.unwrap();
        tx.send(log_message("abc")).await.unwrap();
        drop(tx);

        producer.produce(CancellationToken::new(), rx).await;
        producer.close().await.unwrap();

        assert_eq!(stats.get(StatKind::Consume), 2);
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_events_are_not_counted() {
        let (producer, stats) = producer(TopicConfig::default(), RecordingTransport::default());

        for envelope in dropped_envelopes() {
            assert!(producer.route(envelope).is_none());
        }
        assert_eq!(stats.get(StatKind::Consume), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_consuming() {
        let transport = RecordingTransport::default();
        let sent = transport.sent.clone();
        let (mut producer, stats) = producer(TopicConfig::default(), transport);

        let (tx, rx) = mpsc::channel(8);
        for _ in 0..5 {
            tx.send(value_metric()).await.unwrap();
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        producer.produce(cancel, rx).await;
        producer.close().await.unwrap();

        assert_eq!(stats.get(StatKind::Consume), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_input_queue_is_full() {
        let gate = Arc::new(Notify::new());
        let transport = RecordingTransport {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let (producer, stats) = producer(TopicConfig::default(), transport);
        let producer = Arc::new(producer);

        let (tx, rx) = mpsc::channel(16);
        for _ in 0..10 {
            tx.send(value_metric()).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = {
            let producer = producer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { producer.produce(cancel, rx).await })
        };

        // The transport never accepts a record, so the loop stalls on the
        // bounded input queue until it is cancelled.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("produce did not return after cancellation")
            .unwrap();

        // One record held by the dispatcher and one in the queue; the record
        // whose send was cancelled is not counted.
        assert_eq!(stats.get(StatKind::Consume), 2);
        drop(tx);
    }

    #[tokio::test]
    async fn test_errors_stream_handed_over_once() {
        let (mut producer, _) = producer(TopicConfig::default(), RecordingTransport::default());

        let _errors = producer.errors();
        let mut second = producer.errors();

        let next = tokio::time::timeout(Duration::from_millis(20), second.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (mut producer, _) = producer(TopicConfig::default(), RecordingTransport::default());

        producer.close().await.unwrap();
        producer.close().await.unwrap();

        // Consuming after close returns immediately
        let (_tx, rx) = mpsc::channel(1);
        producer.produce(CancellationToken::new(), rx).await;
    }

    #[tokio::test]
    async fn test_new_without_brokers() {
        let mut config = config(TopicConfig::default());
        config.brokers.clear();

        let result = KafkaProducer::new(&config, Arc::new(Stats::new())).await;
        assert!(matches!(result, Err(Error::NoBrokers)));
    }

    #[tokio::test]
    async fn test_with_transport_without_brokers() {
        let mut config = config(TopicConfig::default());
        config.brokers.clear();

        let result = KafkaProducer::with_transport(
            &config,
            RecordingTransport::default(),
            Arc::new(Stats::new()),
        );
        assert!(matches!(result, Err(Error::NoBrokers)));
    }
}
