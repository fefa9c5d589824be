//! Asynchronous broker client.
//!
//! [`AsyncProducer`] accepts [`ProducerRecord`]s on a bounded input queue and
//! hands them, in queue order, to a [`Transport`]. A dispatcher task owns the
//! queue: it encodes each record when it is ready to submit it, tracks every
//! in-flight delivery, and reports the outcome on the success and error
//! streams. Retries happen inside the transport; a record reaches the error
//! stream only once the transport has given up on it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::serializer::JsonEncoder;
use crate::config::KafkaConfig;
use crate::firehose::EventType;
use crate::{Error, Result};

/// Pause before resubmitting when librdkafka's local queue is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// One record bound for Kafka.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub value: JsonEncoder,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: JsonEncoder) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.value.event_type()
    }
}

/// Where the broker stored an acknowledged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub topic: String,
    pub event_type: EventType,
    pub partition: i32,
    pub offset: i64,
}

/// A record the broker client could not deliver.
#[derive(Debug, thiserror::Error)]
#[error("failed to deliver {} record to topic '{}': {cause}", .record.event_type(), .record.topic)]
pub struct DeliveryError {
    pub record: ProducerRecord,
    #[source]
    pub cause: Error,
}

/// Resolves once the broker has acknowledged or finally rejected a record.
pub type PendingDelivery = BoxFuture<'static, Result<Delivered>>;

/// Outbound side of a broker connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues one encoded record for transmission.
    ///
    /// Returns once the record is queued. Records are transmitted in the
    /// order they were submitted.
    async fn submit(&self, topic: &str, key: Option<&str>, payload: Bytes)
        -> Result<PendingDelivery>;

    /// Blocks until every queued record has been transmitted or `timeout`
    /// elapses.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}

/// [`Transport`] backed by an rdkafka [`FutureProducer`].
#[derive(Clone)]
pub struct KafkaTransport {
    producer: FutureProducer,
}

impl KafkaTransport {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(Error::NoBrokers);
        }

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("acks", "all")
            .set("message.send.max.retries", config.retry_max().to_string())
            .set(
                "retry.backoff.ms",
                config.retry_backoff().as_millis().to_string(),
            )
            // Keyless records are spread over partitions one record at a time
            .set("partitioner", "consistent_random")
            .set("sticky.partitioning.linger.ms", "0")
            .set("compression.type", &config.compression);

        if let Some(linger_ms) = config.flush_frequency_ms {
            client_config.set("linger.ms", linger_ms.to_string());
        }

        let producer: FutureProducer = client_config.create()?;

        Ok(Self { producer })
    }

    /// Creates the transport and verifies that the cluster answers a metadata
    /// request within the configured connect timeout.
    pub async fn connect(config: &KafkaConfig) -> Result<Self> {
        let transport = Self::new(config)?;
        transport.check_brokers(config.connect_timeout()).await?;
        Ok(transport)
    }

    async fn check_brokers(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        let brokers = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| Error::Connection(format!("metadata task failed: {}", e)))?
        .map_err(|e| Error::Connection(format!("brokers are unreachable: {}", e)))?;

        info!(brokers, "Connected to Kafka cluster");
        Ok(())
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn submit(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Bytes,
    ) -> Result<PendingDelivery> {
        loop {
            let mut record: FutureRecord<'_, str, [u8]> =
                FutureRecord::to(topic).payload(&payload[..]);
            if let Some(key) = key {
                record = record.key(key);
            }

            let queued = match self.producer.send_result(record) {
                Ok(delivery) => Some(delivery),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => None,
                Err((e, _)) => return Err(Error::Kafka(e)),
            };

            match queued {
                Some(delivery) => {
                    return Ok(Box::pin(async move {
                        match delivery.await {
                            Ok(Ok((partition, offset))) => Ok(Delivered { partition, offset }),
                            Ok(Err((e, _))) => Err(Error::Kafka(e)),
                            Err(_) => Err(Error::Delivery {
                                message: "delivery canceled by the producer".to_string(),
                            }),
                        }
                    }));
                }
                None => {
                    debug!(topic, "Producer queue is full, backing off");
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| Error::Delivery {
                message: format!("flush task failed: {}", e),
            })??;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Capacity of the input queue; a full queue blocks the sender.
    pub queue_capacity: usize,
    /// Upper bound for draining the queue and for flushing on close.
    pub close_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            close_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            close_timeout: config.close_timeout(),
        }
    }
}

/// Sending half of a report stream, attached only once a caller takes the
/// receiving half.
struct Subscriber<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T> Subscriber<T> {
    fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<T>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a receiver for reports published from now on. A detached
    /// receiver is already at its end.
    fn subscribe(&self, attach: bool) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if attach {
            *self.slot() = Some(tx);
        }
        rx
    }

    /// Hands the report back when nobody is listening.
    fn publish(&self, report: T) -> std::result::Result<(), T> {
        match self.slot().as_ref() {
            Some(sender) => sender.send(report).map_err(|e| e.0),
            None => Err(report),
        }
    }

    fn detach(&self) {
        self.slot().take();
    }
}

struct Reports {
    successes: Subscriber<DeliveryAck>,
    errors: Subscriber<DeliveryError>,
}

impl Reports {
    fn detach(&self) {
        self.successes.detach();
        self.errors.detach();
    }
}

/// Asynchronous producer with an input queue, a success stream and an error
/// stream.
///
/// Reports are only kept for streams a caller has taken; acknowledgments and
/// failures nobody subscribed to are dropped as they happen. Taken streams are
/// unbounded, so a caller that takes one and never reads it keeps every
/// report in memory.
pub struct AsyncProducer {
    input: Option<mpsc::Sender<ProducerRecord>>,
    reports: Arc<Reports>,
    successes_taken: bool,
    errors_taken: bool,
    dispatcher: Option<JoinHandle<()>>,
    transport: Arc<dyn Transport>,
    close_timeout: Duration,
}

impl AsyncProducer {
    /// Spawns the dispatcher task. Must be called from within a Tokio runtime.
    pub fn new<T: Transport>(transport: T, options: ClientOptions) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let (input_tx, input_rx) = mpsc::channel(options.queue_capacity.max(1));
        let reports = Arc::new(Reports {
            successes: Subscriber::new(),
            errors: Subscriber::new(),
        });

        let dispatcher = tokio::spawn(dispatch(transport.clone(), input_rx, reports.clone()));

        Self {
            input: Some(input_tx),
            reports,
            successes_taken: false,
            errors_taken: false,
            dispatcher: Some(dispatcher),
            transport,
            close_timeout: options.close_timeout,
        }
    }

    /// Sender side of the input queue, `None` once the producer is closed.
    pub fn input(&self) -> Option<mpsc::Sender<ProducerRecord>> {
        self.input.clone()
    }

    /// Subscribes to acknowledgments of records delivered from now on.
    /// Only the first call returns a stream.
    pub fn take_successes(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryAck>> {
        if std::mem::replace(&mut self.successes_taken, true) {
            return None;
        }
        Some(self.reports.successes.subscribe(!self.is_closed()))
    }

    /// Subscribes to records that fail from now on. Only the first call
    /// returns a stream.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryError>> {
        if std::mem::replace(&mut self.errors_taken, true) {
            return None;
        }
        Some(self.reports.errors.subscribe(!self.is_closed()))
    }

    pub fn is_closed(&self) -> bool {
        self.input.is_none()
    }

    /// Stops accepting records, delivers everything still queued and flushes
    /// the transport. Both report streams end once this returns. Closing twice
    /// is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        drop(self.input.take());
        let Some(dispatcher) = self.dispatcher.take() else {
            return Ok(());
        };

        info!("Closing producer, draining queued records");
        let drained = tokio::time::timeout(self.close_timeout, dispatcher).await;
        self.reports.detach();
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::Delivery {
                    message: format!("dispatcher task failed: {}", e),
                })
            }
            Err(_) => {
                warn!(timeout = ?self.close_timeout, "Queued records were not drained in time");
                return Err(Error::Timeout {
                    message: "draining queued records".to_string(),
                });
            }
        }

        self.transport.flush(self.close_timeout).await?;
        info!("Producer closed");
        Ok(())
    }
}

type InFlight = BoxFuture<'static, (ProducerRecord, Result<Delivered>)>;

async fn dispatch(
    transport: Arc<dyn Transport>,
    mut input: mpsc::Receiver<ProducerRecord>,
    reports: Arc<Reports>,
) {
    let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();

    loop {
        tokio::select! {
            Some((record, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                report(record, outcome, &reports);
            }
            record = input.recv() => match record {
                Some(record) => match submit(transport.as_ref(), record).await {
                    Ok(pending) => in_flight.push(pending),
                    Err(e) => {
                        debug!(error = %e, "Record rejected before transmission");
                        report_error(e, &reports);
                    }
                },
                None => break,
            },
        }
    }

    debug!(
        in_flight = in_flight.len(),
        "Input queue closed, awaiting outstanding deliveries"
    );
    while let Some((record, outcome)) = in_flight.next().await {
        report(record, outcome, &reports);
    }
}

async fn submit(
    transport: &dyn Transport,
    record: ProducerRecord,
) -> std::result::Result<InFlight, DeliveryError> {
    let payload = match record.value.encode() {
        Ok(payload) => payload,
        Err(cause) => return Err(DeliveryError { record, cause }),
    };

    match transport
        .submit(&record.topic, record.key.as_deref(), payload)
        .await
    {
        Ok(pending) => Ok(Box::pin(async move {
            let outcome = pending.await;
            (record, outcome)
        })),
        Err(cause) => Err(DeliveryError { record, cause }),
    }
}

fn report(record: ProducerRecord, outcome: Result<Delivered>, reports: &Reports) {
    match outcome {
        Ok(delivered) => {
            // Unsubscribed acknowledgments are dropped
            let _ = reports.successes.publish(DeliveryAck {
                event_type: record.event_type(),
                topic: record.topic,
                partition: delivered.partition,
                offset: delivered.offset,
            });
        }
        Err(cause) => {
            debug!(topic = %record.topic, error = %cause, "Record delivery failed");
            report_error(DeliveryError { record, cause }, reports);
        }
    }
}

fn report_error(error: DeliveryError, reports: &Reports) {
    if let Err(error) = reports.errors.publish(error) {
        warn!(error = %error, "Dropping delivery error, nobody reads the error stream");
    }
}
