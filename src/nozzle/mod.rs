//! Producer abstraction shared by the Kafka-backed and debug producers.
//!
//! A [`NozzleProducer`] consumes envelopes from a channel until the channel
//! closes or the cancellation token fires. Individual delivery failures never
//! stop the loop; they surface on the stream returned by
//! [`errors`](NozzleProducer::errors).

pub mod kafka;
pub mod log;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::firehose::Envelope;
use crate::kafka::{DeliveryAck, DeliveryError};
use crate::stats::Stats;
use crate::{Config, Result};

pub use self::kafka::KafkaProducer;
pub use self::log::LogProducer;

pub type ErrorStream = BoxStream<'static, DeliveryError>;
pub type AckStream = BoxStream<'static, DeliveryAck>;

#[async_trait]
pub trait NozzleProducer: Send + Sync {
    /// Consumes `events` until the channel is closed or `cancel` fires.
    ///
    /// Cancellation returns immediately without draining buffered envelopes.
    async fn produce(&self, cancel: CancellationToken, events: mpsc::Receiver<Envelope>);

    /// Stream of records that could not be delivered.
    ///
    /// The first call hands over the live stream; any later call returns a
    /// stream that never yields. Failures before the first call are not kept.
    fn errors(&mut self) -> ErrorStream;

    /// Stream of acknowledged records, with the same hand-over rules as
    /// [`errors`](NozzleProducer::errors).
    fn successes(&mut self) -> AckStream {
        never()
    }

    /// Releases the broker client after delivering anything still buffered.
    async fn close(&mut self) -> Result<()>;
}

/// Builds the producer selected by the configuration.
pub async fn build(config: &Config, stats: Arc<Stats>) -> Result<Box<dyn NozzleProducer>> {
    if config.nozzle.debug {
        return Ok(Box::new(LogProducer::new()));
    }

    let producer = KafkaProducer::new(&config.kafka, stats).await?;
    Ok(Box::new(producer))
}

pub(crate) fn never<T: Send + 'static>() -> BoxStream<'static, T> {
    stream::pending().boxed()
}
