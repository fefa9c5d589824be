use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::firehose::source;
use crate::nozzle::{self, AckStream, ErrorStream, NozzleProducer};
use crate::stats::{StatKind, Stats, StatsSnapshot};
use crate::{Config, Result};

/// Wires an envelope source to the configured producer and runs it until the
/// source is exhausted or shutdown is requested.
pub struct Relay {
    config: Config,
    stats: Arc<Stats>,
}

impl Relay {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stats: Arc::new(Stats::new()),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Builds the producer selected by the configuration and runs it.
    ///
    /// Producer construction errors are returned before any envelope is read.
    pub async fn run<R>(&self, reader: R, shutdown: CancellationToken) -> Result<StatsSnapshot>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let producer = nozzle::build(&self.config, self.stats.clone()).await?;
        self.run_with(producer, reader, shutdown).await
    }

    pub async fn run_with<R>(
        &self,
        mut producer: Box<dyn NozzleProducer>,
        reader: R,
        shutdown: CancellationToken,
    ) -> Result<StatsSnapshot>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        info!("Relay starting");

        let (tx, rx) = mpsc::channel(self.config.nozzle.event_buffer.max(1));
        let source = tokio::spawn(source::forward(reader, tx, self.stats.clone()));

        let reporter_done = CancellationToken::new();
        let reporter = tokio::spawn(report_deliveries(
            producer.errors(),
            producer.successes(),
            self.stats.clone(),
            self.stats_interval(),
            reporter_done.clone(),
        ));

        producer.produce(shutdown, rx).await;
        let closed = producer.close().await;

        reporter_done.cancel();
        if let Err(e) = reporter.await {
            warn!(error = %e, "Delivery reporter failed");
        }

        // The source may still be blocked on its reader after a shutdown.
        source.abort();
        match source.await {
            Ok(Ok(forwarded)) => debug!(forwarded, "Event source finished"),
            Ok(Err(e)) => warn!(error = %e, "Event source failed"),
            Err(e) if e.is_cancelled() => debug!("Event source stopped"),
            Err(e) => warn!(error = %e, "Event source task failed"),
        }

        let snapshot = self.stats.snapshot();
        info!(
            consume = snapshot.consume,
            consume_fail = snapshot.consume_fail,
            publish = snapshot.publish,
            publish_fail = snapshot.publish_fail,
            "Relay stopped"
        );

        closed?;
        Ok(snapshot)
    }

    fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.config.nozzle.stats_interval_secs.max(1))
    }
}

/// Counts delivery outcomes and logs periodic stats until `done` fires.
///
/// Reports already buffered on the streams are drained before `done` is
/// honoured.
async fn report_deliveries(
    mut errors: ErrorStream,
    mut successes: AckStream,
    stats: Arc<Stats>,
    period: Duration,
    done: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;
            Some(e) = errors.next() => {
                stats.inc(StatKind::PublishFail);
                warn!(
                    topic = %e.record.topic,
                    event_type = %e.record.event_type(),
                    error = %e.cause,
                    "Failed to deliver record"
                );
            }
            Some(ack) = successes.next() => {
                stats.inc(StatKind::Publish);
                trace!(
                    topic = %ack.topic,
                    partition = ack.partition,
                    offset = ack.offset,
                    "Record delivered"
                );
            }
            _ = done.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                info!(
                    consume = snapshot.consume,
                    consume_fail = snapshot.consume_fail,
                    publish = snapshot.publish,
                    publish_fail = snapshot.publish_fail,
                    in_flight = snapshot.in_flight(),
                    "Nozzle stats"
                );
            }
        }
    }
}
