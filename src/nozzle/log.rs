use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument, Span};

use super::{never, ErrorStream, NozzleProducer};
use crate::firehose::Envelope;
use crate::Result;

/// Target used for the logged envelopes.
pub const EVENT_LOG_TARGET: &str = "nozzle::firehose";

/// Producer that writes every envelope to the log instead of Kafka.
///
/// Meant for running the nozzle without a broker.
pub struct LogProducer {
    span: Span,
}

impl LogProducer {
    pub fn new() -> Self {
        Self {
            span: info_span!("log_producer"),
        }
    }

    fn write(&self, envelope: &Envelope) {
        let event_type = envelope.event_type();
        let at = envelope
            .timestamp
            .map(DateTime::<Utc>::from_timestamp_nanos)
            .map(|ts| ts.to_rfc3339());

        match serde_json::to_string(envelope) {
            Ok(json) => info!(
                target: EVENT_LOG_TARGET,
                origin = %envelope.origin,
                %event_type,
                at = at.as_deref().unwrap_or("-"),
                "{}",
                json
            ),
            Err(e) => warn!(%event_type, error = %e, "Failed to encode envelope"),
        }
    }

    async fn run(&self, cancel: CancellationToken, mut events: mpsc::Receiver<Envelope>) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(envelope) => self.write(&envelope),
                    None => {
                        warn!("Nozzle consumer event channel is closed");
                        return;
                    }
                },
            }
        }
    }
}

impl Default for LogProducer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NozzleProducer for LogProducer {
    async fn produce(&self, cancel: CancellationToken, events: mpsc::Receiver<Envelope>) {
        self.run(cancel, events).instrument(self.span.clone()).await
    }

    fn errors(&mut self) -> ErrorStream {
        never()
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
