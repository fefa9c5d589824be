//! Line-delimited JSON envelope source.
//!
//! Stands in for a live firehose subscription: each non-blank line of the
//! reader is decoded as one [`Envelope`] and pushed onto the event channel.
//! The channel is closed when the reader reaches EOF, which in turn ends the
//! producer's consume loop.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Envelope;
use crate::stats::{StatKind, Stats};
use crate::Result;

/// Forwards every decodable line of `reader` to `tx` until EOF or until the
/// receiving side is dropped.
///
/// Lines that fail to decode are logged, counted as `ConsumeFail` and skipped.
/// Returns the number of envelopes forwarded.
pub async fn forward<R>(reader: R, tx: mpsc::Sender<Envelope>, stats: Arc<Stats>) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    // Raw segments, so a line that is not UTF-8 fails to decode like any
    // other malformed line instead of ending the stream.
    let mut lines = reader.split(b'\n');
    let mut line_no: u64 = 0;
    let mut forwarded: u64 = 0;

    while let Some(line) = lines.next_segment().await? {
        line_no += 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let envelope = match serde_json::from_slice::<Envelope>(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(line = line_no, error = %e, "Failed to decode envelope");
                stats.inc(StatKind::ConsumeFail);
                continue;
            }
        };

        if tx.send(envelope).await.is_err() {
            debug!("Event channel receiver dropped, stop reading source");
            return Ok(forwarded);
        }
        forwarded += 1;
    }

    info!(forwarded, "Event source reached end of input");
    Ok(forwarded)
}
