use bytes::Bytes;

use crate::firehose::{Envelope, EventType};
use crate::Result;

/// Deferred JSON encoding of an envelope.
///
/// The broker client calls [`encode`](JsonEncoder::encode) when it is ready
/// to transmit the record, not when the record is enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonEncoder {
    envelope: Envelope,
}

impl JsonEncoder {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn event_type(&self) -> EventType {
        self.envelope.event_type()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let buf = serde_json::to_vec(&self.envelope)?;
        Ok(Bytes::from(buf))
    }
}
