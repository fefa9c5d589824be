use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// Envelope accepted for forwarding.
    Consume,
    /// Upstream input that could not be decoded.
    ConsumeFail,
    /// Record acknowledged by the broker.
    Publish,
    /// Record the broker client gave up on.
    PublishFail,
}

/// Process-wide event counters.
#[derive(Debug, Default)]
pub struct Stats {
    consume: AtomicU64,
    consume_fail: AtomicU64,
    publish: AtomicU64,
    publish_fail: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub consume: u64,
    pub consume_fail: u64,
    pub publish: u64,
    pub publish_fail: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, kind: StatKind) {
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: StatKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consume: self.get(StatKind::Consume),
            consume_fail: self.get(StatKind::ConsumeFail),
            publish: self.get(StatKind::Publish),
            publish_fail: self.get(StatKind::PublishFail),
        }
    }

    fn counter(&self, kind: StatKind) -> &AtomicU64 {
        match kind {
            StatKind::Consume => &self.consume,
            StatKind::ConsumeFail => &self.consume_fail,
            StatKind::Publish => &self.publish,
            StatKind::PublishFail => &self.publish_fail,
        }
    }
}

impl StatsSnapshot {
    /// Records consumed but neither acknowledged nor failed yet.
    pub fn in_flight(&self) -> u64 {
        self.consume
            .saturating_sub(self.publish)
            .saturating_sub(self.publish_fail)
    }
}
