#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use kafka_firehose_nozzle::config::{KafkaConfig, TopicConfig};
use kafka_firehose_nozzle::firehose::{
    ContainerMetric, Envelope, Event, HttpStart, LogMessage, MessageType, PeerType, ValueMetric,
};
use kafka_firehose_nozzle::kafka::{Delivered, PendingDelivery, Transport};
use kafka_firehose_nozzle::{Error, Result};
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Get test configuration from environment variables
pub fn get_test_config(topic: TopicConfig) -> KafkaConfig {
    KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        topic,
        retry_max: Some(3),
        retry_backoff_ms: Some(50),
        flush_frequency_ms: Some(0), // Immediate sending for tests
        compression: "none".to_string(),
        queue_capacity: 16,
        connect_timeout_ms: 5_000,
        close_timeout_ms: 10_000,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub topic: String,
    pub payload: Bytes,
}

impl SentRecord {
    pub fn envelope(&self) -> Envelope {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

/// In-memory transport recording every submitted record.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    pub sent: Arc<Mutex<Vec<SentRecord>>>,
    pub reject_topic: Option<String>,
}

impl MemoryTransport {
    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn submit(
        &self,
        topic: &str,
        _key: Option<&str>,
        payload: Bytes,
    ) -> Result<PendingDelivery> {
        if self.reject_topic.as_deref() == Some(topic) {
            return Err(Error::Delivery {
                message: format!("topic {} is not writable", topic),
            });
        }

        let offset = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(SentRecord {
                topic: topic.to_string(),
                payload,
            });
            sent.len() as i64 - 1
        };
        Ok(Box::pin(async move { Ok(Delivered { partition: 0, offset }) }))
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

pub fn log_message(app_id: &str, message: &str) -> Envelope {
    Envelope::new(
        "rep",
        Event::LogMessage(LogMessage {
            message: message.as_bytes().to_vec(),
            message_type: MessageType::Out,
            timestamp: 1_700_000_000_000_000_000,
            app_id: app_id.to_string(),
            source_type: Some("APP/PROC/WEB".to_string()),
            source_instance: Some("0".to_string()),
        }),
    )
    .with_timestamp(1_700_000_000_000_000_000)
}

pub fn value_metric(name: &str, value: f64) -> Envelope {
    Envelope::new(
        "gorouter",
        Event::ValueMetric(ValueMetric {
            name: name.to_string(),
            value,
            unit: "ms".to_string(),
        }),
    )
}

pub fn container_metric(app_id: &str, cpu_percentage: f64) -> Envelope {
    Envelope::new(
        "rep",
        Event::ContainerMetric(ContainerMetric {
            application_id: app_id.to_string(),
            instance_index: 0,
            cpu_percentage,
            memory_bytes: 64 * 1024 * 1024,
            disk_bytes: 128 * 1024 * 1024,
            memory_bytes_quota: Some(256 * 1024 * 1024),
            disk_bytes_quota: None,
        }),
    )
}

pub fn http_start() -> Envelope {
    Envelope::new(
        "gorouter",
        Event::HttpStart(HttpStart {
            timestamp: 1,
            request_id: "req-1".to_string(),
            peer_type: PeerType::Client,
            method: "GET".to_string(),
            uri: "/health".to_string(),
            remote_address: "10.0.0.1:5555".to_string(),
            user_agent: "curl/8.0".to_string(),
            application_id: Some("app-42".to_string()),
            instance_index: None,
            instance_id: None,
        }),
    )
}
