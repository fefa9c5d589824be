use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry count applied when `retry_max` is unset or zero.
pub const DEFAULT_RETRY_MAX: u32 = 5;

/// Backoff applied when `retry_backoff_ms` is unset or zero.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub nozzle: NozzleConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub topic: TopicConfig,
    #[serde(default)]
    pub retry_max: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    /// Maps onto `linger.ms`; unset leaves librdkafka's default.
    #[serde(default)]
    pub flush_frequency_ms: Option<u64>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

/// Topic names and per-application templates, one pair per event kind.
///
/// Templates take a single `%s` placeholder which is replaced with the
/// application id. Empty strings are treated the same as unset values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TopicConfig {
    pub log_message: Option<String>,
    pub log_message_fmt: Option<String>,
    pub value_metric: Option<String>,
    pub container_metric: Option<String>,
    pub container_metric_fmt: Option<String>,
    pub http_start: Option<String>,
    pub http_start_fmt: Option<String>,
    pub http_stop: Option<String>,
    pub http_stop_fmt: Option<String>,
    pub http_start_stop: Option<String>,
    pub http_start_stop_fmt: Option<String>,
    pub counter_event: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NozzleConfig {
    /// Log envelopes instead of producing them to Kafka.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for NozzleConfig {
    fn default() -> Self {
        Self {
            debug: false,
            event_buffer: default_event_buffer(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("NOZZLE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}

impl KafkaConfig {
    pub fn retry_max(&self) -> u32 {
        self.retry_max
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_RETRY_MAX)
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_BACKOFF)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl TopicConfig {
    /// Names of the configured topic settings whose event kinds are never
    /// forwarded.
    pub fn unforwarded(&self) -> Vec<&'static str> {
        [
            ("http_start", &self.http_start),
            ("http_start_fmt", &self.http_start_fmt),
            ("http_stop", &self.http_stop),
            ("http_stop_fmt", &self.http_stop_fmt),
            ("http_start_stop", &self.http_start_stop),
            ("http_start_stop_fmt", &self.http_start_stop_fmt),
            ("counter_event", &self.counter_event),
            ("error", &self.error),
        ]
        .into_iter()
        .filter(|(_, value)| value.as_deref().is_some_and(|v| !v.is_empty()))
        .map(|(name, _)| name)
        .collect()
    }
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_close_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_stats_interval_secs() -> u64 {
    60
}
