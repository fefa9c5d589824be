use crate::config::TopicConfig;
use crate::firehose::{Envelope, Event};

pub const DEFAULT_LOG_MESSAGE_TOPIC: &str = "log-message";
pub const DEFAULT_VALUE_METRIC_TOPIC: &str = "value-metric";
pub const DEFAULT_CONTAINER_METRIC_TOPIC: &str = "container-metric";

/// Placeholder replaced with the application id in topic templates.
const APP_ID_PLACEHOLDER: &str = "%s";

/// Event kinds that are forwarded to Kafka.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    LogMessage,
    ValueMetric,
    ContainerMetric,
}

impl TopicKind {
    /// Returns the topic kind and application id for forwarded envelopes,
    /// `None` for the kinds that are dropped.
    pub fn route(envelope: &Envelope) -> Option<(TopicKind, Option<&str>)> {
        match &envelope.event {
            Event::LogMessage(m) => Some((TopicKind::LogMessage, Some(m.app_id.as_str()))),
            Event::ValueMetric(_) => Some((TopicKind::ValueMetric, None)),
            Event::ContainerMetric(m) => {
                Some((TopicKind::ContainerMetric, Some(m.application_id.as_str())))
            }
            Event::HttpStart(_)
            | Event::HttpStop(_)
            | Event::HttpStartStop(_)
            | Event::CounterEvent(_)
            | Event::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TopicRule {
    name: String,
    template: Option<String>,
}

impl TopicRule {
    fn new(name: Option<&String>, template: Option<&String>, default: &str) -> Self {
        Self {
            name: non_empty(name).unwrap_or(default).to_string(),
            template: non_empty(template).map(str::to_string),
        }
    }

    fn render(&self, app_id: Option<&str>) -> String {
        if let Some(template) = &self.template {
            let rendered = template.replacen(APP_ID_PLACEHOLDER, app_id.unwrap_or(""), 1);
            if !rendered.is_empty() {
                return rendered;
            }
        }
        self.name.clone()
    }
}

/// Resolves destination topics from a snapshot of the topic configuration.
///
/// Templates take precedence over static names, and static names over the
/// compiled-in defaults. The application id is substituted verbatim, so a
/// placeholder inside an id is never expanded again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicResolver {
    log_message: TopicRule,
    value_metric: TopicRule,
    container_metric: TopicRule,
}

impl TopicResolver {
    pub fn new(config: &TopicConfig) -> Self {
        Self {
            log_message: TopicRule::new(
                config.log_message.as_ref(),
                config.log_message_fmt.as_ref(),
                DEFAULT_LOG_MESSAGE_TOPIC,
            ),
            value_metric: TopicRule::new(
                config.value_metric.as_ref(),
                None,
                DEFAULT_VALUE_METRIC_TOPIC,
            ),
            container_metric: TopicRule::new(
                config.container_metric.as_ref(),
                config.container_metric_fmt.as_ref(),
                DEFAULT_CONTAINER_METRIC_TOPIC,
            ),
        }
    }

    pub fn resolve(&self, kind: TopicKind, app_id: Option<&str>) -> String {
        match kind {
            TopicKind::LogMessage => self.log_message.render(app_id),
            TopicKind::ValueMetric => self.value_metric.render(None),
            TopicKind::ContainerMetric => self.container_metric.render(app_id),
        }
    }

    pub fn log_message_topic(&self, app_id: &str) -> String {
        self.resolve(TopicKind::LogMessage, Some(app_id))
    }

    pub fn value_metric_topic(&self) -> String {
        self.resolve(TopicKind::ValueMetric, None)
    }

    pub fn container_metric_topic(&self, app_id: &str) -> String {
        self.resolve(TopicKind::ContainerMetric, Some(app_id))
    }
}

impl Default for TopicResolver {
    fn default() -> Self {
        Self::new(&TopicConfig::default())
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.is_empty())
}
