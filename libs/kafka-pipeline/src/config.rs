//! Kafka client configuration.
//!
//! One [`KafkaConfig`] describes a service's view of the messaging plane:
//! where the brokers are, which topic and consumer group it works, and how
//! aggressively failed messages are retried before they land in the DLQ.

use rdkafka::ClientConfig;
use std::time::Duration;

/// The shared policy event topic: 3 partitions, keyed by `policy_id`.
pub const EVENTS_TOPIC: &str = "auto.events";

/// Dead letter topic for messages the pipeline could not process.
pub const DLQ_TOPIC: &str = "auto.events.dlq";

/// Settings for Kafka clients
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Broker endpoints, comma-separated
    pub brokers: String,
    /// Consumer group id
    pub group_id: String,
    /// Topic to consume from / publish to
    pub topic: String,
    /// DLQ topic; `None` disables dead-lettering
    pub dlq_topic: Option<String>,
    /// Additional processing attempts after the first failure
    pub retry_attempts: u32,
    /// Delay between retry attempts
    pub retry_delay: Duration,
    /// Upper bound on a single handler invocation
    pub processing_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092,localhost:9093,localhost:9094".to_string(),
            group_id: String::new(),
            topic: EVENTS_TOPIC.to_string(),
            dlq_topic: Some(DLQ_TOPIC.to_string()),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(2),
            processing_timeout: Duration::from_secs(30),
        }
    }
}

impl KafkaConfig {
    /// Load configuration from environment variables, falling back to the
    /// given group id and the defaults above. Setting `KAFKA_DLQ_TOPIC` to an
    /// empty string disables dead-lettering.
    pub fn from_env(default_group_id: &str) -> Self {
        let defaults = Self::default();
        let dlq_topic = match std::env::var("KAFKA_DLQ_TOPIC") {
            Ok(topic) if topic.is_empty() => None,
            Ok(topic) => Some(topic),
            Err(_) => defaults.dlq_topic,
        };

        Self {
            brokers: std::env::var("KAFKA_BROKERS").unwrap_or(defaults.brokers),
            group_id: std::env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| default_group_id.to_string()),
            topic: std::env::var("KAFKA_TOPIC").unwrap_or(defaults.topic),
            dlq_topic,
            retry_attempts: env_or("KAFKA_RETRY_ATTEMPTS", defaults.retry_attempts),
            retry_delay: Duration::from_millis(env_or(
                "KAFKA_RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )),
            processing_timeout: Duration::from_millis(env_or(
                "KAFKA_PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout.as_millis() as u64,
            )),
        }
    }

    /// Client settings for the transactional event producer.
    ///
    /// Idempotence plus `acks=all` means a delivery ack implies every in-sync
    /// replica has the message exactly once, so the producer can commit its
    /// database transaction on the strength of the ack alone.
    pub fn producer_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.send.max.retries", "5")
            .set("max.in.flight.requests.per.connection", "5")
            .set("partitioner", "murmur2_random")
            .set("compression.type", "snappy")
            .set("message.timeout.ms", "30000");
        config
    }

    /// Client settings for the DLQ producer. Plain delivery semantics; the
    /// caller awaits each send to completion.
    pub fn dlq_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "5000");
        config
    }

    /// Client settings for the consumer group.
    ///
    /// Offsets are stored manually after each message and flushed by the
    /// client's background commit; the framework never commits ahead of
    /// processing.
    pub fn consumer_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.commit.interval.ms", "5000")
            .set("auto.offset.reset", "latest")
            .set("partition.assignment.strategy", "roundrobin")
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.partition.eof", "false");
        config
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
