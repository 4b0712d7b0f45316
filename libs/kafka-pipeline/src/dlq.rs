//! Dead Letter Queue support.
//!
//! Messages that fail processing after retry exhaustion, or fail with a
//! non-retryable error, are forwarded verbatim to the DLQ topic together
//! with their origin coordinates and the error text. The DLQ record keeps
//! the original key, so downstream tooling can still route by policy.

use crate::config::KafkaConfig;
use crate::consumer::ReceivedMessage;
use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// DLQ record format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub original_key: String,
    pub original_value: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl DlqMessage {
    /// Capture a failed message. The payload is carried verbatim (lossily
    /// decoded to UTF-8), so the record stays inspectable even when the
    /// failure was a malformed payload.
    pub fn from_failure(message: &ReceivedMessage, error: &PipelineError) -> Self {
        Self {
            original_topic: message.topic.clone(),
            original_partition: message.partition,
            original_offset: message.offset,
            original_key: String::from_utf8_lossy(message.key.as_deref().unwrap_or_default())
                .into_owned(),
            original_value: String::from_utf8_lossy(&message.payload).into_owned(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Producer for the DLQ topic; every send is awaited to completion.
pub struct DlqProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl DlqProducer {
    pub fn new(config: &KafkaConfig, topic: String) -> PipelineResult<Self> {
        let producer: FutureProducer = config.dlq_client_config().create()?;

        Ok(Self {
            producer,
            topic,
            timeout: Duration::from_secs(5),
        })
    }

    /// Forward a failed message to the DLQ, keyed by the original key.
    pub async fn forward(
        &self,
        message: &ReceivedMessage,
        error: &PipelineError,
    ) -> PipelineResult<()> {
        let record = DlqMessage::from_failure(message, error);
        let payload = serde_json::to_vec(&record)?;
        let key = message.key.clone().unwrap_or_default();

        let (partition, offset) = self
            .producer
            .send(
                FutureRecord::to(&self.topic).key(&key).payload(&payload),
                self.timeout,
            )
            .await
            .map_err(|(err, _)| PipelineError::Kafka(err))?;

        debug!(
            dlq_topic = %self.topic,
            partition,
            offset,
            original_topic = %record.original_topic,
            original_offset = record.original_offset,
            "Message forwarded to DLQ"
        );

        Ok(())
    }
}
