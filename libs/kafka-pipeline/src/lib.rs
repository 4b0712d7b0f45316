//! Messaging plane for the insurance policy pipeline.
//!
//! This crate owns the exactly-once discipline between the HTTP gateway, the
//! Kafka log and the consumer services:
//!
//! - [`producer::EventPublisher`] couples a ledger insert with the broker
//!   delivery ack inside one database transaction,
//! - [`consumer::EventConsumer`] drains a topic through a composable
//!   middleware chain and stores offsets only after a message is handled or
//!   dead-lettered,
//! - [`middleware`] provides the standard logging / metrics / retry stages,
//! - [`dlq`] forwards poison messages to the dead letter topic.
//!
//! Delivery from the broker is at-least-once; handlers are required to be
//! idempotent with respect to the envelope id for the pipeline to be
//! exactly-once in effect.

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod producer;

pub use config::{KafkaConfig, DLQ_TOPIC, EVENTS_TOPIC};
pub use consumer::{ConsumerBuilder, EventConsumer, EventHandler, Middleware, Next, ReceivedMessage};
pub use dlq::{DlqMessage, DlqProducer};
pub use error::{PipelineError, PipelineResult};
pub use metrics::ConsumerMetrics;
pub use middleware::{LoggingMiddleware, MetricsMiddleware, RetryMiddleware};
pub use producer::EventPublisher;
