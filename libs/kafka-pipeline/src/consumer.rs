//! Consumer framework: partition loop, middleware chain, offset policy.
//!
//! A consumer joins the group for a single topic and feeds every message
//! through a chain of middlewares terminating at the handler. Offsets are
//! stored after each message regardless of outcome, so a poison message is
//! dead-lettered and the partition keeps moving; duplicate delivery across
//! restarts is possible and handlers are required to be idempotent.

use crate::config::KafkaConfig;
use crate::dlq::DlqProducer;
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::ConsumerMetrics;
use crate::middleware::{LoggingMiddleware, MetricsMiddleware, RetryMiddleware};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::Offset;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Owned snapshot of a broker message.
///
/// Handlers and middlewares work with this instead of the SDK's borrowed
/// message, which keeps them independent of the client library and trivially
/// constructible in tests.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ReceivedMessage {
    fn from_borrowed(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_string(),
                            header.value.unwrap_or_default().to_vec(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|key| key.to_vec()),
            payload: message.payload().unwrap_or_default().to_vec(),
            headers,
        }
    }

    /// Message key as UTF-8, when present and valid.
    pub fn key_utf8(&self) -> Option<&str> {
        self.key.as_deref().and_then(|key| std::str::from_utf8(key).ok())
    }

    /// First header with the given name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }
}

/// Terminal processing step for one topic.
///
/// Implementations must be idempotent with respect to the envelope id and
/// must only return once their side effects are durable.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: &ReceivedMessage) -> PipelineResult<()>;

    /// Topic this handler subscribes to.
    fn topic(&self) -> &str;
}

/// A per-message concern wrapped around the handler.
///
/// `process` receives the downstream chain as [`Next`] and decides whether,
/// and how often, to invoke it.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, message: &ReceivedMessage, next: Next<'_>) -> PipelineResult<()>;
}

/// Cursor over the remaining middleware chain, ending at the handler.
///
/// Copyable on purpose: the retry middleware invokes its downstream several
/// times from a single `process` call.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handler: &'a dyn EventHandler,
}

impl<'a> Next<'a> {
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], handler: &'a dyn EventHandler) -> Self {
        Self {
            middlewares,
            handler,
        }
    }

    /// Invoke the rest of the chain for this message.
    pub fn run(self, message: &'a ReceivedMessage) -> BoxFuture<'a, PipelineResult<()>> {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((current, rest)) => {
                    current
                        .process(message, Next::new(rest, self.handler))
                        .await
                }
                None => self.handler.handle(message).await,
            }
        })
    }
}

/// Builder for [`EventConsumer`].
///
/// The standard chain `logging -> metrics -> retry` is always installed;
/// additional middlewares registered here run between retry and the handler.
pub struct ConsumerBuilder {
    config: KafkaConfig,
    handler: Arc<dyn EventHandler>,
    extra: Vec<Arc<dyn Middleware>>,
    registry: Option<prometheus::Registry>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ConsumerBuilder {
    pub fn new(config: KafkaConfig, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            config,
            handler,
            extra: Vec::new(),
            registry: None,
            shutdown: None,
        }
    }

    /// Append a middleware between the retry stage and the handler.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.extra.push(middleware);
        self
    }

    /// Register metric handles into this registry instead of the default one.
    pub fn registry(mut self, registry: prometheus::Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Observe this shutdown channel; the consumer stops once it turns true.
    pub fn shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> PipelineResult<EventConsumer> {
        let metrics = match &self.registry {
            Some(registry) => ConsumerMetrics::with_registry(self.handler.topic(), registry),
            None => ConsumerMetrics::new(self.handler.topic()),
        };

        let (own_shutdown, shutdown) = match self.shutdown {
            Some(receiver) => (None, receiver),
            None => {
                let (sender, receiver) = watch::channel(false);
                (Some(sender), receiver)
            }
        };

        let mut middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(LoggingMiddleware::new()),
            Arc::new(MetricsMiddleware::new(metrics.clone())),
            Arc::new(
                RetryMiddleware::new(
                    self.config.retry_attempts,
                    self.config.retry_delay,
                    shutdown.clone(),
                )
                .with_metrics(metrics.clone()),
            ),
        ];
        middlewares.extend(self.extra);

        let consumer: StreamConsumer = self.config.consumer_client_config().create()?;

        let dlq = match &self.config.dlq_topic {
            Some(topic) => Some(DlqProducer::new(&self.config, topic.clone())?),
            None => None,
        };

        Ok(EventConsumer {
            config: self.config,
            consumer,
            handler: self.handler,
            middlewares,
            dlq,
            metrics,
            shutdown,
            _own_shutdown: own_shutdown,
        })
    }
}

/// Consumer-group member processing one topic through the middleware chain.
pub struct EventConsumer {
    config: KafkaConfig,
    consumer: StreamConsumer,
    handler: Arc<dyn EventHandler>,
    middlewares: Vec<Arc<dyn Middleware>>,
    dlq: Option<DlqProducer>,
    metrics: ConsumerMetrics,
    shutdown: watch::Receiver<bool>,
    _own_shutdown: Option<watch::Sender<bool>>,
}

impl EventConsumer {
    /// Join the group and process messages until shutdown is signalled.
    ///
    /// Messages are handled one at a time, so offsets within a partition are
    /// stored in strict order. Scaling across partitions is done by running
    /// more group members, not by parallelism inside one consumer.
    pub async fn run(&mut self) -> PipelineResult<()> {
        self.consumer.subscribe(&[self.handler.topic()])?;

        info!(
            topic = %self.handler.topic(),
            group_id = %self.config.group_id,
            "Consumer joined group"
        );

        let mut shutdown = self.shutdown.clone();
        let mut lag_tick = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                }
                _ = lag_tick.tick() => {
                    self.update_lag();
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => self.process(&message).await,
                        Err(err) => {
                            error!(error = %err, "Kafka consumer error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        // Flush offsets stored since the last auto-commit before leaving the
        // group; an empty commit set is not an error worth surfacing.
        if let Err(err) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %err, "Failed to commit offsets on shutdown");
        }

        info!("Consumer stopped");
        Ok(())
    }

    async fn process(&self, message: &BorrowedMessage<'_>) {
        let received = ReceivedMessage::from_borrowed(message);

        let chain = Next::new(&self.middlewares, self.handler.as_ref());
        let outcome =
            match tokio::time::timeout(self.config.processing_timeout, chain.run(&received)).await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::DeadlineExceeded),
            };

        if let Err(err) = outcome {
            error!(
                topic = %received.topic,
                partition = received.partition,
                offset = received.offset,
                error = %err,
                "Failed to process message"
            );

            if let Some(dlq) = &self.dlq {
                match dlq.forward(&received, &err).await {
                    Ok(()) => {
                        self.metrics.dlq_messages.inc();
                        warn!(
                            topic = %received.topic,
                            partition = received.partition,
                            offset = received.offset,
                            "Message sent to DLQ"
                        );
                    }
                    Err(dlq_err) => {
                        error!(error = %dlq_err, "Failed to send message to DLQ");
                    }
                }
            }
        }

        // Store offset+1 whether or not the handler succeeded: a poison
        // message must not wedge its partition.
        if let Err(err) = self.consumer.store_offset(
            &received.topic,
            received.partition,
            received.offset + 1,
        ) {
            warn!(
                partition = received.partition,
                offset = received.offset,
                error = %err,
                "Failed to store offset"
            );
        }
    }

    /// Refresh the lag gauge from broker watermarks. Called off the hot path;
    /// the watermark probe blocks for at most 500ms per partition.
    fn update_lag(&self) {
        let Ok(position) = self.consumer.position() else {
            return;
        };

        let mut lag: i64 = 0;
        for elem in position.elements() {
            let Offset::Offset(current) = elem.offset() else {
                continue;
            };
            match self
                .consumer
                .fetch_watermarks(elem.topic(), elem.partition(), Duration::from_millis(500))
            {
                Ok((_, high)) => lag += (high - current).max(0),
                Err(_) => return,
            }
        }

        self.metrics.consumer_lag.set(lag);
    }
}
