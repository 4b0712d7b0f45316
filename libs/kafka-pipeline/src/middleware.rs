//! Standard per-message middlewares: logging, metrics, bounded retry.
//!
//! The consumer builder installs them as `logging -> metrics -> retry`, so
//! logging and metrics observe one aggregate attempt while the retry stage
//! sees each individual one.

use crate::consumer::{Middleware, Next, ReceivedMessage};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::ConsumerMetrics;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Logs the start and outcome of every message.
#[derive(Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn process(&self, message: &ReceivedMessage, next: Next<'_>) -> PipelineResult<()> {
        let start = Instant::now();

        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = message.key_utf8().unwrap_or_default(),
            "Processing message"
        );

        let result = next.run(message).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                duration_ms,
                "Message processed successfully"
            ),
            Err(err) => error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                duration_ms,
                error = %err,
                "Message processing failed"
            ),
        }

        result
    }
}

/// Observes processing duration and counts successes and failures.
pub struct MetricsMiddleware {
    metrics: ConsumerMetrics,
}

impl MetricsMiddleware {
    pub fn new(metrics: ConsumerMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn process(&self, message: &ReceivedMessage, next: Next<'_>) -> PipelineResult<()> {
        let start = Instant::now();

        let result = next.run(message).await;

        self.metrics
            .processing_duration
            .observe(start.elapsed().as_secs_f64());
        match &result {
            Ok(()) => self.metrics.messages_processed.inc(),
            Err(_) => self.metrics.processing_errors.inc(),
        }

        result
    }
}

/// Retries the downstream chain on transient failures.
///
/// Runs up to `max_retries + 1` attempts with a fixed delay in between. The
/// delay sleep races against shutdown, so a draining consumer gives up on a
/// waiting retry immediately. Non-retryable errors short-circuit.
pub struct RetryMiddleware {
    max_retries: u32,
    retry_delay: Duration,
    shutdown: watch::Receiver<bool>,
    metrics: Option<ConsumerMetrics>,
}

impl RetryMiddleware {
    pub fn new(max_retries: u32, retry_delay: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            max_retries,
            retry_delay,
            shutdown,
            metrics: None,
        }
    }

    /// Count re-attempts in `kafka_retries_total`.
    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Resolves once shutdown is signalled; a closed channel counts as shutdown.
async fn shutdown_signalled(receiver: &mut watch::Receiver<bool>) {
    let _ = receiver.wait_for(|stop| *stop).await;
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn process(&self, message: &ReceivedMessage, next: Next<'_>) -> PipelineResult<()> {
        let attempts = self.max_retries + 1;
        let mut shutdown = self.shutdown.clone();

        let mut last_err = match next.run(message).await {
            Ok(()) => return Ok(()),
            Err(err) if !err.is_retryable() => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "Non-retryable error, giving up"
                );
                return Err(err);
            }
            Err(err) => err,
        };

        for attempt in 1..attempts {
            warn!(
                attempt,
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Retrying message processing"
            );
            if let Some(metrics) = &self.metrics {
                metrics.retries.inc();
            }

            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => {
                    return Err(PipelineError::Cancelled);
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }

            match next.run(message).await {
                Ok(()) => {
                    info!(
                        attempt,
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "Message processing succeeded after retry"
                    );
                    return Ok(());
                }
                Err(err) if !err.is_retryable() => {
                    error!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %err,
                        "Non-retryable error, giving up"
                    );
                    return Err(err);
                }
                Err(err) => last_err = err,
            }
        }

        Err(PipelineError::RetriesExhausted {
            attempts,
            source: Box::new(last_err),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::EventHandler;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_message() -> ReceivedMessage {
        ReceivedMessage {
            topic: "auto.events".to_string(),
            partition: 0,
            offset: 7,
            key: None,
            payload: b"{}".to_vec(),
            headers: Vec::new(),
        }
    }

    /// Fails the first `failures` attempts with the given error kind.
    struct FlakyHandler {
        calls: AtomicU32,
        failures: u32,
        retryable: bool,
    }

    impl FlakyHandler {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                retryable,
            }
        }
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _message: &ReceivedMessage) -> PipelineResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.retryable {
                    Err(PipelineError::Handler(anyhow::anyhow!("transient")))
                } else {
                    Err(PipelineError::DeadlineExceeded)
                }
            } else {
                Ok(())
            }
        }

        fn topic(&self) -> &str {
            "auto.events"
        }
    }

    fn retry(max_retries: u32) -> (RetryMiddleware, watch::Sender<bool>) {
        let (sender, receiver) = watch::channel(false);
        (
            RetryMiddleware::new(max_retries, Duration::from_millis(5), receiver),
            sender,
        )
    }

    async fn run_chain(middleware: &RetryMiddleware, handler: &FlakyHandler) -> PipelineResult<()> {
        let message = test_message();
        middleware
            .process(&message, Next::new(&[], handler))
            .await
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let (middleware, _sender) = retry(3);
        let handler = FlakyHandler::new(0, true);

        run_chain(&middleware, &handler).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let (middleware, _sender) = retry(3);
        let handler = FlakyHandler::new(2, true);

        run_chain(&middleware, &handler).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let (middleware, _sender) = retry(3);
        let handler = FlakyHandler::new(u32::MAX, true);

        let err = run_chain(&middleware, &handler).await.unwrap_err();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            err,
            PipelineError::RetriesExhausted { attempts: 4, .. }
        ));
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let (middleware, _sender) = retry(3);
        let handler = FlakyHandler::new(u32::MAX, false);

        let err = run_chain(&middleware, &handler).await.unwrap_err();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, PipelineError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_retry() {
        let (sender, receiver) = watch::channel(false);
        let middleware = RetryMiddleware::new(3, Duration::from_secs(30), receiver);
        let handler = FlakyHandler::new(u32::MAX, true);
        sender.send(true).unwrap();

        let start = Instant::now();
        let err = run_chain(&middleware, &handler).await.unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
