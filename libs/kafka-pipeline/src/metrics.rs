//! Prometheus handles for consumer observability.
//!
//! Each consumer owns its own set of handles labeled by topic; nothing is
//! registered behind the caller's back. Registration failures (for example a
//! second consumer for the same topic in one process) are logged and the
//! unregistered handles keep working locally.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use tracing::warn;

#[derive(Clone)]
pub struct ConsumerMetrics {
    pub messages_processed: IntCounter,
    pub processing_errors: IntCounter,
    pub retries: IntCounter,
    pub dlq_messages: IntCounter,
    pub processing_duration: Histogram,
    pub consumer_lag: IntGauge,
}

impl ConsumerMetrics {
    /// Handles registered into the process-wide default registry.
    pub fn new(topic: &str) -> Self {
        Self::with_registry(topic, prometheus::default_registry())
    }

    /// Handles registered into an explicit registry.
    pub fn with_registry(topic: &str, registry: &Registry) -> Self {
        let messages_processed = IntCounter::with_opts(
            Opts::new(
                "kafka_messages_processed_total",
                "Total number of processed messages",
            )
            .const_label("topic", topic),
        )
        .expect("valid metric opts for kafka_messages_processed_total");

        let processing_errors = IntCounter::with_opts(
            Opts::new(
                "kafka_processing_errors_total",
                "Total number of processing errors",
            )
            .const_label("topic", topic),
        )
        .expect("valid metric opts for kafka_processing_errors_total");

        let retries = IntCounter::with_opts(
            Opts::new("kafka_retries_total", "Total number of retries").const_label("topic", topic),
        )
        .expect("valid metric opts for kafka_retries_total");

        let dlq_messages = IntCounter::with_opts(
            Opts::new(
                "kafka_dlq_messages_total",
                "Total number of messages sent to DLQ",
            )
            .const_label("topic", topic),
        )
        .expect("valid metric opts for kafka_dlq_messages_total");

        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "kafka_message_processing_duration_seconds",
                "Time spent processing messages",
            )
            .const_label("topic", topic),
        )
        .expect("valid metric opts for kafka_message_processing_duration_seconds");

        let consumer_lag = IntGauge::with_opts(
            Opts::new("kafka_consumer_lag", "Consumer lag").const_label("topic", topic),
        )
        .expect("valid metric opts for kafka_consumer_lag");

        for metric in [
            Box::new(messages_processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(processing_errors.clone()),
            Box::new(retries.clone()),
            Box::new(dlq_messages.clone()),
            Box::new(processing_duration.clone()),
            Box::new(consumer_lag.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register consumer metric: {}", e);
            }
        }

        Self {
            messages_processed,
            processing_errors,
            retries,
            dlq_messages,
            processing_duration,
            consumer_lag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_metric_families() {
        let registry = Registry::new();
        let metrics = ConsumerMetrics::with_registry("auto.events", &registry);

        metrics.messages_processed.inc();
        metrics.processing_duration.observe(0.05);

        let names: Vec<String> = registry
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_string())
            .collect();

        for expected in [
            "kafka_messages_processed_total",
            "kafka_processing_errors_total",
            "kafka_retries_total",
            "kafka_dlq_messages_total",
            "kafka_message_processing_duration_seconds",
            "kafka_consumer_lag",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn handles_survive_duplicate_registration() {
        let registry = Registry::new();
        let _first = ConsumerMetrics::with_registry("auto.events", &registry);
        let second = ConsumerMetrics::with_registry("auto.events", &registry);

        second.retries.inc();
        assert_eq!(second.retries.get(), 1);
    }
}
