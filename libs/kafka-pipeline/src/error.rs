//! Error taxonomy for the messaging plane.
//!
//! The retry middleware keys off [`PipelineError::is_retryable`]: malformed
//! payloads, cancellation and blown deadlines never get another attempt and
//! go straight to the DLQ, everything else is assumed transient.

use event_schema::EnvelopeError;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the producer, the consumer framework and handlers.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Payload could not be decoded into an envelope, or a projection failed
    #[error("failed to decode message: {0}")]
    Decode(#[from] EnvelopeError),

    /// Broker-side failure (send, delivery, consume)
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Store-side failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization of an internal record (DLQ payload) failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown was requested while the operation was in flight
    #[error("processing cancelled by shutdown")]
    Cancelled,

    /// The per-message processing timeout elapsed
    #[error("processing deadline exceeded")]
    DeadlineExceeded,

    /// All retry attempts were used up; `source` is the last failure
    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// Handler-specific failure without a more precise classification
    #[error("handler error: {0}")]
    Handler(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Cancellation and deadline errors mean the caller is going away, and a
    /// payload that did not decode once will never decode. Broker, database
    /// and unclassified handler failures are treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Decode(_)
                | PipelineError::Cancelled
                | PipelineError::DeadlineExceeded
                | PipelineError::RetriesExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_error() -> PipelineError {
        PipelineError::Decode(EnvelopeError::Malformed(
            serde_json::from_slice::<serde_json::Value>(b"not-json").unwrap_err(),
        ))
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(PipelineError::Handler(anyhow::anyhow!("boom")).is_retryable());
        assert!(PipelineError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!decode_error().is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(!PipelineError::DeadlineExceeded.is_retryable());
        assert!(!PipelineError::RetriesExhausted {
            attempts: 4,
            source: Box::new(PipelineError::Cancelled),
        }
        .is_retryable());
    }

    #[test]
    fn exhaustion_reports_attempt_count() {
        let err = PipelineError::RetriesExhausted {
            attempts: 4,
            source: Box::new(PipelineError::Handler(anyhow::anyhow!("still down"))),
        };
        assert!(err.to_string().contains("failed after 4 attempts"));
        assert!(err.to_string().contains("still down"));
    }
}
