//! Kafka handler for underwriting: turns policy lifecycle events into
//! premium calculation rows.
//!
//! Replays of the same delivery append a fresh row with the next version
//! rather than upserting by event id; the latest row by `calculated_at` is
//! authoritative and older rows are kept for audit.

use crate::premium::{self, PremiumQuote};
use async_trait::async_trait;
use chrono::Utc;
use event_schema::{EventKind, PolicyEvent};
use kafka_pipeline::{EventHandler, PipelineResult, ReceivedMessage, EVENTS_TOPIC};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

pub struct UnderwritingHandler {
    pool: PgPool,
}

impl UnderwritingHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn on_policy_created(&self, event: &PolicyEvent) -> PipelineResult<()> {
        let policy = event.policy_data()?;
        let quote = premium::calculate(&policy);

        self.insert_calculation(event, &quote, 1).await?;

        info!(
            policy_id = %event.policy_id,
            base_premium = quote.base_premium,
            final_premium = quote.final_premium,
            risk_score = quote.risk_score,
            "Premium calculated successfully"
        );

        Ok(())
    }

    async fn on_policy_renewed(&self, event: &PolicyEvent) -> PipelineResult<()> {
        let policy = event.policy_data()?;

        let previous_version: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(calculation_version), 0) \
             FROM insurance.premium_calculations WHERE policy_id = $1",
        )
        .bind(&event.policy_id)
        .fetch_one(&self.pool)
        .await?;

        let quote = premium::calculate(&policy);
        self.insert_calculation(event, &quote, previous_version + 1).await?;

        info!(
            policy_id = %event.policy_id,
            calculation_version = previous_version + 1,
            final_premium = quote.final_premium,
            "Premium recalculated for renewal"
        );

        Ok(())
    }

    async fn insert_calculation(
        &self,
        event: &PolicyEvent,
        quote: &PremiumQuote,
        version: i32,
    ) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO insurance.premium_calculations
                (id, policy_id, base_premium, risk_factors, final_premium, calculated_at, calculation_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.policy_id)
        .bind(quote.base_premium)
        .bind(Value::Object(quote.risk_factors.clone()))
        .bind(quote.final_premium)
        .bind(Utc::now())
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EventHandler for UnderwritingHandler {
    async fn handle(&self, message: &ReceivedMessage) -> PipelineResult<()> {
        let event = PolicyEvent::decode(&message.payload)?;

        info!(
            event_id = %event.id,
            policy_id = %event.policy_id,
            event_type = %event.event_type,
            "Processing underwriting event"
        );

        match event.kind() {
            Some(EventKind::Created) => self.on_policy_created(&event).await,
            Some(EventKind::Renewed) => self.on_policy_renewed(&event).await,
            Some(EventKind::Cancelled) => {
                info!(
                    policy_id = %event.policy_id,
                    cancelled_at = %event.timestamp,
                    "Policy cancelled, no premium calculation needed"
                );
                Ok(())
            }
            None => {
                warn!(event_type = %event.event_type, "Unknown event type, skipping");
                Ok(())
            }
        }
    }

    fn topic(&self) -> &str {
        EVENTS_TOPIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_pipeline::PipelineError;
    use sqlx::postgres::PgPoolOptions;

    fn handler() -> UnderwritingHandler {
        UnderwritingHandler::new(PgPoolOptions::new().connect_lazy("postgres://localhost/test").unwrap())
    }

    fn message(payload: &[u8]) -> ReceivedMessage {
        ReceivedMessage {
            topic: EVENTS_TOPIC.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: payload.to_vec(),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_decode_error() {
        let err = handler().handle(&message(b"not-json")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unknown_event_type_is_skipped() {
        let payload = br#"{"id":"e-1","policy_id":"p-1","event_type":"archived"}"#;
        handler().handle(&message(payload)).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_event_is_a_no_op() {
        let payload = br#"{"id":"e-1","policy_id":"p-1","event_type":"cancelled"}"#;
        handler().handle(&message(payload)).await.unwrap();
    }

    #[tokio::test]
    async fn created_event_without_policy_data_is_a_decode_error() {
        let payload = br#"{"id":"e-1","policy_id":"p-1","event_type":"created","event_data":{}}"#;
        let err = handler().handle(&message(payload)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[tokio::test]
    async fn subscribes_to_the_events_topic() {
        assert_eq!(handler().topic(), "auto.events");
    }
}
