//! Kafka handler for billing: invoices for new and renewed policies,
//! pro-rata refunds for cancellations.
//!
//! Billing runs in its own consumer group and may see an event before the
//! pricing consumer has committed its premium. That race is not an error:
//! the handler logs a warning and succeeds, and a later delivery (or the
//! next lifecycle event) picks the premium up.

use crate::records::{refund_amount, BillingStatus, BillingType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use event_schema::{EventKind, PolicyEvent};
use kafka_pipeline::{EventHandler, PipelineResult, ReceivedMessage, EVENTS_TOPIC};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

/// Days the client has to pay a brand-new policy.
const CREATED_PAYMENT_TERM_DAYS: i64 = 30;
/// Days the client has to pay a renewal.
const RENEWAL_PAYMENT_TERM_DAYS: i64 = 15;

pub struct BillingHandler {
    pool: PgPool,
}

impl BillingHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent premium for the policy, if pricing has run yet.
    async fn latest_premium(&self, policy_id: &str) -> PipelineResult<Option<f64>> {
        let premium = sqlx::query_scalar(
            "SELECT final_premium FROM insurance.premium_calculations \
             WHERE policy_id = $1 ORDER BY calculated_at DESC LIMIT 1",
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(premium)
    }

    async fn on_policy_created(&self, event: &PolicyEvent) -> PipelineResult<()> {
        let Some(amount) = self.latest_premium(&event.policy_id).await? else {
            warn!(policy_id = %event.policy_id, "Premium not calculated yet, skipping billing");
            return Ok(());
        };

        let due_date = Utc::now() + Duration::days(CREATED_PAYMENT_TERM_DAYS);
        let billing_id = self
            .insert_record(
                &event.policy_id,
                amount,
                BillingType::Premium,
                Some(due_date),
            )
            .await?;

        info!(
            policy_id = %event.policy_id,
            billing_id = %billing_id,
            amount,
            due_date = %due_date,
            "Billing record created for new policy"
        );
        self.send_payment_notification(&event.policy_id, billing_id, amount, Some(due_date));

        Ok(())
    }

    async fn on_policy_renewed(&self, event: &PolicyEvent) -> PipelineResult<()> {
        let Some(amount) = self.latest_premium(&event.policy_id).await? else {
            warn!(policy_id = %event.policy_id, "Premium not calculated for renewal, skipping billing");
            return Ok(());
        };

        let due_date = Utc::now() + Duration::days(RENEWAL_PAYMENT_TERM_DAYS);
        let billing_id = self
            .insert_record(
                &event.policy_id,
                amount,
                BillingType::Premium,
                Some(due_date),
            )
            .await?;

        info!(
            policy_id = %event.policy_id,
            billing_id = %billing_id,
            amount,
            "Billing record created for policy renewal"
        );
        self.send_payment_notification(&event.policy_id, billing_id, amount, Some(due_date));

        Ok(())
    }

    async fn on_policy_cancelled(&self, event: &PolicyEvent) -> PipelineResult<()> {
        let last_paid: Option<(Uuid, f64, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT id, amount, paid_at FROM insurance.billing_records \
             WHERE policy_id = $1 AND status = 'paid' AND billing_type = 'premium' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(&event.policy_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((_, last_amount, Some(paid_at))) = last_paid else {
            info!(policy_id = %event.policy_id, "No paid premiums found, no refund needed");
            return Ok(());
        };

        let refund = refund_amount(last_amount, paid_at, event.timestamp);
        if refund <= 0.0 {
            info!(policy_id = %event.policy_id, "No refund amount, policy period expired");
            return Ok(());
        }

        let refund_id = self
            .insert_record(&event.policy_id, refund, BillingType::Refund, None)
            .await?;
        self.mark_paid(refund_id).await?;

        info!(
            policy_id = %event.policy_id,
            refund_id = %refund_id,
            refund_amount = refund,
            original_amount = last_amount,
            reason = event.cancellation_reason().unwrap_or_default(),
            "Refund processed for cancelled policy"
        );

        Ok(())
    }

    async fn insert_record(
        &self,
        policy_id: &str,
        amount: f64,
        billing_type: BillingType,
        due_date: Option<DateTime<Utc>>,
    ) -> PipelineResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO insurance.billing_records
                (id, policy_id, amount, billing_type, status, due_date, created_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL)
            "#,
        )
        .bind(id)
        .bind(policy_id)
        .bind(amount)
        .bind(billing_type.as_str())
        .bind(BillingStatus::Pending.as_str())
        .bind(due_date)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn mark_paid(&self, record_id: Uuid) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE insurance.billing_records SET status = $1, paid_at = $2 WHERE id = $3",
        )
        .bind(BillingStatus::Paid.as_str())
        .bind(Utc::now())
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Placeholder for the notification channel; billing rows are ledger
    /// entries, not money movement.
    fn send_payment_notification(
        &self,
        policy_id: &str,
        billing_id: Uuid,
        amount: f64,
        due_date: Option<DateTime<Utc>>,
    ) {
        info!(
            policy_id = %policy_id,
            billing_id = %billing_id,
            amount,
            due_date = due_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
            "Payment notification sent (simulated)"
        );
    }
}

#[async_trait]
impl EventHandler for BillingHandler {
    async fn handle(&self, message: &ReceivedMessage) -> PipelineResult<()> {
        let event = PolicyEvent::decode(&message.payload)?;

        info!(
            event_id = %event.id,
            policy_id = %event.policy_id,
            event_type = %event.event_type,
            "Processing billing event"
        );

        match event.kind() {
            Some(EventKind::Created) => self.on_policy_created(&event).await,
            Some(EventKind::Renewed) => self.on_policy_renewed(&event).await,
            Some(EventKind::Cancelled) => self.on_policy_cancelled(&event).await,
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

    fn handler() -> BillingHandler {
        BillingHandler::new(
            PgPoolOptions::new()
                .connect_lazy("postgres://localhost/test")
                .unwrap(),
        )
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
        let payload = br#"{"id":"e-1","policy_id":"p-1","event_type":"suspended"}"#;
        handler().handle(&message(payload)).await.unwrap();
    }

    #[tokio::test]
    async fn subscribes_to_the_events_topic() {
        assert_eq!(handler().topic(), "auto.events");
    }
}
