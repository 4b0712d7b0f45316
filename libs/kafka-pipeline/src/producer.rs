//! Transactional event publishing.
//!
//! [`EventPublisher`] couples "event recorded" and "event on the broker" so
//! a caller observes one of two outcomes: the event is in the ledger AND
//! acknowledged by every in-sync replica, or neither. The publish path:
//!
//! 1. open a database transaction and check the `policy_events` ledger for
//!    the event id (replays short-circuit to success),
//! 2. send to the broker and await the delivery ack for this exact message,
//! 3. insert the ledger row and commit.
//!
//! A broker failure abandons the transaction, so the id stays unused and the
//! caller can retry with the same envelope. Dropping the returned future has
//! the same effect: the transaction rolls back on drop.

use crate::config::KafkaConfig;
use crate::error::{PipelineError, PipelineResult};
use chrono::Utc;
use event_schema::PolicyEvent;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Publisher with exactly-once coupling between ledger and broker.
pub struct EventPublisher {
    producer: FutureProducer,
    pool: PgPool,
    topic: String,
    delivery_timeout: Duration,
}

impl EventPublisher {
    pub fn new(config: &KafkaConfig, pool: PgPool) -> PipelineResult<Self> {
        let producer: FutureProducer = config.producer_client_config().create()?;

        Ok(Self {
            producer,
            pool,
            topic: config.topic.clone(),
            delivery_timeout: Duration::from_secs(30),
        })
    }

    /// Publish one policy event.
    ///
    /// Fills in the id and timestamp when the caller left them empty and
    /// returns the completed envelope. Re-publishing an id that is already in
    /// the ledger succeeds without touching the broker.
    pub async fn publish(&self, event: PolicyEvent) -> PipelineResult<PolicyEvent> {
        let event = prepare(event);
        event.validate()?;

        let mut tx = self.pool.begin().await?;

        if already_published(&mut tx, &event.id).await? {
            info!(event_id = %event.id, "Event already published, skipping");
            return Ok(event);
        }

        let payload = event.encode()?;
        // The delivery future resolves once the broker has acknowledged this
        // exact message; only then is the ledger row committed.
        let (partition, offset) = self
            .producer
            .send(
                FutureRecord::to(&self.topic)
                    .key(&event.policy_id)
                    .payload(&payload)
                    .headers(event_headers(&event)),
                self.delivery_timeout,
            )
            .await
            .map_err(|(err, _)| PipelineError::Kafka(err))?;

        insert_ledger_row(&mut tx, &event, &self.topic).await?;
        tx.commit().await?;

        info!(
            event_id = %event.id,
            policy_id = %event.policy_id,
            event_type = %event.event_type,
            partition,
            offset,
            "Policy event published successfully"
        );

        Ok(event)
    }

    /// Publish a batch of events atomically.
    ///
    /// All broker acks are collected before the single commit; any failure
    /// abandons the whole transaction. Events whose id is already in the
    /// ledger are skipped, mirroring the single-event path.
    pub async fn publish_batch(&self, events: Vec<PolicyEvent>) -> PipelineResult<Vec<PolicyEvent>> {
        if events.is_empty() {
            return Ok(events);
        }

        let mut tx = self.pool.begin().await?;
        let mut deliveries = Vec::new();
        let mut published = Vec::with_capacity(events.len());

        for event in events {
            let event = prepare(event);
            event.validate()?;

            if already_published(&mut tx, &event.id).await? {
                info!(event_id = %event.id, "Event already published, skipping");
                published.push(event);
                continue;
            }

            let payload = event.encode()?;
            let delivery = self
                .producer
                .send_result(
                    FutureRecord::to(&self.topic)
                        .key(&event.policy_id)
                        .payload(&payload)
                        .headers(event_headers(&event)),
                )
                .map_err(|(err, _)| PipelineError::Kafka(err))?;
            deliveries.push(delivery);

            insert_ledger_row(&mut tx, &event, &self.topic).await?;
            published.push(event);
        }

        for delivery in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((err, _))) => return Err(PipelineError::Kafka(err)),
                Err(_) => return Err(PipelineError::Cancelled),
            }
        }

        tx.commit().await?;

        info!(batch_size = published.len(), "Policy event batch published");
        Ok(published)
    }
}

/// Fill in the identity fields the caller may have left empty.
fn prepare(mut event: PolicyEvent) -> PolicyEvent {
    if event.id.is_empty() {
        event.id = Uuid::new_v4().to_string();
    }
    if !event.has_timestamp() {
        event.timestamp = Utc::now();
    }
    event
}

fn event_headers(event: &PolicyEvent) -> OwnedHeaders {
    OwnedHeaders::new()
        .insert(Header {
            key: "event_id",
            value: Some(event.id.as_bytes()),
        })
        .insert(Header {
            key: "event_type",
            value: Some(event.event_type.as_bytes()),
        })
        .insert(Header {
            key: "source",
            value: Some(event.source.as_bytes()),
        })
}

async fn already_published(
    tx: &mut Transaction<'_, Postgres>,
    event_id: &str,
) -> PipelineResult<bool> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM insurance.policy_events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(existing.is_some())
}

async fn insert_ledger_row(
    tx: &mut Transaction<'_, Postgres>,
    event: &PolicyEvent,
    topic: &str,
) -> PipelineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO insurance.policy_events
            (id, policy_id, event_type, event_data, processed_at, kafka_topic)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&event.id)
    .bind(&event.policy_id)
    .bind(&event.event_type)
    .bind(Value::Object(event.event_data.clone()))
    .bind(event.timestamp)
    .bind(topic)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schema::EventKind;
    use serde_json::Map;

    #[test]
    fn prepare_fills_missing_identity() {
        let mut event = PolicyEvent::new("policy-1", EventKind::Created, Map::new());
        event.id.clear();
        event.timestamp = chrono::DateTime::UNIX_EPOCH;

        let prepared = prepare(event);
        assert!(!prepared.id.is_empty());
        assert!(prepared.has_timestamp());
    }

    #[test]
    fn prepare_preserves_caller_identity() {
        let event = PolicyEvent::new("policy-1", EventKind::Created, Map::new());
        let id = event.id.clone();
        let timestamp = event.timestamp;

        let prepared = prepare(event);
        assert_eq!(prepared.id, id);
        assert_eq!(prepared.timestamp, timestamp);
    }

    #[test]
    fn headers_carry_event_identity() {
        use rdkafka::message::Headers;

        let event = PolicyEvent::new("policy-1", EventKind::Renewed, Map::new())
            .with_source("gateway");
        let headers = event_headers(&event);

        assert_eq!(headers.count(), 3);
        let header = headers.get(1);
        assert_eq!(header.key, "event_type");
        assert_eq!(header.value, Some(b"renewed".as_slice()));
    }
}
