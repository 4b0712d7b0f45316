//! Canonical wire format for policy lifecycle events.
//!
//! Every service in the pipeline speaks [`PolicyEvent`]: the gateway publishes
//! it, the underwriting and billing consumers decode it. The envelope is JSON
//! on the wire; top-level fields this crate does not know about are preserved
//! across a decode/encode round trip so older services can forward events
//! produced by newer ones.
//!
//! The `event_data` map stays schemaless on the wire. Handlers project it into
//! typed values ([`PolicyData`]) at decode time; a payload with the wrong shape
//! is a malformed envelope, not a handler failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Errors raised while encoding, decoding or validating an envelope.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Envelope carries no event id
    #[error("envelope is missing an event id")]
    MissingEventId,

    /// Envelope carries no policy id (the partition key)
    #[error("envelope is missing a policy id")]
    MissingPolicyId,

    /// Payload is not a valid envelope, or a projection has the wrong shape
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `event_data` is missing a required entry
    #[error("event data is missing the '{0}' entry")]
    MissingEntry(&'static str),
}

/// The lifecycle transitions the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Renewed,
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Renewed => "renewed",
            EventKind::Cancelled => "cancelled",
        }
    }

    /// Returns `None` for event types this version does not know about.
    /// Handlers skip those with a warning instead of failing the message.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(EventKind::Created),
            "renewed" => Some(EventKind::Renewed),
            "cancelled" => Some(EventKind::Cancelled),
            _ => None,
        }
    }
}

/// A policy lifecycle event as it travels through the broker.
///
/// `id` is the idempotency key for the whole pipeline; `policy_id` is the
/// partition key, so all events for one policy are totally ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvent {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub policy_id: String,

    /// "created", "renewed" or "cancelled"; unknown values are tolerated
    #[serde(default)]
    pub event_type: String,

    #[serde(default)]
    pub event_data: Map<String, Value>,

    #[serde(default = "unset_timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub version: String,

    /// Top-level fields from newer schema versions, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn unset_timestamp() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl PolicyEvent {
    /// Build a fresh envelope with a new id and the current time.
    pub fn new(policy_id: impl Into<String>, kind: EventKind, event_data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            policy_id: policy_id.into(),
            event_type: kind.as_str().to_string(),
            event_data,
            timestamp: Utc::now(),
            source: String::new(),
            version: "1.0".to_string(),
            extra: Map::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Encode to UTF-8 JSON. Map keys are emitted in sorted order, so two
    /// equal envelopes always produce identical bytes.
    pub fn encode(&self) -> EnvelopeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> EnvelopeResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Typed view of `event_type`; `None` for unknown types.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event_type)
    }

    /// Producer-side checks before a publish is attempted.
    pub fn validate(&self) -> EnvelopeResult<()> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingEventId);
        }
        if self.policy_id.is_empty() {
            return Err(EnvelopeError::MissingPolicyId);
        }
        Ok(())
    }

    /// Whether the origin filled in a timestamp.
    pub fn has_timestamp(&self) -> bool {
        self.timestamp != DateTime::UNIX_EPOCH
    }

    /// Project `event_data.policy` into its typed shape.
    ///
    /// `created` and `renewed` events carry the pricing inputs here; a missing
    /// or malformed entry makes the whole message undecodable.
    pub fn policy_data(&self) -> EnvelopeResult<PolicyData> {
        let value = self
            .event_data
            .get("policy")
            .ok_or(EnvelopeError::MissingEntry("policy"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Reason attached to a `cancelled` event, when present.
    pub fn cancellation_reason(&self) -> Option<&str> {
        self.event_data.get("reason").and_then(Value::as_str)
    }
}

/// Pricing inputs carried by `created` and `renewed` events.
///
/// Renewals send only the fields that changed, so everything is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyData {
    pub client_id: Option<String>,
    pub policy_type: Option<String>,
    pub driver_age: Option<f64>,
    pub driving_experience: Option<f64>,
    pub car_type: Option<String>,
    pub region: Option<String>,
    pub accidents_count: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> PolicyEvent {
        let mut policy = Map::new();
        policy.insert("driver_age".to_string(), json!(30.0));
        policy.insert("car_type".to_string(), json!("sedan"));
        let mut data = Map::new();
        data.insert("policy".to_string(), Value::Object(policy));
        PolicyEvent::new("policy-1", EventKind::Created, data).with_source("gateway")
    }

    #[test]
    fn encode_decode_round_trip() {
        let event = sample_event();
        let bytes = event.encode().unwrap();
        let decoded = PolicyEvent::decode(&bytes).unwrap();

        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.policy_id, "policy-1");
        assert_eq!(decoded.event_type, "created");
        assert_eq!(decoded.source, "gateway");
        assert_eq!(decoded.timestamp, event.timestamp);
    }

    #[test]
    fn unknown_top_level_fields_survive_round_trip() {
        let json = r#"{
            "id": "e-1",
            "policy_id": "p-1",
            "event_type": "created",
            "event_data": {},
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "gateway",
            "version": "2.0",
            "trace_id": "abc-123"
        }"#;

        let event = PolicyEvent::decode(json.as_bytes()).unwrap();
        assert_eq!(event.extra.get("trace_id"), Some(&json!("abc-123")));

        let bytes = event.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["trace_id"], json!("abc-123"));
    }

    #[test]
    fn stable_key_order() {
        let event = sample_event();
        assert_eq!(event.encode().unwrap(), event.encode().unwrap());
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(
            PolicyEvent::decode(b"not-json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn validate_requires_ids() {
        let mut event = sample_event();
        event.id.clear();
        assert!(matches!(event.validate(), Err(EnvelopeError::MissingEventId)));

        let mut event = sample_event();
        event.policy_id.clear();
        assert!(matches!(event.validate(), Err(EnvelopeError::MissingPolicyId)));

        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn kind_parses_known_types_only() {
        assert_eq!(EventKind::parse("created"), Some(EventKind::Created));
        assert_eq!(EventKind::parse("renewed"), Some(EventKind::Renewed));
        assert_eq!(EventKind::parse("cancelled"), Some(EventKind::Cancelled));
        assert_eq!(EventKind::parse("archived"), None);
    }

    #[test]
    fn policy_data_projection() {
        let data = sample_event().policy_data().unwrap();
        assert_eq!(data.driver_age, Some(30.0));
        assert_eq!(data.car_type.as_deref(), Some("sedan"));
        assert!(data.region.is_none());
    }

    #[test]
    fn policy_data_missing_entry() {
        let event = PolicyEvent::new("p-1", EventKind::Created, Map::new());
        assert!(matches!(
            event.policy_data(),
            Err(EnvelopeError::MissingEntry("policy"))
        ));
    }

    #[test]
    fn policy_data_wrong_shape_is_malformed() {
        let mut data = Map::new();
        data.insert("policy".to_string(), json!({"driver_age": "thirty"}));
        let event = PolicyEvent::new("p-1", EventKind::Created, data);
        assert!(matches!(
            event.policy_data(),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn cancellation_reason() {
        let mut data = Map::new();
        data.insert("reason".to_string(), json!("user_request"));
        let event = PolicyEvent::new("p-1", EventKind::Cancelled, data);
        assert_eq!(event.cancellation_reason(), Some("user_request"));
    }

    #[test]
    fn minimal_payload_decodes_with_defaults() {
        let event = PolicyEvent::decode(br#"{"id": "e-1"}"#).unwrap();
        assert_eq!(event.id, "e-1");
        assert!(event.policy_id.is_empty());
        assert!(!event.has_timestamp());
    }
}
