use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderdesk_core::{AggregateId, TenantId};

use crate::Event;

/// Envelope as it travels over the bus: JSON payload, typed metadata.
pub type PublishedEvent = EventEnvelope<serde_json::Value>;

/// Envelope for an event, containing multi-tenant + stream metadata.
///
/// - **Multi-tenancy** is enforced here via `tenant_id`.
/// - `sequence_number` is the aggregate version the event produced, so
///   consumers can discard duplicates delivered at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        event_type: impl Into<String>,
        event_version: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            event_type: event_type.into(),
            event_version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl PublishedEvent {
    /// Wrap a typed domain event, serializing its payload to JSON.
    pub fn wrap<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence_number: u64,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self::new(
            Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type,
            sequence_number,
            event.event_type(),
            event.version(),
            event.occurred_at(),
            serde_json::to_value(event)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct Pinged {
        at: DateTime<Utc>,
    }

    impl Event for Pinged {
        fn event_type(&self) -> &'static str {
            "test.pinged"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn wrap_copies_event_metadata() {
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();
        let at = Utc::now();

        let envelope =
            PublishedEvent::wrap(tenant_id, aggregate_id, "test.thing", 7, &Pinged { at }).unwrap();

        assert_eq!(envelope.tenant_id(), tenant_id);
        assert_eq!(envelope.aggregate_id(), aggregate_id);
        assert_eq!(envelope.aggregate_type(), "test.thing");
        assert_eq!(envelope.sequence_number(), 7);
        assert_eq!(envelope.event_type(), "test.pinged");
        assert_eq!(envelope.event_version(), 2);
        assert_eq!(envelope.occurred_at(), at);
        assert!(envelope.payload().get("at").is_some());
    }
}
