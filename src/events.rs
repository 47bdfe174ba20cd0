//! Lifecycle event broadcast.
//!
//! Events fire after the store has acknowledged the write and are
//! best-effort: a bus with zero subscribers is valid, and send failures
//! never roll back the data write.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::Entity;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EntityEvent {
    #[serde(rename = "entity:created")]
    Created {
        #[serde(rename = "entityType")]
        entity_type: String,
        #[serde(rename = "entityId")]
        entity_id: String,
        entity: Entity,
    },
    #[serde(rename = "entity:updated")]
    Updated {
        #[serde(rename = "entityType")]
        entity_type: String,
        #[serde(rename = "entityId")]
        entity_id: String,
        entity: Entity,
    },
    #[serde(rename = "entity:deleted")]
    Deleted {
        #[serde(rename = "entityType")]
        entity_type: String,
        #[serde(rename = "entityId")]
        entity_id: String,
    },
    #[serde(rename = "entity:embedding:ready")]
    EmbeddingReady {
        #[serde(rename = "entityType")]
        entity_type: String,
        #[serde(rename = "entityId")]
        entity_id: String,
        entity: Entity,
    },
}

impl EntityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EntityEvent::Created { .. } => "entity:created",
            EntityEvent::Updated { .. } => "entity:updated",
            EntityEvent::Deleted { .. } => "entity:deleted",
            EntityEvent::EmbeddingReady { .. } => "entity:embedding:ready",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EntityEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event. No subscribers is not an error.
    pub fn emit(&self, event: EntityEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => log::debug!("EventBus: {} delivered to {}", name, receivers),
            Err(_) => log::debug!("EventBus: {} dropped (no subscribers)", name),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn sample_entity() -> Entity {
        Entity {
            id: "n1".into(),
            entity_type: "note".into(),
            content: "hello".into(),
            content_hash: "abc".into(),
            metadata: Metadata::new(),
            created: 1,
            updated: 1,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(EntityEvent::Created {
            entity_type: "note".into(),
            entity_id: "n1".into(),
            entity: sample_entity(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "entity:created");
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.emit(EntityEvent::Deleted {
            entity_type: "note".into(),
            entity_id: "n1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_payload_shape() {
        let event = EntityEvent::Deleted {
            entity_type: "note".into(),
            entity_id: "n1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "entity:deleted");
        assert_eq!(json["entityType"], "note");
        assert_eq!(json["entityId"], "n1");
    }
}
