//! Change events and the in-process event bus.
//!
//! Backends append every event to a durable log inside the same
//! transaction as the row change, then publish it on the bus after
//! commit. The bus stands in for the external reliable event stream;
//! per-id ordering is preserved by the single broadcast channel.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::record::{KeyId, UsageDelta};

/// System-wide key change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum VaultEvent {
    /// Key created
    #[serde(rename = "SV_NEW")]
    Created {
        id: KeyId,
        ext_id: String,
        key_type: String,
    },
    /// Key removed
    #[serde(rename = "SV_DEL")]
    Deleted { id: KeyId },
    /// Usage statistics advanced; zero fields are omitted
    #[serde(rename = "SV_UPD")]
    Updated {
        id: KeyId,
        #[serde(flatten)]
        delta: UsageDelta,
    },
}

impl VaultEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            VaultEvent::Created { .. } => "SV_NEW",
            VaultEvent::Deleted { .. } => "SV_DEL",
            VaultEvent::Updated { .. } => "SV_UPD",
        }
    }

    pub fn key_id(&self) -> &KeyId {
        match self {
            VaultEvent::Created { id, .. }
            | VaultEvent::Deleted { id }
            | VaultEvent::Updated { id, .. } => id,
        }
    }
}

const BUS_CAPACITY: usize = 1024;

/// Broadcast fan-out of [`VaultEvent`] to cache replicas.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers; silently dropped when none.
    pub fn publish(&self, event: VaultEvent) {
        tracing::debug!(kind = event.kind(), id = %event.key_id(), "key event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_event_wire_shape() {
        let event = VaultEvent::Updated {
            id: KeyId::from("AbCdEfGhIjKlMnOpQrStUv"),
            delta: UsageDelta::new(2, 512, 0),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"SV_UPD","data":{"id":"AbCdEfGhIjKlMnOpQrStUv","times":2,"bytes":512}}"#
        );
        let back: VaultEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let event = VaultEvent::Deleted {
            id: KeyId::generate(),
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
