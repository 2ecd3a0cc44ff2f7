//! In-memory backend for tests and ephemeral deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Result, VaultError};
use crate::events::{EventBus, VaultEvent};
use crate::record::{KeyId, KeyRecord, UsageDelta};
use crate::storage::KeyBackend;

#[derive(Default)]
struct MemoryState {
    records: HashMap<KeyId, KeyRecord>,
    ext_index: HashMap<String, KeyId>,
    /// Append-only event log, the in-memory stand-in for a durable table
    log: Vec<VaultEvent>,
}

/// Hash-map backend with the same event contract as the durable one.
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    bus: EventBus,
}

impl MemoryBackend {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Snapshot of the event log, oldest first.
    pub fn event_log(&self) -> Vec<VaultEvent> {
        self.state.read().log.clone()
    }
}

#[async_trait]
impl KeyBackend for MemoryBackend {
    async fn load(&self, id: &KeyId) -> Result<KeyRecord> {
        self.state
            .read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::UnknownKeyID(id.to_string()))
    }

    async fn load_ext(&self, ext_id: &str) -> Result<KeyRecord> {
        let state = self.state.read();
        state
            .ext_index
            .get(ext_id)
            .and_then(|id| state.records.get(id))
            .cloned()
            .ok_or_else(|| VaultError::UnknownKeyID(ext_id.to_string()))
    }

    async fn insert(&self, record: &KeyRecord) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            if state.records.contains_key(&record.id) {
                return Err(VaultError::Duplicate(record.id.to_string()));
            }
            if state.ext_index.contains_key(&record.ext_id) {
                return Err(VaultError::Duplicate(record.ext_id.clone()));
            }
            let mut stored = record.clone();
            stored.raw = None;
            if stored.created.is_none() {
                stored.created = Some(chrono::Utc::now());
            }
            let event = VaultEvent::Created {
                id: stored.id.clone(),
                ext_id: stored.ext_id.clone(),
                key_type: stored.key_type.clone(),
            };
            state.ext_index.insert(stored.ext_id.clone(), stored.id.clone());
            state.records.insert(stored.id.clone(), stored);
            state.log.push(event.clone());
            event
        };
        self.bus.publish(event);
        Ok(())
    }

    async fn remove(&self, id: &KeyId) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            let record = state
                .records
                .remove(id)
                .ok_or_else(|| VaultError::UnknownKeyID(id.to_string()))?;
            state.ext_index.remove(&record.ext_id);
            let event = VaultEvent::Deleted { id: id.clone() };
            state.log.push(event.clone());
            event
        };
        self.bus.publish(event);
        Ok(())
    }

    async fn update_usage(&self, id: &KeyId, delta: &UsageDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let event = {
            let mut state = self.state.write();
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| VaultError::UnknownKeyID(id.to_string()))?;
            record.stats.apply(delta);
            let event = VaultEvent::Updated {
                id: id.clone(),
                delta: *delta,
            };
            state.log.push(event.clone());
            event
        };
        self.bus.publish(event);
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<KeyId>> {
        let state = self.state.read();
        let mut ids: Vec<KeyId> = state
            .records
            .values()
            .filter(|r| prefix.map_or(true, |p| r.ext_id.starts_with(p)))
            .map(|r| r.id.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UsageFlags;

    fn record(ext_id: &str) -> KeyRecord {
        KeyRecord::new(ext_id, UsageFlags::default(), "AES", Default::default())
    }

    #[tokio::test]
    async fn insert_load_remove_cycle() {
        let backend = MemoryBackend::new(EventBus::new());
        let rec = record("alpha");
        backend.insert(&rec).await.unwrap();

        let loaded = backend.load(&rec.id).await.unwrap();
        assert_eq!(loaded.ext_id, "alpha");
        assert!(loaded.created.is_some());
        assert_eq!(backend.load_ext("alpha").await.unwrap().id, rec.id);

        backend.remove(&rec.id).await.unwrap();
        assert!(matches!(
            backend.load(&rec.id).await,
            Err(VaultError::UnknownKeyID(_))
        ));
        assert!(matches!(
            backend.remove(&rec.id).await,
            Err(VaultError::UnknownKeyID(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_ext_id_rejected() {
        let backend = MemoryBackend::new(EventBus::new());
        backend.insert(&record("dup")).await.unwrap();
        assert!(matches!(
            backend.insert(&record("dup")).await,
            Err(VaultError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn usage_accumulates_and_logs() {
        let backend = MemoryBackend::new(EventBus::new());
        let rec = record("counted");
        backend.insert(&rec).await.unwrap();

        backend
            .update_usage(&rec.id, &UsageDelta::new(1, 64, 0))
            .await
            .unwrap();
        backend
            .update_usage(&rec.id, &UsageDelta::new(2, 0, 1))
            .await
            .unwrap();
        // empty deltas are dropped before they reach the log
        backend
            .update_usage(&rec.id, &UsageDelta::default())
            .await
            .unwrap();

        let loaded = backend.load(&rec.id).await.unwrap();
        assert_eq!(loaded.stats.times, 3);
        assert_eq!(loaded.stats.bytes, 64);
        assert_eq!(loaded.stats.failures, 1);
        assert_eq!(backend.event_log().len(), 3);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let backend = MemoryBackend::new(EventBus::new());
        backend.insert(&record("app/a")).await.unwrap();
        backend.insert(&record("app/b")).await.unwrap();
        backend.insert(&record("sys/x")).await.unwrap();

        assert_eq!(backend.list(None).await.unwrap().len(), 3);
        assert_eq!(backend.list(Some("app/")).await.unwrap().len(), 2);
        assert!(backend.list(Some("nope")).await.unwrap().is_empty());
    }
}
