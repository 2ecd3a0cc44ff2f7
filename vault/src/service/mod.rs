//! Service layer: key lifecycle orchestration and data operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, VaultError};
use crate::record::{KeyId, KeyRecord, UsageFlag, UsageFlags, UsageStats};
use crate::storage::KeyStorage;

pub mod data;
pub mod keys;

pub use data::DataService;
pub use keys::{KeyService, Material};

/// Metadata view of a key. Carries neither raw material nor ciphertext.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub id: KeyId,
    pub ext_id: String,
    pub key_type: String,
    pub flags: UsageFlags,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub created: Option<DateTime<Utc>>,
    pub stats: UsageStats,
}

impl From<KeyRecord> for KeyInfo {
    fn from(record: KeyRecord) -> Self {
        Self {
            id: record.id,
            ext_id: record.ext_id,
            key_type: record.key_type,
            flags: record.flags,
            params: record.params,
            created: record.created,
            stats: record.stats,
        }
    }
}

/// Storage handle plus the policy checks every service applies on load.
pub struct ServiceShared {
    storage: Arc<dyn KeyStorage>,
    failure_limit: u64,
}

impl ServiceShared {
    pub fn new(storage: Arc<dyn KeyStorage>, failure_limit: u64) -> Self {
        Self {
            storage,
            failure_limit,
        }
    }

    pub fn storage(&self) -> &Arc<dyn KeyStorage> {
        &self.storage
    }

    /// Failure-count circuit breaker, applied on every key load.
    fn guard(&self, record: &KeyRecord) -> Result<()> {
        if record.stats.failures > self.failure_limit {
            return Err(VaultError::SecurityError(format!(
                "Failure limit exceeded for key {}",
                record.id
            )));
        }
        Ok(())
    }

    /// Load with decryption, enforcing the capability flag and the
    /// failure ceiling.
    pub async fn load_for(&self, id: &KeyId, flag: UsageFlag) -> Result<KeyRecord> {
        let record = self.storage.load(id, true).await?;
        self.guard(&record)?;
        if !record.flags.has(flag) {
            return Err(VaultError::NotApplicable);
        }
        Ok(record)
    }

    /// Load without decryption; only the failure ceiling applies.
    pub async fn load_meta(&self, id: &KeyId) -> Result<KeyRecord> {
        let record = self.storage.load(id, false).await?;
        self.guard(&record)?;
        Ok(record)
    }

    /// Load by external id without decryption; only the failure ceiling
    /// applies.
    pub async fn load_meta_ext(&self, ext_id: &str) -> Result<KeyRecord> {
        let record = self.storage.load_ext(ext_id, false).await?;
        self.guard(&record)?;
        Ok(record)
    }
}
