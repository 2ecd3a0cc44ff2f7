//! Storage traits and implementations.
//!
//! [`KeyBackend`] is raw persistence: row load/save/remove/list plus
//! transactional event emission. [`KeyStorage`] is the decorated surface
//! consumed by services, adding envelope encryption and KEK lifecycle.

use async_trait::async_trait;

use crate::config::{CipherConfig, KdfConfig};
use crate::error::Result;
use crate::record::{KeyId, KeyRecord, UsageDelta};

pub mod cached;
pub mod encrypted;
pub mod memory;
pub mod sqlite;

pub use cached::CachedStorage;
pub use encrypted::EncryptedStorage;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Raw record persistence. Implementations emit [`crate::events::VaultEvent`]s
/// transactionally with every mutation.
#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Load by id; fails `UnknownKeyID` on a miss.
    async fn load(&self, id: &KeyId) -> Result<KeyRecord>;

    /// Load by external id; fails `UnknownKeyID` on a miss.
    async fn load_ext(&self, ext_id: &str) -> Result<KeyRecord>;

    /// Insert a new row; fails `Duplicate` on an id or external-id clash.
    async fn insert(&self, record: &KeyRecord) -> Result<()>;

    /// Delete exactly one row; fails `UnknownKeyID` when nothing matched.
    async fn remove(&self, id: &KeyId) -> Result<()>;

    /// Add the delta to the stored counters; fails `UnknownKeyID` when the
    /// row vanished so callers can reconcile.
    async fn update_usage(&self, id: &KeyId, delta: &UsageDelta) -> Result<()>;

    /// Ids of all keys, optionally filtered by external-id prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<KeyId>>;
}

// lets replicas share one backend instance
#[async_trait]
impl<T: KeyBackend + ?Sized> KeyBackend for std::sync::Arc<T> {
    async fn load(&self, id: &KeyId) -> Result<KeyRecord> {
        (**self).load(id).await
    }

    async fn load_ext(&self, ext_id: &str) -> Result<KeyRecord> {
        (**self).load_ext(ext_id).await
    }

    async fn insert(&self, record: &KeyRecord) -> Result<()> {
        (**self).insert(record).await
    }

    async fn remove(&self, id: &KeyId) -> Result<()> {
        (**self).remove(id).await
    }

    async fn update_usage(&self, id: &KeyId, delta: &UsageDelta) -> Result<()> {
        (**self).update_usage(id, delta).await
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<KeyId>> {
        (**self).list(prefix).await
    }
}

/// The storage surface consumed by services: encryption-aware loads and
/// the KEK lifecycle on top of a backend.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Load by id, decrypting `raw` when `decrypt` is set.
    async fn load(&self, id: &KeyId, decrypt: bool) -> Result<KeyRecord>;

    /// Load by external id, decrypting `raw` when `decrypt` is set.
    async fn load_ext(&self, ext_id: &str, decrypt: bool) -> Result<KeyRecord>;

    /// Encrypt `raw` and persist the sealed record.
    async fn save(&self, record: &KeyRecord) -> Result<()>;

    async fn remove(&self, id: &KeyId) -> Result<()>;

    async fn update_usage(&self, id: &KeyId, delta: &UsageDelta) -> Result<()>;

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<KeyId>>;

    /// Unlock with an operator secret (deriving and self-testing the KEK)
    /// or lock with `None`.
    async fn set_secret(
        &self,
        secret: Option<&[u8]>,
        cipher: CipherConfig,
        kdf: Option<KdfConfig>,
    ) -> Result<()>;

    fn is_locked(&self) -> bool;
}
