//! Encrypted key storage with envelope encryption, replica-coherent
//! caching and key lifecycle services.
//!
//! Layering, bottom up: a [`storage::KeyBackend`] persists sealed
//! records and emits change events; [`storage::EncryptedStorage`] adds
//! envelope encryption under an operator-derived KEK;
//! [`storage::CachedStorage`] adds an LRU read cache with write-behind
//! usage counters kept coherent across replicas by the event stream.
//! [`service::KeyService`] and [`service::DataService`] sit on top and
//! enforce capability flags and the failure-count circuit breaker.

pub mod config;
pub mod error;
pub mod events;
pub mod record;
pub mod service;
pub mod storage;

pub use config::{CacheConfig, CipherConfig, KdfConfig, StorageConfig};
pub use error::{Result, VaultError};
pub use events::{EventBus, VaultEvent};
pub use record::{KeyId, KeyRecord, UsageDelta, UsageFlag, UsageFlags, UsageStats};
pub use service::{DataService, KeyInfo, KeyService, Material, ServiceShared};
pub use storage::{CachedStorage, EncryptedStorage, KeyBackend, KeyStorage, MemoryBackend, SqliteBackend};
