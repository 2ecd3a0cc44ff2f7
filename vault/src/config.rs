//! Configuration structs with serde-level defaulting.

use std::path::PathBuf;
use std::time::Duration;

use secvault_cipher::{AesMode, Digest};
use serde::{Deserialize, Serialize};

fn default_cipher_type() -> String {
    "AES".to_string()
}

fn default_cipher_bits() -> u32 {
    256
}

fn default_cipher_mode() -> AesMode {
    AesMode::Gcm
}

fn default_aad() -> String {
    "SecVault".to_string()
}

/// Cipher used to wrap raw key material under the KEK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherConfig {
    #[serde(default = "default_cipher_type")]
    pub key_type: String,
    #[serde(default = "default_cipher_bits")]
    pub bits: u32,
    #[serde(default = "default_cipher_mode")]
    pub mode: AesMode,
    #[serde(default = "default_aad")]
    pub aad: String,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            key_type: default_cipher_type(),
            bits: default_cipher_bits(),
            mode: default_cipher_mode(),
            aad: default_aad(),
        }
    }
}

fn default_kdf_type() -> String {
    "HKDF".to_string()
}

fn default_kdf_salt() -> String {
    "SecVault".to_string()
}

fn default_kdf_info() -> String {
    "KEK".to_string()
}

fn default_kdf_rounds() -> u32 {
    1000
}

fn default_kdf_digest() -> Digest {
    Digest::Sha512
}

/// KDF that turns the operator secret into the KEK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_kdf_type")]
    pub kdf: String,
    #[serde(default = "default_kdf_salt")]
    pub salt: String,
    /// Info parameter, used by HKDF
    #[serde(default = "default_kdf_info")]
    pub info: String,
    /// Iteration count, used by PBKDF2
    #[serde(default = "default_kdf_rounds")]
    pub rounds: u32,
    #[serde(default = "default_kdf_digest")]
    pub digest: Digest,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            kdf: default_kdf_type(),
            salt: default_kdf_salt(),
            info: default_kdf_info(),
            rounds: default_kdf_rounds(),
            digest: default_kdf_digest(),
        }
    }
}

fn default_cache_size() -> usize {
    10240
}

fn default_ttl_ms() -> u64 {
    600_000
}

fn default_sync_delay_ms() -> u64 {
    10_000
}

fn default_sync_threads() -> usize {
    3
}

/// Tuning for the cached storage wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Max cached entries
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Entry time-to-live in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Delay between flush-worker iterations in milliseconds
    #[serde(default = "default_sync_delay_ms")]
    pub sync_delay_ms: u64,
    /// Max ids drained concurrently per flush iteration
    #[serde(default = "default_sync_threads")]
    pub sync_threads: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            ttl_ms: default_ttl_ms(),
            sync_delay_ms: default_sync_delay_ms(),
            sync_threads: default_sync_threads(),
        }
    }
}

fn default_key_table() -> String {
    "enc_keys".to_string()
}

fn default_failure_limit() -> u64 {
    10_000
}

/// Backend and service level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path; in-memory when absent
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_key_table")]
    pub key_table: String,
    /// Decrypt/verify failure ceiling before a key is quarantined
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            key_table: default_key_table(),
            failure_limit: default_failure_limit(),
        }
    }
}
