//! Key record model: ids, capability flags, usage counters.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Opaque key identifier: base64url encoding of a UUIDv4, 22 chars.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Mint a fresh globally unique id.
    pub fn generate() -> Self {
        KeyId(URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic per-record IV: the decoded id bytes zero-padded or
    /// truncated to `len`. Unique ids are a correctness precondition for
    /// IV uniqueness.
    pub fn derive_iv(&self, len: usize) -> Vec<u8> {
        let mut iv = URL_SAFE_NO_PAD
            .decode(&self.0)
            .unwrap_or_else(|_| self.0.clone().into_bytes());
        iv.resize(len, 0);
        iv
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        KeyId(s)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        KeyId(s.to_string())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

/// Fixed capability set granted at creation, immutable afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageFlags {
    pub encrypt: bool,
    pub sign: bool,
    pub derive: bool,
    pub shared: bool,
    pub temp: bool,
}

/// Capability selector used by service-level gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageFlag {
    Encrypt,
    Sign,
    Derive,
    Shared,
    Temp,
}

impl UsageFlags {
    pub fn has(&self, flag: UsageFlag) -> bool {
        match flag {
            UsageFlag::Encrypt => self.encrypt,
            UsageFlag::Sign => self.sign,
            UsageFlag::Derive => self.derive,
            UsageFlag::Shared => self.shared,
            UsageFlag::Temp => self.temp,
        }
    }
}

/// Monotonic per-key usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub times: u64,
    pub bytes: u64,
    pub failures: u64,
}

impl UsageStats {
    pub fn apply(&mut self, delta: &UsageDelta) {
        self.times = self.times.saturating_add(delta.times);
        self.bytes = self.bytes.saturating_add(delta.bytes);
        self.failures = self.failures.saturating_add(delta.failures);
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Usage increments; zero fields are omitted on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub times: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failures: u64,
}

impl UsageDelta {
    pub fn new(times: u64, bytes: u64, failures: u64) -> Self {
        Self {
            times,
            bytes,
            failures,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.times == 0 && self.bytes == 0 && self.failures == 0
    }

    pub fn add(&mut self, other: &UsageDelta) {
        self.times = self.times.saturating_add(other.times);
        self.bytes = self.bytes.saturating_add(other.bytes);
        self.failures = self.failures.saturating_add(other.failures);
    }

    /// Subtract a flushed snapshot from the live delta.
    pub fn subtract(&mut self, other: &UsageDelta) {
        self.times = self.times.saturating_sub(other.times);
        self.bytes = self.bytes.saturating_sub(other.bytes);
        self.failures = self.failures.saturating_sub(other.failures);
    }
}

/// One stored key and its metadata.
///
/// `raw` is present in memory only while the storage is unlocked and the
/// record was loaded with decryption; it is never serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyId,
    pub ext_id: String,
    #[serde(skip)]
    pub raw: Option<Zeroizing<Vec<u8>>>,
    /// Base64 envelope, the persisted form of `raw`
    pub data: Option<String>,
    pub flags: UsageFlags,
    pub key_type: String,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub created: Option<DateTime<Utc>>,
    pub stats: UsageStats,
}

impl KeyRecord {
    pub fn new(
        ext_id: impl Into<String>,
        flags: UsageFlags,
        key_type: impl Into<String>,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: KeyId::generate(),
            ext_id: ext_id.into(),
            raw: None,
            data: None,
            flags,
            key_type: key_type.into(),
            params,
            created: None,
            stats: UsageStats::default(),
        }
    }

    /// Copy for persistence: identical metadata, no raw material.
    pub fn sealed(&self) -> Self {
        let mut copy = self.clone();
        copy.raw = None;
        copy
    }
}

// manual impl keeps raw material and ciphertext out of logs
impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("ext_id", &self.ext_id)
            .field("key_type", &self.key_type)
            .field("flags", &self.flags)
            .field("created", &self.created)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
