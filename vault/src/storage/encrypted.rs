//! Envelope encryption over any backend, plus KEK lifecycle.
//!
//! The KEK lives only inside this type's private state and is wiped on
//! lock. A new secret is committed only after a self-test against the
//! sentinel record proves it decrypts existing data.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use secvault_cipher::{registry, CipherOptions, KdfOptions, VaultPlugin};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::{CipherConfig, KdfConfig};
use crate::error::{Result, VaultError};
use crate::record::{KeyId, KeyRecord, UsageDelta, UsageFlags};
use crate::storage::{KeyBackend, KeyStorage};

/// Force full id-derived IV length even for GCM.
const FORCED_IV_LENGTH: usize = 16;

const SENTINEL_EXT_ID: &str = "KEKTEST";
const SENTINEL_PLAINTEXT: &[u8] = b"KEKTEST";

/// The active KEK, cipher plugin and cipher options. Created by unlock,
/// destroyed by lock; never exposed outside the encrypt/decrypt boundary.
struct EncryptionContext {
    kek: Zeroizing<Vec<u8>>,
    plugin: Arc<dyn VaultPlugin>,
    cipher: CipherConfig,
}

/// Transparent envelope encryption of `raw` before every write and
/// decryption after every read.
pub struct EncryptedStorage<B: KeyBackend> {
    backend: B,
    ctx: RwLock<Option<EncryptionContext>>,
}

impl<B: KeyBackend> EncryptedStorage<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            ctx: RwLock::new(None),
        }
    }

    fn cipher_options(ctx: &EncryptionContext, iv: Option<Vec<u8>>) -> CipherOptions {
        CipherOptions {
            mode: Some(ctx.cipher.mode),
            aad: Some(ctx.cipher.aad.clone().into_bytes()),
            iv,
            iv_length: Some(FORCED_IV_LENGTH),
            ..Default::default()
        }
    }

    fn encrypt_with(ctx: &EncryptionContext, record: &KeyRecord) -> Result<String> {
        let raw = record
            .raw
            .as_ref()
            .ok_or_else(|| VaultError::InvalidArgument("No raw material to seal".into()))?;
        // natural unique IV from the record's own id
        let options = Self::cipher_options(ctx, Some(record.id.derive_iv(FORCED_IV_LENGTH)));
        let edata = ctx.plugin.encrypt(&ctx.kek, raw, &options)?;
        Ok(STANDARD.encode(edata))
    }

    fn decrypt_with(ctx: &EncryptionContext, record: &KeyRecord) -> Result<Zeroizing<Vec<u8>>> {
        let data = record.data.as_ref().ok_or(VaultError::InvalidData)?;
        let edata = STANDARD.decode(data).map_err(|_| VaultError::InvalidData)?;
        let options = Self::cipher_options(ctx, None);
        Ok(ctx.plugin.decrypt(&ctx.kek, &edata, &options)?)
    }

    fn sentinel_matches(ctx: &EncryptionContext, record: &KeyRecord) -> Result<()> {
        let plain = Self::decrypt_with(ctx, record).map_err(|_| VaultError::InvalidSecret)?;
        if plain.ct_eq(SENTINEL_PLAINTEXT).into() {
            Ok(())
        } else {
            Err(VaultError::InvalidSecret)
        }
    }

    /// Verify the candidate context against the sentinel record, creating
    /// the sentinel on first-time setup.
    async fn self_test(&self, ctx: &EncryptionContext) -> Result<()> {
        match self.backend.load_ext(SENTINEL_EXT_ID).await {
            Ok(record) => Self::sentinel_matches(ctx, &record),
            Err(VaultError::UnknownKeyID(_)) => {
                let mut sentinel = KeyRecord::new(
                    SENTINEL_EXT_ID,
                    UsageFlags::default(),
                    ctx.cipher.key_type.clone(),
                    serde_json::Map::new(),
                );
                sentinel.raw = Some(Zeroizing::new(SENTINEL_PLAINTEXT.to_vec()));
                sentinel.data = Some(Self::encrypt_with(ctx, &sentinel)?);
                match self.backend.insert(&sentinel.sealed()).await {
                    Ok(()) => {
                        tracing::info!("storage secret sentinel created");
                        Ok(())
                    }
                    // lost a first-setup race, verify against the winner
                    Err(VaultError::Duplicate(_)) => {
                        let record = self.backend.load_ext(SENTINEL_EXT_ID).await?;
                        Self::sentinel_matches(ctx, &record)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl<B: KeyBackend> KeyStorage for EncryptedStorage<B> {
    async fn load(&self, id: &KeyId, decrypt: bool) -> Result<KeyRecord> {
        let mut record = self.backend.load(id).await?;
        if decrypt {
            let guard = self.ctx.read();
            let ctx = guard.as_ref().ok_or(VaultError::LockedStorage)?;
            record.raw = Some(Self::decrypt_with(ctx, &record)?);
        }
        Ok(record)
    }

    async fn load_ext(&self, ext_id: &str, decrypt: bool) -> Result<KeyRecord> {
        let mut record = self.backend.load_ext(ext_id).await?;
        if decrypt {
            let guard = self.ctx.read();
            let ctx = guard.as_ref().ok_or(VaultError::LockedStorage)?;
            record.raw = Some(Self::decrypt_with(ctx, &record)?);
        }
        Ok(record)
    }

    async fn save(&self, record: &KeyRecord) -> Result<()> {
        let mut sealed = record.sealed();
        {
            let guard = self.ctx.read();
            let ctx = guard.as_ref().ok_or(VaultError::LockedStorage)?;
            sealed.data = Some(Self::encrypt_with(ctx, record)?);
        }
        self.backend.insert(&sealed).await
    }

    async fn remove(&self, id: &KeyId) -> Result<()> {
        self.backend.remove(id).await
    }

    async fn update_usage(&self, id: &KeyId, delta: &UsageDelta) -> Result<()> {
        self.backend.update_usage(id, delta).await
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<KeyId>> {
        self.backend.list(prefix).await
    }

    async fn set_secret(
        &self,
        secret: Option<&[u8]>,
        cipher: CipherConfig,
        kdf: Option<KdfConfig>,
    ) -> Result<()> {
        let Some(secret) = secret else {
            // wipe the KEK; prior ciphertexts stay valid for the next unlock
            *self.ctx.write() = None;
            tracing::info!("storage locked");
            return Ok(());
        };

        let plugin = registry::get(&cipher.key_type)?;
        let kek = match &kdf {
            Some(kdf_cfg) => {
                let kdf_plugin = registry::get(&kdf_cfg.kdf)?;
                let options = KdfOptions {
                    salt: Some(kdf_cfg.salt.clone().into_bytes()),
                    info: Some(kdf_cfg.info.clone().into_bytes()),
                    rounds: Some(kdf_cfg.rounds),
                };
                let ikm = Zeroizing::new(secret.to_vec());
                let bits = cipher.bits;
                let digest = kdf_cfg.digest;
                // PBKDF2 rounds are CPU bound, keep them off the executor
                let derived = tokio::task::spawn_blocking(move || {
                    kdf_plugin.derive(&ikm, bits, digest, &options)
                })
                .await
                .map_err(|err| VaultError::Storage(err.to_string()))?;
                derived?
            }
            None => Zeroizing::new(secret.to_vec()),
        };

        let candidate = EncryptionContext {
            kek,
            plugin,
            cipher,
        };
        // prior state stays untouched unless the self-test passes
        self.self_test(&candidate).await?;
        *self.ctx.write() = Some(candidate);
        tracing::info!("storage unlocked");
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.ctx.read().is_none()
    }
}
