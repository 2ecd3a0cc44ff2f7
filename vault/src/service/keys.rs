//! Key lifecycle operations: create, derive, expose, wipe.

use std::sync::Arc;

use secvault_cipher::{registry, AesMode, CipherOptions, Digest, KdfOptions, VaultPlugin};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::{CipherConfig, KdfConfig};
use crate::error::{Result, VaultError};
use crate::record::{KeyId, KeyRecord, UsageFlag, UsageFlags};
use crate::service::{KeyInfo, ServiceShared};
use crate::storage::KeyStorage;

type Params = serde_json::Map<String, serde_json::Value>;

/// Where the raw material of a new key comes from.
///
/// Production is deferred until the creation protocol has confirmed the
/// key does not already exist, so a losing racer wastes no entropy.
pub enum Material {
    /// Fresh material from the key type's own `generate`
    Generate,
    /// Caller-supplied bytes
    Inject(Zeroizing<Vec<u8>>),
    /// KDF output from an existing base key
    Derive {
        base: Zeroizing<Vec<u8>>,
        kdf: Arc<dyn VaultPlugin>,
        digest: Digest,
        options: KdfOptions,
        bits: u32,
    },
}

impl Material {
    fn injected(&self) -> Option<&[u8]> {
        match self {
            Material::Inject(raw) => Some(raw),
            _ => None,
        }
    }
}

fn param_u32(params: &Params, name: &str) -> Option<u32> {
    params.get(name).and_then(|v| v.as_u64()).map(|v| v as u32)
}

/// Key lifecycle orchestration over a [`ServiceShared`] handle.
pub struct KeyService {
    shared: Arc<ServiceShared>,
    cipher: CipherConfig,
    kdf: KdfConfig,
}

impl KeyService {
    pub fn new(shared: Arc<ServiceShared>, cipher: CipherConfig, kdf: KdfConfig) -> Self {
        Self {
            shared,
            cipher,
            kdf,
        }
    }

    fn storage(&self) -> &Arc<dyn KeyStorage> {
        self.shared.storage()
    }

    /// Derive and self-test the KEK, then activate it.
    pub async fn unlock(&self, secret: &[u8]) -> Result<()> {
        self.storage()
            .set_secret(Some(secret), self.cipher.clone(), Some(self.kdf.clone()))
            .await
    }

    /// Wipe the KEK; stored ciphertexts stay valid for the next unlock.
    pub async fn lock(&self) -> Result<()> {
        self.storage()
            .set_secret(None, self.cipher.clone(), None)
            .await
    }

    pub fn is_locked(&self) -> bool {
        self.storage().is_locked()
    }

    pub async fn generate_key(
        &self,
        ext_id: &str,
        flags: UsageFlags,
        key_type: &str,
        params: Params,
    ) -> Result<KeyId> {
        self.new_key(ext_id, flags, key_type, params, Material::Generate)
            .await
    }

    pub async fn inject_key(
        &self,
        ext_id: &str,
        flags: UsageFlags,
        key_type: &str,
        params: Params,
        raw: &[u8],
    ) -> Result<KeyId> {
        self.new_key(
            ext_id,
            flags,
            key_type,
            params,
            Material::Inject(Zeroizing::new(raw.to_vec())),
        )
        .await
    }

    /// Inject material that arrives wrapped under another stored key.
    pub async fn inject_encrypted_key(
        &self,
        ext_id: &str,
        flags: UsageFlags,
        key_type: &str,
        params: Params,
        blob: &[u8],
        kek_id: &KeyId,
        mode: Option<AesMode>,
    ) -> Result<KeyId> {
        let kek = self.shared.load_for(kek_id, UsageFlag::Encrypt).await?;
        let plugin = registry::get(&kek.key_type)?;
        let kek_raw = kek.raw.as_ref().ok_or(VaultError::LockedStorage)?;
        let options = CipherOptions {
            mode,
            ..Default::default()
        };
        let raw = plugin
            .decrypt(kek_raw, blob, &options)
            .map_err(|_| VaultError::InvalidData)?;
        self.new_key(ext_id, flags, key_type, params, Material::Inject(raw))
            .await
    }

    /// Create a key whose material is a KDF over an existing base key.
    /// The base key must carry the `derive` capability.
    #[allow(clippy::too_many_arguments)]
    pub async fn derive_key(
        &self,
        ext_id: &str,
        flags: UsageFlags,
        key_type: &str,
        params: Params,
        base_key_id: &KeyId,
        kdf: &str,
        digest: Digest,
        options: KdfOptions,
    ) -> Result<KeyId> {
        let kdf_plugin = registry::get(kdf)?;
        let base = self.shared.load_for(base_key_id, UsageFlag::Derive).await?;
        let base_raw = base.raw.as_ref().ok_or(VaultError::LockedStorage)?;
        let target_plugin = registry::get(key_type)?;
        let bits = param_u32(&params, "bits").unwrap_or_else(|| target_plugin.default_bits());
        self.new_key(
            ext_id,
            flags,
            key_type,
            params,
            Material::Derive {
                base: base_raw.clone(),
                kdf: kdf_plugin,
                digest,
                options,
                bits,
            },
        )
        .await
    }

    /// Hard delete; replicas learn about it from the delete event.
    pub async fn wipe_key(&self, id: &KeyId) -> Result<()> {
        self.storage().remove(id).await
    }

    /// Raw material of a shared key.
    pub async fn expose_key(&self, id: &KeyId) -> Result<Zeroizing<Vec<u8>>> {
        let record = self.shared.load_for(id, UsageFlag::Shared).await?;
        record.raw.clone().ok_or(VaultError::LockedStorage)
    }

    /// Material of a shared key, wrapped under another stored key.
    pub async fn encrypted_key(
        &self,
        id: &KeyId,
        kek_id: &KeyId,
        mode: Option<AesMode>,
    ) -> Result<Vec<u8>> {
        let target = self.shared.load_for(id, UsageFlag::Shared).await?;
        let target_raw = target.raw.as_ref().ok_or(VaultError::LockedStorage)?;
        let kek = self.shared.load_for(kek_id, UsageFlag::Encrypt).await?;
        let kek_raw = kek.raw.as_ref().ok_or(VaultError::LockedStorage)?;
        let plugin = registry::get(&kek.key_type)?;
        let options = CipherOptions {
            mode,
            ..Default::default()
        };
        Ok(plugin.encrypt(kek_raw, target_raw, &options)?)
    }

    /// Material of a shared key, encrypted to a recipient's RSA public key.
    pub async fn pub_encrypted_key(&self, id: &KeyId, pubkey_pem: &[u8]) -> Result<Vec<u8>> {
        let target = self.shared.load_for(id, UsageFlag::Shared).await?;
        let target_raw = target.raw.as_ref().ok_or(VaultError::LockedStorage)?;
        let rsa = registry::get("RSA")?;
        Ok(rsa.encrypt(pubkey_pem, target_raw, &CipherOptions::default())?)
    }

    /// Public half of an asymmetric key. Prefers the cached `pubkey`
    /// param; falls back to deriving it from the private material.
    pub async fn public_key(&self, id: &KeyId) -> Result<Vec<u8>> {
        let record = self.shared.load_meta(id).await?;
        let plugin = registry::get(&record.key_type)?;
        if !plugin.is_asymmetric() {
            return Err(VaultError::NotApplicable);
        }
        if let Some(pem) = record.params.get("pubkey").and_then(|v| v.as_str()) {
            return Ok(pem.as_bytes().to_vec());
        }
        let record = self.storage().load(id, true).await?;
        let raw = record.raw.as_ref().ok_or(VaultError::LockedStorage)?;
        Ok(plugin.pubkey(raw)?)
    }

    pub async fn key_info(&self, id: &KeyId) -> Result<KeyInfo> {
        Ok(self.shared.load_meta(id).await?.into())
    }

    pub async fn key_info_ext(&self, ext_id: &str) -> Result<KeyInfo> {
        Ok(self.shared.load_meta_ext(ext_id).await?.into())
    }

    pub async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<KeyId>> {
        self.storage().list(prefix).await
    }

    /// Idempotent creation: concurrent callers racing on one external id
    /// converge to a single winner, and a re-request with differing
    /// parameters fails `OrigMismatch` instead of overwriting.
    async fn new_key(
        &self,
        ext_id: &str,
        flags: UsageFlags,
        key_type: &str,
        params: Params,
        source: Material,
    ) -> Result<KeyId> {
        // resolve the plugin before any material is produced
        let plugin = registry::get(key_type)?;
        let mut candidate = KeyRecord::new(ext_id, flags, key_type, params);

        // cheap existence probe, no decryption
        match self.storage().load_ext(ext_id, false).await {
            Ok(existing) => {
                return self
                    .verify_existing(&existing, &candidate, source.injected())
                    .await
            }
            Err(VaultError::UnknownKeyID(_)) => {}
            Err(err) => return Err(err),
        }

        let is_inject = matches!(source, Material::Inject(_));
        let raw = produce_material(&plugin, &candidate.params, source).await?;
        plugin.validate_key(&raw).map_err(|err| match err {
            secvault_cipher::CipherError::InvalidKey(msg) => VaultError::InvalidKey(msg),
            other => VaultError::from(other),
        })?;

        // the public half is derived, not caller-supplied; cache it now
        let mut pubkey_backfilled = false;
        if plugin.is_asymmetric() && !candidate.params.contains_key("pubkey") {
            let pem = plugin.pubkey(&raw)?;
            let pem = String::from_utf8(pem)
                .map_err(|_| VaultError::InvalidKey("Public key is not valid UTF-8".into()))?;
            candidate
                .params
                .insert("pubkey".into(), serde_json::Value::String(pem));
            pubkey_backfilled = true;
        }

        candidate.raw = Some(raw);
        match self.storage().save(&candidate).await {
            Ok(()) => {
                tracing::info!(id = %candidate.id, ext_id, key_type, "key created");
                Ok(candidate.id)
            }
            // another creator won the race; converge on its record
            Err(VaultError::Duplicate(_)) => {
                if pubkey_backfilled {
                    // our derived pubkey is not part of the caller's request
                    candidate.params.remove("pubkey");
                }
                let existing = self.storage().load_ext(ext_id, false).await?;
                let injected = if is_inject {
                    candidate.raw.as_deref().map(|r| r.as_slice())
                } else {
                    None
                };
                self.verify_existing(&existing, &candidate, injected).await
            }
            Err(err) => Err(err),
        }
    }

    /// Origin-mismatch check against an already stored record.
    async fn verify_existing(
        &self,
        existing: &KeyRecord,
        candidate: &KeyRecord,
        injected: Option<&[u8]>,
    ) -> Result<KeyId> {
        let mismatch = || VaultError::OrigMismatch(existing.ext_id.clone());
        if existing.key_type != candidate.key_type || existing.flags != candidate.flags {
            return Err(mismatch());
        }
        // a missing caller pubkey is backfilled before comparing: it is
        // derived from the material, never part of the request
        let mut wanted = candidate.params.clone();
        if !wanted.contains_key("pubkey") {
            if let Some(pubkey) = existing.params.get("pubkey") {
                wanted.insert("pubkey".into(), pubkey.clone());
            }
        }
        if wanted != existing.params {
            return Err(mismatch());
        }
        if let Some(injected) = injected {
            let stored = self.storage().load(&existing.id, true).await?;
            let raw = stored.raw.as_ref().ok_or(VaultError::LockedStorage)?;
            if !bool::from(raw.ct_eq(injected)) {
                return Err(mismatch());
            }
        }
        Ok(existing.id.clone())
    }
}

async fn produce_material(
    plugin: &Arc<dyn VaultPlugin>,
    params: &Params,
    source: Material,
) -> Result<Zeroizing<Vec<u8>>> {
    match source {
        Material::Generate => {
            let options = CipherOptions {
                bits: param_u32(params, "bits"),
                chars: params
                    .get("chars")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                ..Default::default()
            };
            let plugin = Arc::clone(plugin);
            // RSA generation can take seconds, keep it off the executor
            let raw = tokio::task::spawn_blocking(move || plugin.generate(&options))
                .await
                .map_err(|err| VaultError::Storage(err.to_string()))?;
            Ok(raw?)
        }
        Material::Inject(raw) => Ok(raw),
        Material::Derive {
            base,
            kdf,
            digest,
            options,
            bits,
        } => {
            let raw = tokio::task::spawn_blocking(move || kdf.derive(&base, bits, digest, &options))
                .await
                .map_err(|err| VaultError::Storage(err.to_string()))?;
            Ok(raw?)
        }
    }
}
