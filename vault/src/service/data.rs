//! Data operations with stored keys: encrypt, decrypt, sign, verify.
//!
//! Every success bumps the key's usage counters; decrypt and verify
//! failures bump the failure counter and coalesce to a single coarse
//! error so callers cannot distinguish wrong key from corrupt input.

use std::sync::Arc;

use secvault_cipher::{registry, CipherOptions};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::record::{KeyId, KeyRecord, UsageDelta, UsageFlag};
use crate::service::ServiceShared;

pub struct DataService {
    shared: Arc<ServiceShared>,
}

impl DataService {
    pub fn new(shared: Arc<ServiceShared>) -> Self {
        Self { shared }
    }

    /// Counter updates are best effort; a failed bump never fails the
    /// data operation itself.
    async fn bump(&self, id: &KeyId, delta: UsageDelta) {
        if let Err(err) = self.shared.storage().update_usage(id, &delta).await {
            tracing::warn!(id = %id, error = %err, "usage update failed");
        }
    }

    fn raw<'a>(record: &'a KeyRecord) -> Result<&'a [u8]> {
        record
            .raw
            .as_deref()
            .map(|r| r.as_slice())
            .ok_or(VaultError::LockedStorage)
    }

    pub async fn encrypt(
        &self,
        id: &KeyId,
        data: &[u8],
        options: &CipherOptions,
    ) -> Result<Vec<u8>> {
        let record = self.shared.load_for(id, UsageFlag::Encrypt).await?;
        let plugin = registry::get(&record.key_type)?;
        let out = plugin.encrypt(Self::raw(&record)?, data, options)?;
        self.bump(id, UsageDelta::new(1, data.len() as u64, 0)).await;
        Ok(out)
    }

    pub async fn decrypt(
        &self,
        id: &KeyId,
        edata: &[u8],
        options: &CipherOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let record = self.shared.load_for(id, UsageFlag::Encrypt).await?;
        let plugin = registry::get(&record.key_type)?;
        match plugin.decrypt(Self::raw(&record)?, edata, options) {
            Ok(plain) => {
                self.bump(id, UsageDelta::new(1, edata.len() as u64, 0)).await;
                Ok(plain)
            }
            Err(err) => {
                tracing::debug!(id = %id, error = %err, "decrypt failed");
                self.bump(id, UsageDelta::new(0, 0, 1)).await;
                Err(VaultError::InvalidData)
            }
        }
    }

    pub async fn sign(&self, id: &KeyId, data: &[u8], options: &CipherOptions) -> Result<Vec<u8>> {
        let record = self.shared.load_for(id, UsageFlag::Sign).await?;
        let plugin = registry::get(&record.key_type)?;
        let sig = plugin.sign(Self::raw(&record)?, data, options)?;
        self.bump(id, UsageDelta::new(1, data.len() as u64, 0)).await;
        Ok(sig)
    }

    pub async fn verify(
        &self,
        id: &KeyId,
        data: &[u8],
        sig: &[u8],
        options: &CipherOptions,
    ) -> Result<()> {
        let record = self.shared.load_for(id, UsageFlag::Sign).await?;
        let plugin = registry::get(&record.key_type)?;
        match plugin.verify(Self::raw(&record)?, data, sig, options) {
            Ok(()) => {
                self.bump(id, UsageDelta::new(1, data.len() as u64, 0)).await;
                Ok(())
            }
            Err(err) => {
                tracing::debug!(id = %id, error = %err, "verification failed");
                self.bump(id, UsageDelta::new(0, 0, 1)).await;
                Err(VaultError::InvalidSignature)
            }
        }
    }
}
