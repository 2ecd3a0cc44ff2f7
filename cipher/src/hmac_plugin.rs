//! HMAC plugin: keyed MACs with 256..=512 bit keys.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::error::{CipherError, Result};
use crate::options::{CipherOptions, Digest};
use crate::plugin::{random_bytes, VaultPlugin};

fn validate_key_bits(bits: u32) -> Result<()> {
    if bits % 8 != 0 || !(256..=512).contains(&bits) {
        return Err(CipherError::NotSupported(format!(
            "Invalid MAC key length: {bits}"
        )));
    }
    Ok(())
}

macro_rules! hmac_sign {
    ($digest:ty, $key:expr, $data:expr) => {{
        let mut mac = Hmac::<$digest>::new_from_slice($key)
            .map_err(|_| CipherError::InvalidKey("HMAC key rejected".into()))?;
        mac.update($data);
        mac.finalize().into_bytes().to_vec()
    }};
}

macro_rules! hmac_verify {
    ($digest:ty, $key:expr, $data:expr, $sig:expr) => {{
        let mut mac = Hmac::<$digest>::new_from_slice($key)
            .map_err(|_| CipherError::InvalidSignature)?;
        mac.update($data);
        mac.verify_slice($sig)
            .map_err(|_| CipherError::InvalidSignature)
    }};
}

/// HMAC message authentication plugin.
pub struct HmacPlugin;

impl VaultPlugin for HmacPlugin {
    fn name(&self) -> &'static str {
        "HMAC"
    }

    fn default_bits(&self) -> u32 {
        256
    }

    fn generate(&self, options: &CipherOptions) -> Result<Zeroizing<Vec<u8>>> {
        let bits = options.bits.unwrap_or_else(|| self.default_bits());
        validate_key_bits(bits)?;
        Ok(random_bytes(bits as usize / 8))
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        validate_key_bits((key.len() * 8) as u32)
    }

    fn sign(&self, key: &[u8], data: &[u8], options: &CipherOptions) -> Result<Vec<u8>> {
        self.validate_key(key)?;
        let sig = match options.digest.unwrap_or(Digest::Sha256) {
            Digest::Sha1 => hmac_sign!(Sha1, key, data),
            Digest::Sha256 => hmac_sign!(Sha256, key, data),
            Digest::Sha384 => hmac_sign!(Sha384, key, data),
            Digest::Sha512 => hmac_sign!(Sha512, key, data),
        };
        Ok(sig)
    }

    fn verify(
        &self,
        key: &[u8],
        data: &[u8],
        sig: &[u8],
        options: &CipherOptions,
    ) -> Result<()> {
        self.validate_key(key)?;
        match options.digest.unwrap_or(Digest::Sha256) {
            Digest::Sha1 => hmac_verify!(Sha1, key, data, sig),
            Digest::Sha256 => hmac_verify!(Sha256, key, data, sig),
            Digest::Sha384 => hmac_verify!(Sha384, key, data, sig),
            Digest::Sha512 => hmac_verify!(Sha512, key, data, sig),
        }
    }
}
