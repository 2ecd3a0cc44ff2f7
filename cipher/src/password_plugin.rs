//! Password plugin: printable shared secrets with constant-time
//! verification.
//!
//! Secrets run from 4 to 255 bytes; a custom character set can be
//! supplied through `CipherOptions::chars`.

use rand::Rng;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{CipherError, Result};
use crate::options::CipherOptions;
use crate::plugin::VaultPlugin;

const DEFAULT_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn validate_key_bits(bits: u32) -> Result<()> {
    let bytes = bits / 8;
    if bits % 8 != 0 || !(4..=255).contains(&bytes) {
        return Err(CipherError::NotSupported(format!(
            "Invalid Password length: {bits}"
        )));
    }
    Ok(())
}

/// Password shared-secret plugin.
pub struct PasswordPlugin;

impl VaultPlugin for PasswordPlugin {
    fn name(&self) -> &'static str {
        "Password"
    }

    fn default_bits(&self) -> u32 {
        128
    }

    fn generate(&self, options: &CipherOptions) -> Result<Zeroizing<Vec<u8>>> {
        let bits = options.bits.unwrap_or_else(|| self.default_bits());
        validate_key_bits(bits)?;
        let chars: &[u8] = match &options.chars {
            Some(chars) if !chars.is_empty() => chars.as_bytes(),
            _ => DEFAULT_CHARS,
        };
        let mut rng = rand::rngs::OsRng;
        let secret: Vec<u8> = (0..bits / 8)
            .map(|_| chars[rng.gen_range(0..chars.len())])
            .collect();
        Ok(Zeroizing::new(secret))
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        validate_key_bits((key.len() * 8) as u32)
    }

    fn verify(
        &self,
        key: &[u8],
        _data: &[u8],
        sig: &[u8],
        _options: &CipherOptions,
    ) -> Result<()> {
        if key.ct_eq(sig).into() {
            Ok(())
        } else {
            Err(CipherError::InvalidSignature)
        }
    }
}
