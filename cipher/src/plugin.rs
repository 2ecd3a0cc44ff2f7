//! The capability interface every algorithm plugin implements

use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CipherError, Result};
use crate::options::{CipherOptions, Digest, KdfOptions};

/// Fill a fresh buffer with OS-sourced randomness.
pub fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Uniform interface over heterogeneous algorithms.
///
/// Every operation defaults to `NotApplicable` so each plugin only
/// implements the surface of its variant: symmetric ciphers override
/// encrypt/decrypt, MACs override sign/verify, KDFs override derive,
/// asymmetric plugins additionally override pubkey.
pub trait VaultPlugin: Send + Sync {
    /// Registry name, e.g. `"AES"`.
    fn name(&self) -> &'static str;

    /// Default key strength in bits when the caller does not choose one.
    fn default_bits(&self) -> u32 {
        128
    }

    /// Whether keys of this type have a derivable public half.
    fn is_asymmetric(&self) -> bool {
        false
    }

    /// Produce fresh key material.
    fn generate(&self, options: &CipherOptions) -> Result<Zeroizing<Vec<u8>>> {
        let _ = options;
        Err(CipherError::NotApplicable)
    }

    /// Check externally supplied key material for this algorithm.
    ///
    /// The default accepts anything; plugins with structural requirements
    /// override and fail `InvalidKey`.
    fn validate_key(&self, key: &[u8]) -> Result<()> {
        let _ = key;
        Ok(())
    }

    /// Encrypt into the `ciphertext ‖ IV ‖ auth-tag` envelope.
    fn encrypt(&self, key: &[u8], data: &[u8], options: &CipherOptions) -> Result<Vec<u8>> {
        let _ = (key, data, options);
        Err(CipherError::NotApplicable)
    }

    /// Decrypt an envelope produced by `encrypt`.
    fn decrypt(
        &self,
        key: &[u8],
        edata: &[u8],
        options: &CipherOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let _ = (key, edata, options);
        Err(CipherError::NotApplicable)
    }

    /// Produce a signature or MAC over `data`.
    fn sign(&self, key: &[u8], data: &[u8], options: &CipherOptions) -> Result<Vec<u8>> {
        let _ = (key, data, options);
        Err(CipherError::NotApplicable)
    }

    /// Verify a signature in constant time where the algorithm allows.
    ///
    /// All failure causes coalesce to `InvalidSignature`.
    fn verify(
        &self,
        key: &[u8],
        data: &[u8],
        sig: &[u8],
        options: &CipherOptions,
    ) -> Result<()> {
        let _ = (key, data, sig, options);
        Err(CipherError::NotApplicable)
    }

    /// Derive `bits` of key material from `base`.
    fn derive(
        &self,
        base: &[u8],
        bits: u32,
        digest: Digest,
        options: &KdfOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let _ = (base, bits, digest, options);
        Err(CipherError::NotApplicable)
    }

    /// Derive the public half of an asymmetric private key.
    fn pubkey(&self, key: &[u8]) -> Result<Vec<u8>> {
        let _ = key;
        Err(CipherError::NotApplicable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;

    impl VaultPlugin for Inert {
        fn name(&self) -> &'static str {
            "Inert"
        }
    }

    #[test]
    fn defaults_are_not_applicable() {
        let p = Inert;
        let opts = CipherOptions::default();
        assert!(matches!(
            p.encrypt(b"k", b"d", &opts),
            Err(CipherError::NotApplicable)
        ));
        assert!(matches!(
            p.pubkey(b"k"),
            Err(CipherError::NotApplicable)
        ));
        assert!(p.validate_key(b"anything").is_ok());
    }

    #[test]
    fn random_bytes_differ() {
        let a = random_bytes(32);
        let b = random_bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(*a, *b);
    }
}
