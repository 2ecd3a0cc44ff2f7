//! HKDF plugin: RFC 5869 extract-and-expand key derivation.

use hkdf::Hkdf;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::error::{CipherError, Result};
use crate::options::{Digest, KdfOptions};
use crate::plugin::VaultPlugin;

macro_rules! hkdf_derive {
    ($digest:ty, $base:expr, $salt:expr, $info:expr, $out:expr) => {{
        // absent or empty salt falls back to hash-length zeros per the RFC
        let hk = Hkdf::<$digest>::new($salt, $base);
        hk.expand($info, $out)
    }};
}

/// HKDF key-derivation plugin.
pub struct HkdfPlugin;

impl VaultPlugin for HkdfPlugin {
    fn name(&self) -> &'static str {
        "HKDF"
    }

    fn derive(
        &self,
        base: &[u8],
        bits: u32,
        digest: Digest,
        options: &KdfOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let req_len = (bits as usize).div_ceil(8);
        let salt = options
            .salt
            .as_deref()
            .filter(|s| !s.is_empty());
        let info = options.info.as_deref().unwrap_or(&[]);

        let mut out = Zeroizing::new(vec![0u8; req_len]);
        let expanded = match digest {
            Digest::Sha1 => hkdf_derive!(Sha1, base, salt, info, &mut out),
            Digest::Sha256 => hkdf_derive!(Sha256, base, salt, info, &mut out),
            Digest::Sha384 => hkdf_derive!(Sha384, base, salt, info, &mut out),
            Digest::Sha512 => hkdf_derive!(Sha512, base, salt, info, &mut out),
        };
        expanded.map_err(|_| {
            CipherError::ArgumentError(format!(
                "Derived key is too long for {digest:?}: {bits}"
            ))
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5869 test case 1
    #[test]
    fn rfc5869_case_1() {
        let p = HkdfPlugin;
        let ikm = [0x0bu8; 22];
        let options = KdfOptions {
            salt: Some(hex::decode("000102030405060708090a0b0c").unwrap()),
            info: Some(hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap()),
            rounds: None,
        };
        let okm = p.derive(&ikm, 42 * 8, Digest::Sha256, &options).unwrap();
        assert_eq!(
            hex::encode(&*okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn excessive_length_rejected() {
        let p = HkdfPlugin;
        // over 255 blocks of SHA-256 output
        let bits = (255 * 32 + 1) * 8;
        assert!(matches!(
            p.derive(b"ikm", bits, Digest::Sha256, &KdfOptions::default()),
            Err(CipherError::ArgumentError(_))
        ));
    }

    #[test]
    fn empty_salt_matches_absent_salt() {
        let p = HkdfPlugin;
        let with_empty = KdfOptions {
            salt: Some(Vec::new()),
            ..Default::default()
        };
        let a = p.derive(b"ikm", 256, Digest::Sha512, &with_empty).unwrap();
        let b = p
            .derive(b"ikm", 256, Digest::Sha512, &KdfOptions::default())
            .unwrap();
        assert_eq!(*a, *b);
    }
}
