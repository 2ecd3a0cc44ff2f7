//! PBKDF2 plugin.

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::error::{CipherError, Result};
use crate::options::{Digest, KdfOptions};
use crate::plugin::VaultPlugin;

const DEFAULT_ROUNDS: u32 = 1000;

/// PBKDF2 key-derivation plugin.
///
/// Iteration count comes from `KdfOptions::rounds`; the work is CPU-bound
/// and callers are expected to run it off the async executor.
pub struct Pbkdf2Plugin;

impl VaultPlugin for Pbkdf2Plugin {
    fn name(&self) -> &'static str {
        "PBKDF2"
    }

    fn derive(
        &self,
        base: &[u8],
        bits: u32,
        digest: Digest,
        options: &KdfOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if bits == 0 || bits % 8 != 0 {
            return Err(CipherError::ArgumentError(format!(
                "Invalid derived key length: {bits}"
            )));
        }
        let rounds = options.rounds.unwrap_or(DEFAULT_ROUNDS);
        if rounds == 0 {
            return Err(CipherError::ArgumentError("Zero PBKDF2 rounds".into()));
        }
        let salt = options.salt.as_deref().unwrap_or(&[]);

        let mut out = Zeroizing::new(vec![0u8; bits as usize / 8]);
        match digest {
            Digest::Sha1 => pbkdf2_hmac::<Sha1>(base, salt, rounds, &mut out),
            Digest::Sha256 => pbkdf2_hmac::<Sha256>(base, salt, rounds, &mut out),
            Digest::Sha384 => pbkdf2_hmac::<Sha384>(base, salt, rounds, &mut out),
            Digest::Sha512 => pbkdf2_hmac::<Sha512>(base, salt, rounds, &mut out),
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vectors from RFC 6070.

    #[test]
    fn rfc6070_vector_1() {
        let p = Pbkdf2Plugin;
        let options = KdfOptions {
            salt: Some(b"salt".to_vec()),
            rounds: Some(1),
            ..Default::default()
        };
        let key = p
            .derive(b"password", 20 * 8, Digest::Sha1, &options)
            .unwrap();
        assert_eq!(
            hex::encode(&*key),
            "0c60c80f961f0e71f3a9b524af6012062fe037a6"
        );
    }

    #[test]
    fn rfc6070_vector_5() {
        let p = Pbkdf2Plugin;
        let options = KdfOptions {
            salt: Some(b"saltSALTsaltSALTsaltSALTsaltSALTsalt".to_vec()),
            rounds: Some(4096),
            ..Default::default()
        };
        let key = p
            .derive(b"passwordPASSWORDpassword", 25 * 8, Digest::Sha1, &options)
            .unwrap();
        assert_eq!(
            hex::encode(&*key),
            "3d2eec4fe41c849b80c8d83662c0e44a8b291a964cf2f07038"
        );
    }

    #[test]
    fn zero_rounds_rejected() {
        let p = Pbkdf2Plugin;
        let options = KdfOptions {
            rounds: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            p.derive(b"password", 128, Digest::Sha256, &options),
            Err(CipherError::ArgumentError(_))
        ));
    }
}
