//! RSA plugin: PEM-encoded keypairs, OAEP/PKCS#1 v1.5 encryption and
//! PKCS#1 v1.5 SHA-256 signatures.
//!
//! Key generation is CPU-heavy; callers run `generate` off the async
//! executor.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CipherError, Result};
use crate::options::{CipherOptions, RsaPadding};
use crate::plugin::VaultPlugin;

fn pem_str(key: &[u8]) -> Result<&str> {
    std::str::from_utf8(key).map_err(|_| CipherError::InvalidKey("Key is not valid PEM".into()))
}

fn parse_private(key: &[u8]) -> Result<RsaPrivateKey> {
    let pem = pem_str(key)?;
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|_| CipherError::InvalidKey("Failed to parse RSA private key".into()))
}

/// Accepts an SPKI public key, a PKCS#1 public key, or a private key
/// whose public half is taken.
fn parse_public(key: &[u8]) -> Result<RsaPublicKey> {
    let pem = pem_str(key)?;
    if let Ok(pk) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(pk);
    }
    if let Ok(pk) = RsaPublicKey::from_pkcs1_pem(pem) {
        return Ok(pk);
    }
    Ok(parse_private(key)?.to_public_key())
}

/// RSA asymmetric plugin.
pub struct RsaPlugin;

impl VaultPlugin for RsaPlugin {
    fn name(&self) -> &'static str {
        "RSA"
    }

    fn default_bits(&self) -> u32 {
        2048
    }

    fn is_asymmetric(&self) -> bool {
        true
    }

    fn generate(&self, options: &CipherOptions) -> Result<Zeroizing<Vec<u8>>> {
        let bits = options.bits.unwrap_or_else(|| self.default_bits());
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits as usize)
            .map_err(|_| CipherError::NotSupported(format!("Invalid RSA key length: {bits}")))?;
        let pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|_| CipherError::InvalidKey("RSA key encoding failed".into()))?;
        Ok(Zeroizing::new(pem.as_bytes().to_vec()))
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        parse_private(key).map(|_| ())
    }

    fn pubkey(&self, key: &[u8]) -> Result<Vec<u8>> {
        let public = parse_private(key)?.to_public_key();
        let pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| CipherError::InvalidKey("RSA key encoding failed".into()))?;
        Ok(pem.into_bytes())
    }

    fn encrypt(&self, key: &[u8], data: &[u8], options: &CipherOptions) -> Result<Vec<u8>> {
        let public = parse_public(key)?;
        let mut rng = rand::rngs::OsRng;
        let res = match options.rsa_padding.unwrap_or_default() {
            RsaPadding::OaepSha1 => public.encrypt(&mut rng, Oaep::new::<Sha1>(), data),
            RsaPadding::Pkcs1v15 => public.encrypt(&mut rng, Pkcs1v15Encrypt, data),
        };
        res.map_err(|_| CipherError::InvalidData("RSA encryption failed".into()))
    }

    fn decrypt(
        &self,
        key: &[u8],
        edata: &[u8],
        options: &CipherOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let private = parse_private(key)?;
        let res = match options.rsa_padding.unwrap_or_default() {
            RsaPadding::OaepSha1 => private.decrypt(Oaep::new::<Sha1>(), edata),
            RsaPadding::Pkcs1v15 => private.decrypt(Pkcs1v15Encrypt, edata),
        };
        res.map(Zeroizing::new)
            .map_err(|_| CipherError::InvalidData("RSA decryption failed".into()))
    }

    fn sign(&self, key: &[u8], data: &[u8], _options: &CipherOptions) -> Result<Vec<u8>> {
        let private = parse_private(key)?;
        let signer = SigningKey::<Sha256>::new(private);
        Ok(signer.sign(data).to_vec())
    }

    fn verify(
        &self,
        key: &[u8],
        data: &[u8],
        sig: &[u8],
        _options: &CipherOptions,
    ) -> Result<()> {
        let public = parse_public(key)?;
        let verifier = VerifyingKey::<Sha256>::new(public);
        let sig = Signature::try_from(sig).map_err(|_| CipherError::InvalidSignature)?;
        verifier
            .verify(data, &sig)
            .map_err(|_| CipherError::InvalidSignature)
    }
}
