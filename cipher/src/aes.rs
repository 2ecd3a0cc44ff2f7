//! AES plugin: CBC and CTR with 16-byte IVs, GCM with 12-byte optimal
//! IV (16 when forced) and a 16-byte auth tag.
//!
//! Envelope layout is `ciphertext ‖ IV ‖ auth-tag`; the tag is present
//! only for authenticated modes.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{AesGcm, KeyInit, Nonce};
use zeroize::Zeroizing;

use crate::error::{CipherError, Result};
use crate::options::{AesMode, CipherOptions};
use crate::plugin::{random_bytes, VaultPlugin};

const AES_BLOCK_LEN: usize = 16;
const AES_IV_LEN: usize = 16;
const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

fn validate_key_bits(bits: u32) -> Result<()> {
    match bits {
        128 | 192 | 256 => Ok(()),
        _ => Err(CipherError::NotSupported(format!(
            "Invalid AES key length: {bits}"
        ))),
    }
}

fn key_err() -> CipherError {
    CipherError::InvalidKey("AES key or IV length mismatch".into())
}

/// Optimal IV length and whether the mode authenticates.
fn mode_spec(mode: AesMode) -> (usize, bool) {
    match mode {
        AesMode::Cbc | AesMode::Ctr => (AES_IV_LEN, false),
        AesMode::Gcm => (GCM_IV_LEN, true),
    }
}

macro_rules! cbc_seal {
    ($alg:ty, $key:expr, $iv:expr, $data:expr) => {
        cbc::Encryptor::<$alg>::new_from_slices($key, $iv)
            .map_err(|_| key_err())?
            .encrypt_padded_vec_mut::<Pkcs7>($data)
    };
}

macro_rules! cbc_open {
    ($alg:ty, $key:expr, $iv:expr, $body:expr) => {
        cbc::Decryptor::<$alg>::new_from_slices($key, $iv)
            .map_err(|_| key_err())?
            .decrypt_padded_vec_mut::<Pkcs7>($body)
            .map_err(|_| CipherError::InvalidData("AES-CBC decryption failed".into()))?
    };
}

macro_rules! ctr_apply {
    ($alg:ty, $key:expr, $iv:expr, $body:expr) => {{
        let mut buf = $body.to_vec();
        let mut cipher =
            ctr::Ctr128BE::<$alg>::new_from_slices($key, $iv).map_err(|_| key_err())?;
        cipher.apply_keystream(&mut buf);
        buf
    }};
}

macro_rules! gcm_seal {
    ($gcm:ty, $key:expr, $iv:expr, $data:expr, $aad:expr) => {
        <$gcm>::new_from_slice($key)
            .map_err(|_| key_err())?
            .encrypt(
                Nonce::from_slice($iv),
                Payload {
                    msg: $data,
                    aad: $aad,
                },
            )
            .map_err(|_| CipherError::InvalidData("AES-GCM encryption failed".into()))?
    };
}

macro_rules! gcm_open {
    ($gcm:ty, $key:expr, $iv:expr, $sealed:expr, $aad:expr) => {
        <$gcm>::new_from_slice($key)
            .map_err(|_| key_err())?
            .decrypt(
                Nonce::from_slice($iv),
                Payload {
                    msg: $sealed,
                    aad: $aad,
                },
            )
            .map_err(|_| CipherError::InvalidData("AES-GCM decryption failed".into()))?
    };
}

/// AES symmetric cipher plugin.
pub struct AesPlugin;

impl AesPlugin {
    fn check_tag_len(options: &CipherOptions) -> Result<()> {
        match options.authtag_length {
            None => Ok(()),
            Some(GCM_TAG_LEN) => Ok(()),
            Some(len) => Err(CipherError::NotSupported(format!(
                "Invalid auth tag length: {len}"
            ))),
        }
    }
}

impl VaultPlugin for AesPlugin {
    fn name(&self) -> &'static str {
        "AES"
    }

    fn default_bits(&self) -> u32 {
        128
    }

    fn generate(&self, options: &CipherOptions) -> Result<Zeroizing<Vec<u8>>> {
        let bits = options.bits.unwrap_or_else(|| self.default_bits());
        validate_key_bits(bits)?;
        Ok(random_bytes(bits as usize / 8))
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        validate_key_bits((key.len() * 8) as u32)
    }

    fn encrypt(&self, key: &[u8], data: &[u8], options: &CipherOptions) -> Result<Vec<u8>> {
        validate_key_bits((key.len() * 8) as u32)?;
        let mode = options.mode.unwrap_or(AesMode::Cbc);
        let (optimal_iv_len, is_auth) = mode_spec(mode);
        let iv_len = options.iv_length.unwrap_or(optimal_iv_len);

        if is_auth {
            Self::check_tag_len(options)?;
        }

        let iv: Vec<u8> = match &options.iv {
            Some(iv) if iv.len() != iv_len => {
                return Err(CipherError::InvalidIv(format!(
                    "Forced IV for AES-{} must be of {iv_len} bytes length",
                    mode.as_str()
                )));
            }
            Some(iv) => iv.clone(),
            None => random_bytes(iv_len).to_vec(),
        };

        match mode {
            AesMode::Cbc | AesMode::Ctr if iv_len != AES_IV_LEN => Err(CipherError::NotSupported(
                format!("Invalid AES-{} IV length: {iv_len}", mode.as_str()),
            )),
            AesMode::Cbc => {
                let mut out = match key.len() {
                    16 => cbc_seal!(Aes128, key, &iv, data),
                    24 => cbc_seal!(Aes192, key, &iv, data),
                    _ => cbc_seal!(Aes256, key, &iv, data),
                };
                out.extend_from_slice(&iv);
                Ok(out)
            }
            AesMode::Ctr => {
                let mut out = match key.len() {
                    16 => ctr_apply!(Aes128, key, &iv, data),
                    24 => ctr_apply!(Aes192, key, &iv, data),
                    _ => ctr_apply!(Aes256, key, &iv, data),
                };
                out.extend_from_slice(&iv);
                Ok(out)
            }
            AesMode::Gcm => {
                let aad = options.aad.as_deref().unwrap_or(&[]);
                // ct ‖ tag from the AEAD, reordered into ct ‖ iv ‖ tag
                let sealed = match (key.len(), iv_len) {
                    (16, GCM_IV_LEN) => gcm_seal!(AesGcm<Aes128, U12>, key, &iv, data, aad),
                    (24, GCM_IV_LEN) => gcm_seal!(AesGcm<Aes192, U12>, key, &iv, data, aad),
                    (32, GCM_IV_LEN) => gcm_seal!(AesGcm<Aes256, U12>, key, &iv, data, aad),
                    (16, AES_IV_LEN) => gcm_seal!(AesGcm<Aes128, U16>, key, &iv, data, aad),
                    (24, AES_IV_LEN) => gcm_seal!(AesGcm<Aes192, U16>, key, &iv, data, aad),
                    (32, AES_IV_LEN) => gcm_seal!(AesGcm<Aes256, U16>, key, &iv, data, aad),
                    _ => {
                        return Err(CipherError::NotSupported(format!(
                            "Invalid AES-GCM IV length: {iv_len}"
                        )));
                    }
                };
                let ct_len = sealed.len() - GCM_TAG_LEN;
                let mut out = Vec::with_capacity(sealed.len() + iv_len);
                out.extend_from_slice(&sealed[..ct_len]);
                out.extend_from_slice(&iv);
                out.extend_from_slice(&sealed[ct_len..]);
                Ok(out)
            }
        }
    }

    fn decrypt(
        &self,
        key: &[u8],
        edata: &[u8],
        options: &CipherOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        validate_key_bits((key.len() * 8) as u32)?;
        let mode = options.mode.unwrap_or(AesMode::Cbc);
        let (optimal_iv_len, is_auth) = mode_spec(mode);
        let iv_len = options.iv_length.unwrap_or(optimal_iv_len);

        let tag_len = if is_auth {
            Self::check_tag_len(options)?;
            GCM_TAG_LEN
        } else {
            0
        };

        if edata.len() < iv_len + tag_len {
            return Err(CipherError::InvalidData("Truncated envelope".into()));
        }

        let (body, tail) = edata.split_at(edata.len() - iv_len - tag_len);
        let (iv, tag) = tail.split_at(iv_len);

        match mode {
            AesMode::Cbc | AesMode::Ctr if iv_len != AES_IV_LEN => Err(CipherError::NotSupported(
                format!("Invalid AES-{} IV length: {iv_len}", mode.as_str()),
            )),
            AesMode::Cbc => {
                if body.is_empty() || body.len() % AES_BLOCK_LEN != 0 {
                    return Err(CipherError::InvalidData("Truncated envelope".into()));
                }
                let data = match key.len() {
                    16 => cbc_open!(Aes128, key, iv, body),
                    24 => cbc_open!(Aes192, key, iv, body),
                    _ => cbc_open!(Aes256, key, iv, body),
                };
                Ok(Zeroizing::new(data))
            }
            AesMode::Ctr => {
                let data = match key.len() {
                    16 => ctr_apply!(Aes128, key, iv, body),
                    24 => ctr_apply!(Aes192, key, iv, body),
                    _ => ctr_apply!(Aes256, key, iv, body),
                };
                Ok(Zeroizing::new(data))
            }
            AesMode::Gcm => {
                let aad = options.aad.as_deref().unwrap_or(&[]);
                let mut sealed = Vec::with_capacity(body.len() + tag_len);
                sealed.extend_from_slice(body);
                sealed.extend_from_slice(tag);
                let data = match (key.len(), iv_len) {
                    (16, GCM_IV_LEN) => gcm_open!(AesGcm<Aes128, U12>, key, iv, &*sealed, aad),
                    (24, GCM_IV_LEN) => gcm_open!(AesGcm<Aes192, U12>, key, iv, &*sealed, aad),
                    (32, GCM_IV_LEN) => gcm_open!(AesGcm<Aes256, U12>, key, iv, &*sealed, aad),
                    (16, AES_IV_LEN) => gcm_open!(AesGcm<Aes128, U16>, key, iv, &*sealed, aad),
                    (24, AES_IV_LEN) => gcm_open!(AesGcm<Aes192, U16>, key, iv, &*sealed, aad),
                    (32, AES_IV_LEN) => gcm_open!(AesGcm<Aes256, U16>, key, iv, &*sealed, aad),
                    _ => {
                        return Err(CipherError::NotSupported(format!(
                            "Invalid AES-GCM IV length: {iv_len}"
                        )));
                    }
                };
                Ok(Zeroizing::new(data))
            }
        }
    }
}
