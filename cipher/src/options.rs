//! Option structs passed to plugin operations

use serde::{Deserialize, Serialize};

use crate::error::{CipherError, Result};

/// AES block cipher mode of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AesMode {
    Cbc,
    Ctr,
    Gcm,
}

impl AesMode {
    /// Parse a mode tag like `"CBC"` or `"GCM"`.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "CBC" => Ok(AesMode::Cbc),
            "CTR" => Ok(AesMode::Ctr),
            "GCM" => Ok(AesMode::Gcm),
            _ => Err(CipherError::NotSupported(format!("Invalid AES mode: {tag}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AesMode::Cbc => "CBC",
            AesMode::Ctr => "CTR",
            AesMode::Gcm => "GCM",
        }
    }
}

/// RSA encryption padding scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RsaPadding {
    /// OAEP with SHA-1 mask generation
    #[default]
    OaepSha1,
    /// PKCS#1 v1.5
    Pkcs1v15,
}

/// Hash function selector for MAC and KDF operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Digest {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    /// Parse a digest tag like `"SHA-256"` or `"sha512"`.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(Digest::Sha1),
            "SHA256" => Ok(Digest::Sha256),
            "SHA384" => Ok(Digest::Sha384),
            "SHA512" => Ok(Digest::Sha512),
            _ => Err(CipherError::NotSupported(format!(
                "Missing hash type: {tag}"
            ))),
        }
    }

    /// Digest output length in bytes.
    pub fn out_len(&self) -> usize {
        match self {
            Digest::Sha1 => 20,
            Digest::Sha256 => 32,
            Digest::Sha384 => 48,
            Digest::Sha512 => 64,
        }
    }
}

/// Options for generate/encrypt/decrypt/sign/verify calls.
///
/// Each plugin reads the subset it understands and ignores the rest.
#[derive(Debug, Clone, Default)]
pub struct CipherOptions {
    /// Key strength for `generate`, in bits
    pub bits: Option<u32>,
    /// AES mode of operation (default CBC)
    pub mode: Option<AesMode>,
    /// Forced IV; random when absent
    pub iv: Option<Vec<u8>>,
    /// Forced IV length overriding the mode's optimal length
    pub iv_length: Option<usize>,
    /// Additional authenticated data for AEAD modes
    pub aad: Option<Vec<u8>>,
    /// Authentication tag length for AEAD modes
    pub authtag_length: Option<usize>,
    /// Digest for MAC operations (default SHA-256)
    pub digest: Option<Digest>,
    /// RSA encryption padding (default OAEP-SHA1)
    pub rsa_padding: Option<RsaPadding>,
    /// Character set override for password generation
    pub chars: Option<String>,
}

/// Options for key-derivation calls.
#[derive(Debug, Clone, Default)]
pub struct KdfOptions {
    pub salt: Option<Vec<u8>>,
    /// Application-specific info tag (HKDF)
    pub info: Option<Vec<u8>>,
    /// Iteration count (PBKDF2)
    pub rounds: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(AesMode::parse("gcm").unwrap(), AesMode::Gcm);
        assert_eq!(AesMode::parse("CBC").unwrap(), AesMode::Cbc);
        assert!(matches!(
            AesMode::parse("XTS"),
            Err(CipherError::NotSupported(_))
        ));
    }

    #[test]
    fn digest_parsing() {
        assert_eq!(Digest::parse("SHA-256").unwrap(), Digest::Sha256);
        assert_eq!(Digest::parse("sha512").unwrap(), Digest::Sha512);
        assert_eq!(Digest::parse("SHA-1").unwrap().out_len(), 20);
        assert!(Digest::parse("MD5").is_err());
    }
}
