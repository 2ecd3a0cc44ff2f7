//! Cipher plugin registry and algorithm plugins for the SecVault key store.
//!
//! Algorithms hide behind the object-safe [`VaultPlugin`] trait so storage
//! and service layers stay algorithm-agnostic. The standard plugins (AES,
//! HMAC, HKDF, PBKDF2, RSA, Password) are installed in the process-wide
//! [`registry`] on first use.

pub mod aes;
pub mod error;
pub mod hkdf_plugin;
pub mod hmac_plugin;
pub mod options;
pub mod password_plugin;
pub mod pbkdf2_plugin;
pub mod plugin;
pub mod registry;
pub mod rsa_plugin;

pub use error::{CipherError, Result};
pub use options::{AesMode, CipherOptions, Digest, KdfOptions, RsaPadding};
pub use plugin::{random_bytes, VaultPlugin};
