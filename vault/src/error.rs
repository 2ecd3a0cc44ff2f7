//! Error taxonomy for storage layers and services.

use secvault_cipher::CipherError;
use thiserror::Error;

/// Errors surfaced by storage and service operations.
///
/// Messages never carry key material or KEK bytes.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Lookup by id or external id found nothing
    #[error("Unknown key: {0}")]
    UnknownKeyID(String),

    /// Unique-constraint violation on save
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// KEK self-test failed against the sentinel record
    #[error("Invalid storage secret")]
    InvalidSecret,

    /// Crypto operation attempted while no KEK is active
    #[error("Storage is locked")]
    LockedStorage,

    /// No plugin is registered for the key type
    #[error("Unsupported key type: {0}")]
    UnsupportedType(String),

    /// Parameters rejected by the algorithm
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Generated or injected material failed validation
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Idempotent creation found an existing key with different origin
    #[error("Origin mismatch for key: {0}")]
    OrigMismatch(String),

    /// Capability flag violation or operation unsupported by the algorithm
    #[error("Operation is not applicable")]
    NotApplicable,

    /// Signature or secret verification failed
    #[error("Signature verification failed")]
    InvalidSignature,

    /// Decryption or envelope parsing failed
    #[error("Invalid data")]
    InvalidData,

    /// Failure-count ceiling exceeded
    #[error("Security error: {0}")]
    SecurityError(String),

    /// Malformed persisted row or statistics payload
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// KDF output length infeasible
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    /// Infrastructure fault in the persistence layer
    #[error("Storage error: {0}")]
    Storage(String),

    /// Params or event payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl From<CipherError> for VaultError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::NotSupported(msg) => VaultError::NotSupported(msg),
            CipherError::NotApplicable => VaultError::NotApplicable,
            CipherError::UnsupportedType(name) => VaultError::UnsupportedType(name),
            CipherError::InvalidKey(msg) => VaultError::InvalidKey(msg),
            // IV length faults surface from corrupt envelopes, keep them coarse
            CipherError::InvalidIv(_) | CipherError::InvalidData(_) => VaultError::InvalidData,
            CipherError::InvalidSignature => VaultError::InvalidSignature,
            CipherError::ArgumentError(msg) => VaultError::ArgumentError(msg),
        }
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                VaultError::Duplicate(msg.clone().unwrap_or_default())
            }
            _ => VaultError::Storage(err.to_string()),
        }
    }
}
