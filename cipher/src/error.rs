//! Error taxonomy shared by all cipher plugins

use thiserror::Error;

/// Errors raised by cipher plugin operations
#[derive(Debug, Error)]
pub enum CipherError {
    /// Parameters are valid in general but not supported by this algorithm
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Operation has no meaning for this algorithm variant
    #[error("Operation is not applicable to this algorithm")]
    NotApplicable,

    /// No plugin is registered under the requested name
    #[error("Unsupported key type: {0}")]
    UnsupportedType(String),

    /// Key material is malformed for the algorithm
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Forced IV does not match the required length
    #[error("Invalid IV: {0}")]
    InvalidIv(String),

    /// Ciphertext envelope failed to parse or decrypt
    #[error("Invalid encrypted data: {0}")]
    InvalidData(String),

    /// Signature or secret verification failed
    ///
    /// Deliberately carries no detail so callers cannot distinguish
    /// length errors from content mismatches.
    #[error("Signature verification failed")]
    InvalidSignature,

    /// Derivation parameters are out of range
    #[error("Invalid argument: {0}")]
    ArgumentError(String),
}

/// Result type for cipher operations
pub type Result<T> = std::result::Result<T, CipherError>;
