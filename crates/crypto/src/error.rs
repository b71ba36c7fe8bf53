//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Invalid G1 point encoding")]
    InvalidG1Point,

    #[error("Invalid G2 point encoding")]
    InvalidG2Point,

    #[error("Invalid scalar encoding")]
    InvalidScalar,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid partial signature from index {0}")]
    InvalidPartial(u32),

    #[error("Empty public polynomial")]
    EmptyPolynomial,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Insufficient threshold shares: need {required}, got {got}")]
    InsufficientShares { required: usize, got: usize },

    #[error("Duplicate share index")]
    DuplicateShareIndex,

    #[error("Lagrange interpolation failed")]
    LagrangeInterpolationFailed,

    #[error("Key derivation failed")]
    KeyDerivationFailed,
}
