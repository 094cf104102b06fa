//! Error types for weft cryptographic primitives.

use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key agreement produced a degenerate (low-order) shared secret
    #[error("key agreement failed: low-order peer public key")]
    LowOrderPoint,
}
