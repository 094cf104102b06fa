//! Error types for the weft wire codec.
//!
//! Receive failures are never surfaced to the ingress caller; they are
//! reported through the tracer as [`crate::runtime::PacketDropReason`]
//! values. The errors here are internal, for the parse helpers.

use thiserror::Error;

/// Wire decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input too short to hold the expected structure
    #[error("wire object too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size available
        actual: usize,
    },

    /// A structurally invalid wire object
    #[error("invalid wire object: {0}")]
    InvalidObject(&'static str),

    /// Unknown address family byte in an InetAddress
    #[error("unrecognized address family: 0x{0:02x}")]
    InvalidAddressFamily(u8),
}
