//! # weft-crypto
//!
//! Cryptographic primitives for the weft overlay transport.
//!
//! This crate provides:
//! - Salsa20/12 stream cipher (packet body encryption, MAC key generation)
//! - Poly1305 one-time message authentication
//! - HMAC-SHA-384 and a counter-mode KBKDF for labeled subkeys
//! - X25519 key agreement producing the 48-byte peer session secret
//! - Constant-time comparison helpers
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | Stream Cipher | Salsa20/12 |
//! | Per-Packet MAC | Poly1305 (64-bit truncated on the wire) |
//! | Extension MAC | HMAC-SHA-384 |
//! | KDF | KBKDF-HMAC-SHA-384 (SP 800-108 counter mode) |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod constant_time;
pub mod error;
pub mod kdf;
pub mod poly;
pub mod salsa;
pub mod x25519;

pub use error::CryptoError;

/// Salsa20/12 key size.
pub const SALSA_KEY_SIZE: usize = 32;

/// Salsa20/12 nonce size.
pub const SALSA_NONCE_SIZE: usize = 8;

/// Salsa20 keystream block size; the cipher is seekable at this granularity.
pub const SALSA_BLOCK_SIZE: usize = 64;

/// Poly1305 one-time key size.
pub const POLY1305_KEY_SIZE: usize = 32;

/// Poly1305 full tag size (truncated to 8 bytes in the packet header).
pub const POLY1305_TAG_SIZE: usize = 16;

/// HMAC-SHA-384 output size.
pub const HMAC_SHA384_SIZE: usize = 48;

/// Peer session secret size (SHA-384 of the X25519 shared secret).
pub const SESSION_SECRET_SIZE: usize = 48;
