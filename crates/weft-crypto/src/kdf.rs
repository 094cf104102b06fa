//! HMAC-SHA-384 and labeled key derivation.
//!
//! The HELLO exchange authenticates its extension block with
//! HMAC-SHA-384 under a subkey derived from the peer session secret by
//! a counter-mode KBKDF (NIST SP 800-108). A single-byte label
//! separates usages and a 32-bit iteration index separates the two
//! directions of an exchange (0 = request, 1 = reply).

use hmac::{Hmac, Mac};
use sha2::Sha384;

use crate::HMAC_SHA384_SIZE;

type HmacSha384 = Hmac<Sha384>;

/// Compute HMAC-SHA-384 of `message` under `key`.
#[must_use]
pub fn hmac_sha384(key: &[u8], message: &[u8]) -> [u8; HMAC_SHA384_SIZE] {
    let mut mac = HmacSha384::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// KBKDF label for the HELLO extension HMAC subkey.
pub const KDF_LABEL_HELLO_HMAC: u8 = b'H';

/// Derive a 48-byte subkey from `key` (SP 800-108 counter mode, one block).
///
/// Fixed input: counter `1` (BE32) || label || 0x00 || iter (BE32) ||
/// output length in bits (BE16).
#[must_use]
pub fn kbkdf_hmac_sha384(key: &[u8], label: u8, iter: u32) -> [u8; HMAC_SHA384_SIZE] {
    let mut fixed = [0u8; 12];
    fixed[..4].copy_from_slice(&1u32.to_be_bytes());
    fixed[4] = label;
    // fixed[5] is the zero separator
    fixed[6..10].copy_from_slice(&iter.to_be_bytes());
    fixed[10..12].copy_from_slice(&((HMAC_SHA384_SIZE as u16) * 8).to_be_bytes());
    hmac_sha384(key, &fixed)
}
