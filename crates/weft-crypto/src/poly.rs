//! Poly1305 one-time message authentication.
//!
//! Raw (unpadded) Poly1305 as used by the packet armor: a fresh key is
//! derived per packet from the first Salsa20/12 keystream block and the
//! resulting tag is truncated to 64 bits in the header MAC field.

use poly1305::Poly1305;
use poly1305::universal_hash::KeyInit;

use crate::constant_time::ct_eq;
use crate::{POLY1305_KEY_SIZE, POLY1305_TAG_SIZE};

/// Compute the raw Poly1305 tag of `message` under a one-time key.
#[must_use]
pub fn poly1305_tag(key: &[u8; POLY1305_KEY_SIZE], message: &[u8]) -> [u8; POLY1305_TAG_SIZE] {
    Poly1305::new(key.into()).compute_unpadded(message).into()
}

/// Verify the truncated 64-bit MAC carried in a packet header.
///
/// Compares `mac8` against the first 8 bytes of the tag of `message`
/// in constant time.
#[must_use]
pub fn poly1305_verify_prefix8(
    key: &[u8; POLY1305_KEY_SIZE],
    message: &[u8],
    mac8: &[u8; 8],
) -> bool {
    let tag = poly1305_tag(key, message);
    ct_eq(&tag[..8], mac8)
}
