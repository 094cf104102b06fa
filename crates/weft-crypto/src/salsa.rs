//! Salsa20/12 stream cipher.
//!
//! The packet format uses Salsa20 reduced to 12 rounds both as the body
//! cipher and as the generator for one-time Poly1305 keys (the first
//! keystream block). The wrapper keeps byte-granular stream position
//! across calls, so callers may feed arbitrary-length spans and the
//! keystream stays continuous.

use salsa20::Salsa12;
use salsa20::cipher::{KeyIvInit, StreamCipher};

use crate::{SALSA_KEY_SIZE, SALSA_NONCE_SIZE};

/// A Salsa20/12 keystream positioned at byte 0.
pub struct Salsa2012 {
    inner: Salsa12,
}

impl Salsa2012 {
    /// Create a cipher instance from a 256-bit key and 64-bit nonce.
    #[must_use]
    pub fn new(key: &[u8; SALSA_KEY_SIZE], nonce: &[u8; SALSA_NONCE_SIZE]) -> Self {
        Self {
            inner: Salsa12::new(key.into(), nonce.into()),
        }
    }

    /// Encrypt or decrypt `input` into `output`, advancing the stream.
    ///
    /// # Panics
    ///
    /// Panics if `output` is shorter than `input`.
    pub fn crypt(&mut self, input: &[u8], output: &mut [u8]) {
        let out = &mut output[..input.len()];
        out.copy_from_slice(input);
        self.inner.apply_keystream(out);
    }

    /// Encrypt or decrypt `data` in place, advancing the stream.
    pub fn crypt_in_place(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }

    /// Produce `out.len()` bytes of raw keystream.
    pub fn keystream(&mut self, out: &mut [u8]) {
        out.fill(0);
        self.inner.apply_keystream(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const NONCE: [u8; 8] = [3u8; 8];

    #[test]
    fn roundtrip() {
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let mut ciphertext = vec![0u8; plaintext.len()];
        Salsa2012::new(&KEY, &NONCE).crypt(plaintext, &mut ciphertext);
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let mut recovered = vec![0u8; plaintext.len()];
        Salsa2012::new(&KEY, &NONCE).crypt(&ciphertext, &mut recovered);
        assert_eq!(&recovered[..], &plaintext[..]);
    }

    #[test]
    fn stream_position_is_continuous_across_calls() {
        let data = vec![0xa5u8; 301];

        let mut one_shot = vec![0u8; data.len()];
        Salsa2012::new(&KEY, &NONCE).crypt(&data, &mut one_shot);

        // Same stream split at non-block-aligned boundaries.
        let mut chunked = vec![0u8; data.len()];
        let mut s20 = Salsa2012::new(&KEY, &NONCE);
        let mut at = 0;
        for len in [1usize, 63, 64, 100, 73] {
            s20.crypt(&data[at..at + len], &mut chunked[at..at + len]);
            at += len;
        }
        assert_eq!(at, data.len());
        assert_eq!(one_shot, chunked);
    }

    #[test]
    fn keystream_matches_zero_encryption() {
        let mut ks = [0u8; 64];
        Salsa2012::new(&KEY, &NONCE).keystream(&mut ks);

        let zeros = [0u8; 64];
        let mut enc = [0u8; 64];
        Salsa2012::new(&KEY, &NONCE).crypt(&zeros, &mut enc);
        assert_eq!(ks, enc);
    }

    #[test]
    fn distinct_nonces_diverge() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        Salsa2012::new(&KEY, &[0u8; 8]).keystream(&mut a);
        Salsa2012::new(&KEY, &[1u8; 8]).keystream(&mut b);
        assert_ne!(a, b);
    }
}
