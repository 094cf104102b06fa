//! X25519 key agreement (RFC 7748).
//!
//! Peers agree on a 48-byte session secret: SHA-384 of the raw
//! Diffie-Hellman output. The digest width matches the packet armor's
//! key schedule, which mangles the first 21 bytes per packet and keys
//! Salsa20/12 from the first 32.

use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha384};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::SESSION_SECRET_SIZE;

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PrivateKey {
    /// Generate a new random private key with RFC 7748 clamping.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Export as bytes (for serialization). Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Import from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Get bytes as a slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// Agree on the 48-byte session secret with a peer.
///
/// Fails if the peer's public key is a low-order point. Both sides
/// derive bit-identical output.
pub fn session_secret(
    private: &PrivateKey,
    peer_public: &PublicKey,
) -> Result<[u8; SESSION_SECRET_SIZE], CryptoError> {
    let shared = private.0.diffie_hellman(&peer_public.0);
    if shared.as_bytes() == &[0u8; 32] {
        return Err(CryptoError::LowOrderPoint);
    }
    let digest = Sha384::digest(shared.as_bytes());
    let mut secret = [0u8; SESSION_SECRET_SIZE];
    secret.copy_from_slice(&digest);
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn agreement_is_symmetric() {
        let alice = PrivateKey::generate(&mut OsRng);
        let bob = PrivateKey::generate(&mut OsRng);

        let ab = session_secret(&alice, &bob.public_key()).unwrap();
        let ba = session_secret(&bob, &alice.public_key()).unwrap();
        assert_eq!(ab, ba);
        assert_ne!(ab, [0u8; SESSION_SECRET_SIZE]);
    }

    #[test]
    fn distinct_peers_distinct_secrets() {
        let alice = PrivateKey::generate(&mut OsRng);
        let bob = PrivateKey::generate(&mut OsRng);
        let carol = PrivateKey::generate(&mut OsRng);

        let ab = session_secret(&alice, &bob.public_key()).unwrap();
        let ac = session_secret(&alice, &carol.public_key()).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn low_order_point_is_rejected() {
        let alice = PrivateKey::generate(&mut OsRng);
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert_eq!(
            session_secret(&alice, &zero),
            Err(crate::CryptoError::LowOrderPoint)
        );
    }

    #[test]
    fn key_roundtrip() {
        let key = PrivateKey::generate(&mut OsRng);
        let restored = PrivateKey::from_bytes(key.to_bytes());
        assert_eq!(key.public_key(), restored.public_key());
    }
}
