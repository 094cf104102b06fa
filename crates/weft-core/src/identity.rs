//! Node identities.
//!
//! An identity binds a 40-bit overlay [`Address`] to Curve25519 key
//! material. The address is derived from the public key through a
//! work-rated digest, so a given address cannot be claimed without
//! grinding keys for it; [`Identity::locally_validate`] re-runs the
//! derivation as a self-check before an unknown identity is admitted
//! to the topology.

use rand_core::OsRng;
use sha2::{Digest, Sha384};

use weft_crypto::x25519::{PrivateKey, PublicKey, session_secret};

use crate::address::{ADDRESS_LENGTH, Address};
use crate::error::ProtocolError;

/// Identity type byte: Curve25519 agreement key.
pub const IDENTITY_TYPE_C25519: u8 = 0x00;

/// Wire size of a marshaled identity: address + type + public key.
pub const IDENTITY_MARSHAL_SIZE: usize = ADDRESS_LENGTH + 1 + 32;

/// Digest byte 5 must fall below this for a public key to be valid.
const WORK_THRESHOLD: u8 = 0x40;

/// A node identity: overlay address plus long-term key material.
///
/// Identities parsed off the wire carry only the public half; locally
/// generated ones also hold the private key and can [`agree`].
///
/// [`agree`]: Identity::agree
#[derive(Clone)]
pub struct Identity {
    address: Address,
    public: PublicKey,
    secret: Option<PrivateKey>,
}

impl Identity {
    /// Generate a new identity, grinding keys until the address
    /// derivation criterion is met.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let secret = PrivateKey::generate(&mut OsRng);
            let public = secret.public_key();
            if let Some(address) = derive_address(&public) {
                return Self {
                    address,
                    public,
                    secret: Some(secret),
                };
            }
        }
    }

    /// The overlay address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The public agreement key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Whether this identity holds its private key.
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Re-derive the address from the public key and check the work
    /// criterion. Cheap relative to the grinding the issuer paid.
    #[must_use]
    pub fn locally_validate(&self) -> bool {
        derive_address(&self.public) == Some(self.address)
    }

    /// Agree on the 48-byte session secret with `other`.
    ///
    /// Returns `None` when this identity has no private key or the
    /// agreement degenerates.
    #[must_use]
    pub fn agree(&self, other: &Identity) -> Option<[u8; 48]> {
        let secret = self.secret.as_ref()?;
        session_secret(secret, &other.public).ok()
    }

    /// Append the public wire form.
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_bytes());
        out.push(IDENTITY_TYPE_C25519);
        out.extend_from_slice(self.public.as_bytes());
    }

    /// Parse an identity at `*cursor`, advancing it.
    ///
    /// Only structural checks happen here; callers gate admission on
    /// [`Identity::locally_validate`].
    pub fn unmarshal(data: &[u8], cursor: &mut usize) -> Result<Self, ProtocolError> {
        let at = *cursor;
        let raw = data
            .get(at..at + IDENTITY_MARSHAL_SIZE)
            .ok_or(ProtocolError::TooShort {
                expected: at + IDENTITY_MARSHAL_SIZE,
                actual: data.len(),
            })?;
        if raw[ADDRESS_LENGTH] != IDENTITY_TYPE_C25519 {
            return Err(ProtocolError::InvalidObject("unknown identity type"));
        }
        let mut addr = [0u8; ADDRESS_LENGTH];
        addr.copy_from_slice(&raw[..ADDRESS_LENGTH]);
        let address = Address::from_bytes(&addr);
        if address.is_reserved() {
            return Err(ProtocolError::InvalidObject("reserved identity address"));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&raw[ADDRESS_LENGTH + 1..]);
        *cursor = at + IDENTITY_MARSHAL_SIZE;
        Ok(Self {
            address,
            public: PublicKey::from_bytes(pk),
            secret: None,
        })
    }
}

/// Derive the overlay address for a public key, or `None` when the key
/// fails the work criterion or lands in a reserved range.
fn derive_address(public: &PublicKey) -> Option<Address> {
    let digest = Sha384::digest(public.as_bytes());
    if digest[5] >= WORK_THRESHOLD {
        return None;
    }
    let mut raw = [0u8; ADDRESS_LENGTH];
    raw.copy_from_slice(&digest[..ADDRESS_LENGTH]);
    let address = Address::from_bytes(&raw);
    (!address.is_reserved()).then_some(address)
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.public == other.public
    }
}

impl Eq for Identity {}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("public", &hex::encode(&self.public.as_bytes()[..8]))
            .finish()
    }
}
