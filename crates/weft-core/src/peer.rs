//! Remote peers.
//!
//! A peer exists only once its identity has been agreed with ours: the
//! constructor runs the key agreement and a peer without a session key
//! cannot be built. The topology owns insertion and eviction.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::identity::Identity;
use crate::path::Path;
use crate::protocol::Verb;

/// Version triple reported by a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVersion {
    /// Remote protocol version
    pub protocol: u8,
    /// Remote software major version
    pub major: u8,
    /// Remote software minor version
    pub minor: u8,
    /// Remote software revision
    pub revision: u16,
}

/// A remote node with an agreed session key.
pub struct Peer {
    identity: Identity,
    key: Zeroizing<[u8; 48]>,
    last_received: AtomicI64,
    remote_version: Mutex<Option<RemoteVersion>>,
    best_path: Mutex<Option<Arc<Path>>>,
}

impl Peer {
    /// Build a peer by agreeing `local` with `remote`.
    ///
    /// `None` when the agreement fails; a peer without a session key
    /// never exists.
    #[must_use]
    pub fn new(local: &Identity, remote: Identity) -> Option<Self> {
        let key = Zeroizing::new(local.agree(&remote)?);
        Some(Self {
            identity: remote,
            key,
            last_received: AtomicI64::new(0),
            remote_version: Mutex::new(None),
            best_path: Mutex::new(None),
        })
    }

    /// The peer's identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The 48-byte symmetric session key.
    #[must_use]
    pub fn key(&self) -> &[u8; 48] {
        &self.key
    }

    /// Record receipt of an authenticated packet from this peer.
    pub fn received(
        &self,
        path: &Arc<Path>,
        hops: u8,
        packet_id: u64,
        verb: Verb,
        now: i64,
    ) {
        self.last_received.store(now, Ordering::Relaxed);
        if hops == 0 {
            *self.best_path.lock().expect("peer lock poisoned") = Some(path.clone());
        }
        tracing::trace!(
            peer = %self.identity.address(),
            packet_id,
            ?verb,
            hops,
            "packet received"
        );
    }

    /// When the last authenticated packet arrived.
    #[must_use]
    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::Relaxed)
    }

    /// The current direct path to this peer, if one is known.
    #[must_use]
    pub fn path(&self, _now: i64) -> Option<Arc<Path>> {
        self.best_path.lock().expect("peer lock poisoned").clone()
    }

    /// Record the version triple reported in a HELLO.
    pub fn set_remote_version(&self, version: RemoteVersion) {
        *self.remote_version.lock().expect("peer lock poisoned") = Some(version);
    }

    /// The last version triple the peer reported.
    #[must_use]
    pub fn remote_version(&self) -> Option<RemoteVersion> {
        *self.remote_version.lock().expect("peer lock poisoned")
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("identity", &self.identity)
            .field("version", &self.remote_version())
            .finish()
    }
}
