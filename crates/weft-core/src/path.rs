//! Network paths.
//!
//! A path is one `(local socket, remote address)` tuple a peer is
//! reachable over. Paths are interned by the topology so that per-path
//! state (liveness stamps, fragment assembly budgets) has one home per
//! tuple.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::runtime::Context;

/// A `(local socket, remote address)` tuple with liveness statistics.
pub struct Path {
    id: u64,
    local_socket: i64,
    address: SocketAddr,
    last_received: AtomicI64,
    last_sent: AtomicI64,
}

impl Path {
    /// Create a path. Each call yields a distinct intern id; the
    /// topology is responsible for creating at most one path per tuple.
    #[must_use]
    pub fn new(local_socket: i64, address: SocketAddr) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            local_socket,
            address,
            last_received: AtomicI64::new(0),
            last_sent: AtomicI64::new(0),
        }
    }

    /// Process-unique intern id, used to key per-path state.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The local socket this path arrived on.
    #[must_use]
    pub fn local_socket(&self) -> i64 {
        self.local_socket
    }

    /// The remote endpoint.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stamp an inbound datagram.
    pub fn received(&self, now: i64) {
        self.last_received.store(now, Ordering::Relaxed);
    }

    /// When the last datagram arrived on this path.
    #[must_use]
    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::Relaxed)
    }

    /// Send `data` out this path as one bounded, non-blocking datagram.
    pub fn send(&self, ctx: &Context, data: &[u8], now: i64) {
        if ctx.sender.send(self.local_socket, self.address, data) {
            self.last_sent.store(now, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("local_socket", &self.local_socket)
            .field("address", &self.address)
            .finish()
    }
}
