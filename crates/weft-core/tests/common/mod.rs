//! Shared fixtures: an in-memory topology and recording collaborators
//! wired into a ready-to-use node under test.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::address::Address;
use weft_core::identity::Identity;
use weft_core::path::Path;
use weft_core::peer::Peer;
use weft_core::protocol::{self, CipherSuite, FRAGMENT_INDICATOR, Verb};
use weft_core::runtime::{
    Context, DatagramSender, NodeServices, PacketDropReason, Relay, SelfAwareness, Topology,
    Tracer, VirtualLayer2,
};
use weft_core::vl1::Vl1;
use weft_core::BufPool;

/// Interning peer/path store with a configurable root and trusted paths.
#[derive(Default)]
pub struct MemoryTopology {
    paths: Mutex<HashMap<(i64, SocketAddr), Arc<Path>>>,
    peers: Mutex<HashMap<Address, Arc<Peer>>>,
    root: Mutex<Option<Arc<Peer>>>,
    trusted: Mutex<HashMap<SocketAddr, u64>>,
}

impl MemoryTopology {
    pub fn trust_path(&self, address: SocketAddr, trusted_path_id: u64) {
        self.trusted.lock().unwrap().insert(address, trusted_path_id);
    }

    pub fn set_root(&self, peer: Arc<Peer>) {
        *self.root.lock().unwrap() = Some(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

impl Topology for MemoryTopology {
    fn get_path(&self, local_socket: i64, address: SocketAddr) -> Arc<Path> {
        self.paths
            .lock()
            .unwrap()
            .entry((local_socket, address))
            .or_insert_with(|| Arc::new(Path::new(local_socket, address)))
            .clone()
    }

    fn get(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(&address).cloned()
    }

    fn add(&self, peer: Arc<Peer>) -> Arc<Peer> {
        self.peers
            .lock()
            .unwrap()
            .entry(peer.identity().address())
            .or_insert(peer)
            .clone()
    }

    fn root(&self) -> Option<Arc<Peer>> {
        self.root.lock().unwrap().clone()
    }

    fn is_root(&self, identity: &Identity) -> bool {
        self.root
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| r.identity() == identity)
    }

    fn should_inbound_path_be_trusted(&self, address: SocketAddr, trusted_path_id: u64) -> bool {
        self.trusted.lock().unwrap().get(&address) == Some(&trusted_path_id)
    }
}

#[derive(Default)]
pub struct RecordingTracer {
    pub drops: Mutex<Vec<(u32, u64, PacketDropReason)>>,
    pub errors: Mutex<Vec<(u32, String)>>,
}

impl RecordingTracer {
    pub fn reasons(&self) -> Vec<PacketDropReason> {
        self.drops.lock().unwrap().iter().map(|d| d.2).collect()
    }
}

impl Tracer for RecordingTracer {
    fn incoming_packet_dropped(
        &self,
        code: u32,
        packet_id: u64,
        _identity: Option<&Identity>,
        _path_address: SocketAddr,
        _hops: u8,
        _verb: Verb,
        reason: PacketDropReason,
    ) {
        self.drops.lock().unwrap().push((code, packet_id, reason));
    }

    fn unexpected_error(&self, code: u32, message: &str) {
        self.errors.lock().unwrap().push((code, message.to_owned()));
    }
}

pub struct FixedClock {
    pub now: AtomicI64,
    pub gate_open: AtomicBool,
}

impl Default for FixedClock {
    fn default() -> Self {
        Self {
            now: AtomicI64::new(100_000),
            gate_open: AtomicBool::new(true),
        }
    }
}

impl FixedClock {
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl NodeServices for FixedClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }

    fn rate_gate_identity_verification(&self, _now: i64, _from: SocketAddr) -> bool {
        self.gate_open.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct RecordingSelfAwareness {
    pub reports: Mutex<Vec<(Address, SocketAddr, bool)>>,
}

impl SelfAwareness for RecordingSelfAwareness {
    fn iam(
        &self,
        reporter: &Identity,
        _local_socket: i64,
        _path_address: SocketAddr,
        surface: SocketAddr,
        reporter_is_root: bool,
        _now: i64,
    ) {
        self.reports
            .lock()
            .unwrap()
            .push((reporter.address(), surface, reporter_is_root));
    }
}

#[derive(Default)]
pub struct RecordingVl2 {
    pub delivered: Mutex<Vec<(&'static str, Vec<u8>, bool)>>,
}

impl RecordingVl2 {
    fn record(&self, verb: &'static str, packet: &[u8], authenticated: bool) {
        self.delivered
            .lock()
            .unwrap()
            .push((verb, packet.to_vec(), authenticated));
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl VirtualLayer2 for RecordingVl2 {
    fn frame(&self, _path: &Arc<Path>, _peer: &Arc<Peer>, packet: &[u8], authenticated: bool) {
        self.record("FRAME", packet, authenticated);
    }

    fn ext_frame(&self, _path: &Arc<Path>, _peer: &Arc<Peer>, packet: &[u8], authenticated: bool) {
        self.record("EXT_FRAME", packet, authenticated);
    }

    fn multicast_like(
        &self,
        _path: &Arc<Path>,
        _peer: &Arc<Peer>,
        packet: &[u8],
        authenticated: bool,
    ) {
        self.record("MULTICAST_LIKE", packet, authenticated);
    }
}

#[derive(Default)]
pub struct RecordingRelay {
    pub relayed: Mutex<Vec<(Address, Vec<u8>)>>,
}

impl Relay for RecordingRelay {
    fn relay(&self, _path: &Arc<Path>, destination: Address, data: &[u8]) {
        self.relayed.lock().unwrap().push((destination, data.to_vec()));
    }
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(i64, SocketAddr, Vec<u8>)>>,
}

impl DatagramSender for RecordingSender {
    fn send(&self, local_socket: i64, to: SocketAddr, data: &[u8]) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((local_socket, to, data.to_vec()));
        true
    }
}

/// A node under test: VL1 wired to recording collaborators.
pub struct TestNode {
    pub identity: Identity,
    pub vl1: Vl1,
    pub ctx: Context,
    pub topology: Arc<MemoryTopology>,
    pub tracer: Arc<RecordingTracer>,
    pub clock: Arc<FixedClock>,
    pub self_awareness: Arc<RecordingSelfAwareness>,
    pub vl2: Arc<RecordingVl2>,
    pub relay: Arc<RecordingRelay>,
    pub sender: Arc<RecordingSender>,
}

impl TestNode {
    pub fn new() -> Self {
        let identity = Identity::generate();
        let topology = Arc::new(MemoryTopology::default());
        let tracer = Arc::new(RecordingTracer::default());
        let clock = Arc::new(FixedClock::default());
        let self_awareness = Arc::new(RecordingSelfAwareness::default());
        let vl2 = Arc::new(RecordingVl2::default());
        let relay = Arc::new(RecordingRelay::default());
        let sender = Arc::new(RecordingSender::default());

        let ctx = Context {
            identity: identity.clone(),
            topology: topology.clone(),
            tracer: tracer.clone(),
            node: clock.clone(),
            self_awareness: self_awareness.clone(),
            vl2: vl2.clone(),
            relay: relay.clone(),
            sender: sender.clone(),
        };

        Self {
            identity,
            vl1: Vl1::new(BufPool::new()),
            ctx,
            topology,
            tracer,
            clock,
            self_awareness,
            vl2,
            relay,
            sender,
        }
    }

    /// Feed one datagram into the pipeline.
    pub fn receive(&self, local_socket: i64, from: SocketAddr, datagram: &[u8]) {
        let mut buf = self.vl1.pool().get();
        buf[..datagram.len()].copy_from_slice(datagram);
        self.vl1
            .on_remote_packet(&self.ctx, local_socket, from, buf, datagram.len());
    }

    /// Insert `remote` as a known peer, as if previously learned.
    pub fn learn_peer(&self, remote: &Identity) -> Arc<Peer> {
        let peer = Peer::new(&self.identity, public_half(remote)).expect("agreement");
        self.topology.add(Arc::new(peer))
    }

    /// Install `remote` as the root, reachable over `(socket, address)`.
    pub fn set_root(&self, remote: &Identity, local_socket: i64, address: SocketAddr) -> Arc<Peer> {
        let peer = self.learn_peer(remote);
        let path = self.topology.get_path(local_socket, address);
        peer.received(&path, 0, 0, Verb::Nop, self.clock.now());
        self.topology.set_root(peer.clone());
        peer
    }
}

/// The wire-visible half of an identity, as a receiver would learn it.
pub fn public_half(id: &Identity) -> Identity {
    let mut wire = Vec::new();
    id.marshal(&mut wire);
    let mut cursor = 0;
    Identity::unmarshal(&wire, &mut cursor).expect("own identity marshals")
}

/// Build and armor a packet from `source` to `destination`.
pub fn build_packet(
    source: Address,
    destination: Address,
    verb: Verb,
    flags: u8,
    compressed: bool,
    payload: &[u8],
    key: &[u8; 48],
    suite: CipherSuite,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(protocol::HEADER_SIZE + payload.len());
    protocol::write_header(
        &mut out,
        protocol::next_packet_id(),
        destination,
        source,
        flags,
        verb,
    );
    if compressed {
        out[27] |= protocol::VERB_FLAG_COMPRESSED;
    }
    out.extend_from_slice(payload);
    protocol::armor(&mut out, key, suite);
    out
}

/// Split an armored packet into a head frame and continuation frames.
///
/// The head must have been built with [`protocol::FLAG_FRAGMENTED`] set
/// before armoring. Returns `total` datagrams: the head (fragment 0)
/// followed by `total - 1` continuations.
pub fn fragment_packet(armored: &[u8], total: usize) -> Vec<Vec<u8>> {
    // The counts nibble can express totals up to 15.
    assert!((2..=15).contains(&total));
    let body = &armored[protocol::HEADER_SIZE..];
    let chunk = body.len().div_ceil(total);

    let mut frames = Vec::with_capacity(total);
    frames.push(armored[..protocol::HEADER_SIZE + chunk].to_vec());
    for index in 1..total {
        let start = index * chunk;
        let end = (start + chunk).min(body.len());
        let mut frame = Vec::with_capacity(protocol::FRAGMENT_HEADER_SIZE + end - start);
        frame.extend_from_slice(&armored[0..8]);
        frame.extend_from_slice(&armored[8..13]);
        frame.push(FRAGMENT_INDICATOR);
        frame.push(((total as u8) << 4) | index as u8);
        frame.push(0);
        frame.extend_from_slice(&body[start..end]);
        frames.push(frame);
    }
    frames
}
