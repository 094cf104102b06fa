//! The VL1 ingress pipeline.
//!
//! One entry point, [`Vl1::on_remote_packet`], funnels every inbound
//! datagram through defragmentation, cipher-suite demultiplexing,
//! authentication/decryption, decompression, and verb dispatch. It
//! executes entirely on the caller's I/O thread and never blocks beyond
//! a bounded datagram send; any number of threads may call it
//! concurrently.
//!
//! Receive failures abort only the packet at hand: each drop site
//! reports exactly once through the tracer with a stable code and a
//! [`PacketDropReason`], and nothing propagates to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use weft_crypto::poly::poly1305_verify_prefix8;

use crate::address::{ADDRESS_LENGTH, Address};
use crate::buf::{BUF_SIZE, Buf, BufPool, Slice, SliceVector, assemble_slice_vector};
use crate::defrag::{AssembleResult, Defragmenter};
use crate::identity::Identity;
use crate::path::Path;
use crate::peer::Peer;
use crate::protocol::{
    CipherSuite, FRAGMENT_INDICATOR, FRAGMENT_INDICATOR_INDEX, FRAGMENT_PAYLOAD_START,
    FragmentHeader, HEADER_SIZE, Header, MAX_INCOMING_FRAGMENTS_PER_PATH, MAX_PACKET_LENGTH,
    MIN_FRAGMENT_LENGTH, MIN_PACKET_LENGTH, PAYLOAD_START, SALSA_BLOCK_HEADROOM,
    VERB_FLAG_COMPRESSED, VERB_MASK, Verb, armor, next_packet_id, packet_cipher, write_header,
};
use crate::runtime::{Context, PacketDropReason};
use crate::whois::WhoisQueue;

/// The VL1 receive pipeline and its owned state.
pub struct Vl1 {
    pub(crate) pool: BufPool,
    defrag: Defragmenter,
    pub(crate) whois: WhoisQueue,
}

impl Vl1 {
    /// Create a pipeline drawing buffers from `pool`.
    #[must_use]
    pub fn new(pool: BufPool) -> Self {
        Self {
            pool,
            defrag: Defragmenter::new(),
            whois: WhoisQueue::new(),
        }
    }

    /// The buffer pool datagrams should be received into.
    #[must_use]
    pub fn pool(&self) -> &BufPool {
        &self.pool
    }

    /// Handle one datagram received on `local_socket` from `from`.
    ///
    /// `len` is the datagram length within `data`; the buffer's spare
    /// capacity belongs to the pipeline.
    pub fn on_remote_packet(
        &self,
        ctx: &Context,
        local_socket: i64,
        from: SocketAddr,
        data: Buf,
        len: usize,
    ) {
        let now = ctx.node.now();
        let path = ctx.topology.get_path(local_socket, from);
        path.received(now);

        // Really short datagrams are keepalives and other junk.
        if len < MIN_FRAGMENT_LENGTH {
            return;
        }
        if len > data.len() {
            ctx.tracer
                .unexpected_error(0x6eae5a52, "datagram length exceeds buffer capacity");
            return;
        }

        let data = Arc::new(data);
        let mut pktv = SliceVector::new();

        if data[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR {
            let Ok(fh) = FragmentHeader::parse(&data[..len]) else {
                self.drop_packet(
                    ctx,
                    0x7ac1059e,
                    0,
                    None,
                    &path,
                    0,
                    Verb::Nop,
                    PacketDropReason::MalformedPacket,
                );
                return;
            };
            let packet_id = fh.packet_id();
            let destination = fh.destination();
            let fragment_no = fh.fragment_no();
            let total_fragments = fh.total_fragments();

            if destination != ctx.identity.address() {
                ctx.relay.relay(&path, destination, &data[..len]);
                return;
            }

            match self.defrag.assemble(
                packet_id,
                &mut pktv,
                Slice::new(data, FRAGMENT_PAYLOAD_START, len),
                fragment_no,
                total_fragments,
                now,
                path.id(),
                MAX_INCOMING_FRAGMENTS_PER_PATH,
            ) {
                AssembleResult::Complete => {}
                _ => return,
            }
        } else {
            // Whole packet or head of a fragment series.
            if len < MIN_PACKET_LENGTH {
                self.drop_packet(
                    ctx,
                    0x20f0218d,
                    0,
                    None,
                    &path,
                    0,
                    Verb::Nop,
                    PacketDropReason::MalformedPacket,
                );
                return;
            }
            let Ok(header) = Header::parse(&data[..len]) else {
                return;
            };
            let packet_id = header.packet_id();
            let destination = header.destination();
            let fragmented = header.is_fragmented();

            if destination != ctx.identity.address() {
                ctx.relay.relay(&path, destination, &data[..len]);
                return;
            }

            if fragmented {
                // The head is always fragment zero; the count rides in
                // the continuations.
                match self.defrag.assemble(
                    packet_id,
                    &mut pktv,
                    Slice::new(data, 0, len),
                    0,
                    0,
                    now,
                    path.id(),
                    MAX_INCOMING_FRAGMENTS_PER_PATH,
                ) {
                    AssembleResult::Complete => {}
                    _ => return,
                }
            } else {
                pktv.push(Slice::new(data, 0, len));
            }
        }

        self.process_assembled(ctx, &path, pktv, now);
    }

    /// Run an assembled slice vector through cipher demux and dispatch.
    pub(crate) fn process_assembled(
        &self,
        ctx: &Context,
        path: &Arc<Path>,
        mut pktv: SliceVector,
        now: i64,
    ) {
        // Defragmenter output sanity: a readable header in the first
        // slice, and enough trailing room in every slice to rebalance
        // to Salsa20 block multiples.
        if pktv.is_empty() || pktv[0].len() < HEADER_SIZE {
            ctx.tracer
                .unexpected_error(0x3df0a991, "empty or undersized packet vector");
            return;
        }
        for s in &pktv {
            if s.end() > BUF_SIZE - SALSA_BLOCK_HEADROOM || s.start() > s.end() {
                return;
            }
        }

        let (packet_id, source, hops, cipher, verb_byte, mac) = {
            let header = match Header::parse(pktv[0].as_bytes()) {
                Ok(h) => h,
                Err(_) => return,
            };
            (
                header.packet_id(),
                header.source(),
                header.hops(),
                header.cipher(),
                header.verb_byte(),
                header.mac(),
            )
        };

        if source == ctx.identity.address() {
            return;
        }
        let peer = ctx.topology.get(source);

        let packet_size: usize = pktv.iter().map(Slice::len).sum();
        if packet_size > MAX_PACKET_LENGTH {
            self.drop_packet(
                ctx,
                0x9a031b1c,
                packet_id,
                peer_identity(&peer),
                path,
                hops,
                Verb::Nop,
                PacketDropReason::MalformedPacket,
            );
            return;
        }

        // Unknown sender: unless this is a HELLO under a suite a
        // stranger is allowed to use, park the packet and ask the root
        // who they are.
        let hello_exempt = matches!(
            cipher,
            Some(CipherSuite::Poly1305None) | Some(CipherSuite::None)
        ) && (verb_byte & VERB_MASK) == Verb::Hello as u8;
        if peer.is_none() && !hello_exempt {
            let pkt = assemble_slice_vector(&self.pool, &pktv);
            if pkt.len() < MIN_PACKET_LENGTH {
                self.drop_packet(
                    ctx,
                    0xc9f2a411,
                    packet_id,
                    None,
                    path,
                    hops,
                    Verb::Nop,
                    PacketDropReason::MalformedPacket,
                );
                return;
            }
            self.whois.enqueue(source, pkt, path.clone());
            self.send_pending_whois(ctx, now);
            return;
        }

        let mut authenticated = false;
        let pkt = match cipher {
            Some(CipherSuite::Poly1305None) => {
                let pkt = assemble_slice_vector(&self.pool, &pktv);
                if pkt.len() < MIN_PACKET_LENGTH {
                    self.drop_packet(
                        ctx,
                        0x83b4e722,
                        packet_id,
                        peer_identity(&peer),
                        path,
                        hops,
                        Verb::Nop,
                        PacketDropReason::MalformedPacket,
                    );
                    return;
                }
                if let Some(peer) = &peer {
                    let bytes = pkt.as_bytes();
                    let (_, mac_key) = packet_cipher(peer.key(), &bytes[..HEADER_SIZE], packet_size);
                    if !poly1305_verify_prefix8(
                        &mac_key,
                        &bytes[crate::protocol::ENCRYPTED_SECTION_START..],
                        &mac,
                    ) {
                        self.drop_packet(
                            ctx,
                            0x55fe1190,
                            packet_id,
                            Some(peer.identity()),
                            path,
                            hops,
                            Verb::Nop,
                            PacketDropReason::MacFailed,
                        );
                        return;
                    }
                    authenticated = true;
                }
                // An unknown sender's HELLO is authenticated inside the
                // handler, against the freshly agreed key.
                pkt
            }

            Some(CipherSuite::Poly1305Salsa2012) => {
                let Some(peer) = &peer else {
                    // No session key, nothing to verify against.
                    self.drop_packet(
                        ctx,
                        0x10d71fc3,
                        packet_id,
                        None,
                        path,
                        hops,
                        Verb::Nop,
                        PacketDropReason::MacFailed,
                    );
                    return;
                };

                // Salsa20 is seekable only at 64-byte boundaries. Move
                // bytes between adjacent slices so every slice but the
                // last is a block multiple; the slice vector's content
                // and order are unchanged.
                if pktv.len() > 1 && !rebalance_slices(&mut pktv) {
                    ctx.tracer
                        .unexpected_error(0x3f55c1a7, "fragment buffer unexpectedly shared");
                    return;
                }

                // Assemble the encrypted image contiguously, verify the
                // MAC over it, then decrypt in place.
                let mut out = self.pool.get();
                let mut at = 0;
                for s in &pktv {
                    let bytes = s.as_bytes();
                    out[at..at + bytes.len()].copy_from_slice(bytes);
                    at += bytes.len();
                }

                let (mut s20, mac_key) = packet_cipher(peer.key(), &out[..HEADER_SIZE], packet_size);
                if !poly1305_verify_prefix8(
                    &mac_key,
                    &out[crate::protocol::ENCRYPTED_SECTION_START..packet_size],
                    &mac,
                ) {
                    self.drop_packet(
                        ctx,
                        0xb62c88e9,
                        packet_id,
                        Some(peer.identity()),
                        path,
                        hops,
                        Verb::Nop,
                        PacketDropReason::MacFailed,
                    );
                    return;
                }
                s20.crypt_in_place(&mut out[crate::protocol::ENCRYPTED_SECTION_START..packet_size]);
                authenticated = true;
                Slice::new(Arc::new(out), 0, packet_size)
            }

            Some(CipherSuite::None) => {
                // Authenticity comes from operator trust in the path;
                // the MAC field carries the asserted trusted path id.
                let pkt = assemble_slice_vector(&self.pool, &pktv);
                if pkt.len() < MIN_PACKET_LENGTH {
                    self.drop_packet(
                        ctx,
                        0x88cd4e0a,
                        packet_id,
                        peer_identity(&peer),
                        path,
                        hops,
                        Verb::Nop,
                        PacketDropReason::MalformedPacket,
                    );
                    return;
                }
                let trusted_path_id = u64::from_be_bytes(mac);
                if !ctx
                    .topology
                    .should_inbound_path_be_trusted(path.address(), trusted_path_id)
                {
                    self.drop_packet(
                        ctx,
                        0x442f7f58,
                        packet_id,
                        peer_identity(&peer),
                        path,
                        hops,
                        Verb::Nop,
                        PacketDropReason::NotTrustedPath,
                    );
                    return;
                }
                authenticated = true;
                pkt
            }

            None => {
                self.drop_packet(
                    ctx,
                    0x61b8a6e4,
                    packet_id,
                    peer_identity(&peer),
                    path,
                    hops,
                    Verb::Nop,
                    PacketDropReason::InvalidObject,
                );
                return;
            }
        };

        // Return any fragment buffers to the pool before dispatch.
        drop(pktv);

        self.dispatch(ctx, path, peer, pkt, authenticated, hops, now);
    }

    /// Decompress if flagged, decode the verb, and route the packet.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        ctx: &Context,
        path: &Arc<Path>,
        peer: Option<Arc<Peer>>,
        pkt: Slice,
        authenticated: bool,
        hops: u8,
        now: i64,
    ) {
        let packet_id = match Header::parse(pkt.as_bytes()) {
            Ok(h) => h.packet_id(),
            Err(_) => return,
        };
        let verb_byte = pkt.as_bytes()[27];
        let claimed_verb = Verb::from_u5(verb_byte).unwrap_or(Verb::Nop);

        let pkt = if verb_byte & VERB_FLAG_COMPRESSED != 0 {
            // Inflating attacker-controlled data is off the table.
            if !authenticated {
                self.drop_packet(
                    ctx,
                    0xe2d00bbe,
                    packet_id,
                    peer_identity(&peer),
                    path,
                    hops,
                    claimed_verb,
                    PacketDropReason::MalformedPacket,
                );
                return;
            }
            match self.decompress(&pkt) {
                Some(p) => p,
                None => {
                    self.drop_packet(
                        ctx,
                        0x1d9b3c54,
                        packet_id,
                        peer_identity(&peer),
                        path,
                        hops,
                        claimed_verb,
                        PacketDropReason::InvalidCompressedData,
                    );
                    return;
                }
            }
        } else {
            pkt
        };

        let bytes = pkt.as_bytes();
        let Some(verb) = Verb::from_u5(bytes[27]) else {
            self.drop_packet(
                ctx,
                0x05c6eb1f,
                packet_id,
                peer_identity(&peer),
                path,
                hops,
                Verb::Nop,
                PacketDropReason::UnrecognizedVerb,
            );
            return;
        };

        match verb {
            Verb::Nop => {
                if let Some(peer) = &peer {
                    peer.received(path, hops, packet_id, verb, now);
                }
            }

            Verb::Hello => self.handle_hello(ctx, path, peer, &pkt, now),

            // Transport verbs whose bodies are not yet served: stamp
            // liveness and move on. ECHO included; it is self-contained
            // and never touches the multicast handlers.
            Verb::Error
            | Verb::Ok
            | Verb::Whois
            | Verb::Rendezvous
            | Verb::Echo
            | Verb::PushDirectPaths
            | Verb::UserMessage
            | Verb::Encap => {
                if let Some(peer) = &peer {
                    peer.received(path, hops, packet_id, verb, now);
                }
                tracing::trace!(?verb, packet_id, "transport verb ignored");
            }

            // Virtual Ethernet verbs belong to the layer above.
            Verb::Frame
            | Verb::ExtFrame
            | Verb::MulticastLike
            | Verb::NetworkCredentials
            | Verb::NetworkConfigRequest
            | Verb::NetworkConfig
            | Verb::MulticastGather
            | Verb::MulticastFrameDeprecated
            | Verb::Multicast => {
                let Some(peer) = &peer else { return };
                peer.received(path, hops, packet_id, verb, now);
                let vl2 = &ctx.vl2;
                match verb {
                    Verb::Frame => vl2.frame(path, peer, bytes, authenticated),
                    Verb::ExtFrame => vl2.ext_frame(path, peer, bytes, authenticated),
                    Verb::MulticastLike => vl2.multicast_like(path, peer, bytes, authenticated),
                    Verb::NetworkCredentials => {
                        vl2.network_credentials(path, peer, bytes, authenticated);
                    }
                    Verb::NetworkConfigRequest => {
                        vl2.network_config_request(path, peer, bytes, authenticated);
                    }
                    Verb::NetworkConfig => vl2.network_config(path, peer, bytes, authenticated),
                    Verb::MulticastGather => vl2.multicast_gather(path, peer, bytes, authenticated),
                    Verb::MulticastFrameDeprecated => {
                        vl2.multicast_frame_deprecated(path, peer, bytes, authenticated);
                    }
                    Verb::Multicast => vl2.multicast(path, peer, bytes, authenticated),
                    _ => {}
                }
            }
        }
    }

    /// Inflate a compressed payload into a fresh buffer, keeping the
    /// header and clearing the compressed flag.
    fn decompress(&self, pkt: &Slice) -> Option<Slice> {
        let bytes = pkt.as_bytes();
        let mut out = self.pool.get();
        let n =
            lz4_flex::block::decompress_into(&bytes[PAYLOAD_START..], &mut out[PAYLOAD_START..])
                .ok()?;
        out[..PAYLOAD_START].copy_from_slice(&bytes[..PAYLOAD_START]);
        out[27] &= !VERB_FLAG_COMPRESSED;
        Some(Slice::new(Arc::new(out), 0, PAYLOAD_START + n))
    }

    /// Send WHOIS requests for every queued address whose retry timer
    /// has elapsed, batched to the root over its preferred path.
    pub fn send_pending_whois(&self, ctx: &Context, now: i64) {
        let Some(root) = ctx.topology.root() else {
            return;
        };
        let Some(root_path) = root.path(now) else {
            return;
        };

        let ready = self.whois.flush_ready(now);
        if ready.is_empty() {
            return;
        }

        let per_packet = (MAX_PACKET_LENGTH - PAYLOAD_START) / ADDRESS_LENGTH;
        for chunk in ready.chunks(per_packet) {
            let mut out = Vec::with_capacity(PAYLOAD_START + chunk.len() * ADDRESS_LENGTH);
            write_header(
                &mut out,
                next_packet_id(),
                root.identity().address(),
                ctx.identity.address(),
                0,
                Verb::Whois,
            );
            for address in chunk {
                out.extend_from_slice(&address.to_bytes());
            }
            armor(&mut out, root.key(), CipherSuite::Poly1305Salsa2012);
            root_path.send(ctx, &out, now);
        }
    }

    /// Re-run everything parked for `address` through the ordinary
    /// ingress stages. Called once the address's peer is learned.
    pub(crate) fn reinject_pending(&self, ctx: &Context, address: Address, now: i64) {
        for (pkt, arrival_path) in self.whois.drain(address) {
            self.process_assembled(ctx, &arrival_path, vec![pkt], now);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn drop_packet(
        &self,
        ctx: &Context,
        code: u32,
        packet_id: u64,
        identity: Option<&Identity>,
        path: &Arc<Path>,
        hops: u8,
        verb: Verb,
        reason: PacketDropReason,
    ) {
        tracing::debug!(code, packet_id, ?verb, ?reason, from = %path.address(), "inbound packet dropped");
        ctx.tracer
            .incoming_packet_dropped(code, packet_id, identity, path.address(), hops, verb, reason);
    }
}

fn peer_identity(peer: &Option<Arc<Peer>>) -> Option<&Identity> {
    peer.as_deref().map(Peer::identity)
}

/// Shift bytes between adjacent slices so every slice but the last has
/// a length that is a multiple of 64, moving from the head of each
/// slice to the tail of its predecessor. Total content and ordering
/// are preserved; only the backing buffers mutate.
///
/// Returns `false` if a backing buffer is unexpectedly shared and
/// cannot be mutated.
fn rebalance_slices(pktv: &mut [Slice]) -> bool {
    for i in 1..pktv.len() {
        let (left, right) = pktv.split_at_mut(i);
        let prev = &mut left[i - 1];
        let cur = &mut right[0];

        let short = (64 - (prev.len() & 63)) & 63;
        let take = short.min(cur.len());
        if take == 0 {
            continue;
        }
        let Some(p) = prev.exclusive() else {
            return false;
        };
        let Some(c) = cur.exclusive() else {
            return false;
        };
        for _ in 0..take {
            p.mem[*p.end] = c.mem[*c.start];
            *p.end += 1;
            *c.start += 1;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufPool;

    fn slice_with(pool: &BufPool, len: usize, fill: u8) -> Slice {
        let mut buf = pool.get();
        buf[..len].fill(fill);
        Slice::new(Arc::new(buf), 0, len)
    }

    #[test]
    fn rebalance_aligns_all_but_last() {
        let pool = BufPool::new();
        let mut pktv = vec![
            slice_with(&pool, 100, 1),
            slice_with(&pool, 130, 2),
            slice_with(&pool, 57, 3),
        ];
        let before: Vec<u8> = pktv.iter().flat_map(|s| s.as_bytes().to_vec()).collect();

        assert!(rebalance_slices(&mut pktv));

        for s in &pktv[..pktv.len() - 1] {
            assert_eq!(s.len() % 64, 0, "non-final slice not block aligned");
        }
        let after: Vec<u8> = pktv.iter().flat_map(|s| s.as_bytes().to_vec()).collect();
        assert_eq!(before, after, "content or order disturbed");
        assert_eq!(after.len(), 287);
    }

    #[test]
    fn rebalance_leaves_aligned_input_alone() {
        let pool = BufPool::new();
        let mut pktv = vec![slice_with(&pool, 128, 1), slice_with(&pool, 30, 2)];
        assert!(rebalance_slices(&mut pktv));
        assert_eq!(pktv[0].len(), 128);
        assert_eq!(pktv[1].len(), 30);
    }

    #[test]
    fn rebalance_handles_draining_a_slice() {
        let pool = BufPool::new();
        // Second slice is too short to fill the first to a boundary.
        let mut pktv = vec![
            slice_with(&pool, 10, 1),
            slice_with(&pool, 3, 2),
            slice_with(&pool, 200, 3),
        ];
        let before: Vec<u8> = pktv.iter().flat_map(|s| s.as_bytes().to_vec()).collect();
        assert!(rebalance_slices(&mut pktv));
        let after: Vec<u8> = pktv.iter().flat_map(|s| s.as_bytes().to_vec()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn rebalance_refuses_shared_buffers() {
        let pool = BufPool::new();
        let shared = Arc::new(pool.get());
        let mut pktv = vec![
            Slice::new(shared.clone(), 0, 100),
            slice_with(&pool, 50, 2),
        ];
        assert!(!rebalance_slices(&mut pktv));
    }
}
