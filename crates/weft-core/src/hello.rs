//! The HELLO exchange.
//!
//! HELLO is the one verb whose sender may be unknown: authentication
//! and identity learning happen in a single step. The packet carries
//! the sender's full identity in the clear, then an optional extension
//! block veiled with Salsa20/12 (a privacy measure, not secrecy) that
//! holds a legacy filler field, a metadata dictionary, and, for
//! protocol 11 and newer, an HMAC-SHA-384 binding the whole encrypted
//! section under a KBKDF subkey. Two authentication layers thus guard a
//! modern HELLO: Poly1305 over the wire image for the legacy-compatible
//! prefix, HMAC-SHA-384 for the extensions.

use std::net::SocketAddr;
use std::sync::Arc;

use weft_crypto::constant_time::ct_eq;
use weft_crypto::kdf::{KDF_LABEL_HELLO_HMAC, hmac_sha384, kbkdf_hmac_sha384};
use weft_crypto::poly::poly1305_verify_prefix8;
use weft_crypto::salsa::Salsa2012;
use weft_crypto::HMAC_SHA384_SIZE;

use crate::address::Address;
use crate::buf::Slice;
use crate::dictionary::Dictionary;
use crate::error::ProtocolError;
use crate::identity::Identity;
use crate::path::Path;
use crate::peer::{Peer, RemoteVersion};
use crate::protocol::{
    CipherSuite, ENCRYPTED_SECTION_START, HEADER_SIZE, HELLO_FIXED_SIZE, Header, OK_HEADER_SIZE,
    OK_HELLO_FIXED_SIZE, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN, VERSION_MAJOR, VERSION_MINOR,
    VERSION_REVISION, Verb, armor, next_packet_id, packet_cipher, read_inet, write_header,
    write_inet,
};
use crate::runtime::{Context, PacketDropReason};
use crate::vl1::Vl1;

impl Vl1 {
    /// Handle a fully assembled HELLO.
    ///
    /// `peer` is the topology's current entry for the claimed source,
    /// if any. The handler performs its own Poly1305 verification under
    /// the agreed key, so a previously unknown sender authenticates
    /// here rather than in the cipher demultiplexer.
    pub(crate) fn handle_hello(
        &self,
        ctx: &Context,
        path: &Arc<Path>,
        peer: Option<Arc<Peer>>,
        pkt: &Slice,
        now: i64,
    ) {
        let bytes = pkt.as_bytes();
        let packet_size = bytes.len();

        let Ok(header) = Header::parse(bytes) else {
            return;
        };
        let packet_id = header.packet_id();
        let hops = header.hops();

        if packet_size < HELLO_FIXED_SIZE {
            self.drop_packet(
                ctx,
                0x27bc82e0,
                packet_id,
                peer.as_deref().map(Peer::identity),
                path,
                hops,
                Verb::Hello,
                PacketDropReason::MalformedPacket,
            );
            return;
        }

        let version_protocol = bytes[28];
        let version_major = bytes[29];
        let version_minor = bytes[30];
        let version_revision = u16::from_be_bytes([bytes[31], bytes[32]]);
        let timestamp: [u8; 8] = bytes[33..41].try_into().expect("8-byte field");

        if version_protocol < PROTOCOL_VERSION_MIN {
            self.drop_packet(
                ctx,
                0x90f3bb61,
                packet_id,
                peer.as_deref().map(Peer::identity),
                path,
                hops,
                Verb::Hello,
                PacketDropReason::PeerTooOld,
            );
            return;
        }

        let mut cursor = HELLO_FIXED_SIZE;
        let id = match Identity::unmarshal(bytes, &mut cursor) {
            Ok(id) => id,
            Err(_) => {
                self.drop_packet(
                    ctx,
                    0x5cd17e29,
                    packet_id,
                    peer.as_deref().map(Peer::identity),
                    path,
                    hops,
                    Verb::Hello,
                    PacketDropReason::InvalidObject,
                );
                return;
            }
        };
        // A header source disagreeing with the enclosed identity is
        // indistinguishable from a forgery.
        if header.source() != id.address() {
            self.drop_packet(
                ctx,
                0x3e0c55d2,
                packet_id,
                None,
                path,
                hops,
                Verb::Hello,
                PacketDropReason::MacFailed,
            );
            return;
        }

        // Session key: reuse the existing peer's when the identity
        // matches, otherwise agree fresh. The agreed key is used below
        // even when no peer exists yet.
        let existing = peer.filter(|p| p.identity() == &id);
        let key: [u8; 48] = match &existing {
            Some(p) => *p.key(),
            None => match ctx.identity.agree(&id) {
                Some(k) => k,
                None => {
                    self.drop_packet(
                        ctx,
                        0x7714a00b,
                        packet_id,
                        Some(&id),
                        path,
                        hops,
                        Verb::Hello,
                        PacketDropReason::MacFailed,
                    );
                    return;
                }
            },
        };

        // Legacy-layer authentication: Poly1305 over the wire image.
        let (_, mac_key) = packet_cipher(&key, &bytes[..HEADER_SIZE], packet_size);
        if !poly1305_verify_prefix8(&mac_key, &bytes[ENCRYPTED_SECTION_START..], &header.mac()) {
            self.drop_packet(
                ctx,
                0x2207f1c8,
                packet_id,
                Some(&id),
                path,
                hops,
                Verb::Hello,
                PacketDropReason::MacFailed,
            );
            return;
        }

        // Extension block. Work on a copy: the veil is stripped in
        // place and the shared packet buffer stays pristine.
        let mut work = bytes.to_vec();
        let mut surface: Option<SocketAddr> = None;
        let mut metadata = Dictionary::new();
        let mut hmac_authenticated = false;

        if cursor < packet_size {
            surface = match read_inet(&work, &mut cursor) {
                Ok(s) => s,
                Err(_) => {
                    self.drop_packet(
                        ctx,
                        0x64d13fa9,
                        packet_id,
                        Some(&id),
                        path,
                        hops,
                        Verb::Hello,
                        PacketDropReason::InvalidObject,
                    );
                    return;
                }
            };
        }

        if cursor < packet_size {
            // Everything from here is veiled with Salsa20/12 under the
            // session key; the nonce is the packet id with its low
            // three bits cleared.
            let mut iv: [u8; 8] = work[0..8].try_into().expect("8-byte field");
            iv[7] &= 0xf8;
            let salsa_key: [u8; 32] = key[..32].try_into().expect("48 >= 32");
            Salsa2012::new(&salsa_key, &iv).crypt_in_place(&mut work[cursor..]);

            // Legacy filler, zero-length in current versions.
            let Some(filler) = read_u16(&work, &mut cursor) else {
                self.drop_malformed_ext(ctx, 0x51c089ad, packet_id, &id, path, hops);
                return;
            };
            cursor += filler as usize;
            if cursor > packet_size {
                self.drop_malformed_ext(ctx, 0x51c089ad, packet_id, &id, path, hops);
                return;
            }

            if cursor < packet_size {
                let Some(dict_len) = read_u16(&work, &mut cursor) else {
                    self.drop_malformed_ext(ctx, 0x0f5ab899, packet_id, &id, path, hops);
                    return;
                };
                let dict_start = cursor;
                cursor += dict_len as usize;
                if cursor > packet_size {
                    self.drop_packet(
                        ctx,
                        0x0f5ab899,
                        packet_id,
                        Some(&id),
                        path,
                        hops,
                        Verb::Hello,
                        PacketDropReason::InvalidObject,
                    );
                    return;
                }

                // Additional fields, zero-length in current versions.
                let Some(additional) = read_u16(&work, &mut cursor) else {
                    self.drop_malformed_ext(ctx, 0xb3e1c077, packet_id, &id, path, hops);
                    return;
                };
                cursor += additional as usize;
                if cursor > packet_size {
                    self.drop_malformed_ext(ctx, 0xb3e1c077, packet_id, &id, path, hops);
                    return;
                }

                // Second authentication layer over the whole encrypted
                // section, up to where the HMAC itself begins.
                if cursor + HMAC_SHA384_SIZE <= packet_size {
                    let hmac_key = kbkdf_hmac_sha384(&key, KDF_LABEL_HELLO_HMAC, 0);
                    let expected =
                        hmac_sha384(&hmac_key, &work[ENCRYPTED_SECTION_START..cursor]);
                    if !ct_eq(&expected, &work[cursor..cursor + HMAC_SHA384_SIZE]) {
                        self.drop_packet(
                            ctx,
                            0x9cc00e36,
                            packet_id,
                            Some(&id),
                            path,
                            hops,
                            Verb::Hello,
                            PacketDropReason::MacFailed,
                        );
                        return;
                    }
                    hmac_authenticated = true;
                }

                if dict_len > 0 {
                    match Dictionary::decode(&work[dict_start..dict_start + dict_len as usize]) {
                        Some(d) => metadata = d,
                        None => {
                            self.drop_packet(
                                ctx,
                                0x4a7d91d5,
                                packet_id,
                                Some(&id),
                                path,
                                hops,
                                Verb::Hello,
                                PacketDropReason::InvalidObject,
                            );
                            return;
                        }
                    }
                }
            }
        }

        // Protocol 11 peers must carry the HMAC layer; older peers are
        // grandfathered.
        if !hmac_authenticated && version_protocol >= 11 {
            self.drop_packet(
                ctx,
                0xd4529f10,
                packet_id,
                Some(&id),
                path,
                hops,
                Verb::Hello,
                PacketDropReason::MacFailed,
            );
            return;
        }

        // Fully verified; learn the peer if it is new.
        let peer = match existing {
            Some(p) => p,
            None => {
                if !ctx.node.rate_gate_identity_verification(now, path.address()) {
                    self.drop_packet(
                        ctx,
                        0x816df3b4,
                        packet_id,
                        Some(&id),
                        path,
                        hops,
                        Verb::Hello,
                        PacketDropReason::RateLimitExceeded,
                    );
                    return;
                }
                if !id.locally_validate() {
                    self.drop_packet(
                        ctx,
                        0x6b01c2ff,
                        packet_id,
                        Some(&id),
                        path,
                        hops,
                        Verb::Hello,
                        PacketDropReason::InvalidObject,
                    );
                    return;
                }
                let Some(new_peer) = Peer::new(&ctx.identity, id.clone()) else {
                    return;
                };
                let peer = ctx.topology.add(Arc::new(new_peer));
                // Learning the address releases anything parked for it.
                self.reinject_pending(ctx, id.address(), now);
                peer
            }
        };

        if hops == 0 {
            if let Some(surface) = surface {
                ctx.self_awareness.iam(
                    &id,
                    path.local_socket(),
                    path.address(),
                    surface,
                    ctx.topology.is_root(&id),
                    now,
                );
            }
        }

        tracing::debug!(
            peer = %id.address(),
            protocol = version_protocol,
            has_metadata = !metadata.is_empty(),
            "hello verified"
        );

        // OK(HELLO) reply: echoed timestamp, our version triple, the
        // address we see the sender at, and for protocol 11 the same
        // extension layout bound by HMAC with iteration 1.
        let mut dict_bytes = Vec::new();
        Dictionary::new().encode(&mut dict_bytes);

        let mut out = Vec::with_capacity(OK_HELLO_FIXED_SIZE + 64 + dict_bytes.len());
        write_header(
            &mut out,
            next_packet_id(),
            id.address(),
            ctx.identity.address(),
            0,
            Verb::Ok,
        );
        out.push(Verb::Hello as u8);
        out.extend_from_slice(&bytes[0..8]);
        out.extend_from_slice(&timestamp);
        out.push(PROTOCOL_VERSION);
        out.push(VERSION_MAJOR);
        out.push(VERSION_MINOR);
        out.extend_from_slice(&VERSION_REVISION.to_be_bytes());
        write_inet(&mut out, Some(path.address()));

        if version_protocol >= 11 {
            out.extend_from_slice(&0u16.to_be_bytes());
            out.extend_from_slice(&(dict_bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(&dict_bytes);
            out.extend_from_slice(&0u16.to_be_bytes());

            let hmac_key = kbkdf_hmac_sha384(peer.key(), KDF_LABEL_HELLO_HMAC, 1);
            let tag = hmac_sha384(&hmac_key, &out[OK_HEADER_SIZE..]);
            out.extend_from_slice(&tag);
        }

        armor(&mut out, peer.key(), CipherSuite::Poly1305Salsa2012);
        path.send(ctx, &out, now);

        peer.set_remote_version(RemoteVersion {
            protocol: version_protocol,
            major: version_major,
            minor: version_minor,
            revision: version_revision,
        });
        peer.received(path, hops, packet_id, Verb::Hello, now);
    }

    fn drop_malformed_ext(
        &self,
        ctx: &Context,
        code: u32,
        packet_id: u64,
        id: &Identity,
        path: &Arc<Path>,
        hops: u8,
    ) {
        self.drop_packet(
            ctx,
            code,
            packet_id,
            Some(id),
            path,
            hops,
            Verb::Hello,
            PacketDropReason::MalformedPacket,
        );
    }
}

/// Build the wire image of a HELLO to `destination`.
///
/// `key` is the session secret agreed between `local` and the
/// destination's identity. The extension block (legacy filler, metadata
/// dictionary, additional fields, and for protocol 11 the HMAC) is
/// veiled with Salsa20/12 and the packet armored `POLY1305_NONE`, the
/// one suite a yet-unknown sender is allowed to introduce itself under.
#[must_use]
pub fn build_hello(
    local: &Identity,
    destination: Address,
    key: &[u8; 48],
    version_protocol: u8,
    timestamp: u64,
    surface: Option<SocketAddr>,
    metadata: &Dictionary,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_header(
        &mut out,
        next_packet_id(),
        destination,
        local.address(),
        0,
        Verb::Hello,
    );
    out.push(version_protocol);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    out.extend_from_slice(&VERSION_REVISION.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    local.marshal(&mut out);
    write_inet(&mut out, surface);

    let ext_start = out.len();
    out.extend_from_slice(&0u16.to_be_bytes());

    let mut dict_bytes = Vec::new();
    metadata.encode(&mut dict_bytes);
    out.extend_from_slice(&(dict_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&dict_bytes);
    out.extend_from_slice(&0u16.to_be_bytes());

    if version_protocol >= 11 {
        let hmac_key = kbkdf_hmac_sha384(key, KDF_LABEL_HELLO_HMAC, 0);
        let tag = hmac_sha384(&hmac_key, &out[ENCRYPTED_SECTION_START..]);
        out.extend_from_slice(&tag);
    }

    let mut iv: [u8; 8] = out[0..8].try_into().expect("8-byte packet id");
    iv[7] &= 0xf8;
    let salsa_key: [u8; 32] = key[..32].try_into().expect("48 >= 32");
    Salsa2012::new(&salsa_key, &iv).crypt_in_place(&mut out[ext_start..]);

    armor(&mut out, key, CipherSuite::Poly1305None);
    out
}

/// Fields of a decrypted OK(HELLO) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkHello {
    /// Packet id of the HELLO being answered.
    pub in_re_packet_id: u64,
    /// Timestamp echoed from the HELLO.
    pub timestamp_echo: u64,
    /// Responder's version triple.
    pub version: RemoteVersion,
    /// The address the responder sees us at.
    pub surface: Option<SocketAddr>,
}

/// Parse a dearmored OK(HELLO), the sender-side counterpart of the
/// reply built by the handler. Extension fields are not interpreted.
pub fn read_ok_hello(packet: &[u8]) -> Result<OkHello, ProtocolError> {
    if packet.len() < OK_HELLO_FIXED_SIZE {
        return Err(ProtocolError::TooShort {
            expected: OK_HELLO_FIXED_SIZE,
            actual: packet.len(),
        });
    }
    if packet[HEADER_SIZE] != Verb::Hello as u8 {
        return Err(ProtocolError::InvalidObject("not an OK(HELLO)"));
    }
    let in_re_packet_id = u64::from_be_bytes(
        packet[HEADER_SIZE + 1..HEADER_SIZE + 9]
            .try_into()
            .expect("8-byte field"),
    );
    let timestamp_echo = u64::from_be_bytes(
        packet[OK_HEADER_SIZE..OK_HEADER_SIZE + 8]
            .try_into()
            .expect("8-byte field"),
    );
    let version = RemoteVersion {
        protocol: packet[OK_HEADER_SIZE + 8],
        major: packet[OK_HEADER_SIZE + 9],
        minor: packet[OK_HEADER_SIZE + 10],
        revision: u16::from_be_bytes([packet[OK_HEADER_SIZE + 11], packet[OK_HEADER_SIZE + 12]]),
    };
    let mut cursor = OK_HELLO_FIXED_SIZE;
    let surface = read_inet(packet, &mut cursor)?;
    Ok(OkHello {
        in_re_packet_id,
        timestamp_echo,
        version,
        surface,
    })
}

fn read_u16(data: &[u8], cursor: &mut usize) -> Option<u16> {
    let b = data.get(*cursor..*cursor + 2)?;
    *cursor += 2;
    Some(u16::from_be_bytes([b[0], b[1]]))
}
