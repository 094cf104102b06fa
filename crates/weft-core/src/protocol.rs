//! Wire layout of the weft VL1 protocol.
//!
//! Zero-copy readers over the common packet header, the fragment
//! header, and the HELLO/OK body layouts, plus the outbound armor that
//! applies a cipher suite and MAC in place. All multi-byte fields are
//! big-endian.
//!
//! ```text
//! Common header (28 bytes):
//!   [0..8)   packet id
//!   [8..13)  destination address
//!   [13..18) source address        (first byte 0xff marks a fragment)
//!   [18]     flags: 0x40 fragmented, bits 3..5 cipher suite,
//!            low 3 bits hop count
//!   [19..27) MAC (or trusted path id under the NONE suite)
//!   [27]     verb: 0x80 compressed, low 5 bits verb id
//!            (start of the encrypted/authenticated section)
//!
//! Fragment frame (16-byte header):
//!   [0..8)   packet id (same as head)
//!   [8..13)  destination address
//!   [13]     0xff fragment indicator
//!   [14]     counts: high nibble total fragments, low nibble index
//!   [15]     hop count (low 3 bits)
//!   [16..)   payload
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use weft_crypto::poly::poly1305_tag;
use weft_crypto::salsa::Salsa2012;

use crate::address::Address;
use crate::buf::BUF_SIZE;
use crate::error::ProtocolError;

/// Protocol version carried in our HELLOs.
pub const PROTOCOL_VERSION: u8 = 11;

/// Oldest protocol version we still talk to.
pub const PROTOCOL_VERSION_MIN: u8 = 6;

/// Node software version triple reported in HELLO/OK exchanges.
pub const VERSION_MAJOR: u8 = 0;
/// Minor component of the reported version.
pub const VERSION_MINOR: u8 = 1;
/// Revision component of the reported version.
pub const VERSION_REVISION: u16 = 0;

/// Datagrams shorter than this are keepalives and carry no state.
pub const MIN_FRAGMENT_LENGTH: usize = 8;

/// Common header plus verb byte.
pub const MIN_PACKET_LENGTH: usize = 28;

/// Size of the common packet header (including the verb byte).
pub const HEADER_SIZE: usize = 28;

/// Size of a fragment continuation header.
pub const FRAGMENT_HEADER_SIZE: usize = 16;

/// Byte index inspected to classify a datagram as a fragment.
pub const FRAGMENT_INDICATOR_INDEX: usize = 13;

/// Sentinel at [`FRAGMENT_INDICATOR_INDEX`] marking a fragment.
pub const FRAGMENT_INDICATOR: u8 = 0xff;

/// Offset of fragment payload within a continuation frame.
pub const FRAGMENT_PAYLOAD_START: usize = 16;

/// Start of the span covered by the per-packet MAC (and, under
/// `POLY1305_SALSA2012`, by the stream cipher): the verb byte.
pub const ENCRYPTED_SECTION_START: usize = 27;

/// Start of the verb-specific payload.
pub const PAYLOAD_START: usize = 28;

/// Trailing buffer headroom every slice must preserve (Salsa20 block).
pub const SALSA_BLOCK_HEADROOM: usize = 64;

/// Maximum assembled packet length.
pub const MAX_PACKET_LENGTH: usize = BUF_SIZE - SALSA_BLOCK_HEADROOM;

/// Maximum fragments per packet (bounded by the 4-bit counts nibble).
pub const MAX_PACKET_FRAGMENTS: usize = 16;

/// Maximum in-flight fragment assemblies per path.
pub const MAX_INCOMING_FRAGMENTS_PER_PATH: usize = 32;

/// Flags bit: this head packet is followed by fragments.
pub const FLAG_FRAGMENTED: u8 = 0x40;

/// Mask of the hop-count bits in the flags byte.
pub const FLAGS_HOPS_MASK: u8 = 0x07;

/// Mask selecting the verb id from the verb byte.
pub const VERB_MASK: u8 = 0x1f;

/// Verb byte flag: payload is LZ4 compressed.
pub const VERB_FLAG_COMPRESSED: u8 = 0x80;

const CIPHER_SHIFT: u8 = 3;
const CIPHER_MASK: u8 = 0x38;

/// Fixed HELLO body size: header + version fields + timestamp.
pub const HELLO_FIXED_SIZE: usize = HEADER_SIZE + 1 + 1 + 1 + 2 + 8;

/// OK header size: common header + in-re verb + in-re packet id.
pub const OK_HEADER_SIZE: usize = HEADER_SIZE + 1 + 8;

/// Fixed OK(HELLO) body size: OK header + echoed timestamp + version.
pub const OK_HELLO_FIXED_SIZE: usize = OK_HEADER_SIZE + 8 + 1 + 1 + 1 + 2;

/// Transport verbs (low 5 bits of the verb byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    /// Liveness only, no payload semantics
    Nop = 0x00,
    /// Identity exchange and session establishment
    Hello = 0x01,
    /// Error in response to a previous packet
    Error = 0x02,
    /// Success in response to a previous packet
    Ok = 0x03,
    /// Identity lookup by address
    Whois = 0x04,
    /// NAT traversal rendezvous
    Rendezvous = 0x05,
    /// Virtual Ethernet frame (VL2)
    Frame = 0x06,
    /// Extended virtual Ethernet frame (VL2)
    ExtFrame = 0x07,
    /// Echo request
    Echo = 0x08,
    /// Multicast group subscription (VL2)
    MulticastLike = 0x09,
    /// Network membership credentials (VL2)
    NetworkCredentials = 0x0a,
    /// Network configuration request (VL2)
    NetworkConfigRequest = 0x0b,
    /// Network configuration push (VL2)
    NetworkConfig = 0x0c,
    /// Multicast member gather (VL2)
    MulticastGather = 0x0d,
    /// Legacy multicast frame (VL2)
    MulticastFrameDeprecated = 0x0e,
    /// Direct path advertisement
    PushDirectPaths = 0x10,
    /// Opaque user payload
    UserMessage = 0x14,
    /// Multicast frame (VL2)
    Multicast = 0x16,
    /// Encapsulated packet
    Encap = 0x17,
}

impl Verb {
    /// Decode the low 5 bits of a verb byte. `None` for unassigned ids.
    #[must_use]
    pub fn from_u5(v: u8) -> Option<Self> {
        Some(match v & VERB_MASK {
            0x00 => Self::Nop,
            0x01 => Self::Hello,
            0x02 => Self::Error,
            0x03 => Self::Ok,
            0x04 => Self::Whois,
            0x05 => Self::Rendezvous,
            0x06 => Self::Frame,
            0x07 => Self::ExtFrame,
            0x08 => Self::Echo,
            0x09 => Self::MulticastLike,
            0x0a => Self::NetworkCredentials,
            0x0b => Self::NetworkConfigRequest,
            0x0c => Self::NetworkConfig,
            0x0d => Self::MulticastGather,
            0x0e => Self::MulticastFrameDeprecated,
            0x10 => Self::PushDirectPaths,
            0x14 => Self::UserMessage,
            0x16 => Self::Multicast,
            0x17 => Self::Encap,
            _ => return None,
        })
    }
}

/// Cipher suites, encoded in bits 3..5 of the flags byte.
///
/// The flags byte is the only mutable-in-flight header field outside
/// the encrypted section, which is why the suite lives there and not in
/// the (encrypted) verb byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// Poly1305 authentication, no encryption
    Poly1305None = 0,
    /// Poly1305 authentication with Salsa20/12 encryption
    Poly1305Salsa2012 = 1,
    /// No cryptography; authenticity from an operator-trusted path
    None = 2,
}

impl CipherSuite {
    /// Decode the cipher bits of the flags byte. Id 3 is reserved for a
    /// future AES-GCM suite; it and the remaining ids decode as `None`
    /// (the Option).
    #[must_use]
    pub fn from_flags(flags: u8) -> Option<Self> {
        match (flags & CIPHER_MASK) >> CIPHER_SHIFT {
            0 => Some(Self::Poly1305None),
            1 => Some(Self::Poly1305Salsa2012),
            2 => Some(Self::None),
            _ => None,
        }
    }

    /// The suite's bits positioned for the flags byte.
    #[must_use]
    pub fn flags_bits(self) -> u8 {
        (self as u8) << CIPHER_SHIFT
    }
}

/// Zero-copy view of the common packet header.
#[derive(Debug, Clone, Copy)]
pub struct Header<'a> {
    raw: &'a [u8],
}

impl<'a> Header<'a> {
    /// Lay the header view over `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self { raw: data })
    }

    /// The 64-bit packet id.
    #[must_use]
    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(self.raw[0..8].try_into().expect("8-byte field"))
    }

    /// Destination address.
    #[must_use]
    pub fn destination(&self) -> Address {
        Address::read_from(self.raw, 8).expect("bounds checked in parse")
    }

    /// Source address.
    #[must_use]
    pub fn source(&self) -> Address {
        Address::read_from(self.raw, 13).expect("bounds checked in parse")
    }

    /// Raw flags byte.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.raw[18]
    }

    /// Hop count (low 3 bits of flags, mutated in flight by relays).
    #[must_use]
    pub fn hops(&self) -> u8 {
        self.raw[18] & FLAGS_HOPS_MASK
    }

    /// Whether this head packet is followed by fragments.
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        self.raw[18] & FLAG_FRAGMENTED != 0
    }

    /// The 8-byte MAC field.
    #[must_use]
    pub fn mac(&self) -> [u8; 8] {
        self.raw[19..27].try_into().expect("8-byte field")
    }

    /// The MAC field reinterpreted as a trusted path id.
    #[must_use]
    pub fn trusted_path_id(&self) -> u64 {
        u64::from_be_bytes(self.mac())
    }

    /// Raw verb byte (verb id, cipher bits, compressed flag).
    #[must_use]
    pub fn verb_byte(&self) -> u8 {
        self.raw[27]
    }

    /// The cipher suite bits.
    #[must_use]
    pub fn cipher(&self) -> Option<CipherSuite> {
        CipherSuite::from_flags(self.raw[18])
    }
}

/// Zero-copy view of a fragment continuation header.
#[derive(Debug, Clone, Copy)]
pub struct FragmentHeader<'a> {
    raw: &'a [u8],
}

impl<'a> FragmentHeader<'a> {
    /// Lay the fragment view over `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data[FRAGMENT_INDICATOR_INDEX] != FRAGMENT_INDICATOR {
            return Err(ProtocolError::InvalidObject("missing fragment indicator"));
        }
        Ok(Self { raw: data })
    }

    /// The packet id shared with the head frame.
    #[must_use]
    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(self.raw[0..8].try_into().expect("8-byte field"))
    }

    /// Destination address.
    #[must_use]
    pub fn destination(&self) -> Address {
        Address::read_from(self.raw, 8).expect("bounds checked in parse")
    }

    /// Fragment index within the packet (low nibble of counts).
    #[must_use]
    pub fn fragment_no(&self) -> u8 {
        self.raw[14] & 0x0f
    }

    /// Declared total fragment count (high nibble of counts).
    #[must_use]
    pub fn total_fragments(&self) -> u8 {
        self.raw[14] >> 4
    }

    /// Hop count.
    #[must_use]
    pub fn hops(&self) -> u8 {
        self.raw[15] & FLAGS_HOPS_MASK
    }
}

/// Append a common packet header to `out`.
///
/// The MAC field is zeroed and the cipher bits in `flags` are left
/// clear; [`armor`] fills both.
pub fn write_header(
    out: &mut Vec<u8>,
    packet_id: u64,
    destination: Address,
    source: Address,
    flags: u8,
    verb: Verb,
) {
    out.extend_from_slice(&packet_id.to_be_bytes());
    out.extend_from_slice(&destination.to_bytes());
    out.extend_from_slice(&source.to_bytes());
    out.push(flags);
    out.extend_from_slice(&[0u8; 8]);
    out.push(verb as u8);
}

/// Write an InetAddress. `None` marshals as the nil family.
pub fn write_inet(out: &mut Vec<u8>, addr: Option<SocketAddr>) {
    match addr {
        None => out.push(0x00),
        Some(SocketAddr::V4(v4)) => {
            out.push(0x04);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            out.push(0x06);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

/// Read an InetAddress at `*cursor`, advancing it.
pub fn read_inet(data: &[u8], cursor: &mut usize) -> Result<Option<SocketAddr>, ProtocolError> {
    let at = *cursor;
    let family = *data.get(at).ok_or(ProtocolError::TooShort {
        expected: at + 1,
        actual: data.len(),
    })?;
    match family {
        0x00 => {
            *cursor = at + 1;
            Ok(None)
        }
        0x04 => {
            let b = data.get(at + 1..at + 7).ok_or(ProtocolError::TooShort {
                expected: at + 7,
                actual: data.len(),
            })?;
            let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
            let port = u16::from_be_bytes([b[4], b[5]]);
            *cursor = at + 7;
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        0x06 => {
            let b = data.get(at + 1..at + 19).ok_or(ProtocolError::TooShort {
                expected: at + 19,
                actual: data.len(),
            })?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[..16]);
            let port = u16::from_be_bytes([b[16], b[17]]);
            *cursor = at + 19;
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        other => Err(ProtocolError::InvalidAddressFamily(other)),
    }
}

/// Derive the per-packet Salsa20/12 key from a peer session key.
///
/// XORs the first 21 key bytes with the packet id, destination, source,
/// hop-masked flags and the raw packet size. Hops are masked off
/// because relays rewrite them in flight; folding in the size gives
/// each packet length its own key space.
#[must_use]
pub fn salsa2012_derive_key(key: &[u8; 48], header: &[u8], packet_size: usize) -> [u8; 48] {
    let mut out = *key;
    for i in 0..18 {
        out[i] ^= header[i];
    }
    out[18] ^= header[18] & !FLAGS_HOPS_MASK;
    out[19] ^= packet_size as u8;
    out[20] ^= (packet_size >> 8) as u8;
    out
}

/// Set up the per-packet cipher and produce the one-time MAC key.
///
/// One full keystream block is consumed for the MAC key, leaving the
/// returned cipher positioned at byte 64 where the payload stream
/// begins.
#[must_use]
pub fn packet_cipher(key: &[u8; 48], header: &[u8], packet_size: usize) -> (Salsa2012, [u8; 32]) {
    let per_packet = salsa2012_derive_key(key, header, packet_size);
    let salsa_key: [u8; 32] = per_packet[..32].try_into().expect("48 >= 32");
    let nonce: [u8; 8] = header[0..8].try_into().expect("8-byte packet id");
    let mut s20 = Salsa2012::new(&salsa_key, &nonce);
    let mut block = [0u8; 64];
    s20.keystream(&mut block);
    let mac_key: [u8; 32] = block[..32].try_into().expect("64 >= 32");
    (s20, mac_key)
}

/// Apply a cipher suite and MAC to an assembled outbound packet.
///
/// Sets the cipher bits in the flags byte, encrypts the section after
/// the MAC field for `POLY1305_SALSA2012`, and writes the truncated
/// Poly1305 tag into the header. The cipher bits go in before key
/// derivation; both ends fold the hop-masked flags into the per-packet
/// key. The `NONE` suite is armored by the send path writing a trusted
/// path id instead; it is not handled here.
pub fn armor(packet: &mut [u8], key: &[u8; 48], suite: CipherSuite) {
    debug_assert!(packet.len() >= MIN_PACKET_LENGTH);
    packet[18] = (packet[18] & !CIPHER_MASK) | suite.flags_bits();

    let (mut s20, mac_key) = {
        let (header, _) = packet.split_at(HEADER_SIZE);
        packet_cipher(key, header, packet.len())
    };

    if suite == CipherSuite::Poly1305Salsa2012 {
        let len = packet.len();
        s20.crypt_in_place(&mut packet[ENCRYPTED_SECTION_START..len]);
    }

    let tag = poly1305_tag(&mac_key, &packet[ENCRYPTED_SECTION_START..]);
    packet[19..27].copy_from_slice(&tag[..8]);
}

/// Verify and strip a cipher suite from a contiguous packet in place.
///
/// The inverse of [`armor`] for the two Poly1305 suites: checks the
/// header MAC and, under `POLY1305_SALSA2012`, decrypts the section
/// after the MAC field. Returns whether authentication succeeded; on
/// failure the packet contents are unchanged. The `NONE` suite carries
/// no cryptography and always fails here.
#[must_use]
pub fn dearmor(packet: &mut [u8], key: &[u8; 48]) -> bool {
    if packet.len() < MIN_PACKET_LENGTH {
        return false;
    }
    let suite = CipherSuite::from_flags(packet[18]);
    let (mut s20, mac_key) = {
        let (header, _) = packet.split_at(HEADER_SIZE);
        packet_cipher(key, header, packet.len())
    };
    let mac: [u8; 8] = packet[19..27].try_into().expect("8-byte field");
    let ok = weft_crypto::poly::poly1305_verify_prefix8(
        &mac_key,
        &packet[ENCRYPTED_SECTION_START..],
        &mac,
    );
    match suite {
        Some(CipherSuite::Poly1305None) => ok,
        Some(CipherSuite::Poly1305Salsa2012) => {
            if ok {
                let len = packet.len();
                s20.crypt_in_place(&mut packet[ENCRYPTED_SECTION_START..len]);
            }
            ok
        }
        _ => false,
    }
}

/// Produce a process-unique packet id.
///
/// Random 64-bit seed plus an atomic counter; ids never repeat within
/// a process lifetime and are unpredictable across restarts.
#[must_use]
pub fn next_packet_id() -> u64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| {
        let mut seed = [0u8; 8];
        getrandom::fill(&mut seed).expect("CSPRNG failure");
        AtomicU64::new(u64::from_be_bytes(seed))
    });
    counter.fetch_add(1, Ordering::Relaxed)
}
