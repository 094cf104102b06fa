//! # weft-core
//!
//! Wire protocol and VL1 ingress pipeline for the weft overlay
//! transport.
//!
//! VL1 is the peer-to-peer datagram layer of the overlay: it receives
//! opaque datagrams, reassembles fragmented packets, authenticates and
//! decrypts them under one of several cipher suites, decompresses the
//! payload, and dispatches transport verbs. Virtual-Ethernet traffic
//! (VL2) and forwarding policy live behind collaborator traits.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        VL1 ingress                           │
//! │  defragment → cipher demux → verify/decrypt → decompress →   │
//! │  verb dispatch (HELLO here, Ethernet verbs to VL2)           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Topology · Tracer · SelfAwareness · Relay · DatagramSender  │
//! │            (collaborator traits, injected via Context)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod address;
pub mod buf;
pub mod defrag;
pub mod dictionary;
pub mod error;
pub mod hello;
pub mod identity;
pub mod path;
pub mod peer;
pub mod protocol;
pub mod runtime;
pub mod vl1;
pub mod whois;

pub use address::Address;
pub use buf::{BUF_SIZE, Buf, BufPool, Slice, SliceVector};
pub use defrag::{AssembleResult, Defragmenter};
pub use dictionary::Dictionary;
pub use error::ProtocolError;
pub use hello::{OkHello, build_hello, read_ok_hello};
pub use identity::Identity;
pub use path::Path;
pub use peer::{Peer, RemoteVersion};
pub use protocol::{CipherSuite, Verb};
pub use runtime::{Context, PacketDropReason};
pub use vl1::Vl1;
