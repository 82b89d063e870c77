//! rswarm - BitTorrent swarm and peer management
//!
//! This library implements the peer-management core of a BitTorrent
//! client: per-torrent peer pools and reputation, handshake admission,
//! choke scheduling, rate-limited outbound dialing, and block-request
//! bookkeeping.
//!
//! The wire protocol codec, handshake cryptography, socket I/O,
//! bandwidth allocation, and block prioritization are consumed through
//! traits so the core stays testable and transport-agnostic.
//!
//! # Modules
//!
//! - [`manager`] - The session-level [`PeerMgr`] and its periodic pulses
//! - [`swarm`] - Per-torrent pools, connected peers, and statistics
//! - [`peer`] - Connected-peer interfaces and peer events
//! - [`peer_info`] - Durable per-address reputation records
//! - [`requests`] - Outstanding block-request bookkeeping
//! - [`pex`] - Peer Exchange entries and the compact wire format
//! - [`session`] - Host-side `Session`/`Torrent` collaborator traits
//! - [`handshake`] - Handshake admission interfaces
//! - [`wishlist`] - Block-request prioritization seam

pub mod bitfield;
pub mod constants;
pub mod error;
pub mod handshake;
pub mod history;
pub mod manager;
pub mod notify;
pub mod peer;
pub mod peer_info;
pub mod pex;
pub mod requests;
pub mod session;
pub mod swarm;
pub mod types;
pub mod wishlist;

mod candidates;
mod rechoke;

#[cfg(test)]
mod testutil;

pub use bitfield::Bitfield;
pub use error::{Error, Result};
pub use handshake::{Handshake, HandshakeMediator, HandshakeResult, TorrentInfo};
pub use manager::{PeerListMode, PeerMgr, PulseDriver};
pub use notify::{ListenerId, Listeners};
pub use peer::{PeerEvent, PeerIo, PeerMsgs, PeerStat, Webseed, WireError};
pub use peer_info::{PeerInfo, PeerSource, SharedPeerInfo};
pub use pex::{Pex, PexFlags};
pub use requests::{ActiveRequests, PeerKey};
pub use session::{Session, Torrent};
pub use swarm::{SwarmEvent, SwarmStats};
pub use types::{
    AddressFamily, BlockIndex, BlockSpan, Direction, EncryptionMode, InfoHash, PeerId, PieceIndex,
    Priority, TorrentId,
};
pub use wishlist::{Wishlist, WishlistMediator};
