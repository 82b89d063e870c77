//! Host-side collaborator interfaces.
//!
//! The peer manager runs inside a client that owns the torrents, the
//! session settings, the bandwidth allocator, and the socket layer.
//! Everything it needs from that host comes through the [`Session`] and
//! [`Torrent`] traits; everything it creates on the host's behalf goes
//! through the factory methods on [`Session`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::handshake::Handshake;
use crate::peer::{PeerIo, PeerMsgs, Webseed};
use crate::requests::PeerKey;
use crate::types::{
    BlockIndex, BlockSpan, EncryptionMode, InfoHash, PeerId, PieceIndex, Priority, TorrentId,
};

/// A torrent as the peer manager sees it.
pub trait Torrent: Send + Sync {
    fn id(&self) -> TorrentId;

    fn info_hash(&self) -> InfoHash;

    /// SHA-1 of the info hash, used by obfuscated handshakes.
    fn obfuscated_hash(&self) -> InfoHash;

    fn client_peer_id(&self) -> PeerId;

    /// Maximum connected peers for this swarm.
    fn peer_limit(&self) -> usize;

    fn priority(&self) -> Priority;

    fn is_done(&self) -> bool;

    fn is_running(&self) -> bool;

    fn is_stopping(&self) -> bool;

    fn is_private(&self) -> bool;

    fn allows_pex(&self) -> bool;

    fn has_metainfo(&self) -> bool;

    fn is_sequential_download(&self) -> bool;

    /// When the torrent was (last) started, in Unix seconds.
    fn start_date(&self) -> u64;

    fn client_can_upload(&self) -> bool;

    fn client_can_download(&self) -> bool;

    /// True if the torrent's upstream bandwidth is saturated.
    fn is_upload_maxed_out(&self) -> bool;

    fn piece_count(&self) -> PieceIndex;

    fn piece_size(&self, piece: PieceIndex) -> u64;

    fn piece_is_wanted(&self, piece: PieceIndex) -> bool;

    fn piece_priority(&self, piece: PieceIndex) -> Priority;

    fn has_piece(&self, piece: PieceIndex) -> bool;

    fn left_until_done(&self) -> u64;

    fn total_size(&self) -> u64;

    fn count_missing_blocks_in_piece(&self, piece: PieceIndex) -> usize;

    fn count_missing_bytes_in_piece(&self, piece: PieceIndex) -> u64;

    fn block_span_for_piece(&self, piece: PieceIndex) -> BlockSpan;

    /// Maps a `(piece, byte offset)` pair to its block index.
    fn block_of(&self, piece: PieceIndex, offset: u32) -> BlockIndex;

    fn has_block(&self, block: BlockIndex) -> bool;

    /// Delivers a completed block upward.
    fn got_block(&self, block: BlockIndex);

    /// Credits uploaded payload to the torrent's counters.
    fn add_uploaded(&self, len: u64);

    /// Credits downloaded payload to the torrent's counters.
    fn add_downloaded(&self, len: u64);

    fn webseed_urls(&self) -> Vec<String>;
}

/// Session-wide settings, accounting, and factories.
pub trait Session: Send + Sync {
    /// Maximum connected peers across all swarms.
    fn peer_limit(&self) -> usize;

    fn upload_slots_per_torrent(&self) -> usize;

    fn encryption_mode(&self) -> EncryptionMode;

    fn allows_tcp(&self) -> bool;

    fn allows_utp(&self) -> bool;

    fn allows_dht(&self) -> bool;

    fn address_is_blocked(&self, addr: IpAddr) -> bool;

    /// Credits uploaded payload to the session totals.
    fn add_uploaded(&self, len: u64);

    /// Credits downloaded payload to the session totals.
    fn add_downloaded(&self, len: u64);

    /// Gives the bandwidth allocator one pulse worth of budget.
    fn allocate_bandwidth(&self, msec: u64);

    /// Opens an outbound transport toward `addr`. Returns `None` when no
    /// socket could be constructed.
    fn new_outgoing_io(
        &self,
        addr: SocketAddr,
        info_hash: InfoHash,
        client_is_seed: bool,
        utp: bool,
    ) -> Option<Arc<dyn PeerIo>>;

    /// Begins a handshake on `io`; the host reports completion through
    /// `PeerMgr::handshake_done`.
    fn start_handshake(&self, io: Arc<dyn PeerIo>, mode: EncryptionMode) -> Box<dyn Handshake>;

    /// Builds the wire driver for an admitted peer. Events for it are
    /// delivered to `PeerMgr::peer_event` under `(tor, key)`.
    fn new_peer_msgs(
        &self,
        tor: TorrentId,
        key: PeerKey,
        io: Arc<dyn PeerIo>,
        peer_id: Option<PeerId>,
    ) -> Box<dyn PeerMsgs>;

    /// Builds a webseed downloader. Events for it are delivered to
    /// `PeerMgr::webseed_event` under `(tor, key)`.
    fn new_webseed(&self, tor: TorrentId, key: PeerKey, url: &str) -> Box<dyn Webseed>;
}
