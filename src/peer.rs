//! Connected-peer interfaces and per-peer swarm state.
//!
//! The wire protocol driver ([`PeerMsgs`]) and the byte-level transport
//! ([`PeerIo`]) are external collaborators; the swarm commands them and
//! receives [`PeerEvent`]s back. What the swarm itself remembers about a
//! live connection (blame, strikes, purge flag, transfer counters) lives
//! in [`ConnectedPeer`].

use std::net::SocketAddr;

use crate::bitfield::Bitfield;
use crate::constants::TRANSFER_HISTORY_SECS;
use crate::history::TransferHistory;
use crate::peer_info::{PeerSource, SharedPeerInfo};
use crate::requests::PeerKey;
use crate::types::{BlockIndex, Direction, InfoHash, PieceIndex, TorrentId};

/// A byte-level connection to one peer.
pub trait PeerIo: Send + Sync {
    /// The remote socket address.
    fn socket_address(&self) -> SocketAddr;

    fn is_incoming(&self) -> bool;

    fn is_utp(&self) -> bool;

    fn is_encrypted(&self) -> bool;

    /// The torrent this connection settled on; the zero hash until the
    /// handshake learns it.
    fn torrent_hash(&self) -> InfoHash;

    /// Re-parents the connection under the torrent's bandwidth limiter.
    fn join_torrent_bandwidth(&self, tor: TorrentId);

    fn close(&self);
}

/// Protocol error classes a peer event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// A request or piece referenced data out of range.
    OutOfRange,
    /// A message exceeded the allowed size.
    MessageSize,
    /// The transport is gone.
    NotConnected,
    /// Anything else; logged and otherwise ignored.
    Other,
}

impl WireError {
    /// True for violations that warrant dropping the peer.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            WireError::OutOfRange | WireError::MessageSize | WireError::NotConnected
        )
    }
}

/// Events delivered from a wire driver or webseed to the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// We uploaded piece data to the peer.
    ClientSentPieceData { length: u32 },
    /// We downloaded piece data from the peer.
    ClientGotPieceData { length: u32 },
    /// The peer choked us.
    ClientGotChoke,
    /// The peer rejected one of our requests (fast extension).
    ClientGotRej { piece: PieceIndex, offset: u32 },
    /// A requested block arrived.
    ClientGotBlock { piece: PieceIndex, offset: u32 },
    /// The peer announced its listening port.
    ClientGotPort { port: u16 },
    ClientGotHave { piece: PieceIndex },
    ClientGotBitfield,
    ClientGotHaveAll,
    ClientGotHaveNone,
    ClientGotSuggest { piece: PieceIndex },
    ClientGotAllowedFast { piece: PieceIndex },
    /// The wire driver hit an error.
    Error { error: WireError },
}

/// The wire protocol driver for one connected peer.
pub trait PeerMsgs: Send {
    fn socket_address(&self) -> SocketAddr;

    fn is_incoming_connection(&self) -> bool;

    fn is_utp_connection(&self) -> bool;

    fn is_encrypted(&self) -> bool;

    fn user_agent(&self) -> Option<String>;

    /// True if the peer has every piece (or is a partial seed with
    /// everything we still want).
    fn is_seed(&self) -> bool;

    fn percent_done(&self) -> f32;

    fn has_piece(&self, piece: PieceIndex) -> bool;

    /// Current piece-transfer speed in the given direction.
    fn piece_speed_bps(&self, dir: Direction) -> u32;

    /// True if piece data is moving in the given direction.
    fn is_transferring_pieces(&self, dir: Direction) -> bool;

    /// Outstanding request count in the given direction.
    fn active_req_count(&self, dir: Direction) -> usize;

    fn peer_is_choked(&self) -> bool;

    fn peer_is_interested(&self) -> bool;

    fn client_is_choked(&self) -> bool;

    fn client_is_interested(&self) -> bool;

    fn set_choke(&mut self, choked: bool);

    fn set_interested(&mut self, interested: bool);

    /// Sends a CANCEL for an outstanding request.
    fn cancel_block_request(&mut self, block: BlockIndex);

    /// Drives queued I/O; called once per bandwidth pulse.
    fn pulse(&mut self);

    /// We completed and verified a piece; announce it to the peer.
    fn on_piece_completed(&mut self, piece: PieceIndex);

    /// Metainfo arrived; progress fields may need refreshing.
    fn on_torrent_got_metainfo(&mut self);
}

/// An HTTP source pseudo-peer.
pub trait Webseed: Send {
    fn is_transferring_pieces(&self, dir: Direction) -> bool;
}

/// A connected peer as the swarm sees it.
pub struct ConnectedPeer {
    pub(crate) key: PeerKey,
    pub(crate) msgs: Box<dyn PeerMsgs>,
    pub(crate) info: SharedPeerInfo,
    /// Set when the peer should be dropped at the next reap.
    pub(crate) do_purge: bool,
    pub(crate) strikes: u8,
    /// Pieces this peer has contributed blocks to.
    pub(crate) blame: Bitfield,
    pub(crate) blocks_sent_to_peer: TransferHistory,
    pub(crate) blocks_sent_to_client: TransferHistory,
    pub(crate) cancels_sent_to_peer: TransferHistory,
    pub(crate) cancels_sent_to_client: TransferHistory,
}

impl ConnectedPeer {
    pub(crate) fn new(
        key: PeerKey,
        msgs: Box<dyn PeerMsgs>,
        info: SharedPeerInfo,
        piece_count: PieceIndex,
    ) -> Self {
        Self {
            key,
            msgs,
            info,
            do_purge: false,
            strikes: 0,
            blame: Bitfield::new(piece_count as usize),
            blocks_sent_to_peer: TransferHistory::new(),
            blocks_sent_to_client: TransferHistory::new(),
            cancels_sent_to_peer: TransferHistory::new(),
            cancels_sent_to_client: TransferHistory::new(),
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn do_purge(&self) -> bool {
        self.do_purge
    }

    pub fn display_name(&self) -> String {
        self.info.lock().display_name()
    }

    /// Key for most-active ordering at eviction time: peers flagged for
    /// purge go first, then the longest-idle.
    pub(crate) fn activity_key(&self) -> (bool, std::cmp::Reverse<u64>) {
        (
            self.do_purge,
            std::cmp::Reverse(self.info.lock().latest_piece_data_time()),
        )
    }
}

/// Point-in-time snapshot of one connected peer, for UIs and RPC.
#[derive(Debug, Clone)]
pub struct PeerStat {
    pub addr: SocketAddr,
    pub client: Option<String>,
    pub from: PeerSource,
    pub progress: f32,
    pub is_utp: bool,
    pub is_encrypted: bool,
    pub is_incoming: bool,
    pub is_seed: bool,
    pub rate_to_peer_bps: u32,
    pub rate_to_client_bps: u32,
    pub peer_is_choked: bool,
    pub peer_is_interested: bool,
    pub client_is_choked: bool,
    pub client_is_interested: bool,
    pub is_downloading_from: bool,
    pub is_uploading_to: bool,
    pub blocks_to_peer: u32,
    pub blocks_to_client: u32,
    pub cancels_to_peer: u32,
    pub cancels_to_client: u32,
    pub active_reqs_to_peer: usize,
    pub active_reqs_to_client: usize,
    /// Compact state summary; see [`flag_string`].
    pub flags: String,
}

/// Builds the classic single-letter peer flag summary:
///
/// `T` µTP, `O` optimistic unchoke, `D`/`d` downloading / interested but
/// choked, `U`/`u` uploading / peer interested but choked, `K` unchoked
/// us though we are not interested, `?` we unchoked an uninterested
/// peer, `E` encrypted, `H` from DHT, `X` from PEX, `I` incoming.
pub fn flag_string(stat: &PeerStat, is_optimistic: bool) -> String {
    let mut flags = String::new();

    if stat.is_utp {
        flags.push('T');
    }
    if is_optimistic {
        flags.push('O');
    }
    if stat.is_downloading_from {
        flags.push('D');
    } else if stat.client_is_interested {
        flags.push('d');
    }
    if stat.is_uploading_to {
        flags.push('U');
    } else if stat.peer_is_interested {
        flags.push('u');
    }
    if !stat.client_is_choked && !stat.client_is_interested {
        flags.push('K');
    }
    if !stat.peer_is_choked && !stat.peer_is_interested {
        flags.push('?');
    }
    if stat.is_encrypted {
        flags.push('E');
    }
    match stat.from {
        PeerSource::Dht => flags.push('H'),
        PeerSource::Pex => flags.push('X'),
        _ => {}
    }
    if stat.is_incoming {
        flags.push('I');
    }

    flags
}

/// Snapshot helper used by the swarm.
pub(crate) fn peer_stat(peer: &ConnectedPeer, now: u64, is_optimistic: bool) -> PeerStat {
    let msgs = &peer.msgs;
    let info = peer.info.lock();

    let mut stat = PeerStat {
        addr: msgs.socket_address(),
        client: msgs.user_agent(),
        from: info.from_first(),
        progress: msgs.percent_done(),
        is_utp: msgs.is_utp_connection(),
        is_encrypted: msgs.is_encrypted(),
        is_incoming: msgs.is_incoming_connection(),
        is_seed: msgs.is_seed(),
        rate_to_peer_bps: msgs.piece_speed_bps(Direction::Up),
        rate_to_client_bps: msgs.piece_speed_bps(Direction::Down),
        peer_is_choked: msgs.peer_is_choked(),
        peer_is_interested: msgs.peer_is_interested(),
        client_is_choked: msgs.client_is_choked(),
        client_is_interested: msgs.client_is_interested(),
        is_downloading_from: msgs.is_transferring_pieces(Direction::Down),
        is_uploading_to: msgs.is_transferring_pieces(Direction::Up),
        blocks_to_peer: peer.blocks_sent_to_peer.count(now, TRANSFER_HISTORY_SECS),
        blocks_to_client: peer.blocks_sent_to_client.count(now, TRANSFER_HISTORY_SECS),
        cancels_to_peer: peer.cancels_sent_to_peer.count(now, TRANSFER_HISTORY_SECS),
        cancels_to_client: peer.cancels_sent_to_client.count(now, TRANSFER_HISTORY_SECS),
        active_reqs_to_peer: msgs.active_req_count(Direction::Up),
        active_reqs_to_client: msgs.active_req_count(Direction::Down),
        flags: String::new(),
    };
    stat.flags = flag_string(&stat, is_optimistic);
    stat
}

pub(crate) struct WebseedEntry {
    pub(crate) key: PeerKey,
    pub(crate) webseed: Box<dyn Webseed>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat() -> PeerStat {
        PeerStat {
            addr: "1.2.3.4:6881".parse().unwrap(),
            client: None,
            from: PeerSource::Tracker,
            progress: 0.5,
            is_utp: false,
            is_encrypted: false,
            is_incoming: false,
            is_seed: false,
            rate_to_peer_bps: 0,
            rate_to_client_bps: 0,
            peer_is_choked: true,
            peer_is_interested: false,
            client_is_choked: true,
            client_is_interested: false,
            is_downloading_from: false,
            is_uploading_to: false,
            blocks_to_peer: 0,
            blocks_to_client: 0,
            cancels_to_peer: 0,
            cancels_to_client: 0,
            active_reqs_to_peer: 0,
            active_reqs_to_client: 0,
            flags: String::new(),
        }
    }

    #[test]
    fn test_flag_string_transfers() {
        let mut s = stat();
        s.is_utp = true;
        s.is_downloading_from = true;
        s.peer_is_interested = true;
        assert_eq!(flag_string(&s, false), "TDu");
    }

    #[test]
    fn test_flag_string_optimistic_and_source() {
        let mut s = stat();
        s.from = PeerSource::Pex;
        s.is_incoming = true;
        s.client_is_interested = true;
        assert_eq!(flag_string(&s, true), "OdXI");
    }

    #[test]
    fn test_flag_string_unchoked_without_interest() {
        let mut s = stat();
        s.client_is_choked = false; // they unchoked us, we don't care
        s.peer_is_choked = false; // we unchoked them, they don't care
        s.is_encrypted = true;
        s.from = PeerSource::Dht;
        assert_eq!(flag_string(&s, false), "K?EH");
    }

    #[test]
    fn test_fatal_wire_errors() {
        assert!(WireError::OutOfRange.is_fatal());
        assert!(WireError::MessageSize.is_fatal());
        assert!(WireError::NotConnected.is_fatal());
        assert!(!WireError::Other.is_fatal());
    }
}
