//! Shared test doubles for the collaborator traits.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::BLOCK_SIZE;
use crate::handshake::{Handshake, HandshakeResult};
use crate::manager::PeerMgr;
use crate::peer::{PeerIo, PeerMsgs, Webseed};
use crate::requests::PeerKey;
use crate::session::{Session, Torrent};
use crate::types::{
    BlockIndex, BlockSpan, Direction, EncryptionMode, InfoHash, PeerId, PieceIndex, Priority,
    TorrentId,
};
use crate::wishlist::{Wishlist, WishlistMediator};

// --- torrent

pub(crate) struct MockTorrent {
    pub id: TorrentId,
    pub info_hash: InfoHash,
    pub piece_count: PieceIndex,
    pub blocks_per_piece: u64,
    pub peer_limit: AtomicUsize,
    pub priority: Mutex<Priority>,
    pub done: AtomicBool,
    pub running: AtomicBool,
    pub stopping: AtomicBool,
    pub private: AtomicBool,
    pub pex_allowed: AtomicBool,
    pub metainfo: AtomicBool,
    pub sequential: AtomicBool,
    pub start_date: AtomicU64,
    pub can_upload: AtomicBool,
    pub can_download: AtomicBool,
    pub upload_maxed: AtomicBool,
    pub left: AtomicU64,
    pub have_blocks: Mutex<HashSet<BlockIndex>>,
    pub have_pieces: Mutex<HashSet<PieceIndex>>,
    pub unwanted_pieces: Mutex<HashSet<PieceIndex>>,
    pub got_blocks: Mutex<Vec<BlockIndex>>,
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    pub webseeds: Mutex<Vec<String>>,
}

impl MockTorrent {
    pub fn new(id: u64, piece_count: PieceIndex, blocks_per_piece: u64) -> Self {
        Self {
            id: TorrentId(id),
            info_hash: InfoHash([id as u8; 20]),
            piece_count,
            blocks_per_piece,
            peer_limit: AtomicUsize::new(50),
            priority: Mutex::new(Priority::Normal),
            done: AtomicBool::new(false),
            running: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            private: AtomicBool::new(false),
            pex_allowed: AtomicBool::new(true),
            metainfo: AtomicBool::new(true),
            sequential: AtomicBool::new(false),
            start_date: AtomicU64::new(0),
            can_upload: AtomicBool::new(true),
            can_download: AtomicBool::new(true),
            upload_maxed: AtomicBool::new(false),
            left: AtomicU64::new(piece_count as u64 * blocks_per_piece * BLOCK_SIZE),
            have_blocks: Mutex::new(HashSet::new()),
            have_pieces: Mutex::new(HashSet::new()),
            unwanted_pieces: Mutex::new(HashSet::new()),
            got_blocks: Mutex::new(Vec::new()),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            webseeds: Mutex::new(Vec::new()),
        }
    }

    pub fn new_shared(id: u64, piece_count: PieceIndex, blocks_per_piece: u64) -> Arc<Self> {
        Arc::new(Self::new(id, piece_count, blocks_per_piece))
    }
}

impl Torrent for MockTorrent {
    fn id(&self) -> TorrentId {
        self.id
    }

    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn obfuscated_hash(&self) -> InfoHash {
        let mut bytes = self.info_hash.0;
        bytes.reverse();
        InfoHash(bytes)
    }

    fn client_peer_id(&self) -> PeerId {
        PeerId(*b"-RS0001-000000000000")
    }

    fn peer_limit(&self) -> usize {
        self.peer_limit.load(Ordering::SeqCst)
    }

    fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn is_private(&self) -> bool {
        self.private.load(Ordering::SeqCst)
    }

    fn allows_pex(&self) -> bool {
        self.pex_allowed.load(Ordering::SeqCst)
    }

    fn has_metainfo(&self) -> bool {
        self.metainfo.load(Ordering::SeqCst)
    }

    fn is_sequential_download(&self) -> bool {
        self.sequential.load(Ordering::SeqCst)
    }

    fn start_date(&self) -> u64 {
        self.start_date.load(Ordering::SeqCst)
    }

    fn client_can_upload(&self) -> bool {
        self.can_upload.load(Ordering::SeqCst)
    }

    fn client_can_download(&self) -> bool {
        self.can_download.load(Ordering::SeqCst)
    }

    fn is_upload_maxed_out(&self) -> bool {
        self.upload_maxed.load(Ordering::SeqCst)
    }

    fn piece_count(&self) -> PieceIndex {
        self.piece_count
    }

    fn piece_size(&self, _piece: PieceIndex) -> u64 {
        self.blocks_per_piece * BLOCK_SIZE
    }

    fn piece_is_wanted(&self, piece: PieceIndex) -> bool {
        !self.unwanted_pieces.lock().contains(&piece)
    }

    fn piece_priority(&self, _piece: PieceIndex) -> Priority {
        Priority::Normal
    }

    fn has_piece(&self, piece: PieceIndex) -> bool {
        self.have_pieces.lock().contains(&piece)
    }

    fn left_until_done(&self) -> u64 {
        self.left.load(Ordering::SeqCst)
    }

    fn total_size(&self) -> u64 {
        self.piece_count as u64 * self.blocks_per_piece * BLOCK_SIZE
    }

    fn count_missing_blocks_in_piece(&self, piece: PieceIndex) -> usize {
        let span = self.block_span_for_piece(piece);
        let have = self.have_blocks.lock();
        (span.begin..span.end).filter(|b| !have.contains(b)).count()
    }

    fn count_missing_bytes_in_piece(&self, piece: PieceIndex) -> u64 {
        self.count_missing_blocks_in_piece(piece) as u64 * BLOCK_SIZE
    }

    fn block_span_for_piece(&self, piece: PieceIndex) -> BlockSpan {
        let begin = piece as u64 * self.blocks_per_piece;
        BlockSpan::new(begin, begin + self.blocks_per_piece)
    }

    fn block_of(&self, piece: PieceIndex, offset: u32) -> BlockIndex {
        piece as u64 * self.blocks_per_piece + offset as u64 / BLOCK_SIZE
    }

    fn has_block(&self, block: BlockIndex) -> bool {
        self.have_blocks.lock().contains(&block)
    }

    fn got_block(&self, block: BlockIndex) {
        self.have_blocks.lock().insert(block);
        self.got_blocks.lock().push(block);
    }

    fn add_uploaded(&self, len: u64) {
        self.uploaded.fetch_add(len, Ordering::SeqCst);
    }

    fn add_downloaded(&self, len: u64) {
        self.downloaded.fetch_add(len, Ordering::SeqCst);
    }

    fn webseed_urls(&self) -> Vec<String> {
        self.webseeds.lock().clone()
    }
}

// --- peer io

pub(crate) struct MockPeerIo {
    pub addr: SocketAddr,
    pub incoming: bool,
    pub utp: bool,
    pub encrypted: bool,
    pub hash: InfoHash,
    pub closed: AtomicBool,
    pub joined: Mutex<Option<TorrentId>>,
}

impl MockPeerIo {
    pub fn incoming(addr: SocketAddr, hash: InfoHash) -> Arc<Self> {
        Arc::new(Self {
            addr,
            incoming: true,
            utp: false,
            encrypted: false,
            hash,
            closed: AtomicBool::new(false),
            joined: Mutex::new(None),
        })
    }

    pub fn outgoing(addr: SocketAddr, hash: InfoHash, utp: bool) -> Arc<Self> {
        Arc::new(Self {
            addr,
            incoming: false,
            utp,
            encrypted: false,
            hash,
            closed: AtomicBool::new(false),
            joined: Mutex::new(None),
        })
    }
}

impl PeerIo for MockPeerIo {
    fn socket_address(&self) -> SocketAddr {
        self.addr
    }

    fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn is_utp(&self) -> bool {
        self.utp
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn torrent_hash(&self) -> InfoHash {
        self.hash
    }

    fn join_torrent_bandwidth(&self, tor: TorrentId) {
        *self.joined.lock() = Some(tor);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// --- wire driver

#[derive(Default)]
pub(crate) struct MockPeerState {
    pub seed: AtomicBool,
    pub pieces: Mutex<HashSet<PieceIndex>>,
    pub speed_up: AtomicU32,
    pub speed_down: AtomicU32,
    pub transferring_up: AtomicBool,
    pub transferring_down: AtomicBool,
    pub peer_interested: AtomicBool,
    pub peer_choked: AtomicBool,
    pub client_choked: AtomicBool,
    pub client_interested: AtomicBool,
    pub cancels: Mutex<Vec<BlockIndex>>,
    pub pulses: AtomicUsize,
}

pub(crate) struct MockPeerMsgs {
    pub addr: SocketAddr,
    pub incoming: bool,
    pub utp: bool,
    pub encrypted: bool,
    pub state: Arc<MockPeerState>,
}

impl PeerMsgs for MockPeerMsgs {
    fn socket_address(&self) -> SocketAddr {
        self.addr
    }

    fn is_incoming_connection(&self) -> bool {
        self.incoming
    }

    fn is_utp_connection(&self) -> bool {
        self.utp
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn user_agent(&self) -> Option<String> {
        None
    }

    fn is_seed(&self) -> bool {
        self.state.seed.load(Ordering::SeqCst)
    }

    fn percent_done(&self) -> f32 {
        if self.is_seed() {
            1.0
        } else {
            0.0
        }
    }

    fn has_piece(&self, piece: PieceIndex) -> bool {
        self.is_seed() || self.state.pieces.lock().contains(&piece)
    }

    fn piece_speed_bps(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Up => self.state.speed_up.load(Ordering::SeqCst),
            Direction::Down => self.state.speed_down.load(Ordering::SeqCst),
        }
    }

    fn is_transferring_pieces(&self, dir: Direction) -> bool {
        match dir {
            Direction::Up => self.state.transferring_up.load(Ordering::SeqCst),
            Direction::Down => self.state.transferring_down.load(Ordering::SeqCst),
        }
    }

    fn active_req_count(&self, _dir: Direction) -> usize {
        0
    }

    fn peer_is_choked(&self) -> bool {
        self.state.peer_choked.load(Ordering::SeqCst)
    }

    fn peer_is_interested(&self) -> bool {
        self.state.peer_interested.load(Ordering::SeqCst)
    }

    fn client_is_choked(&self) -> bool {
        self.state.client_choked.load(Ordering::SeqCst)
    }

    fn client_is_interested(&self) -> bool {
        self.state.client_interested.load(Ordering::SeqCst)
    }

    fn set_choke(&mut self, choked: bool) {
        self.state.peer_choked.store(choked, Ordering::SeqCst);
    }

    fn set_interested(&mut self, interested: bool) {
        self.state.client_interested.store(interested, Ordering::SeqCst);
    }

    fn cancel_block_request(&mut self, block: BlockIndex) {
        self.state.cancels.lock().push(block);
    }

    fn pulse(&mut self) {
        self.state.pulses.fetch_add(1, Ordering::SeqCst);
    }

    fn on_piece_completed(&mut self, _piece: PieceIndex) {}

    fn on_torrent_got_metainfo(&mut self) {}
}

// --- webseed

#[derive(Default)]
pub(crate) struct MockWebseed {
    pub transferring: AtomicBool,
}

impl Webseed for MockWebseed {
    fn is_transferring_pieces(&self, _dir: Direction) -> bool {
        self.transferring.load(Ordering::SeqCst)
    }
}

// --- handshake

pub(crate) struct MockHandshake;

impl Handshake for MockHandshake {}

// --- session

pub(crate) struct MockSession {
    pub peer_limit: AtomicUsize,
    pub upload_slots: AtomicUsize,
    pub tcp: AtomicBool,
    pub utp: AtomicBool,
    pub dht: AtomicBool,
    pub blocked: Mutex<HashSet<IpAddr>>,
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    pub bandwidth_pulses: AtomicUsize,
    pub dialed: Mutex<Vec<(SocketAddr, bool)>>,
    pub fail_dial: Mutex<HashSet<SocketAddr>>,
    pub handshakes_started: AtomicUsize,
    pub msgs: Mutex<HashMap<(TorrentId, PeerKey), Arc<MockPeerState>>>,
    pub webseeds: Mutex<HashMap<(TorrentId, PeerKey), Arc<MockWebseed>>>,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer_limit: AtomicUsize::new(200),
            upload_slots: AtomicUsize::new(4),
            tcp: AtomicBool::new(true),
            utp: AtomicBool::new(true),
            dht: AtomicBool::new(true),
            blocked: Mutex::new(HashSet::new()),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            bandwidth_pulses: AtomicUsize::new(0),
            dialed: Mutex::new(Vec::new()),
            fail_dial: Mutex::new(HashSet::new()),
            handshakes_started: AtomicUsize::new(0),
            msgs: Mutex::new(HashMap::new()),
            webseeds: Mutex::new(HashMap::new()),
        })
    }

    /// The shared state handle for a peer admitted through this session.
    pub fn peer_state(&self, tor: TorrentId, key: PeerKey) -> Arc<MockPeerState> {
        self.msgs.lock().get(&(tor, key)).expect("peer state").clone()
    }
}

impl Session for MockSession {
    fn peer_limit(&self) -> usize {
        self.peer_limit.load(Ordering::SeqCst)
    }

    fn upload_slots_per_torrent(&self) -> usize {
        self.upload_slots.load(Ordering::SeqCst)
    }

    fn encryption_mode(&self) -> EncryptionMode {
        EncryptionMode::ClearPreferred
    }

    fn allows_tcp(&self) -> bool {
        self.tcp.load(Ordering::SeqCst)
    }

    fn allows_utp(&self) -> bool {
        self.utp.load(Ordering::SeqCst)
    }

    fn allows_dht(&self) -> bool {
        self.dht.load(Ordering::SeqCst)
    }

    fn address_is_blocked(&self, addr: IpAddr) -> bool {
        self.blocked.lock().contains(&addr)
    }

    fn add_uploaded(&self, len: u64) {
        self.uploaded.fetch_add(len, Ordering::SeqCst);
    }

    fn add_downloaded(&self, len: u64) {
        self.downloaded.fetch_add(len, Ordering::SeqCst);
    }

    fn allocate_bandwidth(&self, _msec: u64) {
        self.bandwidth_pulses.fetch_add(1, Ordering::SeqCst);
    }

    fn new_outgoing_io(
        &self,
        addr: SocketAddr,
        info_hash: InfoHash,
        _client_is_seed: bool,
        utp: bool,
    ) -> Option<Arc<dyn PeerIo>> {
        self.dialed.lock().push((addr, utp));
        if self.fail_dial.lock().contains(&addr) {
            return None;
        }
        Some(MockPeerIo::outgoing(addr, info_hash, utp))
    }

    fn start_handshake(
        &self,
        _io: Arc<dyn PeerIo>,
        _mode: EncryptionMode,
    ) -> Box<dyn Handshake> {
        self.handshakes_started.fetch_add(1, Ordering::SeqCst);
        Box::new(MockHandshake)
    }

    fn new_peer_msgs(
        &self,
        tor: TorrentId,
        key: PeerKey,
        io: Arc<dyn PeerIo>,
        _peer_id: Option<PeerId>,
    ) -> Box<dyn PeerMsgs> {
        let state = Arc::new(MockPeerState::default());
        state.peer_choked.store(true, Ordering::SeqCst);
        state.client_choked.store(true, Ordering::SeqCst);
        self.msgs.lock().insert((tor, key), state.clone());
        Box::new(MockPeerMsgs {
            addr: io.socket_address(),
            incoming: io.is_incoming(),
            utp: io.is_utp(),
            encrypted: io.is_encrypted(),
            state,
        })
    }

    fn new_webseed(&self, tor: TorrentId, key: PeerKey, _url: &str) -> Box<dyn Webseed> {
        let ws = Arc::new(MockWebseed::default());
        self.webseeds.lock().insert((tor, key), ws.clone());
        Box::new(SharedWebseed(ws))
    }
}

struct SharedWebseed(Arc<MockWebseed>);

impl Webseed for SharedWebseed {
    fn is_transferring_pieces(&self, dir: Direction) -> bool {
        self.0.is_transferring_pieces(dir)
    }
}

// --- wishlist

/// Walks pieces in order, handing out single-block spans that the
/// mediator permits. Duplicate requests (blocks already requested from
/// other peers) are only handed out in endgame.
pub(crate) struct FifoWishlist;

impl Wishlist for FifoWishlist {
    fn next(&self, mediator: &dyn WishlistMediator, numwant: usize) -> Vec<BlockSpan> {
        let mut out = Vec::new();
        for piece in 0..mediator.piece_count() {
            if out.len() >= numwant {
                break;
            }
            if !mediator.client_can_request_piece(piece) {
                continue;
            }
            let span = mediator.block_span(piece);
            for block in span.begin..span.end {
                if out.len() >= numwant {
                    break;
                }
                if !mediator.client_can_request_block(block) {
                    continue;
                }
                if !mediator.is_endgame() && mediator.count_active_requests(block) > 0 {
                    continue;
                }
                out.push(BlockSpan::new(block, block + 1));
            }
        }
        out
    }
}

// --- harness helpers

pub(crate) fn make_mgr(session: Arc<MockSession>) -> Arc<PeerMgr> {
    PeerMgr::new(session, Box::new(FifoWishlist))
}

/// Completes a successful incoming handshake from `addr`.
pub(crate) fn admit_incoming(mgr: &PeerMgr, addr: SocketAddr, hash: InfoHash) -> bool {
    mgr.handshake_done(HandshakeResult {
        io: MockPeerIo::incoming(addr, hash),
        peer_id: Some(PeerId([7u8; 20])),
        is_connected: true,
        read_anything_from_peer: true,
    })
}
