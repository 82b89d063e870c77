//! The session-level peer manager.
//!
//! [`PeerMgr`] owns one [`Swarm`] per registered torrent and drives the
//! three periodic pulses over them: the bandwidth pulse (500 ms) pumps
//! peers and runs the reconnect/reap pass, the rechoke pulse (10 s)
//! recomputes choke state, and the refill upkeep pulse (10 s) cancels
//! timed-out block requests.
//!
//! All state lives behind a single session-wide lock; every public entry
//! point and timer callback takes it first, so the manager is logically
//! single-threaded over the shared state graph.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::candidates;
use crate::constants::{
    BANDWIDTH_PERIOD, INCOMING_RESERVE_RATIO, MAX_CONNECTIONS_PER_PULSE, MAX_UPLOAD_IDLE_SECS,
    MIN_UPLOAD_IDLE_SECS, RECHOKE_PERIOD, RECHOKE_SOON_PERIOD, REFILL_UPKEEP_PERIOD,
    SEED_IDLE_SECS,
};
use crate::error::{Error, Result};
use crate::handshake::{HandshakeMediator, HandshakeResult, TorrentInfo};
use crate::notify::ListenerId;
use crate::peer::{ConnectedPeer, PeerEvent, PeerIo, PeerStat};
use crate::peer_info::{PeerSource, SharedPeerInfo};
use crate::pex::{Pex, PexFlags};
use crate::rechoke;
use crate::requests::PeerKey;
use crate::session::{Session, Torrent};
use crate::swarm::{Swarm, SwarmEvent, SwarmStats};
use crate::types::{
    wallclock, AddressFamily, BlockIndex, BlockSpan, InfoHash, PieceIndex, Priority, TorrentId,
};
use crate::wishlist::{Wishlist, WishlistMediator};

/// Which peers a [`PeerMgr::get_peers`] query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerListMode {
    /// Currently connected peers.
    Connected,
    /// Known peers worth gossiping about.
    Interesting,
}

struct MgrState {
    swarms: HashMap<TorrentId, Swarm>,
    hash_index: HashMap<InfoHash, TorrentId>,
    obfuscated_index: HashMap<InfoHash, TorrentId>,
    incoming_handshakes: HashMap<SocketAddr, Box<dyn crate::handshake::Handshake>>,
    // cached across pulses; keyed by id because a torrent may be
    // removed before the cache drains
    outbound_candidates: Vec<(TorrentId, SocketAddr)>,
}

pub struct PeerMgr {
    session: Arc<dyn Session>,
    wishlist: Box<dyn Wishlist>,
    state: Mutex<MgrState>,
    rechoke_soon_signal: Notify,
}

impl PeerMgr {
    pub fn new(session: Arc<dyn Session>, wishlist: Box<dyn Wishlist>) -> Arc<Self> {
        Arc::new(Self {
            session,
            wishlist,
            state: Mutex::new(MgrState {
                swarms: HashMap::new(),
                hash_index: HashMap::new(),
                obfuscated_index: HashMap::new(),
                incoming_handshakes: HashMap::new(),
                outbound_candidates: Vec::new(),
            }),
            rechoke_soon_signal: Notify::new(),
        })
    }

    // --- torrent registration

    pub fn add_torrent(&self, tor: Arc<dyn Torrent>) -> Result<()> {
        let mut state = self.state.lock();
        let id = tor.id();
        if state.swarms.contains_key(&id) {
            return Err(Error::DuplicateTorrent);
        }
        state.hash_index.insert(tor.info_hash(), id);
        state.obfuscated_index.insert(tor.obfuscated_hash(), id);

        let mut swarm = Swarm::new(tor);
        swarm.rebuild_webseeds(self.session.as_ref());
        state.swarms.insert(id, swarm);
        Ok(())
    }

    /// Tears the swarm down: stop, drop all peers, clear handshakes,
    /// forget the torrent.
    pub fn remove_torrent(&self, tor: TorrentId) -> Result<()> {
        let mut state = self.state.lock();
        let mut swarm = state.swarms.remove(&tor).ok_or(Error::UnknownTorrent)?;
        swarm.stop();
        state.hash_index.remove(&swarm.tor.info_hash());
        state.obfuscated_index.remove(&swarm.tor.obfuscated_hash());
        state.outbound_candidates.retain(|(id, _)| *id != tor);
        Ok(())
    }

    // --- torrent signals

    pub fn on_torrent_started(&self, tor: TorrentId) -> Result<()> {
        {
            let mut state = self.state.lock();
            let swarm = state.swarms.get_mut(&tor).ok_or(Error::UnknownTorrent)?;
            swarm.start();
        }
        self.rechoke_soon();
        Ok(())
    }

    pub fn on_torrent_stopped(&self, tor: TorrentId) -> Result<()> {
        self.with_swarm_mut(tor, |swarm, _| swarm.stop())
    }

    pub fn on_torrent_done(&self, tor: TorrentId) -> Result<()> {
        self.with_swarm_mut(tor, |swarm, _| swarm.on_torrent_done())
    }

    pub fn on_piece_completed(&self, tor: TorrentId, piece: PieceIndex) -> Result<bool> {
        self.with_swarm_mut(tor, |swarm, _| swarm.on_piece_completed(piece))
    }

    pub fn on_got_bad_piece(&self, tor: TorrentId, piece: PieceIndex) -> Result<()> {
        self.with_swarm_mut(tor, |swarm, _| swarm.on_got_bad_piece(piece))
    }

    pub fn on_got_metainfo(&self, tor: TorrentId) -> Result<()> {
        self.with_swarm_mut(tor, |swarm, session| swarm.on_got_metainfo(session))
    }

    pub fn on_swarm_is_all_seeds(&self, tor: TorrentId) -> Result<()> {
        self.with_swarm_mut(tor, |swarm, _| swarm.on_swarm_is_all_seeds())
    }

    /// The blocklist changed; every cached per-peer verdict is stale.
    pub fn on_blocklist_changed(&self) {
        let state = self.state.lock();
        for swarm in state.swarms.values() {
            for pool in [&swarm.connectable_pool, &swarm.incoming_pool] {
                for info in pool.values() {
                    info.lock().set_blocklisted_dirty();
                }
            }
        }
    }

    /// Observes swarm lifecycle events (peer connected/disconnected,
    /// peer banned).
    pub fn subscribe_swarm(
        &self,
        tor: TorrentId,
        callback: Box<dyn Fn(&SwarmEvent) + Send>,
    ) -> Result<ListenerId> {
        self.with_swarm_mut(tor, move |swarm, _| swarm.subscribe(callback))
    }

    pub fn unsubscribe_swarm(&self, tor: TorrentId, id: ListenerId) -> Result<bool> {
        self.with_swarm_mut(tor, move |swarm, _| swarm.unsubscribe(id))
    }

    // --- inbound connections

    /// Accepts (or rejects) a fresh inbound connection and starts its
    /// handshake.
    pub fn add_incoming(&self, io: Arc<dyn PeerIo>) {
        let mut state = self.state.lock();
        let addr = io.socket_address();

        if self.session.address_is_blocked(addr.ip()) {
            trace!(%addr, "blocklisted address tried to connect");
            io.close();
        } else if state.incoming_handshakes.contains_key(&addr) {
            io.close();
        } else {
            let handshake = self
                .session
                .start_handshake(io, self.session.encryption_mode());
            state.incoming_handshakes.insert(addr, handshake);
        }
    }

    /// Completion of any handshake, inbound or outbound. Returns true if
    /// the peer was admitted; otherwise the caller owns closing the io.
    pub fn handshake_done(&self, result: HandshakeResult) -> bool {
        let mut state = self.state.lock();
        let state = &mut *state;

        let socket_address = result.io.socket_address();
        let tor_id = state
            .hash_index
            .get(&result.io.torrent_hash())
            .copied()
            .filter(|id| state.swarms.contains_key(id));

        if result.io.is_incoming() {
            state.incoming_handshakes.remove(&socket_address);
        } else if let Some(swarm) = tor_id.and_then(|id| state.swarms.get_mut(&id)) {
            swarm.outgoing_handshakes.remove(&socket_address);
        }

        let Some(swarm) = tor_id.and_then(|id| state.swarms.get_mut(&id)) else {
            return false;
        };

        if !result.is_connected || !swarm.is_running {
            if let Some(info) = swarm.get_existing_peer_info(&socket_address) {
                let mut guard = info.lock();
                if !guard.is_connected() {
                    guard.on_connection_failed();
                    if !result.read_anything_from_peer {
                        trace!(
                            peer = %guard.display_name(),
                            fails = guard.connection_failure_count(),
                            "marking peer as unreachable"
                        );
                        guard.set_connectable(false);
                    }
                }
            }
            return false;
        }

        // outbound connections must already have a pool entry
        let info = if result.io.is_incoming() {
            swarm.ensure_info_exists(
                socket_address,
                PexFlags::default(),
                PeerSource::Incoming,
                false,
            )
        } else {
            match swarm.get_existing_peer_info(&socket_address) {
                Some(info) => info,
                None => return false,
            }
        };

        let (is_banned, is_connected) = {
            let mut guard = info.lock();
            if !result.io.is_incoming() {
                guard.set_connectable(true);
            }
            if result.io.is_utp() {
                guard.set_utp_supported(true);
            }
            (guard.is_banned(), guard.is_connected())
        };

        if is_banned {
            trace!(%socket_address, "banned peer tried to reconnect");
            return false;
        }
        if swarm.peer_count() >= swarm.tor.peer_limit() {
            return false;
        }
        if is_connected {
            return false;
        }

        let key = swarm.next_key();
        result.io.join_torrent_bandwidth(swarm.tor.id());
        let msgs =
            self.session
                .new_peer_msgs(swarm.tor.id(), key, result.io.clone(), result.peer_id);
        swarm.install_peer(key, msgs, info);
        true
    }

    // --- peer events

    pub fn peer_event(&self, tor: TorrentId, key: PeerKey, event: PeerEvent) -> Result<()> {
        let now = wallclock();
        self.with_swarm_mut(tor, move |swarm, session| {
            swarm.on_peer_event(key, event, session, now);
        })
    }

    pub fn webseed_event(&self, tor: TorrentId, key: PeerKey, event: PeerEvent) -> Result<()> {
        let now = wallclock();
        self.with_swarm_mut(tor, move |swarm, session| {
            swarm.on_webseed_event(key, event, session, now);
        })
    }

    // --- address ingestion

    /// Feeds gossiped peer addresses into the swarm's connectable pool.
    /// Returns how many entries were used.
    pub fn add_pex(&self, tor: TorrentId, from: PeerSource, pex: &[Pex]) -> Result<usize> {
        let mut state = self.state.lock();
        let swarm = state.swarms.get_mut(&tor).ok_or(Error::UnknownTorrent)?;

        let mut used = 0;
        for p in pex {
            // only store peers whose listening address we can trust
            if from == PeerSource::Incoming {
                continue;
            }
            if from == PeerSource::Pex && !p.flags.connectable {
                continue;
            }
            if p.addr.port() == 0 {
                continue;
            }
            if self.session.address_is_blocked(p.addr.ip()) {
                continue;
            }
            swarm.ensure_info_exists(p.addr, p.flags, from, true);
            used += 1;
        }
        Ok(used)
    }

    // --- request bookkeeping

    pub fn client_sent_requests(
        &self,
        tor: TorrentId,
        peer: PeerKey,
        span: BlockSpan,
    ) -> Result<()> {
        let now = wallclock();
        self.with_swarm_mut(tor, move |swarm, _| {
            for block in span.begin..span.end {
                swarm.active_requests.add(block, peer, now);
            }
        })
    }

    pub fn did_peer_request(&self, tor: TorrentId, peer: PeerKey, block: BlockIndex) -> Result<bool> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;
        Ok(swarm.active_requests.has(block, peer))
    }

    pub fn count_active_requests_to_peer(&self, tor: TorrentId, peer: PeerKey) -> Result<usize> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;
        Ok(swarm.active_requests.count_peer(peer))
    }

    /// Picks the next block spans to request from `peer`, via the
    /// wishlist collaborator.
    pub fn next_requests(
        &self,
        tor: TorrentId,
        peer: PeerKey,
        numwant: usize,
    ) -> Result<Vec<BlockSpan>> {
        let mut state = self.state.lock();
        let swarm = state.swarms.get_mut(&tor).ok_or(Error::UnknownTorrent)?;
        swarm.update_endgame();

        let is_webseed = swarm.is_webseed(peer);
        let mediator = RequestMediator {
            swarm: &*swarm,
            peer,
            is_webseed,
        };
        Ok(self.wishlist.next(&mediator, numwant))
    }

    // --- queries

    /// Lists peers for gossip or UI, best first by usefulness, then in
    /// canonical compact order.
    pub fn get_peers(
        &self,
        tor: TorrentId,
        family: AddressFamily,
        mode: PeerListMode,
        max: usize,
    ) -> Result<Vec<Pex>> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;
        let torrent = swarm.tor.clone();

        let mut infos: Vec<SharedPeerInfo> = Vec::new();
        match mode {
            PeerListMode::Connected => {
                for peer in &swarm.peers {
                    if family.matches(&peer.msgs.socket_address()) {
                        infos.push(peer.info.clone());
                    }
                }
            }
            PeerListMode::Interesting => {
                for (addr, info) in &swarm.connectable_pool {
                    if !family.matches(addr) {
                        continue;
                    }
                    let interesting = {
                        let mut guard = info.lock();
                        if torrent.is_done() && guard.is_seed() {
                            false
                        } else if swarm.peer_is_in_use(&guard) {
                            true
                        } else {
                            !guard.is_blocklisted(self.session.as_ref()) && !guard.is_banned()
                        }
                    };
                    if interesting {
                        infos.push(info.clone());
                    }
                }
            }
        }

        infos.sort_by_cached_key(|info| info.lock().usefulness_key());
        infos.truncate(max);

        let mut pex: Vec<Pex> = infos
            .iter()
            .filter_map(|info| {
                let guard = info.lock();
                guard
                    .listen_socket_address()
                    .map(|addr| Pex::with_flags(addr, guard.pex_flags()))
            })
            .collect();
        pex.sort();
        Ok(pex)
    }

    /// How many connected peers have `piece`; `-1` when we already have
    /// it, `0` without metainfo.
    pub fn piece_availability(&self, tor: TorrentId, piece: PieceIndex) -> Result<i32> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;
        Ok(piece_availability(swarm, piece))
    }

    /// Samples piece availability into `n_tabs` evenly spaced buckets.
    pub fn torrent_availability(&self, tor: TorrentId, n_tabs: usize) -> Result<Vec<i32>> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;

        let mut tabs = vec![0i32; n_tabs];
        if n_tabs == 0 {
            return Ok(tabs);
        }
        let interval = swarm.tor.piece_count() as f64 / n_tabs as f64;
        for (i, tab) in tabs.iter_mut().enumerate() {
            let piece = (i as f64 * interval) as PieceIndex;
            *tab = piece_availability(swarm, piece);
        }
        Ok(tabs)
    }

    pub fn swarm_stats(&self, tor: TorrentId) -> Result<SwarmStats> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;
        Ok(swarm.stats())
    }

    pub fn peer_stats(&self, tor: TorrentId) -> Result<Vec<PeerStat>> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;
        Ok(swarm.peer_stats(wallclock()))
    }

    /// Bytes we want that connected peers could give us.
    pub fn desired_available(&self, tor: TorrentId) -> Result<u64> {
        let state = self.state.lock();
        let swarm = state.swarms.get(&tor).ok_or(Error::UnknownTorrent)?;
        let torrent = &swarm.tor;

        if !torrent.is_running()
            || torrent.is_stopping()
            || torrent.is_done()
            || !torrent.has_metainfo()
            || swarm.peers.is_empty()
        {
            return Ok(0);
        }

        if swarm.peers.iter().any(|p| p.msgs.is_seed()) {
            return Ok(torrent.left_until_done());
        }

        let mut desired = 0u64;
        for piece in 0..torrent.piece_count() {
            if torrent.piece_is_wanted(piece)
                && swarm.peers.iter().any(|p| p.msgs.has_piece(piece))
            {
                desired += torrent.count_missing_bytes_in_piece(piece);
            }
        }
        Ok(desired)
    }

    // --- pulses

    /// Asks for an early rechoke (used right after a torrent starts).
    pub fn rechoke_soon(&self) {
        self.rechoke_soon_signal.notify_waiters();
    }

    /// The 500 ms pulse: pump peers, allocate bandwidth, reap and dial.
    pub fn bandwidth_pulse(&self) {
        let mut state = self.state.lock();

        for swarm in state.swarms.values_mut() {
            for peer in &mut swarm.peers {
                peer.msgs.pulse();
            }
        }

        self.session
            .allocate_bandwidth(BANDWIDTH_PERIOD.as_millis() as u64);

        self.reconnect_pulse(&mut state, wallclock());
    }

    /// The 10 s pulse: recompute choke and interest state everywhere.
    pub fn rechoke_pulse(&self) {
        let mut state = self.state.lock();
        for swarm in state.swarms.values_mut() {
            if swarm.is_running && swarm.peer_count() > 0 {
                rechoke::rechoke_uploads(swarm, self.session.as_ref());
                rechoke::update_interest(swarm);
            }
        }
    }

    /// The 10 s upkeep pulse: cancel requests past their TTL.
    pub fn refill_upkeep(&self) {
        let mut state = self.state.lock();
        let now = wallclock();
        for swarm in state.swarms.values_mut() {
            swarm.cancel_old_requests(now);
        }
    }

    fn reconnect_pulse(&self, state: &mut MgrState, now: u64) {
        // remove crappy peers
        for swarm in state.swarms.values_mut() {
            if !swarm.is_running {
                swarm.remove_all_peers();
            } else {
                close_bad_peers(swarm, now);
            }
            swarm.sweep_graveyard(now);
        }

        // per-swarm peer limits
        for swarm in state.swarms.values_mut() {
            if swarm.is_running {
                enforce_swarm_peer_limit(swarm);
            }
        }

        self.enforce_session_peer_limit(state);
        self.make_new_peer_connections(state, now);
    }

    fn enforce_session_peer_limit(&self, state: &mut MgrState) {
        let max = self.session.peer_limit();
        let total: usize = state.swarms.values().map(Swarm::peer_count).sum();
        if total <= max {
            return;
        }

        // keep the most active peers session-wide, close the rest
        let mut all: Vec<((bool, Reverse<u64>), TorrentId, PeerKey)> = Vec::with_capacity(total);
        for (&id, swarm) in &state.swarms {
            for peer in &swarm.peers {
                all.push((peer.activity_key(), id, peer.key));
            }
        }
        all.sort_unstable_by_key(|&(key, _, _)| key);
        for (_, tor, key) in all.drain(max..) {
            if let Some(swarm) = state.swarms.get_mut(&tor) {
                swarm.remove_peer(key);
            }
        }
    }

    fn make_new_peer_connections(&self, state: &mut MgrState, now: u64) {
        if state.outbound_candidates.is_empty() {
            // leave a few slots open for incoming connections
            let total: usize = state.swarms.values().map(Swarm::peer_count).sum();
            let max = (self.session.peer_limit() as f64 * INCOMING_RESERVE_RATIO) as usize;
            if total < max {
                state.outbound_candidates =
                    candidates::generate(&mut state.swarms, self.session.as_ref(), now);
            }
        }

        for _ in 0..MAX_CONNECTIONS_PER_PULSE {
            let Some((tor_id, addr)) = state.outbound_candidates.pop() else {
                break;
            };
            if let Some(swarm) = state.swarms.get_mut(&tor_id) {
                if let Some(info) = swarm.get_existing_peer_info(&addr) {
                    self.initiate_connection(swarm, info, now);
                }
            }
        }
    }

    fn initiate_connection(&self, swarm: &mut Swarm, info: SharedPeerInfo, now: u64) {
        let session = self.session.as_ref();
        let (addr, supports_utp) = {
            let guard = info.lock();
            let Some(addr) = guard.listen_socket_address() else {
                return;
            };
            (addr, guard.supports_utp())
        };

        let utp = session.allows_utp() && supports_utp != Some(false);
        if !utp && !session.allows_tcp() {
            return;
        }

        trace!(
            peer = %addr,
            transport = if utp { "utp" } else { "tcp" },
            "starting outgoing connection"
        );

        match session.new_outgoing_io(addr, swarm.tor.info_hash(), swarm.tor.is_done(), utp) {
            None => {
                let mut guard = info.lock();
                trace!(peer = %guard.display_name(), "io not created; marking peer unreachable");
                guard.set_connectable(false);
                guard.on_connection_failed();
            }
            Some(io) => {
                let handshake = session.start_handshake(io, session.encryption_mode());
                swarm.outgoing_handshakes.insert(addr, handshake);
            }
        }

        info.lock().set_connection_attempt_time(now);
    }

    /// Spawns the three repeating pulse tasks onto the current tokio
    /// runtime. Dropping the returned driver stops them.
    pub fn spawn_pulses(self: &Arc<Self>) -> PulseDriver {
        let mut handles = Vec::with_capacity(3);

        let mgr = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(BANDWIDTH_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                mgr.bandwidth_pulse();
            }
        }));

        let mgr = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(RECHOKE_PERIOD) => {}
                    _ = mgr.rechoke_soon_signal.notified() => {
                        tokio::time::sleep(RECHOKE_SOON_PERIOD).await;
                    }
                }
                mgr.rechoke_pulse();
            }
        }));

        let mgr = self.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFILL_UPKEEP_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                mgr.refill_upkeep();
            }
        }));

        PulseDriver { handles }
    }

    // --- internals

    fn with_swarm_mut<R>(
        &self,
        tor: TorrentId,
        f: impl FnOnce(&mut Swarm, &dyn Session) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock();
        let swarm = state.swarms.get_mut(&tor).ok_or(Error::UnknownTorrent)?;
        Ok(f(swarm, self.session.as_ref()))
    }

    #[cfg(test)]
    pub(crate) fn inspect_swarm<R>(&self, tor: TorrentId, f: impl FnOnce(&Swarm) -> R) -> Option<R> {
        let state = self.state.lock();
        state.swarms.get(&tor).map(f)
    }

    #[cfg(test)]
    pub(crate) fn incoming_handshake_count(&self) -> usize {
        self.state.lock().incoming_handshakes.len()
    }

    #[cfg(test)]
    pub(crate) fn outbound_candidate_count(&self) -> usize {
        self.state.lock().outbound_candidates.len()
    }
}

impl HandshakeMediator for PeerMgr {
    fn torrent(&self, info_hash: &InfoHash) -> Option<TorrentInfo> {
        let state = self.state.lock();
        let id = state.hash_index.get(info_hash)?;
        state.swarms.get(id).map(|swarm| torrent_info(&swarm.tor))
    }

    fn torrent_from_obfuscated(&self, obfuscated_hash: &InfoHash) -> Option<TorrentInfo> {
        let state = self.state.lock();
        let id = state.obfuscated_index.get(obfuscated_hash)?;
        state.swarms.get(id).map(|swarm| torrent_info(&swarm.tor))
    }

    fn allows_dht(&self) -> bool {
        self.session.allows_dht()
    }

    fn allows_tcp(&self) -> bool {
        self.session.allows_tcp()
    }

    fn set_utp_failed(&self, info_hash: &InfoHash, addr: SocketAddr) {
        let state = self.state.lock();
        if let Some(swarm) = state.hash_index.get(info_hash).and_then(|id| state.swarms.get(id)) {
            if let Some(info) = swarm.get_existing_peer_info(&addr) {
                info.lock().set_utp_supported(false);
            }
        }
    }
}

fn torrent_info(tor: &Arc<dyn Torrent>) -> TorrentInfo {
    TorrentInfo {
        info_hash: tor.info_hash(),
        client_peer_id: tor.client_peer_id(),
        id: tor.id(),
        is_done: tor.is_done(),
    }
}

/// Keeps the pulse tasks alive; dropping it aborts them.
pub struct PulseDriver {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for PulseDriver {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

// --- disconnect helpers

pub(crate) fn should_peer_be_closed(
    swarm: &Swarm,
    peer: &ConnectedPeer,
    peer_count: usize,
    now: u64,
) -> bool {
    if peer.do_purge {
        trace!(peer = %peer.display_name(), "purging peer: do_purge flag is set");
        return true;
    }

    let tor = &swarm.tor;
    let info = peer.info.lock();

    // if we're both seeds, hang around just long enough for pex
    if tor.is_done() && peer.msgs.is_seed() {
        return !tor.allows_pex() || info.idle_secs(now).unwrap_or(0) >= SEED_IDLE_SECS;
    }

    // idle cutoff slides from lenient (few peers) to strict (nearly full)
    let relax_if_fewer_than = (tor.peer_limit() as f64 * 0.9).round() as usize;
    let strictness = if relax_if_fewer_than == 0 || peer_count >= relax_if_fewer_than {
        1.0
    } else {
        peer_count as f64 / relax_if_fewer_than as f64
    };
    let hi = MAX_UPLOAD_IDLE_SECS as f64;
    let lo = MIN_UPLOAD_IDLE_SECS as f64;
    let limit = hi - (hi - lo) * strictness;

    if let Some(idle) = info.idle_secs(now) {
        if idle as f64 > limit {
            trace!(
                peer = %info.display_name(),
                idle,
                "purging peer: idle too long"
            );
            return true;
        }
    }

    false
}

fn close_bad_peers(swarm: &mut Swarm, now: u64) {
    let peer_count = swarm.peer_count();
    let bad: Vec<PeerKey> = swarm
        .peers
        .iter()
        .filter(|p| should_peer_be_closed(swarm, p, peer_count, now))
        .map(|p| p.key)
        .collect();
    for key in bad {
        debug!("removing bad peer");
        swarm.remove_peer(key);
    }
}

fn enforce_swarm_peer_limit(swarm: &mut Swarm) {
    let max = swarm.tor.peer_limit();
    if swarm.peer_count() <= max {
        return;
    }

    // close all but the `max` most active
    let mut keys: Vec<((bool, Reverse<u64>), PeerKey)> = swarm
        .peers
        .iter()
        .map(|p| (p.activity_key(), p.key))
        .collect();
    keys.sort_unstable_by_key(|&(key, _)| key);
    for (_, key) in keys.drain(max..) {
        swarm.remove_peer(key);
    }
}

fn piece_availability(swarm: &Swarm, piece: PieceIndex) -> i32 {
    let tor = &swarm.tor;
    if !tor.has_metainfo() {
        return 0;
    }
    if tor.is_done() || tor.has_piece(piece) {
        return -1;
    }
    swarm
        .peers
        .iter()
        .filter(|p| p.msgs.has_piece(piece))
        .count() as i32
}

// --- wishlist mediator

struct RequestMediator<'a> {
    swarm: &'a Swarm,
    peer: PeerKey,
    is_webseed: bool,
}

impl WishlistMediator for RequestMediator<'_> {
    fn client_can_request_block(&self, block: BlockIndex) -> bool {
        !self.swarm.tor.has_block(block) && !self.swarm.active_requests.has(block, self.peer)
    }

    fn client_can_request_piece(&self, piece: PieceIndex) -> bool {
        if !self.swarm.tor.piece_is_wanted(piece) {
            return false;
        }
        self.is_webseed
            || self
                .swarm
                .find_peer(self.peer)
                .is_some_and(|p| p.msgs.has_piece(piece))
    }

    fn is_endgame(&self) -> bool {
        self.swarm.is_endgame()
    }

    fn count_active_requests(&self, block: BlockIndex) -> usize {
        self.swarm.active_requests.count_block(block)
    }

    fn count_missing_blocks(&self, piece: PieceIndex) -> usize {
        self.swarm.tor.count_missing_blocks_in_piece(piece)
    }

    fn block_span(&self, piece: PieceIndex) -> BlockSpan {
        self.swarm.tor.block_span_for_piece(piece)
    }

    fn piece_count(&self) -> PieceIndex {
        self.swarm.tor.piece_count()
    }

    fn priority(&self, piece: PieceIndex) -> Priority {
        self.swarm.tor.piece_priority(piece)
    }

    fn is_sequential_download(&self) -> bool {
        self.swarm.tor.is_sequential_download()
    }
}
