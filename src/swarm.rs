//! Per-torrent swarm state.
//!
//! A [`Swarm`] aggregates everything the peer manager knows about one
//! torrent: the three address pools (connectable, incoming, graveyard),
//! the currently connected peers, the outstanding block requests, the
//! webseed list, and the per-swarm statistics. Peer events mutate the
//! swarm; the periodic pulses in the manager reshape it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::constants::{BLOCK_SIZE, GRAVEYARD_TTL_SECS, MAX_BAD_PIECES_PER_PEER, REQUEST_TTL_SECS};
use crate::handshake::Handshake;
use crate::notify::{ListenerId, Listeners};
use crate::peer::{peer_stat, ConnectedPeer, PeerEvent, PeerMsgs, PeerStat, WebseedEntry};
use crate::peer_info::{PeerInfo, PeerSource, SharedPeerInfo};
use crate::pex::PexFlags;
use crate::requests::{ActiveRequests, PeerKey};
use crate::session::{Session, Torrent};
use crate::types::Direction;

/// Aggregate counters for one swarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub peer_count: usize,
    pub peer_from_count: [usize; PeerSource::COUNT],
    /// Peers actively moving piece data, indexed by [`Direction`].
    pub active_peer_count: [usize; 2],
    pub active_webseed_count: usize,
}

/// Lifecycle notifications emitted to swarm observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmEvent {
    PeerConnected { addr: SocketAddr },
    PeerDisconnected { addr: SocketAddr },
    PeerBanned { addr: IpAddr },
}

pub struct Swarm {
    pub(crate) tor: Arc<dyn Torrent>,
    pub(crate) is_running: bool,
    is_endgame: bool,
    /// The optimistically unchoked peer, if any.
    pub(crate) optimistic: Option<PeerKey>,
    pub(crate) optimistic_unchoke_time_scaler: u8,
    pub(crate) peers: Vec<ConnectedPeer>,
    pub(crate) webseeds: Vec<WebseedEntry>,
    pub(crate) active_requests: ActiveRequests,
    // Connected peers hold handles into these pools; entries migrate
    // between maps without invalidating the handles.
    pub(crate) connectable_pool: HashMap<SocketAddr, SharedPeerInfo>,
    pub(crate) incoming_pool: HashMap<SocketAddr, SharedPeerInfo>,
    pub(crate) graveyard_pool: HashMap<SocketAddr, SharedPeerInfo>,
    pub(crate) outgoing_handshakes: HashMap<SocketAddr, Box<dyn Handshake>>,
    peer_count: usize,
    peer_from_count: [usize; PeerSource::COUNT],
    pool_is_all_seeds: Option<bool>,
    listeners: Listeners<SwarmEvent>,
    next_peer_key: PeerKey,
}

impl Swarm {
    pub(crate) fn new(tor: Arc<dyn Torrent>) -> Self {
        Self {
            tor,
            is_running: false,
            is_endgame: false,
            optimistic: None,
            optimistic_unchoke_time_scaler: 0,
            peers: Vec::new(),
            webseeds: Vec::new(),
            active_requests: ActiveRequests::new(),
            connectable_pool: HashMap::new(),
            incoming_pool: HashMap::new(),
            graveyard_pool: HashMap::new(),
            outgoing_handshakes: HashMap::new(),
            peer_count: 0,
            peer_from_count: [0; PeerSource::COUNT],
            pool_is_all_seeds: None,
            listeners: Listeners::new(),
            next_peer_key: 0,
        }
    }

    // --- observers

    pub(crate) fn subscribe(&mut self, callback: Box<dyn Fn(&SwarmEvent) + Send>) -> ListenerId {
        self.listeners.subscribe(callback)
    }

    pub(crate) fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // --- basic accessors

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn next_key(&mut self) -> PeerKey {
        let key = self.next_peer_key;
        self.next_peer_key += 1;
        key
    }

    pub(crate) fn find_peer(&self, key: PeerKey) -> Option<&ConnectedPeer> {
        self.peers.iter().find(|p| p.key == key)
    }

    pub(crate) fn find_peer_mut(&mut self, key: PeerKey) -> Option<&mut ConnectedPeer> {
        self.peers.iter_mut().find(|p| p.key == key)
    }

    pub(crate) fn is_webseed(&self, key: PeerKey) -> bool {
        self.webseeds.iter().any(|w| w.key == key)
    }

    pub(crate) fn is_endgame(&self) -> bool {
        self.is_endgame
    }

    /// Endgame begins once the outstanding requests cover at least the
    /// bytes left to download.
    pub(crate) fn update_endgame(&mut self) {
        self.is_endgame =
            self.active_requests.len() as u64 * BLOCK_SIZE >= self.tor.left_until_done();
    }

    // --- lifecycle

    pub(crate) fn start(&mut self) {
        self.is_running = true;
    }

    pub(crate) fn stop(&mut self) {
        self.is_running = false;
        self.remove_all_peers();
        self.outgoing_handshakes.clear();
    }

    // --- pools

    pub(crate) fn get_existing_peer_info(&self, addr: &SocketAddr) -> Option<SharedPeerInfo> {
        self.connectable_pool.get(addr).cloned()
    }

    /// Finds or creates the pool entry for `addr`, folding in the new
    /// source and flags when it already exists.
    pub(crate) fn ensure_info_exists(
        &mut self,
        addr: SocketAddr,
        flags: PexFlags,
        from: PeerSource,
        is_connectable: bool,
    ) -> SharedPeerInfo {
        let pool = if is_connectable {
            &mut self.connectable_pool
        } else {
            &mut self.incoming_pool
        };

        let info = match pool.get(&addr) {
            Some(existing) => {
                let mut guard = existing.lock();
                guard.found_at(from);
                guard.set_pex_flags(flags);
                drop(guard);
                existing.clone()
            }
            None => {
                let port = is_connectable.then(|| addr.port());
                let info = PeerInfo::new_shared(addr.ip(), port, flags, from);
                pool.insert(addr, info.clone());
                info
            }
        };

        self.mark_all_seeds_dirty();
        info
    }

    pub(crate) fn mark_peer_as_seed(&mut self, info: &SharedPeerInfo) {
        let mut guard = info.lock();
        trace!(peer = %guard.display_name(), "marking peer as a seed");
        guard.set_seed();
        drop(guard);
        self.mark_all_seeds_dirty();
    }

    pub(crate) fn mark_all_seeds_dirty(&mut self) {
        self.pool_is_all_seeds = None;
    }

    /// True when every known connectable peer is a seed; memoized until
    /// the pools change.
    pub(crate) fn is_all_seeds(&mut self) -> bool {
        if self.pool_is_all_seeds.is_none() {
            let value = self
                .connectable_pool
                .values()
                .all(|info| info.lock().is_seed());
            self.pool_is_all_seeds = Some(value);
        }
        self.pool_is_all_seeds.unwrap_or(true)
    }

    /// A peer info is in use while a connection or an outgoing handshake
    /// holds it.
    pub(crate) fn peer_is_in_use(&self, info: &PeerInfo) -> bool {
        if info.is_connected() {
            return true;
        }
        info.listen_socket_address()
            .is_some_and(|addr| self.outgoing_handshakes.contains_key(&addr))
    }

    /// Drops graveyard entries whose displacement TTL has expired.
    pub(crate) fn sweep_graveyard(&mut self, now: u64) {
        self.graveyard_pool.retain(|_, info| {
            let guard = info.lock();
            guard.is_connected()
                || guard
                    .displaced_at()
                    .map_or(true, |at| now.saturating_sub(at) < GRAVEYARD_TTL_SECS)
        });
    }

    // --- connected peers

    /// Registers an admitted peer. The caller has already verified the
    /// admission preconditions (not banned, swarm not full, not already
    /// connected).
    pub(crate) fn install_peer(
        &mut self,
        key: PeerKey,
        msgs: Box<dyn PeerMsgs>,
        info: SharedPeerInfo,
    ) {
        let addr = msgs.socket_address();
        let from = {
            let mut guard = info.lock();
            guard.set_connected(true);
            guard.from_first()
        };

        self.peers
            .push(ConnectedPeer::new(key, msgs, info, self.tor.piece_count()));
        self.peer_count += 1;
        self.peer_from_count[from.index()] += 1;
        debug_assert_eq!(self.peer_count, self.peers.len());

        self.listeners.emit(&SwarmEvent::PeerConnected { addr });
    }

    pub(crate) fn remove_peer(&mut self, key: PeerKey) {
        if let Some(idx) = self.peers.iter().position(|p| p.key == key) {
            self.remove_peer_at(idx);
        }
    }

    fn remove_peer_at(&mut self, idx: usize) {
        let peer = self.peers.remove(idx);
        self.active_requests.remove_peer(peer.key);

        let addr = peer.msgs.socket_address();
        let was_incoming = peer.msgs.is_incoming_connection();

        let (from, listen, port_empty) = {
            let mut guard = peer.info.lock();
            guard.set_connected(false);
            (
                guard.from_first(),
                guard.listen_socket_address(),
                guard.listen_port().is_none(),
            )
        };

        self.peer_count -= 1;
        self.peer_from_count[from.index()] -= 1;
        debug_assert_eq!(self.peer_count, self.peers.len());

        // an incoming peer that never announced a port leaves no durable
        // record behind
        if was_incoming && port_empty {
            self.incoming_pool.remove(&addr);
        }
        // a displaced entry does not outlive its connection
        for grave_key in [listen, Some(addr)].into_iter().flatten() {
            if self
                .graveyard_pool
                .get(&grave_key)
                .is_some_and(|g| Arc::ptr_eq(g, &peer.info))
            {
                self.graveyard_pool.remove(&grave_key);
            }
        }

        self.listeners.emit(&SwarmEvent::PeerDisconnected { addr });
    }

    pub(crate) fn remove_all_peers(&mut self) {
        while let Some(idx) = self.peers.len().checked_sub(1) {
            self.remove_peer_at(idx);
        }
        debug_assert_eq!(self.peer_count, 0);
    }

    // --- requests

    /// Cancels requests that have been outstanding longer than the TTL.
    pub(crate) fn cancel_old_requests(&mut self, now: u64) {
        let cutoff = now.saturating_sub(REQUEST_TTL_SECS);
        for (block, key) in self.active_requests.sent_before(cutoff) {
            self.active_requests.remove(block, key);
            if let Some(peer) = self.find_peer_mut(key) {
                peer.cancels_sent_to_peer.add(now, 1);
                peer.msgs.cancel_block_request(block);
            }
        }
    }

    /// Cancels every outstanding request for `block`, notifying each
    /// holder except `no_notify`.
    pub(crate) fn cancel_all_requests_for_block(
        &mut self,
        block: crate::types::BlockIndex,
        no_notify: Option<PeerKey>,
        now: u64,
    ) {
        for key in self.active_requests.remove_block(block) {
            if Some(key) == no_notify {
                continue;
            }
            if let Some(peer) = self.find_peer_mut(key) {
                peer.cancels_sent_to_peer.add(now, 1);
                peer.msgs.cancel_block_request(block);
            }
        }
    }

    // --- strikes

    pub(crate) fn add_strike(&mut self, key: PeerKey) {
        let mut banned = None;
        if let Some(peer) = self.find_peer_mut(key) {
            peer.strikes = peer.strikes.saturating_add(1);
            trace!(
                peer = %peer.display_name(),
                strikes = peer.strikes,
                "increasing peer strike count"
            );
            if peer.strikes >= MAX_BAD_PIECES_PER_PEER {
                let mut info = peer.info.lock();
                info.ban();
                banned = Some(info.listen_address());
                drop(info);
                peer.do_purge = true;
                trace!(peer = %peer.display_name(), "banning peer");
            }
        }
        if let Some(addr) = banned {
            self.listeners.emit(&SwarmEvent::PeerBanned { addr });
        }
    }

    // --- webseeds

    pub(crate) fn rebuild_webseeds(&mut self, session: &dyn Session) {
        for entry in self.webseeds.drain(..) {
            self.active_requests.remove_peer(entry.key);
        }
        let tor_id = self.tor.id();
        let urls = self.tor.webseed_urls();
        for url in urls {
            let key = self.next_key();
            self.webseeds.push(WebseedEntry {
                key,
                webseed: session.new_webseed(tor_id, key, &url),
            });
        }
    }

    pub(crate) fn count_active_webseeds(&self) -> usize {
        if !self.tor.is_running() || self.tor.is_done() {
            return 0;
        }
        self.webseeds
            .iter()
            .filter(|w| w.webseed.is_transferring_pieces(Direction::Down))
            .count()
    }

    // --- peer events

    pub(crate) fn on_peer_event(
        &mut self,
        key: PeerKey,
        event: PeerEvent,
        session: &dyn Session,
        now: u64,
    ) {
        let tor = self.tor.clone();
        match event {
            PeerEvent::ClientSentPieceData { length } => {
                tor.add_uploaded(length as u64);
                session.add_uploaded(length as u64);
                if let Some(peer) = self.find_peer(key) {
                    peer.info.lock().set_latest_piece_data_time(now);
                }
            }
            PeerEvent::ClientGotPieceData { length } => {
                tor.add_downloaded(length as u64);
                session.add_downloaded(length as u64);
                if let Some(peer) = self.find_peer(key) {
                    peer.info.lock().set_latest_piece_data_time(now);
                }
            }
            PeerEvent::ClientGotChoke => {
                self.active_requests.remove_peer(key);
            }
            PeerEvent::ClientGotRej { piece, offset } => {
                self.active_requests.remove(tor.block_of(piece, offset), key);
            }
            PeerEvent::ClientGotBlock { piece, offset } => {
                let block = tor.block_of(piece, offset);
                // duplicates must be cancelled before the block is
                // acknowledged upward
                self.cancel_all_requests_for_block(block, Some(key), now);
                if let Some(peer) = self.find_peer_mut(key) {
                    peer.blame.set(piece as usize);
                    peer.blocks_sent_to_client.add(now, 1);
                }
                tor.got_block(block);
            }
            PeerEvent::ClientGotPort { port } => {
                if port != 0 {
                    let current = self
                        .find_peer(key)
                        .map(|p| p.info.lock().listen_port())
                        .unwrap_or(None);
                    if current != Some(port) {
                        self.on_got_port(key, port, now);
                    }
                }
            }
            PeerEvent::ClientGotHave { .. }
            | PeerEvent::ClientGotBitfield
            | PeerEvent::ClientGotHaveAll
            | PeerEvent::ClientGotHaveNone
            | PeerEvent::ClientGotSuggest { .. }
            | PeerEvent::ClientGotAllowedFast { .. } => {
                // consumed by other subsystems
            }
            PeerEvent::Error { error } => {
                if error.is_fatal() {
                    if let Some(peer) = self.find_peer_mut(key) {
                        debug!(
                            peer = %peer.display_name(),
                            ?error,
                            "setting purge flag after protocol error"
                        );
                        peer.do_purge = true;
                    }
                } else {
                    debug!(?error, "unhandled peer error");
                }
            }
        }
    }

    pub(crate) fn on_webseed_event(
        &mut self,
        key: PeerKey,
        event: PeerEvent,
        session: &dyn Session,
        now: u64,
    ) {
        let tor = self.tor.clone();
        match event {
            PeerEvent::ClientGotPieceData { length } => {
                tor.add_downloaded(length as u64);
                session.add_downloaded(length as u64);
            }
            PeerEvent::ClientGotRej { piece, offset } => {
                self.active_requests.remove(tor.block_of(piece, offset), key);
            }
            PeerEvent::ClientGotBlock { piece, offset } => {
                let block = tor.block_of(piece, offset);
                self.cancel_all_requests_for_block(block, Some(key), now);
                tor.got_block(block);
            }
            _ => {}
        }
    }

    // --- port learning and pool migration

    /// A connected peer announced a (new) listening port: promote its
    /// record into the connectable pool, resolving any collision with an
    /// existing entry for the same address.
    fn on_got_port(&mut self, key: PeerKey, port: u16, now: u64) {
        let Some(peer_idx) = self.peers.iter().position(|p| p.key == key) else {
            return;
        };
        let info_this = self.peers[peer_idx].info.clone();
        let socket_addr = self.peers[peer_idx].msgs.socket_address();
        let (listen_addr, old_port) = {
            let guard = info_this.lock();
            (guard.listen_address(), guard.listen_port())
        };
        let was_connectable = old_port.is_some();
        let target = SocketAddr::new(listen_addr, port);

        if let Some(info_that) = self.connectable_pool.get(&target).cloned() {
            if Arc::ptr_eq(&info_that, &info_this) {
                return;
            }
            let that_connected = info_that.lock().is_connected();
            if that_connected {
                if self.resolve_duplicate_connection(
                    peer_idx,
                    &info_this,
                    &info_that,
                    target,
                    socket_addr,
                    now,
                ) {
                    return;
                }
                // this side won: absorb the displaced entry's history
                let that_guard = info_that.lock();
                info_this.lock().merge(&that_guard);
            } else {
                // stale duplicate record: fold it in and drop it
                let that_guard = info_that.lock();
                info_this.lock().merge(&that_guard);
                drop(that_guard);
                self.connectable_pool.remove(&target);
            }
        } else if !was_connectable {
            // it accepted us once, so it accepts connections
            info_this.lock().set_connectable(true);
        }

        // migrate the live entry under its new key
        if was_connectable {
            if let Some(old_port) = old_port {
                self.connectable_pool
                    .remove(&SocketAddr::new(listen_addr, old_port));
            }
        } else {
            self.incoming_pool.remove(&socket_addr);
        }
        info_this.lock().set_listen_port(port);
        self.connectable_pool.insert(target, info_this);
        self.mark_all_seeds_dirty();
    }

    /// Two live connections turned out to be the same peer. Keeps the
    /// more useful one; the loser is flagged for purge and its record is
    /// displaced to the graveyard.
    ///
    /// Returns true if the reporting side lost (the caller must not
    /// migrate it).
    fn resolve_duplicate_connection(
        &mut self,
        peer_idx: usize,
        info_this: &SharedPeerInfo,
        info_that: &SharedPeerInfo,
        target: SocketAddr,
        socket_addr: SocketAddr,
        now: u64,
    ) -> bool {
        let this_key = info_this.lock().usefulness_key();
        let that_key = info_that.lock().usefulness_key();

        if this_key < that_key {
            // the reporting side wins; displace the established entry
            if let Some(other) = self
                .peers
                .iter_mut()
                .find(|p| Arc::ptr_eq(&p.info, info_that))
            {
                other.do_purge = true;
            }
            self.connectable_pool.remove(&target);
            info_that.lock().set_displaced(now);
            self.graveyard_pool.insert(target, info_that.clone());
            false
        } else {
            // the established entry wins; absorb and purge the reporter
            let this_guard = info_this.lock();
            info_that.lock().merge(&this_guard);
            let old_listen = this_guard.listen_socket_address();
            drop(this_guard);

            self.peers[peer_idx].do_purge = true;
            let grave_key = old_listen.unwrap_or(socket_addr);
            let displaced = if old_listen.is_some() {
                self.connectable_pool.remove(&grave_key)
            } else {
                self.incoming_pool.remove(&grave_key)
            };
            if displaced.is_some() {
                info_this.lock().set_displaced(now);
                self.graveyard_pool.insert(grave_key, info_this.clone());
            }
            self.mark_all_seeds_dirty();
            true
        }
    }

    // --- torrent signals

    pub(crate) fn on_torrent_done(&mut self) {
        for peer in &mut self.peers {
            peer.msgs.set_interested(false);
        }
    }

    pub(crate) fn on_swarm_is_all_seeds(&mut self) {
        let infos: Vec<_> = self.connectable_pool.values().cloned().collect();
        for info in infos {
            self.mark_peer_as_seed(&info);
        }
        self.mark_all_seeds_dirty();
    }

    /// Returns true if the completed piece came from peers (rather than
    /// webseeds only).
    pub(crate) fn on_piece_completed(&mut self, piece: crate::types::PieceIndex) -> bool {
        let mut came_from_peers = false;
        for peer in &mut self.peers {
            peer.msgs.on_piece_completed(piece);
            came_from_peers |= peer.blame.has(piece as usize);
        }
        came_from_peers
    }

    pub(crate) fn on_got_bad_piece(&mut self, piece: crate::types::PieceIndex) {
        let guilty: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|p| p.blame.has(piece as usize))
            .map(|p| p.key)
            .collect();
        for key in guilty {
            self.add_strike(key);
        }
    }

    pub(crate) fn on_got_metainfo(&mut self, session: &dyn Session) {
        // the webseed list may have changed
        self.rebuild_webseeds(session);

        let piece_count = self.tor.piece_count() as usize;
        let mut seeds = Vec::new();
        for peer in &mut self.peers {
            peer.msgs.on_torrent_got_metainfo();
            peer.blame.resize(piece_count);
            if peer.msgs.is_seed() {
                seeds.push(peer.info.clone());
            }
        }
        for info in seeds {
            self.mark_peer_as_seed(&info);
        }
    }

    // --- statistics

    pub(crate) fn stats(&self) -> SwarmStats {
        let count_active = |dir: Direction| {
            self.peers
                .iter()
                .filter(|p| p.msgs.is_transferring_pieces(dir))
                .count()
        };
        SwarmStats {
            peer_count: self.peer_count,
            peer_from_count: self.peer_from_count,
            active_peer_count: [count_active(Direction::Up), count_active(Direction::Down)],
            active_webseed_count: self.count_active_webseeds(),
        }
    }

    pub(crate) fn peer_stats(&self, now: u64) -> Vec<PeerStat> {
        self.peers
            .iter()
            .map(|p| peer_stat(p, now, self.optimistic == Some(p.key)))
            .collect()
    }
}
