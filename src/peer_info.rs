//! Durable per-address peer records.
//!
//! A [`PeerInfo`] survives across connects and disconnects: it remembers
//! how we learned about the address, how often dialing it failed, when it
//! last sent or received piece data, and whether it is banned. Swarm pools
//! store these behind `Arc<Mutex<..>>` so that a live connection can keep
//! a reference while the record migrates between pools.

use std::cmp::Reverse;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::RECONNECT_BACKOFF_SECS;
use crate::pex::PexFlags;
use crate::session::Session;

/// Where a peer address was first learned.
///
/// The discriminant order doubles as a trust ranking: smaller values are
/// more trusted sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerSource {
    /// The peer connected to us.
    Incoming = 0,
    /// Local Service Discovery.
    Lpd = 1,
    /// A tracker announce response.
    Tracker = 2,
    /// The Distributed Hash Table.
    Dht = 3,
    /// Peer Exchange gossip.
    Pex = 4,
    /// Loaded from resume data.
    Resume = 5,
}

impl PeerSource {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A shared handle to a pool entry.
///
/// Connected peers hold a clone of the handle; pool migration moves the
/// handle between maps without invalidating it.
pub type SharedPeerInfo = Arc<Mutex<PeerInfo>>;

/// Durable record about one peer address.
#[derive(Debug)]
pub struct PeerInfo {
    listen_address: IpAddr,
    listen_port: Option<u16>,
    pex_flags: PexFlags,
    from_first: PeerSource,
    from_best: PeerSource,
    connection_failure_count: u32,
    connection_attempt_time: u64,
    latest_piece_data_time: u64,
    is_seed: bool,
    is_banned: bool,
    is_connected: bool,
    is_connectable: Option<bool>,
    supports_utp: Option<bool>,
    blocklisted: Option<bool>,
    displaced_at: Option<u64>,
}

impl PeerInfo {
    pub fn new(
        listen_address: IpAddr,
        listen_port: Option<u16>,
        flags: PexFlags,
        from: PeerSource,
    ) -> Self {
        let mut info = Self {
            listen_address,
            listen_port,
            pex_flags: PexFlags::default(),
            from_first: from,
            from_best: from,
            connection_failure_count: 0,
            connection_attempt_time: 0,
            latest_piece_data_time: 0,
            is_seed: false,
            is_banned: false,
            is_connected: false,
            is_connectable: None,
            supports_utp: None,
            blocklisted: None,
            displaced_at: None,
        };
        info.set_pex_flags(flags);
        info
    }

    pub fn new_shared(
        listen_address: IpAddr,
        listen_port: Option<u16>,
        flags: PexFlags,
        from: PeerSource,
    ) -> SharedPeerInfo {
        Arc::new(Mutex::new(Self::new(listen_address, listen_port, flags, from)))
    }

    // --- identity

    pub fn listen_address(&self) -> IpAddr {
        self.listen_address
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    pub fn set_listen_port(&mut self, port: u16) {
        self.listen_port = Some(port);
    }

    /// The address peers should dial, when the listening port is known.
    pub fn listen_socket_address(&self) -> Option<SocketAddr> {
        self.listen_port
            .map(|port| SocketAddr::new(self.listen_address, port))
    }

    pub fn display_name(&self) -> String {
        match self.listen_port {
            Some(port) => format!("{}:{port}", self.listen_address),
            None => format!("{}:?", self.listen_address),
        }
    }

    // --- source attribution

    pub fn from_first(&self) -> PeerSource {
        self.from_first
    }

    pub fn from_best(&self) -> PeerSource {
        self.from_best
    }

    /// Records that another source reported this address.
    pub fn found_at(&mut self, from: PeerSource) {
        self.from_best = self.from_best.min(from);
    }

    // --- capability flags

    pub fn pex_flags(&self) -> PexFlags {
        self.pex_flags
    }

    /// ORs gossiped capability flags into the record.
    pub fn set_pex_flags(&mut self, flags: PexFlags) {
        self.pex_flags.merge(flags);
        if flags.seed {
            self.is_seed = true;
        }
        if flags.utp {
            self.supports_utp = Some(true);
        }
    }

    pub fn supports_utp(&self) -> Option<bool> {
        self.supports_utp
    }

    pub fn set_utp_supported(&mut self, supported: bool) {
        self.supports_utp = Some(supported);
    }

    pub fn is_seed(&self) -> bool {
        self.is_seed
    }

    pub fn set_seed(&mut self) {
        self.is_seed = true;
        self.pex_flags.seed = true;
    }

    // --- connection state

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.is_connected = connected;
    }

    pub fn is_connectable(&self) -> Option<bool> {
        self.is_connectable
    }

    pub fn set_connectable(&mut self, connectable: bool) {
        self.is_connectable = Some(connectable);
    }

    // --- reputation

    pub fn is_banned(&self) -> bool {
        self.is_banned
    }

    pub fn ban(&mut self) {
        self.is_banned = true;
    }

    pub fn connection_failure_count(&self) -> u32 {
        self.connection_failure_count
    }

    pub fn on_connection_failed(&mut self) {
        self.connection_failure_count = self.connection_failure_count.saturating_add(1);
    }

    pub fn connection_attempt_time(&self) -> u64 {
        self.connection_attempt_time
    }

    pub fn set_connection_attempt_time(&mut self, now: u64) {
        self.connection_attempt_time = now;
    }

    pub fn latest_piece_data_time(&self) -> u64 {
        self.latest_piece_data_time
    }

    pub fn set_latest_piece_data_time(&mut self, now: u64) {
        self.latest_piece_data_time = now;
    }

    /// Seconds since piece data was exchanged, or `None` if never.
    pub fn idle_secs(&self, now: u64) -> Option<u64> {
        if self.latest_piece_data_time == 0 {
            None
        } else {
            Some(now.saturating_sub(self.latest_piece_data_time))
        }
    }

    /// Returns true once the reconnect backoff for the current failure
    /// count has elapsed since the last dial attempt.
    pub fn reconnect_interval_has_passed(&self, now: u64) -> bool {
        if self.connection_attempt_time == 0 {
            return true;
        }
        let step = (self.connection_failure_count as usize).min(RECONNECT_BACKOFF_SECS.len() - 1);
        now.saturating_sub(self.connection_attempt_time) >= RECONNECT_BACKOFF_SECS[step]
    }

    // --- blocklist memoization

    /// Whether the address is blocklisted, memoized until the blocklist
    /// changes.
    pub fn is_blocklisted(&mut self, session: &dyn Session) -> bool {
        if let Some(value) = self.blocklisted {
            return value;
        }
        let value = session.address_is_blocked(self.listen_address);
        self.blocklisted = Some(value);
        value
    }

    pub fn set_blocklisted_dirty(&mut self) {
        self.blocklisted = None;
    }

    // --- graveyard bookkeeping

    pub fn displaced_at(&self) -> Option<u64> {
        self.displaced_at
    }

    pub fn set_displaced(&mut self, now: u64) {
        self.displaced_at = Some(now);
    }

    // --- merging and ranking

    /// Folds another record's history into this one; used when two pool
    /// entries are discovered to describe the same peer.
    pub fn merge(&mut self, other: &PeerInfo) {
        self.pex_flags.merge(other.pex_flags);
        self.from_best = self.from_best.min(other.from_best);
        self.is_seed |= other.is_seed;
        self.is_banned |= other.is_banned;
        self.connection_failure_count = self
            .connection_failure_count
            .min(other.connection_failure_count);
        self.connection_attempt_time = self
            .connection_attempt_time
            .max(other.connection_attempt_time);
        self.latest_piece_data_time = self.latest_piece_data_time.max(other.latest_piece_data_time);
        if self.is_connectable.is_none() {
            self.is_connectable = other.is_connectable;
        }
        if self.supports_utp.is_none() {
            self.supports_utp = other.supports_utp;
        }
        self.blocklisted = None;
    }

    /// Ranking key: smaller compares better.
    ///
    /// Peers that sent piece data recently rank first, then the more
    /// trusted source, then the cleaner connection history.
    pub fn usefulness_key(&self) -> UsefulnessKey {
        (
            Reverse(self.latest_piece_data_time),
            self.from_best,
            self.connection_failure_count,
        )
    }
}

/// See [`PeerInfo::usefulness_key`].
pub type UsefulnessKey = (Reverse<u64>, PeerSource, u32);

#[cfg(test)]
mod tests {
    use super::*;

    fn info(from: PeerSource) -> PeerInfo {
        PeerInfo::new("1.2.3.4".parse().unwrap(), Some(6881), PexFlags::default(), from)
    }

    #[test]
    fn test_found_at_keeps_best_source() {
        let mut i = info(PeerSource::Pex);
        i.found_at(PeerSource::Tracker);
        assert_eq!(i.from_best(), PeerSource::Tracker);
        assert_eq!(i.from_first(), PeerSource::Pex);

        i.found_at(PeerSource::Resume);
        assert_eq!(i.from_best(), PeerSource::Tracker);
    }

    #[test]
    fn test_reconnect_backoff_grows() {
        let mut i = info(PeerSource::Tracker);
        assert!(i.reconnect_interval_has_passed(0));

        i.set_connection_attempt_time(1_000);
        assert!(!i.reconnect_interval_has_passed(1_005));
        assert!(i.reconnect_interval_has_passed(1_010));

        i.on_connection_failed();
        assert!(!i.reconnect_interval_has_passed(1_010));
        assert!(i.reconnect_interval_has_passed(1_060));

        for _ in 0..20 {
            i.on_connection_failed();
        }
        assert!(!i.reconnect_interval_has_passed(1_000 + 3_599));
        assert!(i.reconnect_interval_has_passed(1_000 + 3_600));
    }

    #[test]
    fn test_usefulness_prefers_recent_piece_data() {
        let mut a = info(PeerSource::Pex);
        let mut b = info(PeerSource::Tracker);

        // piece data wins over source trust
        a.set_latest_piece_data_time(100);
        assert!(a.usefulness_key() < b.usefulness_key());

        // tie on piece data: source decides
        b.set_latest_piece_data_time(100);
        assert!(b.usefulness_key() < a.usefulness_key());

        // tie on both: failure count decides
        let mut c = info(PeerSource::Tracker);
        c.set_latest_piece_data_time(100);
        c.on_connection_failed();
        assert!(b.usefulness_key() < c.usefulness_key());
    }

    #[test]
    fn test_usefulness_is_transitive() {
        let mut infos = Vec::new();
        for t in [0u64, 50, 100] {
            for from in [PeerSource::Tracker, PeerSource::Pex] {
                for fails in [0u32, 3] {
                    let mut i = info(from);
                    i.set_latest_piece_data_time(t);
                    for _ in 0..fails {
                        i.on_connection_failed();
                    }
                    infos.push(i);
                }
            }
        }

        let keys: Vec<_> = infos.iter().map(|i| i.usefulness_key()).collect();
        for a in &keys {
            for b in &keys {
                for c in &keys {
                    if a < b && b < c {
                        assert!(a < c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_merge_folds_history() {
        let mut winner = info(PeerSource::Pex);
        winner.set_connection_attempt_time(50);
        winner.on_connection_failed();
        winner.on_connection_failed();

        let mut loser = info(PeerSource::Tracker);
        loser.set_latest_piece_data_time(200);
        loser.set_connection_attempt_time(100);
        loser.on_connection_failed();
        loser.ban();

        winner.merge(&loser);
        assert_eq!(winner.from_best(), PeerSource::Tracker);
        assert_eq!(winner.latest_piece_data_time(), 200);
        assert_eq!(winner.connection_attempt_time(), 100);
        assert_eq!(winner.connection_failure_count(), 1);
        assert!(winner.is_banned());
    }

    #[test]
    fn test_pex_flags_update_capabilities() {
        let mut i = info(PeerSource::Pex);
        assert_eq!(i.supports_utp(), None);
        assert!(!i.is_seed());

        i.set_pex_flags(PexFlags {
            seed: true,
            utp: true,
            ..Default::default()
        });
        assert_eq!(i.supports_utp(), Some(true));
        assert!(i.is_seed());
    }
}
