use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng as _;

use crate::constants::{OUTBOUND_CANDIDATE_LIST_CAPACITY, RECENTLY_STARTED_SECS};
use crate::peer_info::PeerInfo;
use crate::session::{Session, Torrent};
use crate::swarm::Swarm;
use crate::types::TorrentId;

/// Is this pool entry someone we would want to dial right now?
pub(crate) fn is_peer_candidate(
    tor: &dyn Torrent,
    in_use: bool,
    info: &mut PeerInfo,
    session: &dyn Session,
    now: u64,
) -> bool {
    // have we already tried and failed to connect?
    if info.is_connectable() == Some(false) {
        return false;
    }

    // not if we're both seeds
    if tor.is_done() && info.is_seed() {
        return false;
    }

    // not if a connection or handshake already holds it
    if in_use {
        return false;
    }

    // not if we just tried them
    if !info.reconnect_interval_has_passed(now) {
        return false;
    }

    if info.is_blocklisted(session) {
        return false;
    }

    if info.is_banned() {
        return false;
    }

    true
}

const fn add_val_to_key(key: u64, width: u32, val: u64) -> u64 {
    (key << width) | val
}

/// Packs the dialing preference into one 64-bit key; smaller is better.
pub(crate) fn score(tor: &dyn Torrent, info: &PeerInfo, salt: u8, now: u64) -> u64 {
    let mut key = 0u64;

    // prefer peers we've connected to, or never tried, over failures
    key = add_val_to_key(key, 1, (info.connection_failure_count() != 0) as u64);

    // prefer the one attempted least recently, cycling through the pool
    key = add_val_to_key(key, 32, info.connection_attempt_time() as u32 as u64);

    // prefer higher-priority torrents
    key = add_val_to_key(key, 4, tor.priority().rank());

    // prefer recently-started torrents
    let recent = now.saturating_sub(tor.start_date()) < RECENTLY_STARTED_SECS;
    key = add_val_to_key(key, 1, !recent as u64);

    // prefer torrents we're still downloading
    key = add_val_to_key(key, 1, tor.is_done() as u64);

    // prefer peers known to be connectable
    key = add_val_to_key(key, 1, (info.is_connectable() != Some(true)) as u64);

    // prefer peers we might be able to upload to
    key = add_val_to_key(key, 1, info.is_seed() as u64);

    // prefer more trusted sources
    key = add_val_to_key(key, 4, info.from_best().index() as u64);

    // salt breaks ties so dialing doesn't go in lock-step
    add_val_to_key(key, 8, salt as u64)
}

/// Builds the bounded outbound-candidate list across every running
/// swarm, best candidate at the back for cheap popping.
pub(crate) fn generate(
    swarms: &mut HashMap<TorrentId, Swarm>,
    session: &dyn Session,
    now: u64,
) -> Vec<(TorrentId, SocketAddr)> {
    let mut rng = rand::rng();
    let mut candidates: Vec<(u64, TorrentId, SocketAddr)> = Vec::new();

    for (&id, swarm) in swarms.iter_mut() {
        if !swarm.is_running {
            continue;
        }
        let tor = swarm.tor.clone();
        let seeding = tor.is_done();

        // if everyone is a seed and pex is off, there is nobody to meet
        if seeding && swarm.is_all_seeds() && !tor.allows_pex() {
            continue;
        }

        if swarm.peer_count() >= tor.peer_limit() {
            continue;
        }

        if seeding && tor.is_upload_maxed_out() {
            continue;
        }

        let pool: Vec<_> = swarm
            .connectable_pool
            .iter()
            .map(|(addr, info)| (*addr, info.clone()))
            .collect();
        for (addr, info) in pool {
            let mut guard = info.lock();
            let in_use = swarm.peer_is_in_use(&guard);
            if is_peer_candidate(tor.as_ref(), in_use, &mut guard, session, now) {
                candidates.push((score(tor.as_ref(), &guard, rng.random(), now), id, addr));
            }
        }
    }

    // keep only the best, then reverse so the best sits at the back
    candidates.sort_unstable_by_key(|&(score, _, _)| score);
    candidates.truncate(OUTBOUND_CANDIDATE_LIST_CAPACITY);
    candidates.reverse();
    candidates
        .into_iter()
        .map(|(_, id, addr)| (id, addr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTorrent;
    use crate::peer_info::{PeerSource, PeerInfo};
    use crate::pex::PexFlags;

    fn info() -> PeerInfo {
        PeerInfo::new(
            "1.2.3.4".parse().unwrap(),
            Some(6881),
            PexFlags::default(),
            PeerSource::Tracker,
        )
    }

    #[test]
    fn test_score_prefers_clean_history() {
        let tor = MockTorrent::new(1, 8, 4);
        let clean = info();
        let mut failed = info();
        failed.on_connection_failed();

        assert!(score(&tor, &clean, 0, 1000) < score(&tor, &failed, 0, 1000));
    }

    #[test]
    fn test_score_round_robins_on_attempt_time() {
        let tor = MockTorrent::new(1, 8, 4);
        let mut older = info();
        older.set_connection_attempt_time(100);
        let mut newer = info();
        newer.set_connection_attempt_time(200);

        assert!(score(&tor, &older, 255, 1000) < score(&tor, &newer, 0, 1000));
    }

    #[test]
    fn test_score_prefers_non_seeds() {
        let tor = MockTorrent::new(1, 8, 4);
        let leecher = info();
        let mut seed = info();
        seed.set_seed();

        assert!(score(&tor, &leecher, 0, 1000) < score(&tor, &seed, 0, 1000));
    }

    #[test]
    fn test_salt_only_breaks_ties() {
        let tor = MockTorrent::new(1, 8, 4);
        let a = info();
        let b = info();

        let lo = score(&tor, &a, 0, 1000);
        let hi = score(&tor, &b, 255, 1000);
        assert!(lo < hi);
        assert_eq!(hi - lo, 255);
    }
}
