use std::cmp::Ordering;

use rand::Rng as _;

use crate::constants::OPTIMISTIC_UNCHOKE_MULTIPLIER;
use crate::session::{Session, Torrent};
use crate::swarm::Swarm;
use crate::types::Direction;

#[derive(Debug, Clone, Copy)]
struct ChokeData {
    key: crate::requests::PeerKey,
    rate: u32,
    salt: u8,
    is_interested: bool,
    was_choked: bool,
    is_choked: bool,
}

impl ChokeData {
    // better first: higher rate, then already-unchoked, then salt
    fn compare(&self, other: &Self) -> Ordering {
        other
            .rate
            .cmp(&self.rate)
            .then_with(|| self.was_choked.cmp(&other.was_choked))
            .then_with(|| self.salt.cmp(&other.salt))
    }
}

/// The rate used to rank peers for reciprocation.
fn rate_bps(tor: &dyn Torrent, peer: &crate::peer::ConnectedPeer) -> u32 {
    if tor.is_done() {
        return peer.msgs.piece_speed_bps(Direction::Up);
    }

    // with a private torrent the window to share may be small, so count
    // both directions while still downloading
    if tor.is_private() {
        return peer
            .msgs
            .piece_speed_bps(Direction::Down)
            .saturating_add(peer.msgs.piece_speed_bps(Direction::Up));
    }

    peer.msgs.piece_speed_bps(Direction::Down)
}

/// Recomputes choke state for every connected peer.
///
/// The `upload_slots_per_torrent` fastest interested peers are unchoked;
/// when upstream bandwidth is already saturated, previous choke states
/// are preserved instead. One additional peer may be optimistically
/// unchoked regardless of its rate.
pub(crate) fn rechoke_uploads(swarm: &mut Swarm, session: &dyn Session) {
    let tor = swarm.tor.clone();
    let choke_all = !tor.client_can_upload();
    let is_maxed_out = tor.is_upload_maxed_out();

    // an optimistic unchoke is immune from rechoking for a few pulses
    if swarm.optimistic_unchoke_time_scaler > 0 {
        swarm.optimistic_unchoke_time_scaler -= 1;
    } else {
        swarm.optimistic = None;
    }

    let mut rng = rand::rng();
    let optimistic = swarm.optimistic;
    let mut choked: Vec<ChokeData> = Vec::with_capacity(swarm.peers.len());

    for peer in &mut swarm.peers {
        if peer.msgs.is_seed() {
            // choke seeds and partial seeds; we have nothing they want
            peer.msgs.set_choke(true);
        } else if choke_all {
            peer.msgs.set_choke(true);
        } else if Some(peer.key) != optimistic {
            choked.push(ChokeData {
                key: peer.key,
                rate: rate_bps(tor.as_ref(), peer),
                salt: rng.random(),
                is_interested: peer.msgs.peer_is_interested(),
                was_choked: peer.msgs.peer_is_choked(),
                is_choked: true,
            });
        }
    }

    choked.sort_unstable_by(ChokeData::compare);

    // unchoke the fastest interested peers up to the slot limit; faster
    // uninterested peers stay unchoked alongside them so a flip to
    // interested displaces the slowest reciprocated peer next pulse
    let upload_slots = session.upload_slots_per_torrent();
    let mut checked_choke_count = 0usize;
    let mut unchoked_interested = 0usize;

    for item in choked.iter_mut() {
        if unchoked_interested >= upload_slots {
            break;
        }
        item.is_choked = if is_maxed_out { item.was_choked } else { false };
        checked_choke_count += 1;
        if item.is_interested {
            unchoked_interested += 1;
        }
    }

    // optimistic unchoke
    if swarm.optimistic.is_none() && !is_maxed_out && checked_choke_count < choked.len() {
        let rand_pool: Vec<usize> = (checked_choke_count..choked.len())
            .filter(|&i| choked[i].is_interested)
            .collect();
        if !rand_pool.is_empty() {
            let i = rand_pool[rng.random_range(0..rand_pool.len())];
            choked[i].is_choked = false;
            swarm.optimistic = Some(choked[i].key);
            swarm.optimistic_unchoke_time_scaler = OPTIMISTIC_UNCHOKE_MULTIPLIER;
        }
    }

    for item in &choked {
        if let Some(peer) = swarm.find_peer_mut(item.key) {
            peer.msgs.set_choke(item.is_choked);
        }
    }
}

/// Declares interest in every peer that has at least one piece we still
/// want.
pub(crate) fn update_interest(swarm: &mut Swarm) {
    let tor = swarm.tor.clone();
    if tor.is_done() || !tor.client_can_download() {
        return;
    }
    if swarm.peers.is_empty() {
        return;
    }

    let n = tor.piece_count();
    let piece_is_interesting: Vec<bool> = (0..n)
        .map(|i| tor.piece_is_wanted(i) && !tor.has_piece(i))
        .collect();

    for peer in &mut swarm.peers {
        let interesting = peer.msgs.is_seed()
            || (0..n).any(|i| piece_is_interesting[i as usize] && peer.msgs.has_piece(i));
        peer.msgs.set_interested(interesting);
    }
}
