//! Tuning parameters for the peer manager.
//!
//! This module contains the constants used throughout the swarm and peer
//! management code: pulse periods, connection throttles, idle-disconnect
//! thresholds, and reputation parameters.
//!
//! These values follow the defaults of mature clients (Transmission,
//! qBittorrent, libtorrent) unless noted otherwise.

use std::time::Duration;

// ============================================================================
// Pulse periods
// ============================================================================

/// How often peers are pumped, bandwidth is allocated, and the
/// reconnect/reap pass runs.
pub const BANDWIDTH_PERIOD: Duration = Duration::from_millis(500);

/// How often choke/unchoke decisions are recomputed.
pub const RECHOKE_PERIOD: Duration = Duration::from_secs(10);

/// Shortened rechoke delay used right after a torrent starts.
pub const RECHOKE_SOON_PERIOD: Duration = Duration::from_millis(100);

/// How often timed-out block requests are cancelled.
pub const REFILL_UPKEEP_PERIOD: Duration = Duration::from_secs(10);

// ============================================================================
// Requests
// ============================================================================

/// Standard block size (16 KiB).
pub const BLOCK_SIZE: u64 = 16384;

/// How long an outstanding block request may linger before it is
/// cancelled and re-eligible elsewhere.
pub const REQUEST_TTL_SECS: u64 = 90;

// ============================================================================
// Outbound dialing
// ============================================================================

/// Hard cap on outbound connection attempts, to avoid overloading
/// consumer routers with SYN floods.
pub const MAX_CONNECTIONS_PER_SECOND: usize = 18;

/// Outbound attempts per bandwidth pulse (18/s over a 500 ms pulse).
pub const MAX_CONNECTIONS_PER_PULSE: usize =
    MAX_CONNECTIONS_PER_SECOND * BANDWIDTH_PERIOD.as_millis() as usize / 1000;

/// Building the candidate list is expensive, so it is cached across
/// pulses; this is roughly four pulses worth of dials.
pub const OUTBOUND_CANDIDATE_LIST_CAPACITY: usize = MAX_CONNECTIONS_PER_PULSE * 4;

/// Leave 5% of the session connection slots free for incoming peers.
pub const INCOMING_RESERVE_RATIO: f64 = 0.95;

/// A torrent started within this window gets dialing priority.
pub const RECENTLY_STARTED_SECS: u64 = 120;

// ============================================================================
// Idle disconnect
// ============================================================================

/// When the swarm is near its peer limit, idle peers are kept this long.
pub const MIN_UPLOAD_IDLE_SECS: u64 = 60;

/// When the swarm has few peers, idle peers are kept this long.
pub const MAX_UPLOAD_IDLE_SECS: u64 = 60 * 5;

/// Seed-to-seed connections are kept alive this long for PEX gossip.
pub const SEED_IDLE_SECS: u64 = 30;

// ============================================================================
// Choking
// ============================================================================

/// An optimistically unchoked peer is immune from rechoking for this
/// many rechoke pulses.
pub const OPTIMISTIC_UNCHOKE_MULTIPLIER: u8 = 4;

// ============================================================================
// Reputation
// ============================================================================

/// Bad pieces a peer may contribute to before being banned.
pub const MAX_BAD_PIECES_PER_PEER: u8 = 5;

/// Reconnect backoff, indexed by consecutive connection failures and
/// saturating at the last entry.
pub const RECONNECT_BACKOFF_SECS: [u64; 7] = [10, 60, 180, 300, 600, 1200, 3600];

/// Window over which per-peer block and cancel counters are kept.
pub const TRANSFER_HISTORY_SECS: u64 = 60;

/// How long a displaced pool entry is kept around so its ban state and
/// counters survive a port collision.
pub const GRAVEYARD_TTL_SECS: u64 = 3600;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connections_per_pulse() {
        assert_eq!(MAX_CONNECTIONS_PER_PULSE, 9);
        assert_eq!(OUTBOUND_CANDIDATE_LIST_CAPACITY, 36);
    }

    #[test]
    fn test_backoff_is_ascending() {
        for pair in RECONNECT_BACKOFF_SECS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
