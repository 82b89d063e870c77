//! Handshake admission interfaces.
//!
//! The handshake state machine itself (plaintext and MSE/obfuscated) is
//! an external collaborator. The peer manager only tracks in-flight
//! attempts for deduplication, feeds the machine what it needs through a
//! [`HandshakeMediator`], and consumes a [`HandshakeResult`] when the
//! attempt settles.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng as _;

use crate::peer::PeerIo;
use crate::types::{InfoHash, PeerId, TorrentId};

/// An in-flight handshake attempt.
///
/// The handle is held in a table keyed by socket address; dropping it
/// aborts the attempt.
pub trait Handshake: Send {}

/// What the handshake machine learned by the time it settled.
pub struct HandshakeResult {
    pub io: Arc<dyn PeerIo>,
    pub peer_id: Option<PeerId>,
    pub is_connected: bool,
    pub read_anything_from_peer: bool,
}

/// Torrent facts the handshake machine needs to accept or reject a peer.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub info_hash: InfoHash,
    pub client_peer_id: PeerId,
    pub id: TorrentId,
    pub is_done: bool,
}

/// The client-side knowledge a handshake consults; implemented by the
/// peer manager.
pub trait HandshakeMediator: Send + Sync {
    fn torrent(&self, info_hash: &InfoHash) -> Option<TorrentInfo>;

    fn torrent_from_obfuscated(&self, obfuscated_hash: &InfoHash) -> Option<TorrentInfo>;

    fn allows_dht(&self) -> bool;

    fn allows_tcp(&self) -> bool;

    /// Remember that µTP did not work for this peer so the next dial
    /// falls back to TCP.
    fn set_utp_failed(&self, info_hash: &InfoHash, addr: SocketAddr);
}

/// Fills the front of `buf` with up to `maxlen` random padding bytes and
/// returns how many were written. Obfuscated handshakes use this to vary
/// their on-wire length.
pub fn pad(buf: &mut [u8], maxlen: usize) -> usize {
    let mut rng = rand::rng();
    let len = rng.random_range(0..=maxlen.min(buf.len()));
    rng.fill(&mut buf[..len]);
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_respects_bounds() {
        let mut buf = [0u8; 64];
        for _ in 0..50 {
            let len = pad(&mut buf, 16);
            assert!(len <= 16);
        }
        let len = pad(&mut buf, 1024);
        assert!(len <= buf.len());
    }
}
