//! Core identifiers and index types shared across the crate.

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Index of a piece within a torrent.
pub type PieceIndex = u32;

/// Index of a 16 KiB block within a torrent.
pub type BlockIndex = u64;

/// A half-open range of blocks `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSpan {
    pub begin: BlockIndex,
    pub end: BlockIndex,
}

impl BlockSpan {
    pub fn new(begin: BlockIndex, end: BlockIndex) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

/// Session-unique torrent identifier.
///
/// Used instead of references in caches that outlive a pulse, since a
/// torrent may be removed between pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentId(pub u64);

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A SHA-1 torrent info hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A 20-byte peer ID from the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

/// Transfer direction, relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to peer.
    Up,
    /// Peer to client.
    Down,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Up => 0,
            Direction::Down => 1,
        }
    }
}

/// Torrent (or piece) priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Rank used in candidate scoring; smaller is better.
    pub fn rank(self) -> u64 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Preferred wire encryption for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    #[default]
    ClearPreferred,
    EncryptionPreferred,
    EncryptionRequired,
}

/// IP family selector for peer list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn wallclock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
