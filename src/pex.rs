//! Peer Exchange entries and the compact wire format ([BEP-11]).
//!
//! Peer addresses travel between clients in "compact" form: 6 bytes per
//! IPv4 peer (4 address + 2 port, big-endian) or 18 bytes per IPv6 peer
//! (16 + 2). An optional parallel `added.f` byte array carries one
//! capability flag byte per peer.
//!
//! # Examples
//!
//! ```
//! use rswarm::pex::{Pex, PexFlags};
//!
//! let peers = vec![
//!     Pex::new("192.168.1.100:6881".parse().unwrap()),
//!     Pex::with_flags(
//!         "10.0.0.1:51413".parse().unwrap(),
//!         PexFlags { seed: true, connectable: true, ..Default::default() },
//!     ),
//! ];
//!
//! let compact = Pex::to_compact_ipv4(&peers);
//! let flags = Pex::added_flags(&peers);
//! let decoded = Pex::from_compact_ipv4(&compact, Some(&flags));
//! assert_eq!(decoded, peers);
//! ```
//!
//! [BEP-11]: http://bittorrent.org/beps/bep_0011.html

use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, Bytes, BytesMut};

/// Bytes per compact IPv4 entry.
const COMPACT_V4_LEN: usize = 6;

/// Bytes per compact IPv6 entry.
const COMPACT_V6_LEN: usize = 18;

/// Capability flags gossiped alongside a PEX peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    /// Peer supports encrypted connections.
    pub encryption: bool,
    /// Peer is a seeder (has complete data).
    pub seed: bool,
    /// Peer supports uTP (micro Transport Protocol).
    pub utp: bool,
    /// Peer supports NAT hole punching.
    pub holepunch: bool,
    /// Peer accepts incoming connections.
    pub connectable: bool,
}

impl PexFlags {
    /// Decodes flags from a single `added.f` byte.
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: (b & 0x01) != 0,
            seed: (b & 0x02) != 0,
            utp: (b & 0x04) != 0,
            holepunch: (b & 0x08) != 0,
            connectable: (b & 0x10) != 0,
        }
    }

    /// Encodes flags to a single `added.f` byte.
    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.encryption {
            b |= 0x01;
        }
        if self.seed {
            b |= 0x02;
        }
        if self.utp {
            b |= 0x04;
        }
        if self.holepunch {
            b |= 0x08;
        }
        if self.connectable {
            b |= 0x10;
        }
        b
    }

    /// Merges another flag set into this one.
    pub fn merge(&mut self, other: PexFlags) {
        self.encryption |= other.encryption;
        self.seed |= other.seed;
        self.utp |= other.utp;
        self.holepunch |= other.holepunch;
        self.connectable |= other.connectable;
    }
}

/// A peer address learned through gossip, a tracker, or any other
/// address source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pex {
    /// The peer's listening socket address.
    pub addr: SocketAddr,
    /// Capability flags for this peer.
    pub flags: PexFlags,
}

impl Pex {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            flags: PexFlags::default(),
        }
    }

    pub fn with_flags(addr: SocketAddr, flags: PexFlags) -> Self {
        Self { addr, flags }
    }

    /// Decodes 6-byte-per-peer compact IPv4 entries.
    ///
    /// Exactly `data.len() / 6` entries are produced; a trailing partial
    /// entry is ignored. `added_f` is applied only when it carries
    /// exactly one byte per decoded peer.
    pub fn from_compact_ipv4(data: &[u8], added_f: Option<&[u8]>) -> Vec<Pex> {
        let n = data.len() / COMPACT_V4_LEN;
        let flags = added_f.filter(|f| f.len() == n);

        let mut peers = Vec::with_capacity(n);
        for i in 0..n {
            let chunk = &data[i * COMPACT_V4_LEN..(i + 1) * COMPACT_V4_LEN];
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            peers.push(Pex {
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                flags: flags.map_or_else(PexFlags::default, |f| PexFlags::from_byte(f[i])),
            });
        }

        peers
    }

    /// Decodes 18-byte-per-peer compact IPv6 entries.
    pub fn from_compact_ipv6(data: &[u8], added_f: Option<&[u8]>) -> Vec<Pex> {
        let n = data.len() / COMPACT_V6_LEN;
        let flags = added_f.filter(|f| f.len() == n);

        let mut peers = Vec::with_capacity(n);
        for i in 0..n {
            let chunk = &data[i * COMPACT_V6_LEN..(i + 1) * COMPACT_V6_LEN];
            let mut ip_bytes = [0u8; 16];
            ip_bytes.copy_from_slice(&chunk[..16]);
            let ip = Ipv6Addr::from(ip_bytes);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            peers.push(Pex {
                addr: SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
                flags: flags.map_or_else(PexFlags::default, |f| PexFlags::from_byte(f[i])),
            });
        }

        peers
    }

    /// Encodes the IPv4 entries of `peers` in compact form.
    pub fn to_compact_ipv4(peers: &[Pex]) -> Bytes {
        let mut buf = BytesMut::with_capacity(peers.len() * COMPACT_V4_LEN);
        for peer in peers {
            if let SocketAddr::V4(addr) = peer.addr {
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
        }
        buf.freeze()
    }

    /// Encodes the IPv6 entries of `peers` in compact form.
    pub fn to_compact_ipv6(peers: &[Pex]) -> Bytes {
        let mut buf = BytesMut::with_capacity(peers.len() * COMPACT_V6_LEN);
        for peer in peers {
            if let SocketAddr::V6(addr) = peer.addr {
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
        }
        buf.freeze()
    }

    /// Encodes one `added.f` flag byte per peer.
    pub fn added_flags(peers: &[Pex]) -> Bytes {
        let mut buf = BytesMut::with_capacity(peers.len());
        for peer in peers {
            buf.put_u8(peer.flags.to_byte());
        }
        buf.freeze()
    }
}

// Canonical wire ordering: by address, then port, then flags.
impl Ord for Pex {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.addr.ip(), self.addr.port(), self.flags.to_byte()).cmp(&(
            other.addr.ip(),
            other.addr.port(),
            other.flags.to_byte(),
        ))
    }
}

impl PartialOrd for Pex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
