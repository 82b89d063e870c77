use thiserror::Error;

/// Errors returned by the public peer-manager surface.
#[derive(Debug, Error)]
pub enum Error {
    /// The torrent id is not registered with the manager.
    #[error("unknown torrent")]
    UnknownTorrent,

    /// A swarm already exists for this torrent.
    #[error("torrent already registered")]
    DuplicateTorrent,

    /// The peer key does not name a connected peer or webseed.
    #[error("unknown peer")]
    UnknownPeer,
}

pub type Result<T> = std::result::Result<T, Error>;
