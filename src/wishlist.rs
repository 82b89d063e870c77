//! Block-request prioritization seam.
//!
//! Deciding *which* blocks to ask a peer for next is delegated to a
//! wishlist collaborator. The swarm exposes everything the prioritizer
//! needs through [`WishlistMediator`]: what can be requested, piece
//! shapes and priorities, and whether the download is in endgame (where
//! duplicate requests across peers become legal).

use crate::types::{BlockIndex, BlockSpan, PieceIndex, Priority};

/// The swarm-side view a [`Wishlist`] works against.
pub trait WishlistMediator {
    /// True if the block is still missing and not already requested from
    /// this peer.
    fn client_can_request_block(&self, block: BlockIndex) -> bool;

    /// True if the piece is wanted and the peer has it.
    fn client_can_request_piece(&self, piece: PieceIndex) -> bool;

    /// True once outstanding requests cover everything left to download.
    fn is_endgame(&self) -> bool;

    /// How many peers the block is currently requested from.
    fn count_active_requests(&self, block: BlockIndex) -> usize;

    /// How many blocks of the piece are still missing.
    fn count_missing_blocks(&self, piece: PieceIndex) -> usize;

    /// The block range covered by the piece.
    fn block_span(&self, piece: PieceIndex) -> BlockSpan;

    fn piece_count(&self) -> PieceIndex;

    fn priority(&self, piece: PieceIndex) -> Priority;

    fn is_sequential_download(&self) -> bool;
}

/// Picks the next block spans to request from a peer.
pub trait Wishlist: Send + Sync {
    fn next(&self, mediator: &dyn WishlistMediator, numwant: usize) -> Vec<BlockSpan>;
}
