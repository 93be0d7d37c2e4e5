//! Piece/block inventory: the single source of truth for which pieces are
//! complete, which blocks of an in-flight piece are pending/requested, and
//! hash verification of finished pieces. Owned exclusively by the scheduler
//! task (see `scheduler.rs`); peer connections never touch it directly.

use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use super::bitfield::Bitfield;
use super::metainfo::{Metainfo, BLOCK_SIZE};

/// Number of pieces remaining at or below which end-game mode activates,
/// allowing the same outstanding block to be requested from multiple peers.
pub const ENDGAME_REMAINING_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: usize,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block was recorded; its piece is not yet complete.
    Accepted,
    /// This was the last missing block and the piece's hash matched; carries
    /// the piece's verified bytes for the caller to hand to the writer.
    PieceCompleted(usize, Vec<u8>),
    /// This was the last missing block but the piece's hash did not match;
    /// the piece has been reset to `Missing` and will be re-offered.
    HashMismatch(usize),
    /// The block didn't correspond to any outstanding piece, or the piece
    /// was already complete — a harmless duplicate (common in end-game).
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub complete_pieces: usize,
    pub total_pieces: usize,
    pub bytes_complete: u64,
    pub bytes_total: u64,
}

#[derive(Debug)]
enum PieceState {
    Missing,
    InFlight(InFlightPiece),
    Complete,
}

#[derive(Debug)]
struct InFlightPiece {
    buffer: Vec<u8>,
    /// Offsets of blocks already written into `buffer`.
    received: Vec<bool>,
    /// Offsets currently out on request to some peer (baseline: at most one
    /// outstanding holder per offset; in end-game this set is bypassed for
    /// selection purposes but still recorded for bookkeeping).
    requested: std::collections::HashSet<u32>,
    received_count: usize,
}

impl InFlightPiece {
    fn new(len: u64, block_count: u32) -> Self {
        Self {
            buffer: vec![0u8; len as usize],
            received: vec![false; block_count as usize],
            requested: std::collections::HashSet::new(),
            received_count: 0,
        }
    }
}

pub struct Inventory {
    metainfo: Arc<Metainfo>,
    state: Vec<PieceState>,
    /// Candidate order pieces are offered in; sequential by default. See
    /// `SPEC_FULL.md` §9: rarest-first can be dropped in by reordering this.
    candidate_order: Vec<usize>,
    complete_count: usize,
}

impl Inventory {
    pub fn new(metainfo: Arc<Metainfo>) -> Self {
        let count = metainfo.piece_count();
        Self {
            metainfo,
            state: (0..count).map(|_| PieceState::Missing).collect(),
            candidate_order: (0..count).collect(),
            complete_count: 0,
        }
    }

    pub fn total_pieces(&self) -> usize {
        self.metainfo.piece_count()
    }

    pub fn have(&self, index: usize) -> bool {
        matches!(self.state.get(index), Some(PieceState::Complete))
    }

    pub fn is_complete(&self) -> bool {
        self.complete_count == self.total_pieces()
    }

    fn is_endgame(&self) -> bool {
        self.total_pieces().saturating_sub(self.complete_count) <= ENDGAME_REMAINING_THRESHOLD
    }

    /// Selects the next block to request from a peer advertising
    /// `peer_bitfield`. Sequential by piece index among pieces the peer has
    /// and we don't; block offsets within a piece are handed out in order.
    pub fn next_request(&mut self, peer_bitfield: &Bitfield) -> Option<BlockRequest> {
        let endgame = self.is_endgame();
        let order = self.candidate_order.clone();
        for i in order {
            if self.have(i) || !peer_bitfield.has(i) {
                continue;
            }
            let piece_len = self.metainfo.piece_length_at(i);
            let block_count = self.metainfo.block_count(i);

            if matches!(self.state[i], PieceState::Missing) {
                self.state[i] = PieceState::InFlight(InFlightPiece::new(piece_len, block_count));
            }

            let PieceState::InFlight(piece) = &mut self.state[i] else {
                continue;
            };

            for block_idx in 0..block_count {
                if piece.received[block_idx as usize] {
                    continue;
                }
                let offset = block_idx * BLOCK_SIZE;
                if !endgame && piece.requested.contains(&offset) {
                    continue;
                }
                piece.requested.insert(offset);
                let length = block_length(piece_len, offset, block_idx, block_count);
                return Some(BlockRequest {
                    piece: i,
                    offset,
                    length,
                });
            }
        }
        None
    }

    /// Records a received block. See `BlockOutcome` for what the caller
    /// should do next.
    pub fn on_block(&mut self, piece: usize, offset: u32, bytes: &[u8]) -> BlockOutcome {
        let Some(state) = self.state.get_mut(piece) else {
            return BlockOutcome::Stale;
        };
        let PieceState::InFlight(in_flight) = state else {
            return BlockOutcome::Stale;
        };

        let block_idx = (offset / BLOCK_SIZE) as usize;
        if block_idx >= in_flight.received.len() {
            return BlockOutcome::Stale;
        }
        let start = offset as usize;
        let end = start + bytes.len();
        if end > in_flight.buffer.len() {
            warn!(piece, offset, "block write would overrun piece buffer");
            return BlockOutcome::Stale;
        }

        in_flight.requested.remove(&offset);
        if in_flight.received[block_idx] {
            // Duplicate delivery (end-game, or a retransmit); ignore.
            return BlockOutcome::Stale;
        }
        in_flight.buffer[start..end].copy_from_slice(bytes);
        in_flight.received[block_idx] = true;
        in_flight.received_count += 1;

        if in_flight.received_count < in_flight.received.len() {
            return BlockOutcome::Accepted;
        }

        // Piece is fully received: verify and finalize.
        let PieceState::InFlight(in_flight) = std::mem::replace(state, PieceState::Missing) else {
            unreachable!()
        };
        let expected = self
            .metainfo
            .piece_hash(piece)
            .expect("piece index bounds already checked");
        let mut hasher = Sha1::new();
        hasher.update(&in_flight.buffer);
        let actual: [u8; 20] = hasher.finalize().into();

        if &actual == expected {
            debug!(piece, "piece hash verified");
            self.state[piece] = PieceState::Complete;
            self.complete_count += 1;
            BlockOutcome::PieceCompleted(piece, in_flight.buffer)
        } else {
            warn!(piece, "piece hash mismatch, resetting");
            self.state[piece] = PieceState::Missing;
            BlockOutcome::HashMismatch(piece)
        }
    }

    /// Releases previously-issued block requests back to pending. Used when
    /// a peer disconnects or a request deadline expires.
    pub fn cancel(&mut self, requests: &[BlockRequest]) {
        for req in requests {
            if let Some(PieceState::InFlight(piece)) = self.state.get_mut(req.piece) {
                piece.requested.remove(&req.offset);
            }
        }
    }

    pub fn progress(&self) -> Progress {
        let bytes_complete = (0..self.total_pieces())
            .filter(|&i| self.have(i))
            .map(|i| self.metainfo.piece_length_at(i))
            .sum();
        Progress {
            complete_pieces: self.complete_count,
            total_pieces: self.total_pieces(),
            bytes_complete,
            bytes_total: self.metainfo.total_length(),
        }
    }
}

fn block_length(piece_len: u64, offset: u32, block_idx: u32, block_count: u32) -> u32 {
    if block_idx + 1 == block_count {
        (piece_len - offset as u64) as u32
    } else {
        BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::FileLayout;

    fn metainfo_with(piece_length: u64, pieces: Vec<[u8; 20]>, total: u64) -> Arc<Metainfo> {
        Arc::new(Metainfo {
            announce: "http://tr".into(),
            announce_list: vec![],
            comment: None,
            info_hash: [0; 20],
            piece_length,
            pieces,
            layout: FileLayout::Single {
                name: "f".into(),
                length: total,
            },
        })
    }

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn completes_single_block_piece_on_correct_hash() {
        let data = vec![b'A'; 16384];
        let meta = metainfo_with(16384, vec![hash_of(&data)], 16384);
        let mut inv = Inventory::new(meta);
        let mut bf = Bitfield::empty(1);
        bf.set(0);

        let req = inv.next_request(&bf).unwrap();
        assert_eq!(req, BlockRequest { piece: 0, offset: 0, length: 16384 });
        assert_eq!(inv.next_request(&bf), None, "offset already requested, baseline mode");

        let outcome = inv.on_block(0, 0, &data);
        assert_eq!(outcome, BlockOutcome::PieceCompleted(0, data));
        assert!(inv.have(0));
        assert!(inv.is_complete());
    }

    #[test]
    fn hash_mismatch_resets_piece_for_reoffer() {
        let data = vec![b'A'; 16384];
        let wrong = vec![b'B'; 16384];
        let meta = metainfo_with(16384, vec![hash_of(&data)], 16384);
        let mut inv = Inventory::new(meta);
        let mut bf = Bitfield::empty(1);
        bf.set(0);

        inv.next_request(&bf).unwrap();
        let outcome = inv.on_block(0, 0, &wrong);
        assert_eq!(outcome, BlockOutcome::HashMismatch(0));
        assert!(!inv.have(0));

        // Piece is offered again.
        let req = inv.next_request(&bf).unwrap();
        assert_eq!(req.piece, 0);
    }

    #[test]
    fn cancel_returns_block_to_pending() {
        let data = vec![b'A'; 16384];
        let meta = metainfo_with(16384, vec![hash_of(&data)], 16384);
        let mut inv = Inventory::new(meta);
        let mut bf = Bitfield::empty(1);
        bf.set(0);

        let req = inv.next_request(&bf).unwrap();
        assert_eq!(inv.next_request(&bf), None);
        inv.cancel(&[req]);
        let req2 = inv.next_request(&bf).unwrap();
        assert_eq!(req, req2);
    }

    #[test]
    fn no_duplicate_outstanding_requests_across_two_pieces() {
        let p0 = vec![b'A'; 16384];
        let p1 = vec![b'B'; 16384];
        let meta = metainfo_with(16384, vec![hash_of(&p0), hash_of(&p1)], 32768);
        let mut inv = Inventory::new(meta);
        let mut bf = Bitfield::empty(2);
        bf.set(0);
        bf.set(1);

        let r0 = inv.next_request(&bf).unwrap();
        let r1 = inv.next_request(&bf).unwrap();
        assert_ne!((r0.piece, r0.offset), (r1.piece, r1.offset));
        assert_eq!(inv.next_request(&bf), None);
    }

    #[test]
    fn progress_tracks_bytes_complete() {
        let data = vec![b'A'; 16384];
        let meta = metainfo_with(16384, vec![hash_of(&data)], 16384);
        let mut inv = Inventory::new(meta);
        let mut bf = Bitfield::empty(1);
        bf.set(0);
        inv.next_request(&bf);
        inv.on_block(0, 0, &data);

        let progress = inv.progress();
        assert_eq!(progress.bytes_complete, 16384);
        assert_eq!(progress.complete_pieces, 1);
        assert_eq!(progress.total_pieces, 1);
    }

    #[test]
    fn trailing_block_of_trailing_piece_is_short() {
        let full = vec![b'A'; 16384];
        let tail = vec![b'B'; 100];
        let meta = metainfo_with(16384, vec![hash_of(&full), hash_of(&tail)], 16384 + 100);
        let mut inv = Inventory::new(meta);
        let mut bf = Bitfield::empty(2);
        bf.set(1);
        let req = inv.next_request(&bf).unwrap();
        assert_eq!(req, BlockRequest { piece: 1, offset: 0, length: 100 });
    }
}
