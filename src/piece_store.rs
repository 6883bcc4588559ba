//! The piece store: the single shared mutable resource of a download.
//!
//! Every peer session mutates the same [`PieceStore`] through
//! [`PieceStore::try_claim`], [`PieceStore::release`], and
//! [`PieceStore::complete`] — together these three calls are the entire
//! extent of cross-session synchronization (§4.2, §5 of the design). The
//! store holds one [`std::sync::Mutex`]; no operation performs I/O while
//! holding it, so there is no risk of a session blocking another session's
//! progress for longer than a few tagged-array mutations.

use std::sync::Mutex;

use crate::{error::*, PieceIndex};

/// The state of a single piece, one per index in `[0, total_pieces)`.
///
/// The only legal transitions are `Missing -> Claimed`, `Claimed -> Missing`
/// and `Claimed -> Completed`; `Completed` is terminal. See
/// [`PieceStore::try_claim`], [`PieceStore::release`], and
/// [`PieceStore::complete`].
#[derive(Clone, Debug, PartialEq)]
enum PieceState {
    /// No peer session currently owns this piece.
    Missing,
    /// Some peer session holds the exclusive right to fetch this piece.
    Claimed,
    /// The piece has been downloaded and its hash verified.
    Completed(Vec<u8>),
}

/// Tracks the ownership and completion state of every piece in a download.
///
/// Represented as a single tagged array rather than three separate sets
/// (missing/claimed/completed) or maps, so there is no three-way-consistency
/// invariant to maintain between them: each index has exactly one state at
/// all times, by construction.
#[derive(Debug)]
pub struct PieceStore {
    pieces: Mutex<Vec<PieceState>>,
    total_pieces: usize,
}

impl PieceStore {
    /// Creates a piece store with every index initialized to `Missing`.
    pub fn new(total_pieces: usize) -> Self {
        Self {
            pieces: Mutex::new(vec![PieceState::Missing; total_pieces]),
            total_pieces,
        }
    }

    /// The total number of pieces this store was created for.
    pub fn total_pieces(&self) -> usize {
        self.total_pieces
    }

    /// Attempts to claim `index` exclusively.
    ///
    /// Returns `true` and transitions `Missing -> Claimed` if no other
    /// session currently owns or has completed the piece; returns `false`
    /// without any state change otherwise.
    pub fn try_claim(&self, index: PieceIndex) -> bool {
        let mut pieces = self.pieces.lock().unwrap();
        match pieces[index] {
            PieceState::Missing => {
                pieces[index] = PieceState::Claimed;
                true
            }
            PieceState::Claimed | PieceState::Completed(_) => false,
        }
    }

    /// Releases a claim on `index`, returning it to `Missing`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not currently `Claimed` — releasing a piece
    /// that was never claimed (or already completed) is a caller bug, not a
    /// recoverable condition (§4.2: "fatal if Missing").
    pub fn release(&self, index: PieceIndex) {
        let mut pieces = self.pieces.lock().unwrap();
        match pieces[index] {
            PieceState::Claimed => pieces[index] = PieceState::Missing,
            PieceState::Completed(_) => {
                // no-op: a piece that another session already completed
                // between this session's claim-miss and its release is not
                // an error, just a race we lost.
            }
            PieceState::Missing => {
                panic!("double-release of piece {}", index)
            }
        }
    }

    /// Marks `index` as completed with the given verified bytes.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not currently `Claimed` by the caller (this
    /// store has no notion of claim ownership beyond exclusivity, so
    /// calling `complete` on a piece the caller never claimed, or one
    /// that's already `Completed`, indicates a caller bug).
    pub fn complete(&self, index: PieceIndex, bytes: Vec<u8>) {
        let mut pieces = self.pieces.lock().unwrap();
        match pieces[index] {
            PieceState::Claimed => pieces[index] = PieceState::Completed(bytes),
            PieceState::Completed(_) => {
                panic!("double-complete of piece {}", index)
            }
            PieceState::Missing => {
                panic!("complete called on unclaimed piece {}", index)
            }
        }
    }

    /// Returns the indices currently neither `Claimed` nor `Completed`.
    pub fn missing_indices(&self) -> Vec<PieceIndex> {
        let pieces = self.pieces.lock().unwrap();
        pieces
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, PieceState::Missing))
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns the indices currently `Completed`.
    pub fn snapshot_completed(&self) -> Vec<PieceIndex> {
        let pieces = self.pieces.lock().unwrap();
        pieces
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, PieceState::Completed(_)))
            .map(|(i, _)| i)
            .collect()
    }

    /// The number of pieces currently `Completed`.
    pub fn completed_count(&self) -> usize {
        let pieces = self.pieces.lock().unwrap();
        pieces
            .iter()
            .filter(|s| matches!(s, PieceState::Completed(_)))
            .count()
    }

    /// Whether every piece has been completed.
    pub fn is_done(&self) -> bool {
        self.completed_count() == self.total_pieces
    }

    /// Concatenates every piece's bytes in ascending index order.
    ///
    /// # Panics
    ///
    /// Panics if called before [`PieceStore::is_done`] is true.
    pub fn finalize(&self) -> Vec<u8> {
        let pieces = self.pieces.lock().unwrap();
        let mut out = Vec::with_capacity(
            pieces
                .iter()
                .map(|s| match s {
                    PieceState::Completed(b) => b.len(),
                    _ => 0,
                })
                .sum(),
        );
        for (index, piece) in pieces.iter().enumerate() {
            match piece {
                PieceState::Completed(bytes) => out.extend_from_slice(bytes),
                _ => panic!(
                    "finalize called before piece {} completed",
                    index
                ),
            }
        }
        out
    }

    /// Asserts the store reached completion, or returns the
    /// per-download-fatal [`Error::Incomplete`] otherwise.
    pub fn ensure_done(&self) -> Result<()> {
        let completed = self.completed_count();
        if completed == self.total_pieces {
            Ok(())
        } else {
            Err(Error::Incomplete {
                completed,
                total: self.total_pieces,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn claim_release_complete_lifecycle() {
        let store = PieceStore::new(3);
        assert!(store.try_claim(0));
        assert!(!store.try_claim(0), "second claim must fail");
        store.release(0);
        assert!(store.try_claim(0), "released piece is claimable again");
        store.complete(0, vec![1, 2, 3]);
        assert!(!store.try_claim(0), "completed piece can't be claimed");
        assert_eq!(store.completed_count(), 1);
        assert_eq!(store.snapshot_completed(), vec![0]);
    }

    #[test]
    #[should_panic(expected = "double-release")]
    fn release_on_missing_panics() {
        let store = PieceStore::new(1);
        store.release(0);
    }

    #[test]
    #[should_panic(expected = "double-complete")]
    fn complete_twice_panics() {
        let store = PieceStore::new(1);
        store.try_claim(0);
        store.complete(0, vec![]);
        store.complete(0, vec![]);
    }

    #[test]
    fn release_on_completed_is_noop() {
        let store = PieceStore::new(1);
        store.try_claim(0);
        store.complete(0, vec![9]);
        // a losing claimant's release after another session already
        // completed the piece must not panic
        store.release(0);
        assert_eq!(store.completed_count(), 1);
    }

    #[test]
    fn is_done_and_finalize() {
        let store = PieceStore::new(2);
        assert!(!store.is_done());
        store.try_claim(0);
        store.complete(0, vec![1, 2]);
        assert!(!store.is_done());
        store.try_claim(1);
        store.complete(1, vec![3, 4]);
        assert!(store.is_done());
        assert_eq!(store.finalize(), vec![1, 2, 3, 4]);
        assert!(store.ensure_done().is_ok());
    }

    #[test]
    fn ensure_done_reports_incomplete() {
        let store = PieceStore::new(2);
        store.try_claim(0);
        store.complete(0, vec![1]);
        match store.ensure_done() {
            Err(Error::Incomplete { completed, total }) => {
                assert_eq!(completed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn only_one_of_many_racing_claimants_wins() {
        let store = Arc::new(PieceStore::new(1));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || store.try_claim(0)));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn missing_indices_excludes_claimed_and_completed() {
        let store = PieceStore::new(3);
        store.try_claim(1);
        store.try_claim(2);
        store.complete(2, vec![]);
        assert_eq!(store.missing_indices(), vec![0]);
    }
}
