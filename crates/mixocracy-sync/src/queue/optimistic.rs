// Optimistic vote deltas layered over fetched tallies.
//
// A delta is created when a vote/unvote is submitted, relative to the last
// fetched tally. Each later fetch either confirms it (the ledger now shows
// prior + delta) or overlays it for that render only. It ends exactly once:
// confirmed, reverted (the write failed), or expired after `max_polls`
// fetches without confirmation.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::ledger::{LedgerTrack, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimisticDelta {
    pub id: TrackId,
    /// +1 for a vote, -1 for an unvote.
    pub delta: i64,
    /// Tally fetched before the write was submitted.
    pub prior: u64,
    polls_left: u32,
}

impl OptimisticDelta {
    fn expected(&self) -> u64 {
        apply(self.prior, self.delta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaResolution {
    Confirmed,
    Expired,
}

fn apply(tally: u64, delta: i64) -> u64 {
    if delta >= 0 {
        tally.saturating_add(delta as u64)
    } else {
        tally.saturating_sub(delta.unsigned_abs())
    }
}

#[derive(Debug)]
pub struct OptimisticBook {
    deltas: HashMap<TrackId, OptimisticDelta>,
    max_polls: u32,
}

impl OptimisticBook {
    pub fn new(max_polls: u32) -> Self {
        Self {
            deltas: HashMap::new(),
            max_polls: max_polls.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn get(&self, id: TrackId) -> Option<&OptimisticDelta> {
        self.deltas.get(&id)
    }

    /// Record a pending write. A second write on the same track replaces the
    /// first, keeping the original prior so the net effect is tracked.
    pub fn add(&mut self, id: TrackId, delta: i64, prior: u64) {
        let entry = match self.deltas.get(&id) {
            Some(existing) => {
                let net = existing.delta + delta;
                if net == 0 {
                    debug!("Optimistic deltas on {} cancel out", id);
                    self.deltas.remove(&id);
                    return;
                }
                OptimisticDelta {
                    id,
                    delta: net,
                    prior: existing.prior,
                    polls_left: self.max_polls,
                }
            }
            None => OptimisticDelta {
                id,
                delta,
                prior,
                polls_left: self.max_polls,
            },
        };
        self.deltas.insert(id, entry);
    }

    /// The write failed. Returns true if a live delta was removed; false if
    /// it had already been confirmed or expired.
    pub fn revert(&mut self, id: TrackId) -> bool {
        match self.deltas.remove(&id) {
            Some(d) => {
                info!("Reverted optimistic delta {:+} on {}", d.delta, id);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.deltas.clear();
    }

    /// Account one fetch: confirm or age each delta, then overlay the
    /// survivors onto `rows`.
    pub fn reconcile(&mut self, rows: &mut [LedgerTrack]) -> Vec<(TrackId, DeltaResolution)> {
        let mut resolved = Vec::new();
        self.deltas.retain(|id, d| {
            let Some(row) = rows.iter().find(|r| r.id == *id) else {
                debug!("Track {} left the queue; dropping optimistic delta", id);
                resolved.push((*id, DeltaResolution::Expired));
                return false;
            };
            if row.votes == d.expected() {
                resolved.push((*id, DeltaResolution::Confirmed));
                return false;
            }
            d.polls_left = d.polls_left.saturating_sub(1);
            if d.polls_left == 0 {
                info!(
                    "Optimistic delta on {} expired (ledger shows {}, expected {})",
                    id,
                    row.votes,
                    d.expected()
                );
                resolved.push((*id, DeltaResolution::Expired));
                return false;
            }
            true
        });
        self.overlay(rows);
        resolved
    }

    /// Overlay live deltas onto freshly fetched rows without aging them.
    pub fn overlay(&self, rows: &mut [LedgerTrack]) {
        for row in rows.iter_mut() {
            if let Some(d) = self.deltas.get(&row.id) {
                row.votes = apply(row.votes, d.delta);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(tallies: &[(u64, u64)]) -> Vec<LedgerTrack> {
        tallies
            .iter()
            .map(|&(id, votes)| LedgerTrack {
                id: TrackId(id),
                name: format!("T{id}"),
                votes,
                removed: false,
            })
            .collect()
    }

    #[test]
    fn lagging_ledger_shows_overlay_until_confirmed() {
        let mut book = OptimisticBook::new(5);
        book.add(TrackId(1), 1, 2);

        // Ledger still reports the old tally: overlay fetched + delta.
        let mut r = rows(&[(1, 2)]);
        assert!(book.reconcile(&mut r).is_empty());
        assert_eq!(r[0].votes, 3);

        // Ledger catches up: confirmed, no double counting.
        let mut r = rows(&[(1, 3)]);
        assert_eq!(
            book.reconcile(&mut r),
            vec![(TrackId(1), DeltaResolution::Confirmed)]
        );
        assert_eq!(r[0].votes, 3);
        assert!(book.is_empty());
    }

    #[test]
    fn concurrent_vote_from_elsewhere_keeps_overlaying() {
        let mut book = OptimisticBook::new(5);
        book.add(TrackId(1), 1, 2);
        // Someone else voted too; ours not yet visible.
        let mut r = rows(&[(1, 3)]);
        // 3 == prior + delta, so this reads as confirmation. Accepted: the
        // display never over-counts.
        book.reconcile(&mut r);
        assert_eq!(r[0].votes, 3);

        let mut book = OptimisticBook::new(5);
        book.add(TrackId(1), 1, 2);
        let mut r = rows(&[(1, 4)]);
        assert!(book.reconcile(&mut r).is_empty());
        assert_eq!(r[0].votes, 5);
    }

    #[test]
    fn delta_expires_after_max_polls() {
        let mut book = OptimisticBook::new(2);
        book.add(TrackId(1), 1, 0);
        let mut r = rows(&[(1, 0)]);
        assert!(book.reconcile(&mut r).is_empty());
        assert_eq!(r[0].votes, 1);
        let mut r = rows(&[(1, 0)]);
        assert_eq!(
            book.reconcile(&mut r),
            vec![(TrackId(1), DeltaResolution::Expired)]
        );
        assert_eq!(r[0].votes, 0);
    }

    #[test]
    fn revert_and_confirm_are_mutually_exclusive() {
        let mut book = OptimisticBook::new(5);
        book.add(TrackId(1), 1, 2);
        let mut r = rows(&[(1, 3)]);
        assert_eq!(book.reconcile(&mut r).len(), 1);
        // A late failure report cannot revert a confirmed delta.
        assert!(!book.revert(TrackId(1)));

        book.add(TrackId(2), -1, 4);
        assert!(book.revert(TrackId(2)));
        assert!(!book.revert(TrackId(2)));
        let mut r = rows(&[(2, 3)]);
        assert!(book.reconcile(&mut r).is_empty());
        assert_eq!(r[0].votes, 3);
    }

    #[test]
    fn unvote_overlay_saturates_at_zero() {
        let mut book = OptimisticBook::new(3);
        book.add(TrackId(1), -1, 1);
        let mut r = rows(&[(1, 0)]);
        // 0 == 1 - 1: confirmed.
        assert_eq!(
            book.reconcile(&mut r),
            vec![(TrackId(1), DeltaResolution::Confirmed)]
        );
        let mut book = OptimisticBook::new(3);
        book.add(TrackId(1), -1, 0);
        let mut r = rows(&[(1, 0)]);
        book.reconcile(&mut r);
        assert_eq!(r[0].votes, 0);
    }

    #[test]
    fn opposite_deltas_cancel() {
        let mut book = OptimisticBook::new(3);
        book.add(TrackId(1), 1, 2);
        book.add(TrackId(1), -1, 3);
        assert!(book.is_empty());
    }

    #[test]
    fn removed_track_drops_its_delta() {
        let mut book = OptimisticBook::new(3);
        book.add(TrackId(1), 1, 0);
        let mut r = rows(&[(2, 0)]);
        assert_eq!(
            book.reconcile(&mut r),
            vec![(TrackId(1), DeltaResolution::Expired)]
        );
    }
}
