// Immutable, ordered view of one DJ's queue.

use std::cmp::Reverse;
use std::collections::HashSet;

use crate::ledger::{Address, LedgerTrack, TrackId};
use crate::playback::ExternalTrackRef;

/// One queued track as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub id: TrackId,
    pub display_name: String,
    /// Streaming ref embedded in the ledger name (`Title|spotify:track:id`).
    /// A hint for resolution, not yet verified.
    pub embedded_ref: Option<ExternalTrackRef>,
    pub vote_count: u64,
}

/// Split a raw ledger name into display name and embedded ref.
pub fn split_track_name(raw: &str) -> (String, Option<ExternalTrackRef>) {
    if let Some((name, uri)) = raw.rsplit_once('|') {
        if let Some(r) = ExternalTrackRef::from_uri(uri) {
            return (name.trim().to_string(), Some(r));
        }
    }
    (raw.trim().to_string(), None)
}

/// Full replacement of a DJ's queue: removed tracks filtered out, sorted by
/// votes descending then ledger insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub target: Address,
    /// Poller generation that produced this snapshot.
    pub generation: u64,
    tracks: Vec<Track>,
    /// Tracks the local account has voted for (advisory, may lag).
    my_votes: HashSet<TrackId>,
}

impl QueueSnapshot {
    pub fn build(
        target: Address,
        generation: u64,
        rows: Vec<LedgerTrack>,
        my_votes: HashSet<TrackId>,
    ) -> Self {
        let mut tracks: Vec<Track> = rows
            .into_iter()
            .filter(|row| !row.removed)
            .filter_map(|row| {
                let (display_name, embedded_ref) = split_track_name(&row.name);
                if display_name.is_empty() && embedded_ref.is_none() {
                    return None;
                }
                Some(Track {
                    id: row.id,
                    display_name,
                    embedded_ref,
                    vote_count: row.votes,
                })
            })
            .collect();
        tracks.sort_by_key(|t| (Reverse(t.vote_count), t.id));
        Self {
            target,
            generation,
            tracks,
            my_votes,
        }
    }

    pub fn empty(target: Address, generation: u64) -> Self {
        Self::build(target, generation, Vec::new(), HashSet::new())
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.get(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn top(&self) -> Option<&Track> {
        self.tracks.first()
    }

    pub fn has_my_vote(&self, id: TrackId) -> bool {
        self.my_votes.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: u64, name: &str, votes: u64) -> LedgerTrack {
        LedgerTrack {
            id: TrackId(id),
            name: name.to_string(),
            votes,
            removed: false,
        }
    }

    fn target() -> Address {
        Address::from_bytes([7; 20])
    }

    fn ids(s: &QueueSnapshot) -> Vec<u64> {
        s.tracks().iter().map(|t| t.id.0).collect()
    }

    #[test]
    fn sorted_by_votes_then_insertion_order() {
        let s = QueueSnapshot::build(
            target(),
            1,
            vec![row(0, "A", 1), row(1, "B", 3), row(2, "C", 3), row(3, "D", 0)],
            HashSet::new(),
        );
        assert_eq!(ids(&s), vec![1, 2, 0, 3]);
        assert_eq!(s.top().unwrap().id, TrackId(1));
    }

    #[test]
    fn sort_is_stable_across_input_permutations() {
        let a = vec![row(4, "E", 2), row(2, "C", 2), row(9, "X", 5), row(1, "B", 2)];
        let mut b = a.clone();
        b.reverse();
        let mut c = a.clone();
        c.rotate_left(2);
        let sa = QueueSnapshot::build(target(), 1, a, HashSet::new());
        let sb = QueueSnapshot::build(target(), 1, b, HashSet::new());
        let sc = QueueSnapshot::build(target(), 1, c, HashSet::new());
        assert_eq!(ids(&sa), vec![9, 1, 2, 4]);
        assert_eq!(sa, sb);
        assert_eq!(sa, sc);
    }

    #[test]
    fn removed_and_blank_tracks_are_filtered() {
        let mut gone = row(1, "Gone", 10);
        gone.removed = true;
        let s = QueueSnapshot::build(
            target(),
            1,
            vec![row(0, "Keep", 0), gone, row(2, "   ", 4)],
            HashSet::new(),
        );
        assert_eq!(ids(&s), vec![0]);
        assert!(!s.contains(TrackId(1)));
    }

    #[test]
    fn embedded_uri_is_split_from_display_name() {
        let (name, r) = split_track_name("Windowlicker|spotify:track:6TeMfXFzz8EX7B6bQMOXuI");
        assert_eq!(name, "Windowlicker");
        assert_eq!(r.unwrap().uri(), "spotify:track:6TeMfXFzz8EX7B6bQMOXuI");

        let (name, r) = split_track_name("AC|DC - Thunderstruck");
        assert_eq!(name, "AC|DC - Thunderstruck");
        assert!(r.is_none());
    }

    #[test]
    fn my_votes_are_advisory_lookup() {
        let s = QueueSnapshot::build(
            target(),
            1,
            vec![row(0, "A", 1)],
            HashSet::from([TrackId(0)]),
        );
        assert!(s.has_my_vote(TrackId(0)));
        assert!(!s.has_my_vote(TrackId(5)));
    }
}
