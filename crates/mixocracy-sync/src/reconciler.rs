// PlaybackReconciler: decides what plays.
//
// A synchronous state machine owned by the event loop. Every input is one
// `ReconcilerInput`; the output is a list of commands for the loop to carry
// out (play, resolve, queue a removal, persist the played set). Nothing here
// awaits, so every transition is testable without timers or network.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::ledger::{Address, TrackId};
use crate::playback::resolver::{ResolveOutcome, ResolveRequest};
use crate::playback::{ExternalTrackRef, PlaybackError};
use crate::queue::QueueSnapshot;

/// How many unresolved tracks are looked up per snapshot.
const RESOLVE_BATCH: usize = 5;

/// What `start()` does when every track in the queue has been played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ExhaustionPolicy {
    /// Never replay within a session; stay `Exhausted` until a new track
    /// shows up.
    #[default]
    #[serde(rename = "strict")]
    Strict,
    /// An explicit start with nothing left replays the current top track.
    #[serde(rename = "restart")]
    RestartOnStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Started, waiting for a playable track (empty queue, resolution in
    /// flight, or device unavailable).
    AwaitingQueue,
    Playing(TrackId),
    Paused(TrackId),
    /// Audible track was set outside this engine and is not in the queue.
    Foreign(ExternalTrackRef),
    Exhausted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::AwaitingQueue => write!(f, "awaiting queue"),
            SessionState::Playing(id) => write!(f, "playing {id}"),
            SessionState::Paused(id) => write!(f, "paused {id}"),
            SessionState::Foreign(r) => write!(f, "external {r}"),
            SessionState::Exhausted => write!(f, "exhausted"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconcilerInput {
    /// Follow a new DJ (or none). `restored_played` seeds the played set
    /// from a crashed session.
    TargetChanged {
        target: Option<Address>,
        restored_played: Vec<TrackId>,
    },
    StartRequested,
    StopRequested,
    SnapshotUpdated(Arc<QueueSnapshot>),
    TracksResolved {
        generation: u64,
        results: Vec<(TrackId, ResolveOutcome)>,
    },
    DeviceReady,
    DeviceLost,
    PlaybackStarted { track: ExternalTrackRef },
    PlaybackPaused { track: ExternalTrackRef },
    PlaybackResumed { track: ExternalTrackRef },
    PlaybackCompleted { track: ExternalTrackRef },
    SkipRequested,
    ExternalTrackChanged { track: ExternalTrackRef },
    PlayFailed { track_id: TrackId, error: PlaybackError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerCommand {
    Play {
        track_id: TrackId,
        track: ExternalTrackRef,
    },
    Resolve {
        generation: u64,
        requests: Vec<ResolveRequest>,
    },
    /// Track finished; persist it as played for crash recovery.
    MarkPlayed { target: Address, track_id: TrackId },
    QueueRemoval { target: Address, track_id: TrackId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Resolved(ExternalTrackRef),
    Unresolvable,
}

enum Candidate {
    Found(TrackId, ExternalTrackRef),
    /// The best unplayed track is still being resolved, or the service
    /// deferred every unplayed track it was asked about.
    Pending,
    NoneLeft,
}

/// Read-only view for status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub target: Option<Address>,
    pub state: SessionState,
    pub current: Option<TrackId>,
    pub played: Vec<TrackId>,
    pub queue_len: usize,
}

#[derive(Debug)]
pub struct PlaybackReconciler {
    policy: ExhaustionPolicy,
    state: SessionState,
    target: Option<Address>,
    generation: u64,
    snapshot: Option<Arc<QueueSnapshot>>,
    current_ref: Option<ExternalTrackRef>,
    played: HashSet<TrackId>,
    played_order: Vec<TrackId>,
    resolutions: HashMap<TrackId, Resolution>,
    in_flight: HashSet<TrackId>,
    /// An explicit start under the restart policy is waiting for the top
    /// track's lookup.
    restart_pending: bool,
}

impl PlaybackReconciler {
    pub fn new(policy: ExhaustionPolicy) -> Self {
        Self {
            policy,
            state: SessionState::Idle,
            target: None,
            generation: 0,
            snapshot: None,
            current_ref: None,
            played: HashSet::new(),
            played_order: Vec::new(),
            resolutions: HashMap::new(),
            in_flight: HashSet::new(),
            restart_pending: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_played(&self, id: TrackId) -> bool {
        self.played.contains(&id)
    }

    pub fn current(&self) -> Option<TrackId> {
        match self.state {
            SessionState::Playing(id) | SessionState::Paused(id) => Some(id),
            _ => None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            target: self.target,
            state: self.state.clone(),
            current: self.current(),
            played: self.played_order.clone(),
            queue_len: self.snapshot.as_ref().map_or(0, |s| s.len()),
        }
    }

    pub fn handle(&mut self, input: ReconcilerInput) -> Vec<ReconcilerCommand> {
        let before = self.state.clone();
        let mut cmds = Vec::new();
        match input {
            ReconcilerInput::TargetChanged {
                target,
                restored_played,
            } => self.on_target_changed(target, restored_played),
            ReconcilerInput::StartRequested => self.on_start(&mut cmds),
            ReconcilerInput::StopRequested => self.on_stop(),
            ReconcilerInput::SnapshotUpdated(snapshot) => self.on_snapshot(snapshot, &mut cmds),
            ReconcilerInput::TracksResolved {
                generation,
                results,
            } => self.on_resolved(generation, results, &mut cmds),
            ReconcilerInput::DeviceReady => {
                if self.state == SessionState::AwaitingQueue {
                    self.select_for_start(false, &mut cmds);
                }
            }
            ReconcilerInput::DeviceLost => self.on_device_lost(),
            ReconcilerInput::PlaybackStarted { track } | ReconcilerInput::PlaybackResumed { track } => {
                if let SessionState::Paused(id) = self.state {
                    if self.current_ref.as_ref() == Some(&track) {
                        self.state = SessionState::Playing(id);
                    }
                }
            }
            ReconcilerInput::PlaybackPaused { track } => {
                if let SessionState::Playing(id) = self.state {
                    if self.current_ref.as_ref() == Some(&track) {
                        self.state = SessionState::Paused(id);
                    }
                }
            }
            ReconcilerInput::PlaybackCompleted { track } => self.on_completed(track, &mut cmds),
            ReconcilerInput::SkipRequested => self.on_skip(&mut cmds),
            ReconcilerInput::ExternalTrackChanged { track } => self.on_external(track),
            ReconcilerInput::PlayFailed { track_id, error } => {
                self.on_play_failed(track_id, error, &mut cmds)
            }
        }
        if self.state != before {
            info!("Session: {} -> {}", before, self.state);
        }
        cmds
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn on_target_changed(&mut self, target: Option<Address>, restored: Vec<TrackId>) {
        self.generation += 1;
        self.target = target;
        self.state = SessionState::Idle;
        self.snapshot = None;
        self.current_ref = None;
        self.resolutions.clear();
        self.in_flight.clear();
        self.restart_pending = false;
        self.played.clear();
        self.played_order.clear();
        for id in restored {
            if self.played.insert(id) {
                self.played_order.push(id);
            }
        }
        if !self.played.is_empty() {
            info!("Restored {} played tracks for this session", self.played.len());
        }
    }

    fn on_start(&mut self, cmds: &mut Vec<ReconcilerCommand>) {
        match self.state {
            SessionState::Playing(_) | SessionState::Paused(_) | SessionState::Foreign(_) => {
                debug!("Start ignored: already {}", self.state);
            }
            _ if self.target.is_none() => warn!("Start ignored: no DJ selected"),
            _ => self.select_for_start(true, cmds),
        }
    }

    fn on_stop(&mut self) {
        self.generation += 1;
        self.state = SessionState::Idle;
        self.current_ref = None;
        self.in_flight.clear();
        self.restart_pending = false;
        self.played.clear();
        self.played_order.clear();
    }

    fn on_snapshot(&mut self, snapshot: Arc<QueueSnapshot>, cmds: &mut Vec<ReconcilerCommand>) {
        if Some(snapshot.target) != self.target {
            debug!("Ignoring snapshot for {}", snapshot.target);
            return;
        }
        self.snapshot = Some(snapshot);
        self.request_resolution(cmds);

        match self.state {
            SessionState::AwaitingQueue => self.select_for_start(false, cmds),
            SessionState::Exhausted => {
                // Only a track never played this session wakes us up.
                if let Candidate::Found(id, track) = self.next_candidate() {
                    self.play(id, track, cmds);
                }
            }
            SessionState::Playing(id) | SessionState::Paused(id) => {
                if !self.snapshot_contains(id) {
                    debug!("Current track {} left the queue; keeps playing", id);
                }
            }
            SessionState::Idle | SessionState::Foreign(_) => {}
        }
    }

    fn on_resolved(
        &mut self,
        generation: u64,
        results: Vec<(TrackId, ResolveOutcome)>,
        cmds: &mut Vec<ReconcilerCommand>,
    ) {
        if generation != self.generation {
            debug!("Discarding resolution batch from generation {}", generation);
            return;
        }
        for (id, outcome) in results {
            self.in_flight.remove(&id);
            match outcome {
                ResolveOutcome::Resolved(r) => {
                    self.resolutions.insert(id, Resolution::Resolved(r));
                }
                ResolveOutcome::Unresolvable => {
                    self.resolutions.insert(id, Resolution::Unresolvable);
                }
                ResolveOutcome::Deferred => {}
            }
        }
        match self.state {
            SessionState::AwaitingQueue => self.select_for_start(false, cmds),
            SessionState::Exhausted => {
                if let Candidate::Found(id, track) = self.next_candidate() {
                    self.play(id, track, cmds);
                }
            }
            _ => {}
        }
    }

    fn on_device_lost(&mut self) {
        match self.state {
            SessionState::Playing(_) | SessionState::Paused(_) | SessionState::Foreign(_) => {
                // The interrupted track did not finish; it stays eligible.
                self.current_ref = None;
                self.state = SessionState::AwaitingQueue;
            }
            _ => {}
        }
    }

    fn on_completed(&mut self, track: ExternalTrackRef, cmds: &mut Vec<ReconcilerCommand>) {
        match self.state.clone() {
            SessionState::Playing(id) | SessionState::Paused(id)
                if self.current_ref.as_ref() == Some(&track) =>
            {
                self.finish_current(id, cmds);
                self.advance(cmds);
            }
            SessionState::Foreign(r) if r == track => self.advance(cmds),
            _ => debug!("Completion of {} does not match {}; ignored", track, self.state),
        }
    }

    fn on_skip(&mut self, cmds: &mut Vec<ReconcilerCommand>) {
        match self.state {
            SessionState::Playing(id) | SessionState::Paused(id) => {
                self.finish_current(id, cmds);
                self.advance(cmds);
            }
            SessionState::Foreign(_) => self.advance(cmds),
            _ => debug!("Skip ignored while {}", self.state),
        }
    }

    /// The audible track was changed outside this engine. Adopt it; tracks
    /// that were skipped over (and the interrupted one) stay unplayed.
    fn on_external(&mut self, track: ExternalTrackRef) {
        if self.state == SessionState::Idle {
            debug!("External track {} while idle; ignored", track);
            return;
        }
        if self.current_ref.as_ref() == Some(&track) {
            return;
        }
        self.current_ref = Some(track.clone());
        self.state = match self.track_for_ref(&track) {
            Some(id) => SessionState::Playing(id),
            None => SessionState::Foreign(track),
        };
    }

    fn on_play_failed(
        &mut self,
        track_id: TrackId,
        error: PlaybackError,
        cmds: &mut Vec<ReconcilerCommand>,
    ) {
        if self.current() != Some(track_id) {
            debug!("Play failure for {} is stale; ignored", track_id);
            return;
        }
        self.current_ref = None;
        if error.is_retryable() {
            warn!("Play of {} failed ({}); waiting to retry", track_id, error);
            self.state = SessionState::AwaitingQueue;
        } else {
            warn!("Play of {} failed ({}); skipping track", track_id, error);
            self.resolutions.insert(track_id, Resolution::Unresolvable);
            self.advance(cmds);
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    fn finish_current(&mut self, id: TrackId, cmds: &mut Vec<ReconcilerCommand>) {
        self.current_ref = None;
        if self.played.insert(id) {
            self.played_order.push(id);
        }
        if let Some(target) = self.target {
            cmds.push(ReconcilerCommand::MarkPlayed {
                target,
                track_id: id,
            });
            cmds.push(ReconcilerCommand::QueueRemoval {
                target,
                track_id: id,
            });
        }
    }

    /// Completion/skip selection: never replays.
    fn advance(&mut self, cmds: &mut Vec<ReconcilerCommand>) {
        self.current_ref = None;
        match self.next_candidate() {
            Candidate::Found(id, track) => self.play(id, track, cmds),
            Candidate::Pending => self.state = SessionState::AwaitingQueue,
            Candidate::NoneLeft => self.state = SessionState::Exhausted,
        }
    }

    /// Start selection. `explicit` is a user start; only that may replay
    /// under the restart policy.
    fn select_for_start(&mut self, explicit: bool, cmds: &mut Vec<ReconcilerCommand>) {
        let Some(snapshot) = self.snapshot.clone() else {
            self.state = SessionState::AwaitingQueue;
            return;
        };
        if snapshot.is_empty() {
            self.state = SessionState::AwaitingQueue;
            return;
        }
        match self.next_candidate() {
            Candidate::Found(id, track) => self.play(id, track, cmds),
            Candidate::Pending => self.state = SessionState::AwaitingQueue,
            Candidate::NoneLeft => {
                let restart = explicit || self.restart_pending;
                if restart && self.policy == ExhaustionPolicy::RestartOnStart {
                    if let Some(top) = snapshot.top() {
                        match self.resolutions.get(&top.id) {
                            Some(Resolution::Resolved(r)) => {
                                info!("Queue exhausted; restarting from top track {}", top.id);
                                let r = r.clone();
                                self.play(top.id, r, cmds);
                                return;
                            }
                            Some(Resolution::Unresolvable) => {}
                            None => {
                                // Played tracks are never looked up on their
                                // own; fetch the top one for the restart.
                                if explicit && !self.in_flight.contains(&top.id) {
                                    self.in_flight.insert(top.id);
                                    cmds.push(ReconcilerCommand::Resolve {
                                        generation: self.generation,
                                        requests: vec![ResolveRequest {
                                            id: top.id,
                                            name: top.display_name.clone(),
                                            hint: top.embedded_ref.clone(),
                                        }],
                                    });
                                }
                                if self.in_flight.contains(&top.id) {
                                    debug!("Restart waits for top track {} to resolve", top.id);
                                    self.restart_pending = true;
                                    self.state = SessionState::AwaitingQueue;
                                    return;
                                }
                            }
                        }
                    }
                }
                self.restart_pending = false;
                self.state = SessionState::Exhausted;
            }
        }
    }

    fn next_candidate(&self) -> Candidate {
        let Some(snapshot) = &self.snapshot else {
            return Candidate::NoneLeft;
        };
        let mut deferred = false;
        for track in snapshot.tracks() {
            if self.played.contains(&track.id) {
                continue;
            }
            match self.resolutions.get(&track.id) {
                Some(Resolution::Resolved(r)) => return Candidate::Found(track.id, r.clone()),
                Some(Resolution::Unresolvable) => continue,
                None if self.in_flight.contains(&track.id) => return Candidate::Pending,
                // Deferred by the service; looked up again with the next
                // snapshot.
                None => deferred = true,
            }
        }
        if deferred {
            Candidate::Pending
        } else {
            Candidate::NoneLeft
        }
    }

    fn play(&mut self, id: TrackId, track: ExternalTrackRef, cmds: &mut Vec<ReconcilerCommand>) {
        info!("Selecting {} ({})", id, track);
        self.restart_pending = false;
        self.current_ref = Some(track.clone());
        self.state = SessionState::Playing(id);
        cmds.push(ReconcilerCommand::Play { track_id: id, track });
    }

    fn request_resolution(&mut self, cmds: &mut Vec<ReconcilerCommand>) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let requests: Vec<ResolveRequest> = snapshot
            .tracks()
            .iter()
            .filter(|t| !self.played.contains(&t.id))
            .filter(|t| !self.resolutions.contains_key(&t.id) && !self.in_flight.contains(&t.id))
            .take(RESOLVE_BATCH)
            .map(|t| ResolveRequest {
                id: t.id,
                name: t.display_name.clone(),
                hint: t.embedded_ref.clone(),
            })
            .collect();
        if requests.is_empty() {
            return;
        }
        self.in_flight.extend(requests.iter().map(|r| r.id));
        cmds.push(ReconcilerCommand::Resolve {
            generation: self.generation,
            requests,
        });
    }

    fn snapshot_contains(&self, id: TrackId) -> bool {
        self.snapshot.as_ref().is_some_and(|s| s.contains(id))
    }

    fn track_for_ref(&self, track: &ExternalTrackRef) -> Option<TrackId> {
        let snapshot = self.snapshot.as_ref()?;
        snapshot.tracks().iter().find_map(|t| {
            let resolved = matches!(
                self.resolutions.get(&t.id),
                Some(Resolution::Resolved(r)) if r == track
            );
            (resolved || t.embedded_ref.as_ref() == Some(track)).then_some(t.id)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
