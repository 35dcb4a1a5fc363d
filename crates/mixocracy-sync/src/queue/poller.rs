// QueueSnapshotPoller: periodic ledger reads for the selected DJ, optimistic
// overlay, and the live-DJ roster check.
//
// Runs as its own task. Ledger reads are spawned so a slow RPC never blocks
// control messages; each read is tagged with the generation current when it
// started and discarded if the target changed meanwhile.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::optimistic::{DeltaResolution, OptimisticBook};
use super::snapshot::QueueSnapshot;
use crate::ledger::{Address, LedgerError, LedgerTrack, TrackId, VoteLedger};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerControl {
    /// Follow another DJ (or none). Cancels in-flight reads.
    SetTarget(Option<Address>),
    /// Refresh as soon as possible (e.g. after a confirmed removal).
    PollNow,
    /// A vote (+1) or unvote (-1) was submitted.
    AddDelta { id: TrackId, delta: i64 },
    /// The write behind a delta failed.
    RevertDelta { id: TrackId },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterUpdate {
    pub active_djs: Vec<Address>,
    /// Whether the followed DJ is live; `None` when no DJ is followed.
    pub target_active: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum PollerEvent {
    Snapshot(Arc<QueueSnapshot>),
    Roster(RosterUpdate),
}

/// Raw read of one DJ's queue, before any optimistic overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedQueue {
    pub rows: Vec<LedgerTrack>,
    pub my_votes: HashSet<TrackId>,
}

#[derive(Debug)]
enum FetchOutcome {
    Queue {
        generation: u64,
        result: Result<FetchedQueue, LedgerError>,
    },
    Roster {
        generation: u64,
        result: Result<RosterUpdate, LedgerError>,
    },
}

// ---------------------------------------------------------------------------
// Ledger reads
// ---------------------------------------------------------------------------

/// Read the whole queue: batched call first, per-track reads as fallback.
/// `voter` adds the advisory has-voted set; its failures are ignored.
pub async fn fetch_queue(
    ledger: &dyn VoteLedger,
    target: Address,
    voter: Option<Address>,
) -> Result<FetchedQueue, LedgerError> {
    let rows = match ledger.list_queue(target).await {
        Ok(rows) => rows,
        Err(e) => {
            debug!("Batched queue read failed ({}), falling back to per-track reads", e);
            fetch_per_track(ledger, target).await?
        }
    };

    let mut my_votes = HashSet::new();
    if let Some(voter) = voter {
        for row in &rows {
            match ledger.query_has_voted(voter, target, row.id).await {
                Ok(true) => {
                    my_votes.insert(row.id);
                }
                Ok(false) => {}
                Err(e) => debug!("has-voted read for {} failed: {}", row.id, e),
            }
        }
    }

    Ok(FetchedQueue { rows, my_votes })
}

async fn fetch_per_track(
    ledger: &dyn VoteLedger,
    target: Address,
) -> Result<Vec<LedgerTrack>, LedgerError> {
    let count = ledger.song_count(target).await?;
    let mut rows = Vec::new();
    for raw_id in 0..count {
        let id = TrackId(raw_id);
        if ledger.is_song_removed(target, id).await? {
            continue;
        }
        let name = ledger.song_name(target, id).await?;
        if name.trim().is_empty() {
            continue;
        }
        let votes = ledger.query_tally(target, id).await?;
        rows.push(LedgerTrack {
            id,
            name,
            votes,
            removed: false,
        });
    }
    Ok(rows)
}

async fn fetch_roster(
    ledger: &dyn VoteLedger,
    target: Option<Address>,
) -> Result<RosterUpdate, LedgerError> {
    let active_djs = ledger.active_djs().await?;
    let target_active = match target {
        Some(t) => Some(ledger.is_set_active(t).await?),
        None => None,
    };
    Ok(RosterUpdate {
        active_djs,
        target_active,
    })
}

// ---------------------------------------------------------------------------
// Poller task
// ---------------------------------------------------------------------------

pub struct QueuePoller {
    ledger: Arc<dyn VoteLedger>,
    voter: Option<Address>,
    queue_interval: Duration,
    roster_interval: Duration,
    book: OptimisticBook,
    target: Option<Address>,
    generation: u64,
    last_fetch: Option<FetchedQueue>,
    queue_task: Option<JoinHandle<()>>,
    roster_task: Option<JoinHandle<()>>,
    /// A refresh was requested while a read was in flight.
    poll_again: bool,
    events: mpsc::Sender<PollerEvent>,
}

impl QueuePoller {
    pub fn new(
        ledger: Arc<dyn VoteLedger>,
        voter: Option<Address>,
        queue_interval: Duration,
        roster_interval: Duration,
        optimistic_max_polls: u32,
        events: mpsc::Sender<PollerEvent>,
    ) -> Self {
        Self {
            ledger,
            voter,
            queue_interval,
            roster_interval,
            book: OptimisticBook::new(optimistic_max_polls),
            target: None,
            generation: 0,
            last_fetch: None,
            queue_task: None,
            roster_task: None,
            poll_again: false,
            events,
        }
    }

    /// Run until `Stop` or until either channel closes.
    pub async fn run(mut self, mut control: mpsc::Receiver<PollerControl>) {
        let (fetch_tx, mut fetch_rx) = mpsc::channel::<FetchOutcome>(8);

        // Target switches fetch immediately, so periodic ticks start one
        // period out.
        let now = Instant::now();
        let mut queue_tick = interval_at(now + self.queue_interval, self.queue_interval);
        queue_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut roster_tick = interval_at(now + self.roster_interval, self.roster_interval);
        roster_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.start_roster_fetch(&fetch_tx);

        loop {
            let keep_going = tokio::select! {
                ctrl = control.recv() => match ctrl {
                    Some(PollerControl::Stop) | None => false,
                    Some(c) => self.handle_control(c, &fetch_tx).await,
                },
                Some(outcome) = fetch_rx.recv() => self.handle_fetch(outcome, &fetch_tx).await,
                _ = queue_tick.tick() => {
                    self.start_queue_fetch(&fetch_tx);
                    true
                }
                _ = roster_tick.tick() => {
                    self.start_roster_fetch(&fetch_tx);
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        self.abort_in_flight();
        info!("Queue poller stopped");
    }

    fn abort_in_flight(&mut self) {
        if let Some(handle) = self.queue_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.roster_task.take() {
            handle.abort();
        }
        self.poll_again = false;
    }

    fn start_queue_fetch(&mut self, fetch_tx: &mpsc::Sender<FetchOutcome>) {
        let Some(target) = self.target else {
            return;
        };
        if self.queue_task.as_ref().is_some_and(|h| !h.is_finished()) {
            self.poll_again = true;
            return;
        }
        let ledger = self.ledger.clone();
        let voter = self.voter;
        let generation = self.generation;
        let tx = fetch_tx.clone();
        self.queue_task = Some(tokio::spawn(async move {
            let result = fetch_queue(ledger.as_ref(), target, voter).await;
            let _ = tx.send(FetchOutcome::Queue { generation, result }).await;
        }));
    }

    fn start_roster_fetch(&mut self, fetch_tx: &mpsc::Sender<FetchOutcome>) {
        if self.roster_task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let ledger = self.ledger.clone();
        let target = self.target;
        let generation = self.generation;
        let tx = fetch_tx.clone();
        self.roster_task = Some(tokio::spawn(async move {
            let result = fetch_roster(ledger.as_ref(), target).await;
            let _ = tx.send(FetchOutcome::Roster { generation, result }).await;
        }));
    }

    /// Returns false when the event receiver is gone.
    async fn handle_fetch(
        &mut self,
        outcome: FetchOutcome,
        fetch_tx: &mpsc::Sender<FetchOutcome>,
    ) -> bool {
        match outcome {
            FetchOutcome::Queue { generation, result } => {
                if generation != self.generation {
                    debug!("Discarding queue read from generation {}", generation);
                    return true;
                }
                let delivered = match result {
                    Ok(fetched) => {
                        let mut rows = fetched.rows.clone();
                        for (id, resolution) in self.book.reconcile(&mut rows) {
                            match resolution {
                                DeltaResolution::Confirmed => {
                                    debug!("Vote delta on {} confirmed by ledger", id)
                                }
                                DeltaResolution::Expired => {
                                    debug!("Vote delta on {} expired", id)
                                }
                            }
                        }
                        let my_votes = fetched.my_votes.clone();
                        self.last_fetch = Some(fetched);
                        self.emit_snapshot(rows, my_votes).await
                    }
                    Err(e) => {
                        warn!("Queue poll failed, keeping last snapshot: {}", e);
                        true
                    }
                };
                if std::mem::take(&mut self.poll_again) {
                    self.start_queue_fetch(fetch_tx);
                }
                delivered
            }
            FetchOutcome::Roster { generation, result } => {
                if generation != self.generation {
                    debug!("Discarding roster read from generation {}", generation);
                    return true;
                }
                match result {
                    Ok(update) => self.events.send(PollerEvent::Roster(update)).await.is_ok(),
                    Err(e) => {
                        warn!("Roster poll failed: {}", e);
                        true
                    }
                }
            }
        }
    }

    async fn handle_control(
        &mut self,
        control: PollerControl,
        fetch_tx: &mpsc::Sender<FetchOutcome>,
    ) -> bool {
        match control {
            PollerControl::SetTarget(target) => {
                if target == self.target {
                    self.start_queue_fetch(fetch_tx);
                    return true;
                }
                self.abort_in_flight();
                self.generation += 1;
                self.book.clear();
                self.last_fetch = None;
                self.target = target;
                match target {
                    Some(t) => info!("Polling queue of {} (generation {})", t, self.generation),
                    None => info!("Queue polling idle"),
                }
                self.start_queue_fetch(fetch_tx);
                self.start_roster_fetch(fetch_tx);
                true
            }
            PollerControl::PollNow => {
                self.start_queue_fetch(fetch_tx);
                true
            }
            PollerControl::AddDelta { id, delta } => {
                let prior = self
                    .last_fetch
                    .as_ref()
                    .and_then(|f| f.rows.iter().find(|r| r.id == id))
                    .map(|r| r.votes);
                let Some(prior) = prior else {
                    warn!("No fetched tally for {}; not applying optimistic delta", id);
                    return true;
                };
                self.book.add(id, delta, prior);
                self.rerender().await
            }
            PollerControl::RevertDelta { id } => {
                if self.book.revert(id) {
                    self.rerender().await
                } else {
                    true
                }
            }
            PollerControl::Stop => false,
        }
    }

    /// Re-emit the last fetch with the current overlay, without a ledger read.
    async fn rerender(&mut self) -> bool {
        let Some(last) = &self.last_fetch else {
            return true;
        };
        let mut rows = last.rows.clone();
        let my_votes = last.my_votes.clone();
        self.book.overlay(&mut rows);
        self.emit_snapshot(rows, my_votes).await
    }

    async fn emit_snapshot(&mut self, rows: Vec<LedgerTrack>, my_votes: HashSet<TrackId>) -> bool {
        let Some(target) = self.target else {
            return true;
        };
        let snapshot = QueueSnapshot::build(target, self.generation, rows, my_votes);
        debug!(
            "Emitting snapshot for {}: {} tracks (generation {})",
            target,
            snapshot.len(),
            self.generation
        );
        self.events
            .send(PollerEvent::Snapshot(Arc::new(snapshot)))
            .await
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
