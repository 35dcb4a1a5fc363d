// Application state and orchestration logic.
//
// The serialized event loop of a DJ session. Bridge events, poller output,
// results of spawned network work, and console commands are applied here one
// at a time. Ledger, streaming and relay calls never run inline: they are
// spawned and their results come back as `TaskResult` messages.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::ledger::{Address, LedgerError, TrackId, TxHash, VoteLedger};
use crate::playback::auth::{TokenSet, TokenStore};
use crate::playback::driver::{DriverEvent, DriverState, PlaybackDriver};
use crate::playback::resolver::{resolve_batch, ResolveOutcome};
use crate::playback::{ExternalTrackRef, PlaybackError, StreamingApi};
use crate::protocol::{BridgeCommand, BridgeMessage, ConnectionStatus, UiUpdate, UserCommand};
use crate::queue::{PollerControl, PollerEvent, QueueSnapshot};
use crate::reconciler::{PlaybackReconciler, ReconcilerCommand, ReconcilerInput, SessionState};
use crate::removal::RemovalRequest;
use crate::ws_server::WsEvent;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long the bridge page may stay silent before its device is considered
/// gone.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Outcome of network work spawned off the event loop.
#[derive(Debug)]
pub enum TaskResult {
    Resolved {
        generation: u64,
        results: Vec<(TrackId, ResolveOutcome)>,
    },
    PlayFinished {
        track_id: TrackId,
        track: ExternalTrackRef,
        result: Result<(), PlaybackError>,
    },
    /// Pause, resume or device transfer.
    ControlFinished {
        action: &'static str,
        result: Result<(), PlaybackError>,
    },
    TokenReady(Result<String, PlaybackError>),
    VoteFinished {
        target: Address,
        id: TrackId,
        delta: i64,
        result: Result<TxHash, LedgerError>,
    },
    AddFinished {
        name: String,
        result: Result<TxHash, LedgerError>,
    },
    RemoveFinished {
        id: TrackId,
        result: Result<TxHash, LedgerError>,
    },
    SetFinished {
        live: bool,
        result: Result<TxHash, LedgerError>,
    },
}

/// Outgoing channels owned by the event loop.
pub struct AppChannels {
    pub poller: mpsc::Sender<PollerControl>,
    pub removal: mpsc::Sender<RemovalRequest>,
    /// JSON text for the bridge page.
    pub bridge: mpsc::Sender<String>,
    pub tasks: mpsc::Sender<TaskResult>,
    pub ui: mpsc::Sender<UiUpdate>,
}

pub struct AppState {
    pub config: Config,
    /// Local wallet: voter, and DJ identity when live.
    pub account: Address,
    ledger: Arc<dyn VoteLedger>,
    streaming: Arc<dyn StreamingApi>,
    tokens: Arc<TokenStore>,
    db: Arc<Database>,
    pub reconciler: PlaybackReconciler,
    pub driver: PlaybackDriver,
    pub target: Option<Address>,
    pub snapshot: Option<Arc<QueueSnapshot>>,
    pub roster: Vec<Address>,
    pub connection_status: ConnectionStatus,
    pub last_bridge_message: Option<Instant>,
    pub live: bool,
    /// Tracks with a vote/unvote write in flight; a second write on the same
    /// track is refused until the first settles.
    pending_votes: HashSet<TrackId>,
    resolve_tasks: Vec<JoinHandle<()>>,
    channels: AppChannels,
}

impl AppState {
    pub fn new(
        config: Config,
        ledger: Arc<dyn VoteLedger>,
        streaming: Arc<dyn StreamingApi>,
        tokens: Arc<TokenStore>,
        db: Arc<Database>,
        channels: AppChannels,
    ) -> Self {
        let playback = &config.playback;
        let driver = PlaybackDriver::new(
            Duration::from_millis(playback.completion_tolerance_ms),
            Duration::from_millis(playback.advance_debounce_ms),
            Duration::from_millis(playback.play_grace_ms),
        );
        Self {
            account: config.ledger.account,
            reconciler: PlaybackReconciler::new(playback.exhaustion_policy),
            driver,
            config,
            ledger,
            streaming,
            tokens,
            db,
            target: None,
            snapshot: None,
            roster: Vec::new(),
            connection_status: ConnectionStatus::Disconnected,
            last_bridge_message: None,
            live: false,
            pending_votes: HashSet::new(),
            resolve_tasks: Vec::new(),
            channels,
        }
    }

    fn spawn<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let tx = self.channels.tasks.clone();
        tokio::spawn(async move {
            let _ = tx.send(work.await).await;
        })
    }

    async fn notify(&self, update: UiUpdate) {
        let _ = self.channels.ui.send(update).await;
    }

    async fn notice(&self, text: impl Into<String>) {
        self.notify(UiUpdate::Notice(text.into())).await;
    }

    async fn send_bridge(&self, command: BridgeCommand) {
        if self.channels.bridge.send(command.to_json()).await.is_err() {
            warn!("Bridge channel closed; dropping {:?}", command);
        }
    }

    async fn send_poller(&self, control: PollerControl) {
        if self.channels.poller.send(control).await.is_err() {
            warn!("Queue poller is gone");
        }
    }

    // -----------------------------------------------------------------------
    // Reconciler plumbing
    // -----------------------------------------------------------------------

    /// Feed one input to the reconciler and carry out what it asks for.
    /// Commands that fail synchronously feed their failure straight back.
    pub async fn apply(&mut self, input: ReconcilerInput) {
        let before = self.reconciler.state().clone();
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            for command in self.reconciler.handle(input) {
                if let Some(follow_up) = self.execute(command).await {
                    inputs.push_back(follow_up);
                }
            }
        }
        if *self.reconciler.state() != before {
            self.notify(UiUpdate::Session(self.reconciler.status())).await;
        }
    }

    async fn execute(&mut self, command: ReconcilerCommand) -> Option<ReconcilerInput> {
        match command {
            ReconcilerCommand::Play { track_id, track } => {
                let device = match self.driver.begin_play(&track, Instant::now()) {
                    Ok(device) => device,
                    Err(error) => {
                        debug!("Cannot play {} yet: {}", track_id, error);
                        return Some(ReconcilerInput::PlayFailed { track_id, error });
                    }
                };
                let api = self.streaming.clone();
                self.spawn(async move {
                    let result = api.play(&device, &track).await;
                    TaskResult::PlayFinished {
                        track_id,
                        track,
                        result,
                    }
                });
            }
            ReconcilerCommand::Resolve {
                generation,
                requests,
            } => {
                let api = self.streaming.clone();
                self.resolve_tasks.retain(|h| !h.is_finished());
                let handle = self.spawn(async move {
                    TaskResult::Resolved {
                        generation,
                        results: resolve_batch(api, requests).await,
                    }
                });
                self.resolve_tasks.push(handle);
            }
            ReconcilerCommand::MarkPlayed { target, track_id } => {
                if let Err(e) = self.db.record_played(target, track_id) {
                    warn!("Failed to persist played track {}: {:#}", track_id, e);
                }
            }
            ReconcilerCommand::QueueRemoval { target, track_id } => {
                let request = RemovalRequest { target, track_id };
                if self.channels.removal.send(request).await.is_err() {
                    warn!("Removal coordinator gone; {} stays on the ledger", track_id);
                }
            }
        }
        None
    }

    async fn apply_driver_events(&mut self, events: Vec<DriverEvent>) {
        for event in events {
            let input = match event {
                DriverEvent::DeviceReady => ReconcilerInput::DeviceReady,
                DriverEvent::DeviceLost => ReconcilerInput::DeviceLost,
                DriverEvent::Started { track } => ReconcilerInput::PlaybackStarted { track },
                DriverEvent::Paused { track } => ReconcilerInput::PlaybackPaused { track },
                DriverEvent::Resumed { track } => ReconcilerInput::PlaybackResumed { track },
                DriverEvent::Completed { track } => ReconcilerInput::PlaybackCompleted { track },
                DriverEvent::ExternalTrackChanged { track } => {
                    ReconcilerInput::ExternalTrackChanged { track }
                }
            };
            self.apply(input).await;
        }
    }

    // -----------------------------------------------------------------------
    // Session control
    // -----------------------------------------------------------------------

    /// Follow another DJ. Cancels in-flight resolution, forgets the previous
    /// session's played set, and restores any set persisted for `target` by
    /// an interrupted run.
    pub async fn switch_target(&mut self, target: Option<Address>) {
        if target == self.target {
            self.send_poller(PollerControl::PollNow).await;
            return;
        }
        if let Some(old) = self.target {
            if let Err(e) = self.db.clear_played(old) {
                warn!("Failed to clear played tracks for {}: {:#}", old, e);
            }
        }
        self.pause_device();
        for handle in self.resolve_tasks.drain(..) {
            handle.abort();
        }
        self.pending_votes.clear();
        self.snapshot = None;
        self.target = target;

        let restored = match target {
            Some(t) => self.db.load_played(t).unwrap_or_else(|e| {
                warn!("Failed to load played tracks for {}: {:#}", t, e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        if !restored.is_empty() {
            info!("Recovered {} played tracks from an interrupted session", restored.len());
        }

        self.send_poller(PollerControl::SetTarget(target)).await;
        self.apply(ReconcilerInput::TargetChanged {
            target,
            restored_played: restored,
        })
        .await;
        match target {
            Some(t) => self.notice(format!("following {t}")).await,
            None => self.notice("not following any DJ").await,
        }
    }

    /// Stop the session: pause audio, reset the reconciler, drop the
    /// persisted played set.
    pub async fn end_session(&mut self) {
        self.pause_device();
        self.apply(ReconcilerInput::StopRequested).await;
        if let Some(target) = self.target {
            if let Err(e) = self.db.clear_played(target) {
                warn!("Failed to clear played tracks for {}: {:#}", target, e);
            }
        }
    }

    fn pause_device(&mut self) {
        if self.driver.state() != DriverState::Playing {
            return;
        }
        if let Ok(device) = self.driver.begin_pause() {
            let api = self.streaming.clone();
            self.spawn(async move {
                TaskResult::ControlFinished {
                    action: "pause",
                    result: api.pause(&device).await,
                }
            });
        }
    }

    /// Token refresh failed: the page has to log in again and the device is
    /// unusable until it does.
    async fn reauthenticate(&mut self) {
        warn!("Streaming authorization lost; asking the bridge page to log in again");
        self.send_bridge(BridgeCommand::Reauthenticate {
            client_id: self.config.spotify.client_id.clone(),
            redirect_uri: self.config.spotify.redirect_uri.clone(),
        })
        .await;
        let events = self.driver.device_lost();
        self.apply_driver_events(events).await;
        self.notice("streaming login expired; log in again on the player page")
            .await;
    }

    async fn submit_vote(&mut self, id: TrackId, delta: i64) {
        let Some(target) = self.target else {
            self.notice("follow a DJ before voting").await;
            return;
        };
        if !self.pending_votes.insert(id) {
            self.notice(format!("a vote on {id} is still pending")).await;
            return;
        }
        self.send_poller(PollerControl::AddDelta { id, delta }).await;
        let ledger = self.ledger.clone();
        self.spawn(async move {
            let result = if delta > 0 {
                ledger.vote(target, id).await
            } else {
                ledger.unvote(target, id).await
            };
            TaskResult::VoteFinished {
                target,
                id,
                delta,
                result,
            }
        });
    }

    pub fn shutdown(&mut self) {
        for handle in self.resolve_tasks.drain(..) {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the main application event loop.
///
/// Listens on five sources using a biased `tokio::select!`, so a bridge
/// event (track completion) that is ready together with a queue snapshot is
/// applied first:
/// 1. WebSocket events from the bridge page
/// 2. Results of spawned network work
/// 3. Console commands
/// 4. Poller snapshots and roster updates
/// 5. Heartbeat timeout checks
pub async fn run(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    mut poller_rx: mpsc::Receiver<PollerEvent>,
    mut task_rx: mpsc::Receiver<TaskResult>,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    mut state: AppState,
) -> anyhow::Result<()> {
    info!("Application event loop started");

    if let Some(target) = state.config.ledger.target {
        state.switch_target(Some(target)).await;
    }

    // When the WebSocket channel closes we stop polling it so select! never
    // spins on a closed receiver.
    let mut ws_open = true;

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
    // The first tick completes immediately.
    heartbeat_interval.tick().await;

    loop {
        tokio::select! {
            biased;

            ws_event = ws_rx.recv(), if ws_open => match ws_event {
                Some(event) => handle_ws_event(&mut state, event).await,
                None => {
                    info!("WebSocket channel closed");
                    ws_open = false;
                }
            },

            Some(result) = task_rx.recv() => handle_task_result(&mut state, result).await,

            cmd = cmd_rx.recv() => match cmd {
                Some(UserCommand::Quit) => {
                    info!("Quit command received, shutting down");
                    break;
                }
                Some(cmd) => handle_user_command(&mut state, cmd).await,
                None => {
                    info!("Command channel closed, shutting down");
                    break;
                }
            },

            event = poller_rx.recv() => match event {
                Some(event) => handle_poller_event(&mut state, event).await,
                None => {
                    warn!("Queue poller stopped, shutting down");
                    break;
                }
            },

            _ = heartbeat_interval.tick() => check_heartbeat(&mut state).await,
        }
    }

    state.shutdown();
    state.send_poller(PollerControl::Stop).await;
    info!("Application event loop exiting");
    Ok(())
}

// ---------------------------------------------------------------------------
// Bridge events
// ---------------------------------------------------------------------------

pub async fn handle_ws_event(state: &mut AppState, event: WsEvent) {
    match event {
        WsEvent::Connected { addr } => {
            info!("Player bridge connected from {}", addr);
            state.connection_status = ConnectionStatus::Connected;
            state.last_bridge_message = Some(Instant::now());
            state.notify(UiUpdate::Bridge(ConnectionStatus::Connected)).await;
            state.driver.connecting();
            state
                .send_bridge(BridgeCommand::Connect {
                    device_name: state.config.spotify.device_name.clone(),
                })
                .await;
        }
        WsEvent::Disconnected => {
            info!("Player bridge disconnected");
            state.connection_status = ConnectionStatus::Disconnected;
            state.last_bridge_message = None;
            state.notify(UiUpdate::Bridge(ConnectionStatus::Disconnected)).await;
            let events = state.driver.device_lost();
            state.apply_driver_events(events).await;
        }
        WsEvent::Message(json) => {
            if state.connection_status == ConnectionStatus::Disconnected
                && state.last_bridge_message.is_some()
            {
                info!("Player bridge restored (message after stale timeout)");
                state.connection_status = ConnectionStatus::Connected;
                state.notify(UiUpdate::Bridge(ConnectionStatus::Connected)).await;
                // The timeout dropped the device; have the page register it again.
                state.driver.connecting();
                state
                    .send_bridge(BridgeCommand::Connect {
                        device_name: state.config.spotify.device_name.clone(),
                    })
                    .await;
            }
            if state.last_bridge_message.is_some() {
                state.last_bridge_message = Some(Instant::now());
            }
            handle_bridge_message(state, &json).await;
        }
    }
}

async fn handle_bridge_message(state: &mut AppState, json: &str) {
    let msg: BridgeMessage = match serde_json::from_str(json) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse bridge message: {}", e);
            return;
        }
    };

    match msg {
        BridgeMessage::DeviceReady { device_id } => {
            let events = state.driver.device_ready(device_id.clone());
            let api = state.streaming.clone();
            state.spawn(async move {
                TaskResult::ControlFinished {
                    action: "transfer",
                    result: api.transfer_playback(&device_id).await,
                }
            });
            state.apply_driver_events(events).await;
        }
        BridgeMessage::DeviceNotReady { device_id } => {
            warn!("Playback device {} went offline", device_id);
            let events = state.driver.device_lost();
            state.apply_driver_events(events).await;
        }
        BridgeMessage::PlayerState(player) => {
            let events = state.driver.observe(player, Instant::now());
            state.apply_driver_events(events).await;
        }
        BridgeMessage::Tokens {
            access_token,
            refresh_token,
            expires_in,
        } => {
            info!("Received streaming tokens from the player page");
            state
                .tokens
                .set(TokenSet::new(access_token, refresh_token, expires_in));
        }
        BridgeMessage::TokenRequest => {
            let api = state.streaming.clone();
            state.spawn(async move { TaskResult::TokenReady(api.access_token().await) });
        }
        BridgeMessage::Heartbeat => {}
        BridgeMessage::DeviceError { message } => {
            warn!("Player page reported an error: {}", message);
            state.notice(format!("player error: {message}")).await;
            let events = state.driver.device_lost();
            state.apply_driver_events(events).await;
        }
    }
}

async fn check_heartbeat(state: &mut AppState) {
    if state.connection_status != ConnectionStatus::Connected {
        return;
    }
    let Some(last) = state.last_bridge_message else {
        return;
    };
    let elapsed = last.elapsed();
    if elapsed > HEARTBEAT_TIMEOUT {
        warn!("No bridge message for {:?}, marking player as disconnected", elapsed);
        state.connection_status = ConnectionStatus::Disconnected;
        state.notify(UiUpdate::Bridge(ConnectionStatus::Disconnected)).await;
        let events = state.driver.device_lost();
        state.apply_driver_events(events).await;
    }
}

// ---------------------------------------------------------------------------
// Poller events
// ---------------------------------------------------------------------------

pub async fn handle_poller_event(state: &mut AppState, event: PollerEvent) {
    match event {
        PollerEvent::Snapshot(snapshot) => {
            if Some(snapshot.target) != state.target {
                debug!("Dropping snapshot for {} (no longer followed)", snapshot.target);
                return;
            }
            state.snapshot = Some(snapshot.clone());
            state.notify(UiUpdate::Queue(snapshot.clone())).await;
            state.apply(ReconcilerInput::SnapshotUpdated(snapshot)).await;
        }
        PollerEvent::Roster(update) => {
            if update.active_djs != state.roster {
                state.roster = update.active_djs.clone();
                state.notify(UiUpdate::Roster(update.active_djs)).await;
            }
            let session_running = *state.reconciler.state() != SessionState::Idle;
            if let (Some(target), Some(false)) = (state.target, update.target_active) {
                if session_running {
                    info!("{} is no longer live; ending session", target);
                    state.end_session().await;
                    state.notice(format!("{target} ended their set")).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task results
// ---------------------------------------------------------------------------

pub async fn handle_task_result(state: &mut AppState, result: TaskResult) {
    match result {
        TaskResult::Resolved {
            generation,
            results,
        } => {
            state
                .apply(ReconcilerInput::TracksResolved {
                    generation,
                    results,
                })
                .await;
        }
        TaskResult::PlayFinished {
            track_id, result: Ok(()), ..
        } => debug!("Play command for {} accepted", track_id),
        TaskResult::PlayFinished {
            track_id,
            track,
            result: Err(error),
        } => {
            warn!("Play of {} ({}) failed: {}", track_id, track, error);
            state.driver.play_failed(&track);
            let auth_lost = error == PlaybackError::AuthExpired;
            state
                .apply(ReconcilerInput::PlayFailed { track_id, error })
                .await;
            if auth_lost {
                state.reauthenticate().await;
            }
        }
        TaskResult::ControlFinished { action, result } => match result {
            Ok(()) => debug!("{} command accepted", action),
            Err(PlaybackError::AuthExpired) => state.reauthenticate().await,
            Err(e) => {
                warn!("{} command failed: {}", action, e);
                state.notice(format!("{action} failed: {e}")).await;
            }
        },
        TaskResult::TokenReady(result) => match result {
            Ok(access_token) => state.send_bridge(BridgeCommand::Token { access_token }).await,
            Err(PlaybackError::AuthExpired) => state.reauthenticate().await,
            Err(e) => warn!("Could not provide a token to the player page: {}", e),
        },
        TaskResult::VoteFinished {
            target,
            id,
            delta,
            result,
        } => {
            if Some(target) != state.target {
                debug!("Vote result for {} on {} arrived after a target switch", id, target);
                return;
            }
            state.pending_votes.remove(&id);
            let verb = if delta > 0 { "vote" } else { "unvote" };
            match result {
                Ok(tx) => {
                    info!("{} on {} confirmed (tx {})", verb, id, tx.0);
                    state.send_poller(PollerControl::PollNow).await;
                }
                Err(e) => {
                    warn!("{} on {} failed: {}", verb, id, e);
                    state.send_poller(PollerControl::RevertDelta { id }).await;
                    state.notice(format!("{verb} on {id} failed: {e}")).await;
                }
            }
        }
        TaskResult::AddFinished { name, result } => match result {
            Ok(tx) => {
                info!("Added \"{}\" to own queue (tx {})", name, tx.0);
                state.notice(format!("added \"{name}\"")).await;
                if state.target == Some(state.account) {
                    state.send_poller(PollerControl::PollNow).await;
                }
            }
            Err(e) => {
                warn!("Adding \"{}\" failed: {}", name, e);
                state.notice(format!("adding \"{name}\" failed: {e}")).await;
            }
        },
        TaskResult::RemoveFinished { id, result } => match result {
            Ok(tx) => {
                info!("Removed {} from own queue (tx {})", id, tx.0);
                state.send_poller(PollerControl::PollNow).await;
            }
            Err(e) => state.notice(format!("removing {id} failed: {e}")).await,
        },
        TaskResult::SetFinished { live, result } => match (live, result) {
            (true, Ok(_)) => {
                state.live = true;
                state.notice("set started").await;
                let account = state.account;
                state.switch_target(Some(account)).await;
            }
            (false, Ok(_)) => {
                state.live = false;
                state.end_session().await;
                state.send_bridge(BridgeCommand::Disconnect).await;
                state.notice("set ended").await;
            }
            (_, Err(e)) => {
                warn!("Set change failed: {}", e);
                state.notice(format!("set change failed: {e}")).await;
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Console commands
// ---------------------------------------------------------------------------

pub async fn handle_user_command(state: &mut AppState, cmd: UserCommand) {
    match cmd {
        UserCommand::Play => {
            if state.target.is_none() {
                state.notice("follow a DJ first: target <address>").await;
                return;
            }
            state.apply(ReconcilerInput::StartRequested).await;
            if state.driver.device_id().is_none() {
                state
                    .notice("waiting for the player page to register a device")
                    .await;
            }
        }
        UserCommand::Skip => {
            if !state.driver.try_skip(Instant::now()) {
                state.notice("skip ignored: the queue just advanced").await;
                return;
            }
            state.apply(ReconcilerInput::SkipRequested).await;
        }
        UserCommand::Pause => match state.driver.begin_pause() {
            Ok(device) => {
                let api = state.streaming.clone();
                state.spawn(async move {
                    TaskResult::ControlFinished {
                        action: "pause",
                        result: api.pause(&device).await,
                    }
                });
            }
            Err(e) => state.notice(format!("cannot pause: {e}")).await,
        },
        UserCommand::Resume => match state.driver.begin_resume() {
            Ok(device) => {
                let api = state.streaming.clone();
                state.spawn(async move {
                    TaskResult::ControlFinished {
                        action: "resume",
                        result: api.resume(&device).await,
                    }
                });
            }
            Err(e) => state.notice(format!("cannot resume: {e}")).await,
        },
        UserCommand::Stop => state.end_session().await,
        UserCommand::Vote(id) => state.submit_vote(id, 1).await,
        UserCommand::Unvote(id) => state.submit_vote(id, -1).await,
        UserCommand::Add(name) => {
            let ledger = state.ledger.clone();
            state.spawn(async move {
                let result = ledger.add_track(&name).await;
                TaskResult::AddFinished { name, result }
            });
        }
        UserCommand::Remove(id) => {
            if state.target != Some(state.account) {
                state.notice("only tracks in your own queue can be removed").await;
                return;
            }
            let ledger = state.ledger.clone();
            state.spawn(async move {
                TaskResult::RemoveFinished {
                    id,
                    result: ledger.remove_track(id).await,
                }
            });
        }
        UserCommand::Target(target) => state.switch_target(target).await,
        UserCommand::GoLive => {
            let (ledger, account) = (state.ledger.clone(), state.account);
            state.spawn(async move {
                TaskResult::SetFinished {
                    live: true,
                    result: ledger.start_set(account).await,
                }
            });
        }
        UserCommand::EndSet => {
            let (ledger, account) = (state.ledger.clone(), state.account);
            state.spawn(async move {
                TaskResult::SetFinished {
                    live: false,
                    result: ledger.stop_set(account).await,
                }
            });
        }
        UserCommand::Status => {
            state.notify(UiUpdate::Session(state.reconciler.status())).await;
            if let Some(snapshot) = state.snapshot.clone() {
                state.notify(UiUpdate::Queue(snapshot)).await;
            }
            let position = match state.driver.position() {
                Some((pos, dur)) => format!("{}s/{}s", pos / 1000, dur / 1000),
                None => "-".into(),
            };
            state
                .notice(format!(
                    "player: {:?}, bridge: {:?}, position {}",
                    state.driver.state(),
                    state.connection_status,
                    position
                ))
                .await;
        }
        UserCommand::Quit => {
            // Handled in the main loop
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
