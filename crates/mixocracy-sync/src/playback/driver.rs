// PlaybackDriver: the single owner of the player device.
//
// Pure state machine fed with player-state observations (relayed by the
// bridge page) and the local commands issued through it. It never awaits;
// the event loop runs the actual API calls on spawned tasks. Time is passed
// in explicitly so completion detection and debouncing are testable.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::{ExternalTrackRef, PlaybackError, PlayerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Connecting,
    Ready,
    Playing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    DeviceReady,
    DeviceLost,
    /// A track we asked for became audible.
    Started { track: ExternalTrackRef },
    Paused { track: ExternalTrackRef },
    Resumed { track: ExternalTrackRef },
    /// The current track played to its end. Emitted at most once per
    /// debounce window per track.
    Completed { track: ExternalTrackRef },
    /// Something other than this driver changed the audible track.
    ExternalTrackChanged { track: ExternalTrackRef },
}

// ---------------------------------------------------------------------------
// Advance latch
// ---------------------------------------------------------------------------

/// Debounce for `advance()`: completion or skip, whichever gets there first.
/// A completion is a player report about one track and only collides with an
/// earlier advance away from that same track. A skip is aimed at whatever the
/// user last saw, so any advance inside the window absorbs it.
#[derive(Debug)]
pub struct AdvanceLatch {
    window: Duration,
    last: Option<(Option<ExternalTrackRef>, Instant)>,
}

impl AdvanceLatch {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    fn within_window(&self, now: Instant) -> Option<&Option<ExternalTrackRef>> {
        match &self.last {
            Some((track, at)) if now.saturating_duration_since(*at) < self.window => Some(track),
            _ => None,
        }
    }

    pub fn try_complete(&mut self, track: &ExternalTrackRef, now: Instant) -> bool {
        if self.within_window(now).is_some_and(|prev| prev.as_ref() == Some(track)) {
            return false;
        }
        self.last = Some((Some(track.clone()), now));
        true
    }

    pub fn try_skip(&mut self, from: Option<&ExternalTrackRef>, now: Instant) -> bool {
        if self.within_window(now).is_some() {
            return false;
        }
        self.last = Some((from.cloned(), now));
        true
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Observation {
    state: PlayerState,
    at: Instant,
}

#[derive(Debug)]
pub struct PlaybackDriver {
    state: DriverState,
    device_id: Option<String>,
    last: Option<Observation>,
    /// Track believed audible: the one we started or the one we adopted.
    expected: Option<ExternalTrackRef>,
    pending_play: Option<(ExternalTrackRef, Instant)>,
    user_pause_pending: bool,
    latch: AdvanceLatch,
    tolerance: Duration,
    play_grace: Duration,
}

impl PlaybackDriver {
    pub fn new(tolerance: Duration, debounce: Duration, play_grace: Duration) -> Self {
        Self {
            state: DriverState::Uninitialized,
            device_id: None,
            last: None,
            expected: None,
            pending_play: None,
            user_pause_pending: false,
            latch: AdvanceLatch::new(debounce),
            tolerance,
            play_grace,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn expected_track(&self) -> Option<&ExternalTrackRef> {
        self.expected.as_ref()
    }

    /// Last observed playback position, for status display.
    pub fn position(&self) -> Option<(u64, u64)> {
        self.last
            .as_ref()
            .map(|o| (o.state.position_ms, o.state.duration_ms))
    }

    /// The bridge was asked to register a device.
    pub fn connecting(&mut self) {
        if self.state == DriverState::Uninitialized {
            self.state = DriverState::Connecting;
        }
    }

    pub fn device_ready(&mut self, device_id: String) -> Vec<DriverEvent> {
        info!("Playback device ready: {}", device_id);
        self.device_id = Some(device_id);
        self.state = DriverState::Ready;
        vec![DriverEvent::DeviceReady]
    }

    /// Bridge gone, auth lost, or the set stopped. Back to Uninitialized.
    pub fn device_lost(&mut self) -> Vec<DriverEvent> {
        let had_device = self.state != DriverState::Uninitialized;
        self.state = DriverState::Uninitialized;
        self.device_id = None;
        self.last = None;
        self.expected = None;
        self.pending_play = None;
        self.user_pause_pending = false;
        if had_device {
            info!("Playback device lost");
            vec![DriverEvent::DeviceLost]
        } else {
            vec![]
        }
    }

    fn ready_device(&self) -> Result<String, PlaybackError> {
        match self.state {
            DriverState::Ready | DriverState::Playing | DriverState::Paused => {
                self.device_id.clone().ok_or(PlaybackError::NoDevice)
            }
            _ => Err(PlaybackError::NoDevice),
        }
    }

    /// Register an outgoing play command. Returns the device to target.
    pub fn begin_play(
        &mut self,
        track: &ExternalTrackRef,
        now: Instant,
    ) -> Result<String, PlaybackError> {
        let device = self.ready_device()?;
        self.pending_play = Some((track.clone(), now));
        self.expected = Some(track.clone());
        self.user_pause_pending = false;
        Ok(device)
    }

    /// The play command for `track` failed; forget it.
    pub fn play_failed(&mut self, track: &ExternalTrackRef) {
        if self.pending_play.as_ref().is_some_and(|(t, _)| t == track) {
            self.pending_play = None;
        }
        if self.expected.as_ref() == Some(track) {
            self.expected = None;
        }
    }

    pub fn begin_pause(&mut self) -> Result<String, PlaybackError> {
        let device = self.ready_device()?;
        self.user_pause_pending = true;
        Ok(device)
    }

    pub fn begin_resume(&mut self) -> Result<String, PlaybackError> {
        let device = self.ready_device()?;
        self.user_pause_pending = false;
        Ok(device)
    }

    /// Guarded skip: true if the user's skip may advance now.
    pub fn try_skip(&mut self, now: Instant) -> bool {
        let allowed = self.latch.try_skip(self.expected.as_ref(), now);
        if !allowed {
            debug!("Skip suppressed by debounce");
        }
        allowed
    }

    /// Feed one player-state observation.
    pub fn observe(&mut self, new: PlayerState, now: Instant) -> Vec<DriverEvent> {
        if matches!(self.state, DriverState::Uninitialized | DriverState::Connecting) {
            debug!("Ignoring player state before device is ready");
            return vec![];
        }
        let prev = self.last.replace(Observation {
            state: new.clone(),
            at: now,
        });

        if let Some((wanted, issued)) = self.pending_play.clone() {
            if new.track.as_ref() == Some(&wanted) && !new.paused {
                self.pending_play = None;
                self.state = DriverState::Playing;
                return vec![DriverEvent::Started { track: wanted }];
            }
            if now.saturating_duration_since(issued) < self.play_grace {
                // Transitional states from before the command took effect.
                return vec![];
            }
            debug!("Play of {} not confirmed within grace period", wanted);
            self.pending_play = None;
        }

        let Some(track) = new.track.clone() else {
            return vec![];
        };

        if self.expected.as_ref() != Some(&track) {
            info!("Audible track changed externally to {}", track);
            self.expected = Some(track.clone());
            self.user_pause_pending = false;
            self.state = if new.paused {
                DriverState::Paused
            } else {
                DriverState::Playing
            };
            return vec![DriverEvent::ExternalTrackChanged { track }];
        }

        let Some(prev) = prev else {
            self.state = if new.paused {
                DriverState::Paused
            } else {
                DriverState::Playing
            };
            return vec![];
        };
        let prev_same = prev.state.track.as_ref() == Some(&track);

        match (prev.state.paused, new.paused) {
            (false, true) if prev_same => {
                if !self.user_pause_pending && self.near_end(&prev, &new, now) {
                    self.state = DriverState::Ready;
                    if self.latch.try_complete(&track, now) {
                        info!("Track {} completed", track);
                        return vec![DriverEvent::Completed { track }];
                    }
                    debug!("Completion of {} suppressed by debounce", track);
                    return vec![];
                }
                self.user_pause_pending = false;
                self.state = DriverState::Paused;
                vec![DriverEvent::Paused { track }]
            }
            (true, false) => {
                self.state = DriverState::Playing;
                vec![DriverEvent::Resumed { track }]
            }
            _ => {
                self.state = if new.paused {
                    self.state_when_paused()
                } else {
                    DriverState::Playing
                };
                vec![]
            }
        }
    }

    fn state_when_paused(&self) -> DriverState {
        // A completed track stays paused at its end; that is Ready, not Paused.
        if self.state == DriverState::Ready {
            DriverState::Ready
        } else {
            DriverState::Paused
        }
    }

    /// Whether the playing->paused transition happened at the end of the
    /// track. The SDK often reports position 0 after the end, so a zero
    /// position falls back to extrapolating the previous observation.
    fn near_end(&self, prev: &Observation, new: &PlayerState, now: Instant) -> bool {
        let duration = new.duration_ms.max(prev.state.duration_ms);
        if duration == 0 {
            return false;
        }
        let reached = if new.position_ms > 0 {
            new.position_ms
        } else {
            let elapsed = now.saturating_duration_since(prev.at).as_millis() as u64;
            prev.state.position_ms.saturating_add(elapsed)
        };
        reached.saturating_add(self.tolerance.as_millis() as u64) >= duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: Duration = Duration::from_millis(1500);
    const DEBOUNCE: Duration = Duration::from_millis(1000);
    const GRACE: Duration = Duration::from_millis(3000);

    fn r(id: &str) -> ExternalTrackRef {
        ExternalTrackRef::from_uri(&format!("spotify:track:{id}")).unwrap()
    }

    fn st(track: &str, paused: bool, pos: u64, dur: u64) -> PlayerState {
        PlayerState {
            track: Some(r(track)),
            paused,
            position_ms: pos,
            duration_ms: dur,
        }
    }

    fn ready_driver() -> PlaybackDriver {
        let mut d = PlaybackDriver::new(TOL, DEBOUNCE, GRACE);
        d.connecting();
        d.device_ready("dev-1".into());
        d
    }

    /// Driver playing track `a` (duration 180s) confirmed at `t0`.
    fn playing_a(t0: Instant) -> PlaybackDriver {
        let mut d = ready_driver();
        assert_eq!(d.begin_play(&r("a"), t0).unwrap(), "dev-1");
        let ev = d.observe(st("a", false, 0, 180_000), t0 + Duration::from_millis(200));
        assert_eq!(ev, vec![DriverEvent::Started { track: r("a") }]);
        d
    }

    #[test]
    fn lifecycle_states() {
        let mut d = PlaybackDriver::new(TOL, DEBOUNCE, GRACE);
        assert_eq!(d.state(), DriverState::Uninitialized);
        assert_eq!(d.begin_play(&r("a"), Instant::now()), Err(PlaybackError::NoDevice));
        d.connecting();
        assert_eq!(d.state(), DriverState::Connecting);
        d.device_ready("dev".into());
        assert_eq!(d.state(), DriverState::Ready);
        assert_eq!(d.device_lost(), vec![DriverEvent::DeviceLost]);
        assert_eq!(d.state(), DriverState::Uninitialized);
        assert!(d.device_lost().is_empty());
    }

    #[test]
    fn completion_detected_at_reset_position() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        d.observe(st("a", false, 178_000, 180_000), t0 + Duration::from_secs(178));
        let ev = d.observe(st("a", true, 0, 180_000), t0 + Duration::from_millis(179_600));
        assert_eq!(ev, vec![DriverEvent::Completed { track: r("a") }]);
        assert_eq!(d.state(), DriverState::Ready);
    }

    #[test]
    fn mid_track_pause_is_not_completion() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        let ev = d.observe(st("a", true, 60_000, 180_000), t0 + Duration::from_secs(60));
        assert_eq!(ev, vec![DriverEvent::Paused { track: r("a") }]);
        assert_eq!(d.state(), DriverState::Paused);
        let ev = d.observe(st("a", false, 60_000, 180_000), t0 + Duration::from_secs(70));
        assert_eq!(ev, vec![DriverEvent::Resumed { track: r("a") }]);
    }

    #[test]
    fn user_pause_near_end_is_not_completion() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        d.begin_pause().unwrap();
        let ev = d.observe(st("a", true, 179_500, 180_000), t0 + Duration::from_millis(179_500));
        assert_eq!(ev, vec![DriverEvent::Paused { track: r("a") }]);
    }

    #[test]
    fn duplicate_end_events_complete_once() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        d.observe(st("a", false, 179_000, 180_000), t0 + Duration::from_secs(179));
        let first = d.observe(st("a", true, 0, 180_000), t0 + Duration::from_millis(180_000));
        // SDK repeats the end: play, then paused again within the window.
        d.observe(st("a", false, 179_900, 180_000), t0 + Duration::from_millis(180_100));
        let second = d.observe(st("a", true, 0, 180_000), t0 + Duration::from_millis(180_300));
        assert_eq!(first, vec![DriverEvent::Completed { track: r("a") }]);
        assert!(!second.contains(&DriverEvent::Completed { track: r("a") }));
    }

    #[test]
    fn skip_and_completion_share_the_latch() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        d.observe(st("a", false, 179_000, 180_000), t0 + Duration::from_secs(179));
        assert!(d.try_skip(t0 + Duration::from_millis(179_500)));
        let ev = d.observe(st("a", true, 0, 180_000), t0 + Duration::from_millis(180_000));
        assert!(ev.is_empty());
    }

    #[test]
    fn completion_latch_is_per_track() {
        let t0 = Instant::now();
        let mut latch = AdvanceLatch::new(DEBOUNCE);
        assert!(latch.try_complete(&r("a"), t0));
        assert!(!latch.try_complete(&r("a"), t0 + Duration::from_millis(500)));
        assert!(latch.try_complete(&r("b"), t0 + Duration::from_millis(600)));
        assert!(latch.try_complete(&r("b"), t0 + Duration::from_millis(1700)));
    }

    #[test]
    fn skip_is_absorbed_by_any_recent_advance() {
        let t0 = Instant::now();
        let mut latch = AdvanceLatch::new(DEBOUNCE);
        assert!(latch.try_complete(&r("a"), t0));
        assert!(!latch.try_skip(Some(&r("b")), t0 + Duration::from_millis(300)));
        assert!(latch.try_skip(Some(&r("b")), t0 + Duration::from_millis(1000)));
        assert!(!latch.try_skip(Some(&r("c")), t0 + Duration::from_millis(1500)));
        // The end of the skipped track reported late is not a second advance.
        assert!(!latch.try_complete(&r("b"), t0 + Duration::from_millis(1600)));
    }

    #[test]
    fn skip_right_after_completion_is_suppressed() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        d.observe(st("a", false, 179_000, 180_000), t0 + Duration::from_secs(179));
        let ev = d.observe(st("a", true, 0, 180_000), t0 + Duration::from_millis(180_000));
        assert_eq!(ev, vec![DriverEvent::Completed { track: r("a") }]);

        // The completion started `b`; a skip issued in the same window must
        // not move past it.
        d.begin_play(&r("b"), t0 + Duration::from_millis(180_050)).unwrap();
        assert!(!d.try_skip(t0 + Duration::from_millis(180_100)));
        assert!(d.try_skip(t0 + Duration::from_millis(181_500)));
    }

    #[test]
    fn stale_events_during_play_grace_are_ignored() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        d.begin_play(&r("b"), t0 + Duration::from_secs(10)).unwrap();
        // The SDK still reports `a` briefly, then `b` starts.
        let ev = d.observe(st("a", true, 10_000, 180_000), t0 + Duration::from_millis(10_100));
        assert!(ev.is_empty());
        let ev = d.observe(st("b", false, 0, 200_000), t0 + Duration::from_millis(10_400));
        assert_eq!(ev, vec![DriverEvent::Started { track: r("b") }]);
    }

    #[test]
    fn foreign_track_after_grace_is_external_change() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        let ev = d.observe(st("z", false, 5_000, 200_000), t0 + Duration::from_secs(30));
        assert_eq!(ev, vec![DriverEvent::ExternalTrackChanged { track: r("z") }]);
        assert_eq!(d.expected_track(), Some(&r("z")));
        assert_eq!(d.state(), DriverState::Playing);
    }

    #[test]
    fn unconfirmed_play_falls_back_to_external_change() {
        let t0 = Instant::now();
        let mut d = playing_a(t0);
        d.begin_play(&r("b"), t0 + Duration::from_secs(10)).unwrap();
        let ev = d.observe(st("c", false, 0, 100_000), t0 + Duration::from_secs(14));
        assert_eq!(ev, vec![DriverEvent::ExternalTrackChanged { track: r("c") }]);
    }

    #[test]
    fn observations_before_ready_are_ignored() {
        let mut d = PlaybackDriver::new(TOL, DEBOUNCE, GRACE);
        d.connecting();
        assert!(d.observe(st("a", false, 0, 1000), Instant::now()).is_empty());
    }
}
