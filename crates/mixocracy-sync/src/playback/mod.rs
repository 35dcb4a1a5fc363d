// Streaming collaborator surface and the playback driver.

pub mod auth;
pub mod driver;
pub mod resolver;
pub mod spotify;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque handle the streaming service plays, e.g. `spotify:track:4uLU6hMC`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalTrackRef(String);

impl ExternalTrackRef {
    const PREFIX: &'static str = "spotify:track:";

    /// Accepts `spotify:track:<id>` with a non-empty alphanumeric id.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let id = uri.trim().strip_prefix(Self::PREFIX)?;
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(ExternalTrackRef(format!("{}{id}", Self::PREFIX)))
    }

    pub fn uri(&self) -> &str {
        &self.0
    }

    /// Service-side track id (the part after the prefix).
    pub fn track_id(&self) -> &str {
        &self.0[Self::PREFIX.len()..]
    }
}

impl fmt::Display for ExternalTrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    /// No device is registered/active to receive commands. Recoverable once
    /// the bridge reconnects.
    #[error("no active playback device")]
    NoDevice,

    /// Token refresh failed; the user has to re-authenticate.
    #[error("streaming authorization expired")]
    AuthExpired,

    /// Neither lookup nor search found a playable match.
    #[error("could not resolve `{query}`: {reason}")]
    TrackResolution { query: String, reason: String },

    /// 429 / 5xx / transport failure. Retried on a later pass.
    #[error("transient streaming failure: {0}")]
    Transient(String),

    #[error("streaming api error {status}: {message}")]
    Api { status: u16, message: String },
}

impl PlaybackError {
    /// Errors where the same command is expected to succeed later, as
    /// opposed to a problem with the track itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlaybackError::NoDevice | PlaybackError::AuthExpired | PlaybackError::Transient(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Player state as reported by the playback SDK
// ---------------------------------------------------------------------------

/// One `player_state_changed` observation relayed by the bridge page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub track: Option<ExternalTrackRef>,
    pub paused: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Streaming API trait
// ---------------------------------------------------------------------------

/// REST side of the streaming service. Implemented by
/// [`spotify::SpotifyClient`] and by fakes in tests.
#[async_trait]
pub trait StreamingApi: Send + Sync {
    /// Find a playable ref for a ledger track. `hint` is a ref embedded in
    /// the track name; it is verified before being trusted.
    async fn resolve(
        &self,
        name: &str,
        hint: Option<&ExternalTrackRef>,
    ) -> Result<ExternalTrackRef, PlaybackError>;

    /// Start `track` from the beginning on `device_id`.
    async fn play(&self, device_id: &str, track: &ExternalTrackRef) -> Result<(), PlaybackError>;

    async fn pause(&self, device_id: &str) -> Result<(), PlaybackError>;

    async fn resume(&self, device_id: &str) -> Result<(), PlaybackError>;

    /// Make `device_id` the active device without starting playback.
    async fn transfer_playback(&self, device_id: &str) -> Result<(), PlaybackError>;

    /// Access token for the browser SDK, refreshed if it is about to expire.
    async fn access_token(&self) -> Result<String, PlaybackError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_ref_parses_uri() {
        let r = ExternalTrackRef::from_uri(" spotify:track:4uLU6hMCjMI75M1A2tKUQC ").unwrap();
        assert_eq!(r.uri(), "spotify:track:4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(r.track_id(), "4uLU6hMCjMI75M1A2tKUQC");
    }

    #[test]
    fn external_ref_rejects_other_uris() {
        assert!(ExternalTrackRef::from_uri("spotify:album:abc").is_none());
        assert!(ExternalTrackRef::from_uri("spotify:track:").is_none());
        assert!(ExternalTrackRef::from_uri("spotify:track:ab/cd").is_none());
    }

    #[test]
    fn retryable_classification() {
        assert!(PlaybackError::NoDevice.is_retryable());
        assert!(PlaybackError::Transient("429".into()).is_retryable());
        assert!(!PlaybackError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!PlaybackError::TrackResolution {
            query: "x".into(),
            reason: "none".into()
        }
        .is_retryable());
    }
}
