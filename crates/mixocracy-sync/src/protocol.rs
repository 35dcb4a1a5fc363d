// Message types crossing task boundaries: the bridge page's WebSocket
// protocol, console commands, and updates pushed back to the console.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ledger::{Address, TrackId};
use crate::playback::PlayerState;
use crate::queue::QueueSnapshot;
use crate::reconciler::SessionStatus;

// ---------------------------------------------------------------------------
// Bridge page -> engine
// ---------------------------------------------------------------------------

/// Messages from the browser page hosting the playback SDK.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeMessage {
    /// The SDK registered a device and can receive playback commands.
    DeviceReady { device_id: String },
    DeviceNotReady { device_id: String },
    /// `player_state_changed` relayed as-is.
    PlayerState(PlayerState),
    /// The page finished the PKCE login and hands over fresh tokens.
    Tokens {
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
    },
    /// The SDK's `getOAuthToken` callback fired.
    TokenRequest,
    Heartbeat,
    /// Initialization, authentication or account error from the SDK.
    DeviceError { message: String },
}

// ---------------------------------------------------------------------------
// Engine -> bridge page
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeCommand {
    Token { access_token: String },
    /// Refresh failed; the page must run the login flow again.
    Reauthenticate {
        client_id: String,
        redirect_uri: String,
    },
    /// Create and connect the SDK player.
    Connect { device_name: String },
    Disconnect,
}

impl BridgeCommand {
    pub fn to_json(&self) -> String {
        // Serializing a fieldless/string-only enum cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

// ---------------------------------------------------------------------------
// Console -> engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Start the session on the followed DJ's queue.
    Play,
    Skip,
    Pause,
    Resume,
    Stop,
    Vote(TrackId),
    Unvote(TrackId),
    /// Append a track to the local account's own queue. The name may embed
    /// a streaming URI as `Title|spotify:track:id`.
    Add(String),
    /// Remove a track from the local account's own queue.
    Remove(TrackId),
    /// Follow a DJ, or stop following with `None`.
    Target(Option<Address>),
    /// Start a set as the local account and follow it.
    GoLive,
    EndSet,
    Status,
    Quit,
}

impl FromStr for UserCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        // Track names keep their inner spaces.
        let line = line.trim();
        if let Some((verb, name)) = line.split_once(char::is_whitespace) {
            if verb.eq_ignore_ascii_case("add") {
                return Ok(UserCommand::Add(name.trim().to_string()));
            }
        }
        if line.eq_ignore_ascii_case("add") {
            return Err("`add` needs a track name".into());
        }

        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
        let arg = parts.next();
        if parts.next().is_some() {
            return Err(format!("too many arguments for `{verb}`"));
        }

        let track = |arg: Option<&str>| -> Result<TrackId, String> {
            let raw = arg.ok_or_else(|| format!("`{verb}` needs a track id"))?;
            raw.parse::<TrackId>()
                .map_err(|_| format!("invalid track id `{raw}`"))
        };

        let cmd = match verb.to_ascii_lowercase().as_str() {
            "play" | "start" => UserCommand::Play,
            "skip" | "next" => UserCommand::Skip,
            "pause" => UserCommand::Pause,
            "resume" => UserCommand::Resume,
            "stop" => UserCommand::Stop,
            "vote" => UserCommand::Vote(track(arg)?),
            "unvote" => UserCommand::Unvote(track(arg)?),
            "remove" => UserCommand::Remove(track(arg)?),
            "target" | "follow" => match arg {
                None | Some("none") => UserCommand::Target(None),
                Some(raw) => UserCommand::Target(Some(
                    raw.parse::<Address>().map_err(|e| format!("invalid address: {e}"))?,
                )),
            },
            "go-live" | "golive" => UserCommand::GoLive,
            "end-set" | "endset" => UserCommand::EndSet,
            "status" => UserCommand::Status,
            "quit" | "exit" => UserCommand::Quit,
            other => return Err(format!("unknown command `{other}`")),
        };
        Ok(cmd)
    }
}

// ---------------------------------------------------------------------------
// Engine -> console
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum UiUpdate {
    Queue(Arc<QueueSnapshot>),
    Session(SessionStatus),
    Roster(Vec<Address>),
    Bridge(ConnectionStatus),
    Notice(String),
}

impl fmt::Display for UiUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UiUpdate::Queue(snapshot) => {
                writeln!(f, "queue of {} ({} tracks):", snapshot.target, snapshot.len())?;
                for track in snapshot.tracks() {
                    let mine = if snapshot.has_my_vote(track.id) { "*" } else { " " };
                    writeln!(
                        f,
                        "  {mine}{:>5}  {:>3} votes  {}",
                        track.id.to_string(),
                        track.vote_count,
                        track.display_name
                    )?;
                }
                Ok(())
            }
            UiUpdate::Session(status) => {
                let target = status
                    .target
                    .map_or_else(|| "nobody".to_string(), |t| t.to_string());
                write!(
                    f,
                    "session: {} (following {}, {} played, {} queued)",
                    status.state,
                    target,
                    status.played.len(),
                    status.queue_len
                )
            }
            UiUpdate::Roster(djs) if djs.is_empty() => write!(f, "no live DJs"),
            UiUpdate::Roster(djs) => {
                let list: Vec<String> = djs.iter().map(|a| a.to_string()).collect();
                write!(f, "live DJs: {}", list.join(", "))
            }
            UiUpdate::Bridge(ConnectionStatus::Connected) => write!(f, "player bridge connected"),
            UiUpdate::Bridge(ConnectionStatus::Disconnected) => {
                write!(f, "player bridge disconnected")
            }
            UiUpdate::Notice(text) => f.write_str(text),
        }
    }
}
