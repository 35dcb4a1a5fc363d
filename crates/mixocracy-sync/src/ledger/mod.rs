// Vote ledger client: the typed read/write surface of the voting contract.
//
// Reads are best-effort and every failure surfaces as `Unavailable` so that
// callers keep their last good data instead of rendering an empty queue.
// Writes resolve once the transaction is confirmed (or rejected).

pub mod abi;
pub mod rpc;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use thiserror::Error;

pub use types::{Address, LedgerTrack, TrackId, TxHash};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Network/RPC failure or an empty/undecodable read. Retry on next poll.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The contract already holds a vote from this account for the track.
    #[error("already voted for track {0}")]
    AlreadyVoted(TrackId),

    /// Unvote without an existing vote.
    #[error("no existing vote for track {0}")]
    NotVoted(TrackId),

    /// Any other contract-level revert. Surfaced to the user, never retried.
    #[error("ledger rejected the transaction: {reason}")]
    Rejected { reason: String },
}

impl LedgerError {
    /// True for contract-level reverts, false for transport problems.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, LedgerError::Unavailable(_))
    }

    /// Map a revert reason string from the contract onto the error taxonomy.
    pub fn from_revert(reason: &str, track: Option<TrackId>) -> Self {
        match (reason, track) {
            ("ALREADY_VOTED", Some(id)) => LedgerError::AlreadyVoted(id),
            ("NOT_VOTED", Some(id)) => LedgerError::NotVoted(id),
            _ => LedgerError::Rejected {
                reason: reason.to_string(),
            },
        }
    }
}

/// Pull the revert reason out of a node error message such as
/// `execution reverted: "ALREADY_VOTED"` or `... reason="SET_NOT_ACTIVE" ...`.
pub fn extract_revert_reason(message: &str) -> Option<String> {
    let lower = message.to_ascii_lowercase();
    let marker = "execution reverted:";
    if let Some(pos) = lower.find(marker) {
        let rest = message[pos + marker.len()..].trim_start();
        let rest = rest.trim_start_matches('"');
        let reason: String = rest
            .chars()
            .take_while(|c| *c != '"' && *c != ',' && *c != '\n')
            .collect();
        let reason = reason.trim();
        if !reason.is_empty() {
            return Some(reason.to_string());
        }
    }
    if let Some(pos) = message.find("reason=\"") {
        let rest = &message[pos + "reason=\"".len()..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Ledger trait
// ---------------------------------------------------------------------------

/// The voting contract as seen by the engine. Implemented over JSON-RPC by
/// [`rpc::JsonRpcLedger`] and by in-memory fakes in tests.
#[async_trait]
pub trait VoteLedger: Send + Sync {
    /// Cast a vote. Resolves after confirmation.
    async fn vote(&self, target: Address, id: TrackId) -> Result<TxHash, LedgerError>;

    /// Retract a vote. Resolves after confirmation.
    async fn unvote(&self, target: Address, id: TrackId) -> Result<TxHash, LedgerError>;

    async fn query_tally(&self, target: Address, id: TrackId) -> Result<u64, LedgerError>;

    async fn query_has_voted(
        &self,
        voter: Address,
        target: Address,
        id: TrackId,
    ) -> Result<bool, LedgerError>;

    /// Batched read of all non-removed tracks with their tallies.
    async fn list_queue(&self, target: Address) -> Result<Vec<LedgerTrack>, LedgerError>;

    async fn song_count(&self, target: Address) -> Result<u64, LedgerError>;

    async fn song_name(&self, target: Address, id: TrackId) -> Result<String, LedgerError>;

    async fn is_song_removed(&self, target: Address, id: TrackId) -> Result<bool, LedgerError>;

    /// Append a track to the caller's own queue. `name` may carry an
    /// embedded streaming URI (`Title|spotify:track:id`).
    async fn add_track(&self, name: &str) -> Result<TxHash, LedgerError>;

    /// DJ-initiated removal from the DJ's own queue.
    async fn remove_track(&self, id: TrackId) -> Result<TxHash, LedgerError>;

    async fn active_djs(&self) -> Result<Vec<Address>, LedgerError>;

    async fn is_set_active(&self, target: Address) -> Result<bool, LedgerError>;

    async fn start_set(&self, target: Address) -> Result<TxHash, LedgerError>;

    async fn stop_set(&self, target: Address) -> Result<TxHash, LedgerError>;
}
