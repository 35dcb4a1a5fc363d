// Batch track resolution, run off the reconciliation path. Results carry the
// session generation they were requested under so stale batches are dropped.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ExternalTrackRef, PlaybackError, StreamingApi};
use crate::ledger::TrackId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub id: TrackId,
    pub name: String,
    pub hint: Option<ExternalTrackRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(ExternalTrackRef),
    /// No match exists; do not ask again this session.
    Unresolvable,
    /// Rate limit, network or auth trouble; retry on the next rebuild.
    Deferred,
}

/// Resolve each request in order. Once the service reports a retryable
/// failure the rest of the batch is deferred instead of hammering it.
pub async fn resolve_batch(
    api: Arc<dyn StreamingApi>,
    requests: Vec<ResolveRequest>,
) -> Vec<(TrackId, ResolveOutcome)> {
    let mut out = Vec::with_capacity(requests.len());
    let mut backing_off = false;

    for req in requests {
        if backing_off {
            out.push((req.id, ResolveOutcome::Deferred));
            continue;
        }
        let outcome = match api.resolve(&req.name, req.hint.as_ref()).await {
            Ok(found) => {
                debug!("Resolved {} `{}` -> {}", req.id, req.name, found);
                ResolveOutcome::Resolved(found)
            }
            Err(e @ PlaybackError::TrackResolution { .. }) => {
                warn!("Track {} unresolvable: {}", req.id, e);
                ResolveOutcome::Unresolvable
            }
            Err(e) if e.is_retryable() => {
                warn!("Resolution of {} deferred: {}", req.id, e);
                backing_off = true;
                ResolveOutcome::Deferred
            }
            Err(e) => {
                warn!("Track {} unresolvable: {}", req.id, e);
                ResolveOutcome::Unresolvable
            }
        };
        out.push((req.id, outcome));
    }
    out
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Scripted streaming service shared by the playback and app tests.
    #[derive(Default)]
    pub struct FakeStreaming {
        pub catalog: Mutex<HashMap<String, Result<ExternalTrackRef, PlaybackError>>>,
        pub calls: Mutex<Vec<String>>,
        pub play_result: Mutex<Option<PlaybackError>>,
        pub token_result: Mutex<Option<PlaybackError>>,
    }

    impl FakeStreaming {
        pub fn with_track(self, name: &str, uri: &str) -> Self {
            let r = ExternalTrackRef::from_uri(uri).unwrap();
            self.catalog.lock().unwrap().insert(name.to_string(), Ok(r));
            self
        }

        pub fn with_failure(self, name: &str, err: PlaybackError) -> Self {
            self.catalog.lock().unwrap().insert(name.to_string(), Err(err));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamingApi for FakeStreaming {
        async fn resolve(
            &self,
            name: &str,
            hint: Option<&ExternalTrackRef>,
        ) -> Result<ExternalTrackRef, PlaybackError> {
            self.calls.lock().unwrap().push(format!("resolve {name}"));
            if let Some(h) = hint {
                return Ok(h.clone());
            }
            self.catalog
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| {
                    Err(PlaybackError::TrackResolution {
                        query: name.to_string(),
                        reason: "no search results".into(),
                    })
                })
        }

        async fn play(&self, device_id: &str, track: &ExternalTrackRef) -> Result<(), PlaybackError> {
            self.calls.lock().unwrap().push(format!("play {device_id} {track}"));
            match self.play_result.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn pause(&self, device_id: &str) -> Result<(), PlaybackError> {
            self.calls.lock().unwrap().push(format!("pause {device_id}"));
            Ok(())
        }

        async fn resume(&self, device_id: &str) -> Result<(), PlaybackError> {
            self.calls.lock().unwrap().push(format!("resume {device_id}"));
            Ok(())
        }

        async fn transfer_playback(&self, device_id: &str) -> Result<(), PlaybackError> {
            self.calls.lock().unwrap().push(format!("transfer {device_id}"));
            Ok(())
        }

        async fn access_token(&self) -> Result<String, PlaybackError> {
            self.calls.lock().unwrap().push("token".into());
            match self.token_result.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok("fake-access-token".into()),
            }
        }
    }
}
