// RemovalCoordinator: retires finished tracks from the ledger through the
// privileged removal relay.
//
// Requests arrive over a channel from the event loop. A request matching one
// already waiting or in flight is dropped. Requests are processed FIFO with a
// fixed delay between items and never retried automatically: a failed
// removal only means the track lingers in later snapshots, where the played
// set already keeps it from being selected. A fresh request for the same
// track after it left the queue is attempted again.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::RemovalConfig;
use crate::ledger::{Address, TrackId};
use crate::queue::PollerControl;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The relay's wallet is not registered as a DJ.
    #[error("removal relay not authorized: {0}")]
    Forbidden(String),

    #[error("removal relay wallet needs funding ({})", .address.as_deref().unwrap_or("unknown address"))]
    Unfunded { address: Option<String> },

    #[error("removal relay returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("removal relay unreachable: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Removed { tx: Option<String> },
    /// The relay answered 200 but has no wallet configured; nothing happened.
    NotConfigured,
}

#[async_trait]
pub trait RemovalRelay: Send + Sync {
    async fn remove(&self, target: Address, id: TrackId) -> Result<RelayOutcome, RelayError>;
}

// ---------------------------------------------------------------------------
// HTTP relay
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoveBody {
    song_id: u64,
    dj_address: Address,
}

pub struct HttpRelay {
    http: reqwest::Client,
    url: String,
}

impl HttpRelay {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(request_timeout).build()?,
            url: url.into(),
        })
    }

    pub fn from_config(config: &RemovalConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.relay_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }
}

#[async_trait]
impl RemovalRelay for HttpRelay {
    async fn remove(&self, target: Address, id: TrackId) -> Result<RelayOutcome, RelayError> {
        let response = self
            .http
            .post(&self.url)
            .json(&RemoveBody {
                song_id: id.0,
                dj_address: target,
            })
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        interpret_relay_response(status, &body)
    }
}

pub(crate) fn interpret_relay_response(
    status: StatusCode,
    body: &str,
) -> Result<RelayOutcome, RelayError> {
    let json: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let field = |name: &str| json.get(name).and_then(Value::as_str).map(str::to_string);

    match status {
        s if s.is_success() => {
            if json.get("warning").and_then(Value::as_bool) == Some(true) {
                return Ok(RelayOutcome::NotConfigured);
            }
            Ok(RelayOutcome::Removed {
                tx: field("transactionHash"),
            })
        }
        StatusCode::FORBIDDEN => Err(RelayError::Forbidden(
            field("details")
                .or_else(|| field("error"))
                .unwrap_or_else(|| "forbidden".into()),
        )),
        StatusCode::SERVICE_UNAVAILABLE => Err(RelayError::Unfunded {
            address: field("address"),
        }),
        s => Err(RelayError::Http {
            status: s.as_u16(),
            message: field("error").unwrap_or_else(|| body.chars().take(200).collect()),
        }),
    }
}

// ---------------------------------------------------------------------------
// Coordinator task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemovalRequest {
    pub target: Address,
    pub track_id: TrackId,
}

pub struct RemovalCoordinator<R: RemovalRelay> {
    relay: R,
    inter_item_delay: Duration,
    /// Waiting in `queue` or being sent to the relay.
    queued: HashSet<RemovalRequest>,
    queue: VecDeque<RemovalRequest>,
    poller: Option<mpsc::Sender<PollerControl>>,
}

impl<R: RemovalRelay> RemovalCoordinator<R> {
    pub fn new(relay: R, inter_item_delay: Duration) -> Self {
        Self {
            relay,
            inter_item_delay,
            queued: HashSet::new(),
            queue: VecDeque::new(),
            poller: None,
        }
    }

    /// Ask the poller for an early refresh after each confirmed removal.
    pub fn with_poller(mut self, poller: mpsc::Sender<PollerControl>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Run until the request channel closes and the queue has drained.
    pub async fn run(mut self, mut requests: mpsc::Receiver<RemovalRequest>) {
        let mut ready_at = Instant::now();
        let mut closed = false;

        loop {
            if closed && self.queue.is_empty() {
                break;
            }
            let has_work = !self.queue.is_empty();
            // Intake first: buffered duplicates are merged before anything is sent.
            tokio::select! {
                biased;

                req = requests.recv(), if !closed => match req {
                    Some(req) => self.enqueue(req),
                    None => closed = true,
                },
                _ = sleep_until(ready_at), if has_work => {
                    self.process_next().await;
                    ready_at = Instant::now() + self.inter_item_delay;
                }
            }
        }
        info!("Removal coordinator stopped");
    }

    fn enqueue(&mut self, req: RemovalRequest) {
        if !self.queued.insert(req) {
            debug!("Removal of {} for {} already pending", req.track_id, req.target);
            return;
        }
        debug!("Queued removal of {} ({} pending)", req.track_id, self.queue.len() + 1);
        self.queue.push_back(req);
    }

    async fn process_next(&mut self) {
        if let Some(req) = self.queue.pop_front() {
            self.process(req).await;
            self.queued.remove(&req);
        }
    }

    async fn process(&self, req: RemovalRequest) {
        match self.relay.remove(req.target, req.track_id).await {
            Ok(RelayOutcome::Removed { tx }) => {
                info!(
                    "Removed {} from {}'s queue (tx {})",
                    req.track_id,
                    req.target,
                    tx.as_deref().unwrap_or("unknown")
                );
                if let Some(poller) = &self.poller {
                    let _ = poller.send(PollerControl::PollNow).await;
                }
            }
            Ok(RelayOutcome::NotConfigured) => {
                warn!("Removal relay not configured; {} stays on the ledger", req.track_id);
            }
            Err(e) => warn!("Removal of {} failed, dropping: {}", req.track_id, e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeRelay {
        calls: Arc<Mutex<Vec<(TrackId, Instant)>>>,
        fail: Arc<Mutex<Option<RelayError>>>,
    }

    impl FakeRelay {
        fn calls(&self) -> Vec<(TrackId, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemovalRelay for FakeRelay {
        async fn remove(&self, _target: Address, id: TrackId) -> Result<RelayOutcome, RelayError> {
            self.calls.lock().unwrap().push((id, Instant::now()));
            match self.fail.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(RelayOutcome::Removed {
                    tx: Some(format!("0x{}", id.0)),
                }),
            }
        }
    }

    fn dj() -> Address {
        Address::from_bytes([0xd1; 20])
    }

    fn req(id: u64) -> RemovalRequest {
        RemovalRequest {
            target: dj(),
            track_id: TrackId(id),
        }
    }

    #[tokio::test]
    async fn dedups_and_spaces_requests_fifo() {
        tokio::time::pause();
        let relay = FakeRelay::default();
        let (tx, rx) = mpsc::channel(16);
        let coordinator = RemovalCoordinator::new(relay.clone(), Duration::from_secs(2));
        for id in [3, 1, 3, 2, 1] {
            tx.send(req(id)).await.unwrap();
        }
        drop(tx);
        coordinator.run(rx).await;

        let calls = relay.calls();
        let ids: Vec<u64> = calls.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn failures_are_dropped_until_requested_again() {
        tokio::time::pause();
        let relay = FakeRelay::default();
        *relay.fail.lock().unwrap() = Some(RelayError::Unfunded {
            address: Some("0xhot".into()),
        });
        let (tx, rx) = mpsc::channel(16);
        let (poll_tx, mut poll_rx) = mpsc::channel(4);
        let handle = tokio::spawn(
            RemovalCoordinator::new(relay.clone(), Duration::from_secs(2))
                .with_poller(poll_tx)
                .run(rx),
        );
        tx.send(req(7)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(relay.calls().len(), 1);

        // No automatic retry, but a later request for the same track is
        // attempted once more.
        tx.send(req(7)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(relay.calls().len(), 2);
        assert!(poll_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn completed_requests_are_forgotten() {
        let relay = FakeRelay::default();
        let mut coordinator = RemovalCoordinator::new(relay.clone(), Duration::from_secs(2));
        for id in [1, 2, 1] {
            coordinator.enqueue(req(id));
        }
        assert_eq!(coordinator.queue.len(), 2);

        coordinator.process_next().await;
        coordinator.process_next().await;
        assert!(coordinator.queued.is_empty());

        coordinator.enqueue(req(1));
        assert_eq!(coordinator.queue.len(), 1);
        assert_eq!(relay.calls().len(), 2);
    }

    #[tokio::test]
    async fn http_relay_gives_up_on_a_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold connections without ever answering.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let relay = HttpRelay::new(
            format!("http://{addr}/api/remove-played-song"),
            Duration::from_millis(300),
        )
        .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), relay.remove(dj(), TrackId(1)))
            .await
            .expect("request should time out on its own");
        assert!(matches!(result, Err(RelayError::Transport(_))));
        server.abort();
    }

    #[tokio::test]
    async fn success_nudges_poller() {
        tokio::time::pause();
        let relay = FakeRelay::default();
        let (tx, rx) = mpsc::channel(16);
        let (poll_tx, mut poll_rx) = mpsc::channel(4);
        tx.send(req(1)).await.unwrap();
        drop(tx);
        RemovalCoordinator::new(relay, Duration::from_secs(2))
            .with_poller(poll_tx)
            .run(rx)
            .await;
        assert_eq!(poll_rx.recv().await, Some(PollerControl::PollNow));
    }

    #[test]
    fn relay_responses_are_classified() {
        assert_eq!(
            interpret_relay_response(StatusCode::OK, r#"{"success":true,"transactionHash":"0xab"}"#),
            Ok(RelayOutcome::Removed {
                tx: Some("0xab".into())
            })
        );
        assert_eq!(
            interpret_relay_response(
                StatusCode::OK,
                r#"{"error":"Automatic removal not configured","warning":true}"#
            ),
            Ok(RelayOutcome::NotConfigured)
        );
        assert_eq!(
            interpret_relay_response(
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":"Hot wallet needs funding","address":"0xfeed"}"#
            ),
            Err(RelayError::Unfunded {
                address: Some("0xfeed".into())
            })
        );
        assert!(matches!(
            interpret_relay_response(StatusCode::FORBIDDEN, r#"{"error":"Hot wallet not authorized"}"#),
            Err(RelayError::Forbidden(_))
        ));
        assert_eq!(
            interpret_relay_response(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            Err(RelayError::Http {
                status: 500,
                message: "boom".into()
            })
        );
    }

    #[test]
    fn request_body_uses_relay_field_names() {
        let body = serde_json::to_value(RemoveBody {
            song_id: 4,
            dj_address: dj(),
        })
        .unwrap();
        assert_eq!(body["songId"], 4);
        assert_eq!(body["djAddress"], dj().to_string());
    }
}
