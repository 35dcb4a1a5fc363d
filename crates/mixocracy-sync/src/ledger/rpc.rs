// JSON-RPC implementation of `VoteLedger` (`eth_call` for reads,
// `eth_sendTransaction` + receipt polling for writes).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::abi::{self, Arg, Function};
use super::{extract_revert_reason, Address, LedgerError, LedgerTrack, TrackId, TxHash, VoteLedger};
use crate::config::LedgerConfig;

/// Selector of the standard `Error(string)` revert payload.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Why an RPC request failed, before mapping onto `LedgerError`.
#[derive(Debug, Clone)]
pub(crate) enum RpcFailure {
    Transport(String),
    Node(RpcErrorBody),
}

impl RpcFailure {
    /// Revert reason, if the node reported a contract revert.
    fn revert_reason(&self) -> Option<String> {
        match self {
            RpcFailure::Transport(_) => None,
            RpcFailure::Node(body) => body
                .data
                .as_ref()
                .and_then(Value::as_str)
                .and_then(decode_revert_data)
                .or_else(|| extract_revert_reason(&body.message)),
        }
    }

    fn describe(&self) -> String {
        match self {
            RpcFailure::Transport(e) => format!("transport error: {e}"),
            RpcFailure::Node(body) => format!("rpc error {}: {}", body.code, body.message),
        }
    }
}

/// Decode an `Error(string)` revert payload given as hex.
pub(crate) fn decode_revert_data(hex: &str) -> Option<String> {
    let bytes = abi::from_hex(hex).ok()?;
    if bytes.len() < 4 || bytes[..4] != ERROR_STRING_SELECTOR {
        return None;
    }
    abi::decode_string(&bytes[4..]).ok()
}

/// Interpret a raw JSON-RPC response body.
pub(crate) fn interpret_response(body: Value) -> Result<Value, RpcFailure> {
    let response: RpcResponse = serde_json::from_value(body)
        .map_err(|e| RpcFailure::Transport(format!("malformed rpc response: {e}")))?;
    if let Some(error) = response.error {
        return Err(RpcFailure::Node(error));
    }
    Ok(response.result.unwrap_or(Value::Null))
}

// ---------------------------------------------------------------------------
// JsonRpcLedger
// ---------------------------------------------------------------------------

pub struct JsonRpcLedger {
    http: reqwest::Client,
    rpc_url: String,
    contract: Address,
    account: Address,
    receipt_timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    pub fn new(
        rpc_url: String,
        contract: Address,
        account: Address,
        receipt_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(request_timeout).build()?,
            rpc_url,
            contract,
            account,
            receipt_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &LedgerConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.rpc_url.clone(),
            config.contract_address,
            config.account,
            Duration::from_secs(config.receipt_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(e.to_string()))?;
        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("status {status}: {e}")))?;
        interpret_response(value)
    }

    /// Read-only contract call. Any failure is `Unavailable`.
    async fn call(&self, function: &Function, args: &[Arg<'_>]) -> Result<Vec<u8>, LedgerError> {
        let data = abi::to_hex(&abi::encode_call(function, args));
        let params = json!([{ "to": self.contract.to_string(), "data": data }, "latest"]);
        let result = self.rpc("eth_call", params).await.map_err(|f| {
            LedgerError::Unavailable(format!("{} failed: {}", function.signature, f.describe()))
        })?;
        let hex = result.as_str().unwrap_or("0x");
        let bytes = abi::from_hex(hex).map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        if bytes.is_empty() {
            return Err(LedgerError::Unavailable(format!(
                "{} returned empty data (selector mismatch?)",
                function.signature
            )));
        }
        Ok(bytes)
    }

    /// Submit a transaction and wait for its receipt.
    async fn transact(
        &self,
        function: &Function,
        args: &[Arg<'_>],
        track: Option<TrackId>,
    ) -> Result<TxHash, LedgerError> {
        let data = abi::to_hex(&abi::encode_call(function, args));
        let params = json!([{
            "from": self.account.to_string(),
            "to": self.contract.to_string(),
            "data": data,
        }]);
        let result = self
            .rpc("eth_sendTransaction", params)
            .await
            .map_err(|f| match f.revert_reason() {
                Some(reason) => LedgerError::from_revert(&reason, track),
                None => LedgerError::Unavailable(f.describe()),
            })?;
        let hash = result
            .as_str()
            .map(|s| TxHash(s.to_string()))
            .ok_or_else(|| LedgerError::Unavailable("eth_sendTransaction returned no hash".into()))?;
        info!("Submitted {} as {}", function.signature, hash);
        self.wait_for_receipt(&hash).await?;
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: &TxHash) -> Result<(), LedgerError> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        loop {
            match self.rpc("eth_getTransactionReceipt", json!([hash.0])).await {
                Ok(Value::Null) => debug!("Receipt for {} not yet available", hash),
                Ok(receipt) => {
                    let status = receipt.get("status").and_then(Value::as_str).unwrap_or("0x1");
                    return if status == "0x1" {
                        Ok(())
                    } else {
                        Err(LedgerError::Rejected {
                            reason: format!("transaction {hash} reverted"),
                        })
                    };
                }
                Err(f) => warn!("Receipt poll for {} failed: {}", hash, f.describe()),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LedgerError::Unavailable(format!(
                    "no receipt for {hash} within {:?}",
                    self.receipt_timeout
                )));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

fn decode_err(e: abi::AbiError) -> LedgerError {
    LedgerError::Unavailable(format!("decode failed: {e}"))
}

#[async_trait]
impl VoteLedger for JsonRpcLedger {
    async fn vote(&self, target: Address, id: TrackId) -> Result<TxHash, LedgerError> {
        self.transact(&abi::VOTE, &[Arg::Address(target), Arg::Uint(id.0)], Some(id))
            .await
    }

    async fn unvote(&self, target: Address, id: TrackId) -> Result<TxHash, LedgerError> {
        self.transact(&abi::UNVOTE, &[Arg::Address(target), Arg::Uint(id.0)], Some(id))
            .await
    }

    async fn query_tally(&self, target: Address, id: TrackId) -> Result<u64, LedgerError> {
        let data = self
            .call(&abi::GET_VOTES, &[Arg::Address(target), Arg::Uint(id.0)])
            .await?;
        abi::decode_uint(&data).map_err(decode_err)
    }

    async fn query_has_voted(
        &self,
        voter: Address,
        target: Address,
        id: TrackId,
    ) -> Result<bool, LedgerError> {
        let data = self
            .call(
                &abi::HAS_VOTED,
                &[Arg::Address(voter), Arg::Address(target), Arg::Uint(id.0)],
            )
            .await?;
        abi::decode_bool(&data).map_err(decode_err)
    }

    async fn list_queue(&self, target: Address) -> Result<Vec<LedgerTrack>, LedgerError> {
        let data = self
            .call(&abi::GET_ALL_SONGS_WITH_VOTES, &[Arg::Address(target)])
            .await?;
        let rows = abi::decode_song_rows(&data).map_err(decode_err)?;
        Ok(rows
            .into_iter()
            .map(|(id, name, votes)| LedgerTrack {
                id: TrackId(id),
                name,
                votes,
                removed: false,
            })
            .collect())
    }

    async fn song_count(&self, target: Address) -> Result<u64, LedgerError> {
        let data = self.call(&abi::GET_SONG_COUNT, &[Arg::Address(target)]).await?;
        abi::decode_uint(&data).map_err(decode_err)
    }

    async fn song_name(&self, target: Address, id: TrackId) -> Result<String, LedgerError> {
        let data = self
            .call(&abi::GET_SONG, &[Arg::Address(target), Arg::Uint(id.0)])
            .await?;
        abi::decode_string(&data).map_err(decode_err)
    }

    async fn is_song_removed(&self, target: Address, id: TrackId) -> Result<bool, LedgerError> {
        let data = self
            .call(&abi::IS_SONG_REMOVED, &[Arg::Address(target), Arg::Uint(id.0)])
            .await?;
        abi::decode_bool(&data).map_err(decode_err)
    }

    async fn add_track(&self, name: &str) -> Result<TxHash, LedgerError> {
        if name.trim().is_empty() {
            return Err(LedgerError::Rejected {
                reason: "track name is empty".into(),
            });
        }
        self.transact(&abi::ADD_SONG, &[Arg::Str(name)], None).await
    }

    async fn remove_track(&self, id: TrackId) -> Result<TxHash, LedgerError> {
        self.transact(&abi::REMOVE_SONG, &[Arg::Uint(id.0)], Some(id)).await
    }

    async fn active_djs(&self) -> Result<Vec<Address>, LedgerError> {
        let data = self.call(&abi::GET_ACTIVE_DJS, &[]).await?;
        abi::decode_address_array(&data).map_err(decode_err)
    }

    async fn is_set_active(&self, target: Address) -> Result<bool, LedgerError> {
        let data = self.call(&abi::IS_SET_ACTIVE, &[Arg::Address(target)]).await?;
        abi::decode_bool(&data).map_err(decode_err)
    }

    async fn start_set(&self, target: Address) -> Result<TxHash, LedgerError> {
        self.transact(&abi::START_SET, &[Arg::Address(target)], None).await
    }

    async fn stop_set(&self, target: Address) -> Result<TxHash, LedgerError> {
        self.transact(&abi::STOP_SET, &[Arg::Address(target)], None).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
