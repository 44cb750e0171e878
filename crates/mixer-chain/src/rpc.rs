//! Minimal JSON-RPC transport for the two Ethereum methods this crate needs:
//! `eth_blockNumber` and `eth_getLogs`. Kept as a small trait so the poller's
//! chunking/retry/decode logic can be exercised against a fake client in
//! tests, without opening a socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mixer_types::{MixerError, Result};
use serde::Deserialize;
use serde_json::{json, Value};

/// A single decoded-enough log entry, as returned by `eth_getLogs`.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub block_number: u64,
    pub transaction_hash: String,
    /// `topics[0]` is the event signature hash; `topics[1..]` are indexed args.
    pub topics: Vec<String>,
    /// Raw ABI-encoded, non-indexed event data.
    pub data: Vec<u8>,
}

/// The RPC surface the [`crate::EventPoller`] depends on.
pub trait RpcClient: Send + Sync {
    /// Current chain head block number.
    fn block_number(&self) -> Result<u64>;

    /// Logs matching `address` and any of `topics[0]` in the inclusive
    /// `[from_block, to_block]` window.
    fn get_logs(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
        topics: &[[u8; 32]],
    ) -> Result<Vec<RawLog>>;
}

/// JSON-RPC client over HTTP, used for both `http(s)://` and `ws(s)://`
/// endpoints — the core has no push-subscription dependency, so a WebSocket
/// URL is routed through the same request/response transport.
pub struct HttpRpcClient {
    url: String,
    client: reqwest::blocking::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| MixerError::Rpc(format!("failed to build RPC client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| MixerError::Rpc(format!("{method} request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(MixerError::Rpc(format!(
                "{method} returned HTTP {}",
                resp.status()
            )));
        }

        #[derive(Deserialize)]
        struct Envelope {
            result: Option<Value>,
            error: Option<RpcErrorBody>,
        }
        #[derive(Deserialize)]
        struct RpcErrorBody {
            code: i64,
            message: String,
        }

        let envelope: Envelope = resp
            .json()
            .map_err(|e| MixerError::Rpc(format!("{method} response not valid JSON-RPC: {e}")))?;

        if let Some(err) = envelope.error {
            return Err(MixerError::Rpc(format!(
                "{method} error {}: {}",
                err.code, err.message
            )));
        }
        envelope
            .result
            .ok_or_else(|| MixerError::Rpc(format!("{method} response missing result")))
    }
}

impl RpcClient for HttpRpcClient {
    fn block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([]))?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| MixerError::Rpc("eth_blockNumber result not a string".into()))?;
        parse_quantity(hex_str)
    }

    fn get_logs(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
        topics: &[[u8; 32]],
    ) -> Result<Vec<RawLog>> {
        let topic_hexes: Vec<String> = topics.iter().map(|t| format!("0x{}", hex::encode(t))).collect();
        let params = json!([{
            "address": address,
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
            "topics": [topic_hexes],
        }]);

        let result = self.call("eth_getLogs", params)?;
        let entries = result
            .as_array()
            .ok_or_else(|| MixerError::Rpc("eth_getLogs result not an array".into()))?;

        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            logs.push(parse_log_entry(entry)?);
        }
        Ok(logs)
    }
}

fn parse_log_entry(entry: &Value) -> Result<RawLog> {
    let block_number = entry
        .get("blockNumber")
        .and_then(Value::as_str)
        .ok_or_else(|| MixerError::Rpc("log entry missing blockNumber".into()))
        .and_then(parse_quantity)?;
    let transaction_hash = entry
        .get("transactionHash")
        .and_then(Value::as_str)
        .ok_or_else(|| MixerError::Rpc("log entry missing transactionHash".into()))?
        .to_string();
    let topics = entry
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| MixerError::Rpc("log entry missing topics".into()))?
        .iter()
        .map(|t| t.as_str().unwrap_or_default().to_string())
        .collect();
    let data_hex = entry
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| MixerError::Rpc("log entry missing data".into()))?;
    let data = mixer_types::hex_to_bytes(data_hex)?;

    Ok(RawLog {
        block_number,
        transaction_hash,
        topics,
        data,
    })
}

fn parse_quantity(hex_str: &str) -> Result<u64> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    u64::from_str_radix(stripped, 16)
        .map_err(|e| MixerError::Rpc(format!("invalid quantity {hex_str:?}: {e}")))
}
