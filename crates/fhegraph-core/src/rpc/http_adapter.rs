//! Native JSON-RPC client for EVM-compatible endpoints.
//!
//! Implements [`EvmRpc`] over HTTP using `reqwest`, with optional basic
//! auth, an optional request-rate limiter, and exponential-backoff retry
//! for transport-level failures.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{CoreError, RpcError};

use super::types::{LogFilter, RpcLog};
use super::EvmRpc;

/// Retry policy for transport failures: 5 attempts with delays of
/// 400ms × 2^attempt between them.
const MAX_RPC_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY_MS: u64 = 400;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// HTTP-based EVM JSON-RPC client.
///
/// Every call goes through the retry wrapper; only transport-level
/// failures (connection errors, timeouts, 5xx) are retried, JSON-RPC
/// logic errors surface immediately.
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
    limiter: Option<DirectRateLimiter>,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a new client pointing at `url` with optional basic auth.
    ///
    /// If `requests_per_second` is set, calls are rate-limited per
    /// outbound HTTP request.
    pub fn new(
        url: &str,
        user: Option<&str>,
        pass: Option<&str>,
        requests_per_second: Option<u32>,
    ) -> Result<Self, CoreError> {
        let auth = match (user, pass) {
            (Some(u), Some(p)) => Some((u.to_owned(), p.to_owned())),
            _ => None,
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .expect("reqwest client builder uses valid static config");

        let limiter = match requests_per_second {
            None => None,
            Some(limit) => {
                let limit = NonZeroU32::new(limit).ok_or_else(|| {
                    CoreError::InvalidEventData(
                        "requests_per_second must be at least 1".to_owned(),
                    )
                })?;
                Some(RateLimiter::direct(Quota::per_second(limit)))
            }
        };

        Ok(Self {
            client,
            url: url.to_owned(),
            auth,
            limiter,
            next_id: AtomicU64::new(initial_request_id()),
        })
    }

    async fn wait_for_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// One JSON-RPC call with retry. Transport errors back off
    /// exponentially up to [`MAX_RPC_ATTEMPTS`]; the last error surfaces.
    async fn rpc_call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        let mut attempt = 0u32;
        loop {
            match self.rpc_call_once(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(CoreError::Rpc(err)) if err.is_retryable() && attempt + 1 < MAX_RPC_ATTEMPTS => {
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS << attempt);
                    warn!(
                        rpc.method = method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient rpc failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn rpc_call_once(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        self.wait_for_rate_limit().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            rpc.id = id,
            rpc.method = method,
            rpc.params = params.len(),
            "rpc call"
        );
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let mut builder = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&req);
        if let Some((ref user, ref pass)) = self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = builder.send().await.map_err(RpcError::Transport)?;
        let status = response.status();
        if status.is_server_error() {
            return Err(RpcError::HttpStatus(status.as_u16()).into());
        }

        let body = response.text().await.map_err(RpcError::Transport)?;
        debug!(rpc.id = id, rpc.method = method, %status, body_len = body.len(), "rpc response");
        trace!(rpc.id = id, rpc.method = method, body = %body, "rpc response body");

        let decoded: JsonRpcResponse = serde_json::from_str(&body).map_err(|e| {
            RpcError::InvalidResponse(format!("decode JSON-RPC response: {e}; body={body}"))
        })?;

        if let Some(err) = decoded.error {
            return Err(parse_jsonrpc_error(err));
        }

        Ok(decoded.result.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl EvmRpc for HttpRpcClient {
    async fn block_number(&self) -> Result<u64, CoreError> {
        let raw = self.rpc_call("eth_blockNumber", Vec::new()).await?;
        parse_quantity(&raw, "blockNumber")
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, CoreError> {
        let mut params = serde_json::Map::new();
        params.insert(
            "fromBlock".to_owned(),
            serde_json::json!(to_quantity(filter.from_block)),
        );
        params.insert(
            "toBlock".to_owned(),
            serde_json::json!(to_quantity(filter.to_block)),
        );
        if let Some(address) = filter.address {
            params.insert(
                "address".to_owned(),
                serde_json::json!(format!("0x{}", hex::encode(address.as_slice()))),
            );
        }

        let raw = self
            .rpc_call("eth_getLogs", vec![serde_json::Value::Object(params)])
            .await?;
        let items = raw
            .as_array()
            .ok_or_else(|| RpcError::InvalidResponse("eth_getLogs: expected array".to_owned()))?;
        items.iter().map(parse_log).collect()
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>, CoreError> {
        let raw = self
            .rpc_call(
                "eth_getBlockByNumber",
                vec![
                    serde_json::json!(to_quantity(block_number)),
                    serde_json::json!(false),
                ],
            )
            .await?;
        if raw.is_null() {
            return Ok(None);
        }
        let timestamp = raw.get("timestamp").ok_or_else(|| {
            RpcError::InvalidResponse("eth_getBlockByNumber: missing timestamp".to_owned())
        })?;
        parse_quantity(timestamp, "timestamp").map(Some)
    }
}

// ==============================================================================
// JSON-RPC Protocol Types
// ==============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

/// Parse a JSON-RPC error value into a structured `CoreError`.
fn parse_jsonrpc_error(err: serde_json::Value) -> CoreError {
    #[derive(Deserialize)]
    struct JsonRpcError {
        code: i64,
        message: String,
    }

    if let Ok(parsed) = serde_json::from_value::<JsonRpcError>(err.clone()) {
        CoreError::Rpc(RpcError::ServerError {
            code: parsed.code,
            message: parsed.message,
        })
    } else {
        CoreError::Rpc(RpcError::InvalidResponse(format!(
            "non-standard JSON-RPC error: {err}"
        )))
    }
}

// ==============================================================================
// Response Field Parsers
// ==============================================================================

fn to_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Parse an EVM hex quantity (`"0x1a"`) into a u64.
fn parse_quantity(value: &serde_json::Value, field: &str) -> Result<u64, CoreError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse(format!("{field}: expected hex string")))?;
    let body = raw
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::InvalidResponse(format!("{field}: missing 0x prefix: {raw}")))?;
    u64::from_str_radix(body, 16)
        .map_err(|e| RpcError::InvalidResponse(format!("{field}: bad hex quantity {raw}: {e}")).into())
}

fn parse_b256_field(value: Option<&serde_json::Value>, field: &str) -> Result<B256, CoreError> {
    let raw = value
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RpcError::InvalidResponse(format!("log: missing {field}")))?;
    raw.parse()
        .map_err(|e| RpcError::InvalidResponse(format!("log: bad {field} `{raw}`: {e}")).into())
}

fn parse_log(raw: &serde_json::Value) -> Result<RpcLog, CoreError> {
    let address: Address = raw
        .get("address")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RpcError::InvalidResponse("log: missing address".to_owned()))?
        .parse()
        .map_err(|e| RpcError::InvalidResponse(format!("log: bad address: {e}")))?;

    let topics = raw
        .get("topics")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| RpcError::InvalidResponse("log: missing topics".to_owned()))?
        .iter()
        .map(|topic| parse_b256_field(Some(topic), "topic"))
        .collect::<Result<Vec<_>, _>>()?;

    let data_hex = raw
        .get("data")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RpcError::InvalidResponse("log: missing data".to_owned()))?;
    let data = hex::decode(data_hex.trim_start_matches("0x"))
        .map_err(|e| RpcError::InvalidResponse(format!("log: bad data hex: {e}")))?;

    Ok(RpcLog {
        address,
        topics,
        data,
        block_number: parse_quantity(
            raw.get("blockNumber")
                .ok_or_else(|| RpcError::InvalidResponse("log: missing blockNumber".to_owned()))?,
            "blockNumber",
        )?,
        block_hash: parse_b256_field(raw.get("blockHash"), "blockHash")?,
        tx_hash: parse_b256_field(raw.get("transactionHash"), "transactionHash")?,
        log_index: parse_quantity(
            raw.get("logIndex")
                .ok_or_else(|| RpcError::InvalidResponse("log: missing logIndex".to_owned()))?,
            "logIndex",
        )?,
    })
}

fn initial_request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}
