//! Error types for fhegraph-core.

// ==============================================================================
// RPC Errors
// ==============================================================================

/// Structured errors from the EVM JSON-RPC layer.
///
/// Each variant captures a specific failure mode rather than collapsing
/// everything into a single `String`, which makes programmatic error
/// handling (e.g. retries on transport errors vs. logic errors) possible.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP transport: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("JSON-RPC error: code={code}, message={message}")]
    ServerError { code: i64, message: String },

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Transport-level failures (connection errors, timeouts, 5xx) are
    /// transient and safe to retry; JSON-RPC logic errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus(status) => (500..600).contains(status),
            Self::ServerError { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

// ==============================================================================
// Core Errors
// ==============================================================================

/// Top-level error type for the fhegraph-core crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error("invalid event data: {0}")]
    InvalidEventData(String),

    #[error(
        "non-trivial upstream {upstream} of tx {tx_hash} has no dependency record; \
         transactions must be processed in (block_number, tx_hash) order"
    )]
    UpstreamOrderViolation { tx_hash: String, upstream: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
