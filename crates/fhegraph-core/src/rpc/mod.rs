//! EVM JSON-RPC abstraction layer.
//!
//! Defines the [`EvmRpc`] trait and provides an HTTP JSON-RPC
//! implementation ([`HttpRpcClient`]) plus a test mock (`mock::MockRpc`).

mod http_adapter;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use http_adapter::HttpRpcClient;
pub use types::{LogFilter, RpcLog};

use async_trait::async_trait;

use crate::error::CoreError;

/// Minimal trait covering the EVM RPC methods the indexer needs.
///
/// Implementations are expected to handle authentication, retry policy,
/// and response deserialization internally.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    /// Latest block number at the endpoint.
    async fn block_number(&self) -> Result<u64, CoreError>;

    /// Logs matching the filter, in `(block_number, log_index)` order as
    /// returned by the node.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, CoreError>;

    /// Unix timestamp of a block, or `None` if the node does not know the
    /// block.
    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>, CoreError>;
}
