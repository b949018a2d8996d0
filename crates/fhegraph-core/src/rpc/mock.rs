//! Mock [`EvmRpc`] implementation for unit tests.
//!
//! Uses a builder pattern (`MockRpc::builder()`) to register canned logs
//! and block timestamps before the mock is consumed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::CoreError;

use super::types::{LogFilter, RpcLog};
use super::EvmRpc;

/// A mock EVM RPC backend for testing. Serves canned logs filtered by
/// block range/address and canned block timestamps.
pub struct MockRpc {
    logs: Vec<RpcLog>,
    timestamps: HashMap<u64, u64>,
    tip: u64,
    /// Counts `block_timestamp` calls so tests can assert cache behavior.
    timestamp_fetches: AtomicU64,
}

impl MockRpc {
    pub fn builder() -> MockRpcBuilder {
        MockRpcBuilder {
            logs: Vec::new(),
            timestamps: HashMap::new(),
            tip: 0,
        }
    }

    pub fn timestamp_fetches(&self) -> u64 {
        self.timestamp_fetches.load(Ordering::Relaxed)
    }
}

/// Builder for configuring a [`MockRpc`] with canned data.
pub struct MockRpcBuilder {
    logs: Vec<RpcLog>,
    timestamps: HashMap<u64, u64>,
    tip: u64,
}

impl MockRpcBuilder {
    pub fn with_log(mut self, log: RpcLog) -> Self {
        self.tip = self.tip.max(log.block_number);
        self.logs.push(log);
        self
    }

    pub fn with_block_timestamp(mut self, block_number: u64, timestamp: u64) -> Self {
        self.timestamps.insert(block_number, timestamp);
        self
    }

    pub fn with_tip(mut self, tip: u64) -> Self {
        self.tip = tip;
        self
    }

    pub fn build(self) -> MockRpc {
        MockRpc {
            logs: self.logs,
            timestamps: self.timestamps,
            tip: self.tip,
            timestamp_fetches: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EvmRpc for MockRpc {
    async fn block_number(&self) -> Result<u64, CoreError> {
        Ok(self.tip)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, CoreError> {
        Ok(self
            .logs
            .iter()
            .filter(|log| {
                log.block_number >= filter.from_block
                    && log.block_number <= filter.to_block
                    && filter
                        .address
                        .map(|address| log.address == address)
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<u64>, CoreError> {
        self.timestamp_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.timestamps.get(&block_number).copied())
    }
}
