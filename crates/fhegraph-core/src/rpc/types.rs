//! Wire-level types shared by RPC implementations.

use alloy::primitives::{Address, B256};

/// Parameters for an `eth_getLogs` call over a contiguous block range.
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    /// Restrict to one emitting contract (the executor), when set.
    pub address: Option<Address>,
}

/// A raw log as returned by `eth_getLogs`, already hex-decoded.
#[derive(Debug, Clone)]
pub struct RpcLog {
    pub address: Address,
    /// Full topic list including `topic0`.
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
}
