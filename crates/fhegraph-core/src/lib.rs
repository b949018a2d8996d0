//! Core library for **fhegraph** — an FHE ciphertext data-flow indexer.
//!
//! This crate ingests fhevm executor events from an EVM chain and
//! reconstructs, per transaction, a typed data-flow graph over ciphertext
//! handles; from those graphs it derives canonical structural signatures,
//! cross-transaction dependency records, incremental rollups, and
//! intra-block cycle reports. It is intentionally transport-agnostic: the
//! [`rpc::EvmRpc`] trait can be backed by HTTP JSON-RPC, a mock, or any
//! future transport, while all state lives in a single-writer SQLite
//! database behind [`store::Store`].

pub mod builder;
pub mod cache;
pub mod cycles;
pub mod deps;
pub mod derive;
pub mod dfg;
pub mod error;
pub mod events;
pub mod handle;
pub mod ingest;
pub mod rollup;
pub mod rpc;
pub mod signature;
pub mod store;
pub mod types;
pub mod validate;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{CoreError, RpcError};
pub use store::Store;
pub use types::{ChainId, EventName, TxDfg};
