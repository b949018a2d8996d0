use std::path::PathBuf;

use alloy::primitives::Address;
use clap::{Args, Parser, Subcommand};

fn parse_nonzero_usize(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|e| format!("{e}"))?;
    if n == 0 {
        return Err("value must be at least 1".to_string());
    }
    Ok(n)
}

/// fhegraph — FHE ciphertext data-flow indexer for fhevm executor events.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ingest executor logs for a block range.
    Ingest(IngestArgs),
    /// Follow the chain tip, ingesting confirmed blocks continuously.
    Stream(StreamArgs),
    /// Build per-transaction DFGs and cross-tx dependency records.
    Build(BuildArgs),
    /// Update the per-chain rollups (op mix, dependencies, time buckets,
    /// chain stats).
    Rollup(RollupArgs),
    /// Scan blocks for intra-block dependency cycles.
    Cycles(CyclesArgs),
    /// Re-derive DFGs from stored events and compare against persisted
    /// state.
    Validate(ValidateArgs),
    /// Recompute derived event fields in place (one-time backfill).
    Backfill(BackfillArgs),
}

/// Arguments shared by every subcommand: which database, which chain.
#[derive(Args)]
pub struct StoreArgs {
    /// Path to the SQLite database.
    #[arg(long, default_value = "fhegraph.db", env = "FHEGRAPH_DB")]
    pub db: PathBuf,

    /// Chain id to operate on.
    #[arg(long, env = "FHEGRAPH_CHAIN_ID")]
    pub chain_id: u64,
}

/// RPC connection arguments for commands that talk to a node.
#[derive(Args)]
pub struct RpcArgs {
    /// EVM JSON-RPC endpoint URL.
    #[arg(long, default_value = "http://127.0.0.1:8545", env = "FHEGRAPH_RPC_URL")]
    pub rpc_url: String,

    /// RPC username (optional; not needed for token-in-URL providers).
    #[arg(long, env = "FHEGRAPH_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password (optional; not needed for token-in-URL providers).
    #[arg(long, env = "FHEGRAPH_RPC_PASS")]
    pub rpc_pass: Option<String>,

    /// Cap outbound RPC requests per second.
    #[arg(long)]
    pub rpc_rate_limit: Option<u32>,
}

#[derive(Args)]
pub struct IngestArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub rpc: RpcArgs,

    /// Executor contract address; ingests all logs in range when omitted.
    #[arg(long, env = "FHEGRAPH_EXECUTOR")]
    pub executor: Option<Address>,

    /// First block to ingest. Defaults to resuming from the checkpoint.
    #[arg(long)]
    pub from_block: Option<u64>,

    /// Last block to ingest. Defaults to tip minus confirmations.
    #[arg(long)]
    pub to_block: Option<u64>,

    /// Start this many blocks behind the tip instead of an explicit
    /// from-block (ignored when --from-block is set).
    #[arg(long)]
    pub lookback: Option<u64>,

    /// Blocks per eth_getLogs request.
    #[arg(long, default_value = "1000")]
    pub batch_size: u64,

    /// Concurrent in-flight batch fetches (must be at least 1).
    #[arg(long, default_value = "4", value_parser = parse_nonzero_usize)]
    pub fetch_concurrency: usize,

    /// Blocks behind the tip considered confirmed.
    #[arg(long, default_value = "5")]
    pub confirmations: u64,
}

#[derive(Args)]
pub struct StreamArgs {
    #[command(flatten)]
    pub ingest: IngestArgs,

    /// Seconds between tip polls.
    #[arg(long, default_value = "12")]
    pub poll_interval: u64,
}

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Only build txs at or above this block.
    #[arg(long)]
    pub from_block: Option<u64>,

    /// Only build txs at or below this block.
    #[arg(long)]
    pub to_block: Option<u64>,

    /// Ignore the build checkpoint and reprocess everything in range.
    #[arg(long)]
    pub force_full: bool,
}

#[derive(Args)]
pub struct RollupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub rpc: RpcArgs,

    /// Bucket width for the op-time rollup, in seconds.
    #[arg(long, default_value = "3600")]
    pub bucket_seconds: u64,

    /// Delay between block-timestamp fetches, in milliseconds.
    #[arg(long, default_value = "100")]
    pub block_fetch_delay_ms: u64,

    /// Rebuild every rollup from scratch instead of incrementally.
    #[arg(long)]
    pub force_full: bool,
}

#[derive(Args)]
pub struct CyclesArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// First block to scan.
    #[arg(long, default_value = "0")]
    pub from_block: u64,

    /// Last block to scan. Defaults to everything built.
    #[arg(long)]
    pub to_block: Option<u64>,

    /// Exit with status 2 when any cyclic SCC is found.
    #[arg(long)]
    pub fail_on_cycles: bool,

    /// Cap on txs listed per reported SCC.
    #[arg(long, default_value = "20")]
    pub max_txs_per_scc: usize,
}

#[derive(Args)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Only validate txs at or above this block.
    #[arg(long)]
    pub from_block: Option<u64>,

    /// Only validate txs at or below this block.
    #[arg(long)]
    pub to_block: Option<u64>,

    /// Exit with status 2 when any mismatch is found.
    #[arg(long)]
    pub fail_on_mismatch: bool,

    /// Cap on mismatch samples kept in the report.
    #[arg(long, default_value = "20")]
    pub max_samples: usize,
}

#[derive(Args)]
pub struct BackfillArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}
