//! Subcommand implementations. Each command opens the store itself
//! (analyzers read-only, everything else read-write), runs one core
//! pipeline, and prints a JSON report to stdout. The returned exit code
//! is 0 unless a fail-on flag turned findings into a failure.

use std::time::Duration;

use eyre::WrapErr;

use fhegraph_core::builder::{build_dfgs, BuildOptions};
use fhegraph_core::cache::BlockTimeCache;
use fhegraph_core::cycles::scan_blocks;
use fhegraph_core::ingest::{backfill_derived, ingest_range, next_ingest_block, IngestOptions};
use fhegraph_core::rollup::{rollup_chain_stats, rollup_deps, rollup_op_buckets, rollup_op_mix};
use fhegraph_core::rpc::{EvmRpc, HttpRpcClient};
use fhegraph_core::validate::{validate_chain, ValidateOptions};
use fhegraph_core::{ChainId, Store};

use crate::cli::{
    BackfillArgs, BuildArgs, Command, CyclesArgs, IngestArgs, RollupArgs, RpcArgs, StreamArgs,
    ValidateArgs,
};

/// Exit status for analyzers asked to fail on findings.
const EXIT_FINDINGS: i32 = 2;

pub async fn run(command: Command) -> eyre::Result<i32> {
    match command {
        Command::Ingest(args) => ingest(args).await,
        Command::Stream(args) => stream(args).await,
        Command::Build(args) => build(args),
        Command::Rollup(args) => rollup(args).await,
        Command::Cycles(args) => cycles(args),
        Command::Validate(args) => validate(args),
        Command::Backfill(args) => backfill(args),
    }
}

fn connect(rpc: &RpcArgs) -> eyre::Result<HttpRpcClient> {
    HttpRpcClient::new(
        &rpc.rpc_url,
        rpc.rpc_user.as_deref(),
        rpc.rpc_pass.as_deref(),
        rpc.rpc_rate_limit,
    )
    .wrap_err("construct RPC client")
}

fn print_report<T: serde::Serialize>(report: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(report).expect("report serializes")
    );
}

async fn ingest(args: IngestArgs) -> eyre::Result<i32> {
    let chain = ChainId(args.store.chain_id);
    let mut store = Store::open(&args.store.db).wrap_err("open database")?;
    let rpc = connect(&args.rpc)?;

    let tip = rpc.block_number().await.wrap_err("fetch chain tip")?;
    let confirmed = tip.saturating_sub(args.confirmations);
    let from = match (args.from_block, args.lookback) {
        (Some(from), _) => from,
        (None, Some(lookback)) => confirmed.saturating_sub(lookback.saturating_sub(1)),
        (None, None) => next_ingest_block(&store, chain, 0)?,
    };
    let to = args.to_block.unwrap_or(confirmed);

    let options = IngestOptions {
        batch_size: args.batch_size,
        fetch_concurrency: args.fetch_concurrency,
        executor: args.executor,
    };
    let summary = ingest_range(&rpc, &mut store, chain, from, to, &options)
        .await
        .wrap_err("ingest block range")?;
    print_report(&summary);
    Ok(0)
}

async fn stream(args: StreamArgs) -> eyre::Result<i32> {
    let chain = ChainId(args.ingest.store.chain_id);
    let mut store = Store::open(&args.ingest.store.db).wrap_err("open database")?;
    let rpc = connect(&args.ingest.rpc)?;

    let options = IngestOptions {
        batch_size: args.ingest.batch_size,
        fetch_concurrency: args.ingest.fetch_concurrency,
        executor: args.ingest.executor,
    };
    let default_start = args.ingest.from_block.unwrap_or(0);

    tracing::info!(
        chain = %chain,
        poll_interval = args.poll_interval,
        confirmations = args.ingest.confirmations,
        "streaming confirmed blocks; Ctrl-C to stop"
    );
    loop {
        let tip = rpc.block_number().await.wrap_err("fetch chain tip")?;
        let target = tip.saturating_sub(args.ingest.confirmations);
        let next = next_ingest_block(&store, chain, default_start)?;
        if next <= target {
            let summary = ingest_range(&rpc, &mut store, chain, next, target, &options)
                .await
                .wrap_err("ingest block range")?;
            tracing::info!(
                chain = %chain,
                from = next,
                to = target,
                inserted = summary.events_inserted,
                "streamed batch"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.poll_interval)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }
    Ok(0)
}

fn build(args: BuildArgs) -> eyre::Result<i32> {
    let chain = ChainId(args.store.chain_id);
    let mut store = Store::open(&args.store.db).wrap_err("open database")?;
    let summary = build_dfgs(
        &mut store,
        chain,
        &BuildOptions {
            from_block: args.from_block,
            to_block: args.to_block,
            force_full: args.force_full,
        },
    )
    .wrap_err("build DFGs")?;
    print_report(&summary);
    Ok(0)
}

async fn rollup(args: RollupArgs) -> eyre::Result<i32> {
    let chain = ChainId(args.store.chain_id);
    let mut store = Store::open(&args.store.db).wrap_err("open database")?;
    let rpc = connect(&args.rpc)?;
    let block_times = BlockTimeCache::new();

    let op_mix = rollup_op_mix(&mut store, chain, args.force_full).wrap_err("op-mix rollup")?;
    let deps = rollup_deps(&mut store, chain, args.force_full).wrap_err("dependency rollup")?;
    let buckets = rollup_op_buckets(
        &mut store,
        &rpc,
        &block_times,
        chain,
        args.bucket_seconds,
        Duration::from_millis(args.block_fetch_delay_ms),
        args.force_full,
    )
    .await
    .wrap_err("op-bucket rollup")?;
    let chain_stats = rollup_chain_stats(&mut store, chain).wrap_err("chain-stats rollup")?;

    print_report(&serde_json::json!({
        "op_mix": op_mix,
        "deps": deps,
        "op_buckets": buckets,
        "chain_stats": chain_stats,
    }));
    Ok(0)
}

fn cycles(args: CyclesArgs) -> eyre::Result<i32> {
    let chain = ChainId(args.store.chain_id);
    let store = Store::open_read_only(&args.store.db).wrap_err("open database read-only")?;
    let scan = scan_blocks(
        &store,
        chain,
        args.from_block,
        args.to_block.unwrap_or(u64::MAX),
        args.max_txs_per_scc,
    )
    .wrap_err("scan for cycles")?;
    print_report(&scan);

    if scan.has_cycles() && args.fail_on_cycles {
        return Ok(EXIT_FINDINGS);
    }
    Ok(0)
}

fn validate(args: ValidateArgs) -> eyre::Result<i32> {
    let chain = ChainId(args.store.chain_id);
    let store = Store::open_read_only(&args.store.db).wrap_err("open database read-only")?;
    let report = validate_chain(
        &store,
        chain,
        &ValidateOptions {
            from_block: args.from_block,
            to_block: args.to_block,
            max_samples: args.max_samples,
        },
    )
    .wrap_err("validate DFGs")?;
    print_report(&report);

    if !report.is_clean() && args.fail_on_mismatch {
        return Ok(EXIT_FINDINGS);
    }
    Ok(0)
}

fn backfill(args: BackfillArgs) -> eyre::Result<i32> {
    let chain = ChainId(args.store.chain_id);
    let mut store = Store::open(&args.store.db).wrap_err("open database")?;
    let updated = backfill_derived(&mut store, chain).wrap_err("backfill derived fields")?;
    print_report(&serde_json::json!({ "updated": updated }));
    Ok(0)
}
