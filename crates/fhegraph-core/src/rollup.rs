//! Incremental rollup engine.
//!
//! Four per-chain rollups: operation mix, dependency stats with depth
//! distributions, operation-time buckets, and coarse chain stats. Each of
//! the first three is checkpointed; a missing checkpoint (or a forced
//! flag) triggers a full rebuild whose state replaces the previous rollup
//! atomically instead of merging into it.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::BlockTimeCache;
use crate::error::CoreError;
use crate::rpc::EvmRpc;
use crate::store::{
    Store, CKPT_ROLLUP_DEPS, CKPT_ROLLUP_OP_BUCKETS, CKPT_ROLLUP_OP_MIX,
};
use crate::types::{ChainId, ChainStatsRollup, Checkpoint, OpMixRollup};

/// How a rollup pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupMode {
    Incremental,
    Full,
}

/// Counters for one rollup pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RollupOutcome {
    pub mode: RollupMode,
    pub rows_scanned: u64,
}

// ==============================================================================
// Op-Mix Rollup
// ==============================================================================

/// Merge per-tx DFG stats into the chain's op-mix rollup.
///
/// Incremental when a checkpoint and an existing rollup row are present;
/// otherwise (or when forced) rebuilds from scratch and replaces the row.
pub fn rollup_op_mix(
    store: &mut Store,
    chain_id: ChainId,
    force_full: bool,
) -> Result<RollupOutcome, CoreError> {
    let checkpoint = store.checkpoint(chain_id, CKPT_ROLLUP_OP_MIX)?;
    let existing = store.op_mix_rollup(chain_id)?;

    let (mode, mut rollup, after) = match (&checkpoint, existing) {
        (Some(ckpt), Some(rollup)) if !force_full => {
            let after = ckpt.last_tx_hash.map(|tx| (ckpt.last_block, tx));
            (RollupMode::Incremental, rollup, after)
        }
        _ => {
            if !force_full && checkpoint.is_some() {
                warn!(chain = %chain_id, "op-mix rollup row missing; falling back to full rebuild");
            }
            (RollupMode::Full, OpMixRollup::default(), None)
        }
    };

    let rows = store.dfg_summaries_after(chain_id, after)?;
    let rows_scanned = rows.len() as u64;
    let last = rows.last().map(|row| (row.block_number, row.tx_hash));

    for row in &rows {
        rollup.dfg_tx_count += 1;
        rollup.stats.merge(&row.stats);
    }

    if mode == RollupMode::Full || !rows.is_empty() {
        let new_checkpoint = last.map(|(block, tx)| Checkpoint {
            last_block: block,
            last_tx_hash: Some(tx),
        });
        store.put_op_mix_rollup(chain_id, &rollup, new_checkpoint.as_ref())?;
    }

    info!(
        chain = %chain_id,
        mode = ?mode,
        rows = rows_scanned,
        dfg_txs = rollup.dfg_tx_count,
        "op-mix rollup done"
    );
    Ok(RollupOutcome { mode, rows_scanned })
}

// ==============================================================================
// Dependency Rollup
// ==============================================================================

/// Update the chain's dependency rollup (counters, sums, maxima, and the
/// chain/total depth histograms).
pub fn rollup_deps(
    store: &mut Store,
    chain_id: ChainId,
    force_full: bool,
) -> Result<RollupOutcome, CoreError> {
    let checkpoint = store.checkpoint(chain_id, CKPT_ROLLUP_DEPS)?;
    let existing = store.dep_rollup(chain_id)?;

    match (&checkpoint, existing) {
        (Some(ckpt), Some(mut rollup)) if !force_full => {
            let after = ckpt.last_tx_hash.map(|tx| (ckpt.last_block, tx));
            let rows = store.deps_after(chain_id, after)?;
            let rows_scanned = rows.len() as u64;
            let last = rows.last().map(|row| (row.block_number, row.tx_hash));

            for dep in &rows {
                rollup.absorb(dep);
            }
            if !rows.is_empty() {
                let new_checkpoint = last.map(|(block, tx)| Checkpoint {
                    last_block: block,
                    last_tx_hash: Some(tx),
                });
                store.put_dep_rollup(chain_id, &rollup, new_checkpoint.as_ref())?;
            }

            info!(chain = %chain_id, mode = "incremental", rows = rows_scanned, "dependency rollup done");
            Ok(RollupOutcome {
                mode: RollupMode::Incremental,
                rows_scanned,
            })
        }
        _ => {
            // Full rebuild straight from the dependency table.
            let rollup = store.dep_rollup_full(chain_id)?;
            let rows_scanned = rollup.total_txs;
            let new_checkpoint = store.last_dep_position(chain_id)?.map(|(block, tx)| Checkpoint {
                last_block: block,
                last_tx_hash: Some(tx),
            });
            store.put_dep_rollup(chain_id, &rollup, new_checkpoint.as_ref())?;

            info!(chain = %chain_id, mode = "full", rows = rows_scanned, "dependency rollup done");
            Ok(RollupOutcome {
                mode: RollupMode::Full,
                rows_scanned,
            })
        }
    }
}

// ==============================================================================
// Op-Bucket Rollup
// ==============================================================================

/// Bucket raw events by block timestamp. Timestamps are fetched once per
/// block through the shared cache, and successive RPC fetches are spaced
/// by `fetch_delay`.
pub async fn rollup_op_buckets(
    store: &mut Store,
    rpc: &dyn EvmRpc,
    block_times: &BlockTimeCache,
    chain_id: ChainId,
    bucket_seconds: u64,
    fetch_delay: Duration,
    force_full: bool,
) -> Result<RollupOutcome, CoreError> {
    if bucket_seconds == 0 {
        return Err(CoreError::InvalidEventData(
            "bucket_seconds must be greater than zero".to_owned(),
        ));
    }

    let checkpoint = store.checkpoint(chain_id, CKPT_ROLLUP_OP_BUCKETS)?;
    let (mode, after_block) = match &checkpoint {
        Some(ckpt) if !force_full => (RollupMode::Incremental, Some(ckpt.last_block)),
        _ => (RollupMode::Full, None),
    };

    let rows = store.event_block_counts(chain_id, after_block)?;
    let rows_scanned = rows.len() as u64;
    let last_block = rows.last().map(|(block, _, _)| *block);

    let mut counts: BTreeMap<(u64, String), u64> = BTreeMap::new();
    let mut fetched_any = false;
    let mut current: Option<(u64, Option<u64>)> = None; // (block, timestamp)

    for (block_number, event_name, count) in rows {
        let timestamp = match current {
            Some((block, cached)) if block == block_number => cached,
            _ => {
                let resolved = match block_times.get(block_number).await {
                    Some(cached) => Some(cached),
                    None => {
                        if fetched_any && !fetch_delay.is_zero() {
                            tokio::time::sleep(fetch_delay).await;
                        }
                        fetched_any = true;
                        let fetched = rpc.block_timestamp(block_number).await?;
                        if let Some(timestamp) = fetched {
                            block_times.insert(block_number, timestamp).await;
                        }
                        fetched
                    }
                };
                current = Some((block_number, resolved));
                resolved
            }
        };

        let Some(timestamp) = timestamp else {
            warn!(chain = %chain_id, block = block_number, "block timestamp unavailable; bucket skipped");
            continue;
        };
        let bucket_start = timestamp - timestamp % bucket_seconds;
        *counts.entry((bucket_start, event_name)).or_default() += count;
    }

    if mode == RollupMode::Full || last_block.is_some() {
        store.apply_op_buckets(
            chain_id,
            bucket_seconds,
            &counts,
            last_block,
            mode == RollupMode::Full,
        )?;
    }

    info!(
        chain = %chain_id,
        mode = ?mode,
        rows = rows_scanned,
        buckets = counts.len(),
        "op-bucket rollup done"
    );
    Ok(RollupOutcome { mode, rows_scanned })
}

// ==============================================================================
// Chain Stats Rollup
// ==============================================================================

/// Recompute and store the coarse chain-level summary. Always a full
/// aggregate pass; cheap enough that no checkpoint is kept.
pub fn rollup_chain_stats(
    store: &mut Store,
    chain_id: ChainId,
) -> Result<ChainStatsRollup, CoreError> {
    let stats = store.compute_chain_stats(chain_id)?;
    store.put_chain_stats(chain_id, &stats)?;
    debug!(
        chain = %chain_id,
        dfg_txs = stats.dfg_tx_count,
        signatures = stats.distinct_signatures,
        "chain stats rollup done"
    );
    Ok(stats)
}
