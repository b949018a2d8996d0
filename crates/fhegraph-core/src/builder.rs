//! DFG build driver.
//!
//! Walks the event log in `(block_number, tx_hash)` ascending order from
//! the build checkpoint, builds each transaction's DFG, computes its
//! dependency record against the pre-commit store state, and lands
//! everything in one transactional unit per tx. Ordered processing is what
//! guarantees every non-trivial upstream's dependency record exists when a
//! downstream tx is processed.

use tracing::{debug, info, warn};

use crate::deps::compute_tx_dependency;
use crate::dfg::build_tx_dfg;
use crate::error::CoreError;
use crate::store::{Store, CKPT_DFG_BUILD};
use crate::types::ChainId;

/// Options for one build run.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Only process txs at or above this block.
    pub from_block: Option<u64>,
    /// Only process txs at or below this block.
    pub to_block: Option<u64>,
    /// Ignore the build checkpoint and reprocess everything in range.
    pub force_full: bool,
}

/// Counters for one build run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BuildSummary {
    pub txs_built: u64,
    pub nodes: u64,
    pub edges: u64,
    pub events_skipped: u64,
}

/// Build all pending transactions for a chain.
pub fn build_dfgs(
    store: &mut Store,
    chain_id: ChainId,
    options: &BuildOptions,
) -> Result<BuildSummary, CoreError> {
    let after = if options.force_full {
        None
    } else {
        store
            .checkpoint(chain_id, CKPT_DFG_BUILD)?
            .and_then(|ckpt| ckpt.last_tx_hash.map(|tx| (ckpt.last_block, tx)))
    };

    let refs = store.tx_refs_after(chain_id, after, options.from_block, options.to_block)?;
    info!(
        chain = %chain_id,
        pending = refs.len(),
        resumed = after.is_some(),
        "starting DFG build"
    );

    let mut summary = BuildSummary::default();
    for (block_number, tx_hash) in refs {
        let events = store.events_for_tx(chain_id, tx_hash)?;
        let outcome = build_tx_dfg(chain_id, tx_hash, block_number, &events);

        for skip in &outcome.skipped {
            warn!(
                chain = %chain_id,
                tx = %tx_hash,
                log_index = skip.log_index,
                reason = %skip.reason,
                "event skipped during DFG build"
            );
        }
        summary.events_skipped += outcome.skipped.len() as u64;

        let dfg = outcome.dfg;
        let dep = compute_tx_dependency(
            store,
            chain_id,
            tx_hash,
            block_number,
            &dfg.external_inputs,
            dfg.depth,
        )?;

        summary.txs_built += 1;
        summary.nodes += dfg.nodes.len() as u64;
        summary.edges += dfg.edges.len() as u64;

        debug!(
            chain = %chain_id,
            tx = %tx_hash,
            block = block_number,
            nodes = dfg.nodes.len(),
            edges = dfg.edges.len(),
            depth = dfg.depth,
            "built tx DFG"
        );
        store.commit_tx_build(&dfg, &dep)?;
    }

    info!(
        chain = %chain_id,
        txs = summary.txs_built,
        nodes = summary.nodes,
        edges = summary.edges,
        skipped = summary.events_skipped,
        "DFG build finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use crate::types::EventName;

    const CHAIN: ChainId = ChainId(1);

    #[test]
    fn builds_all_pending_txs_in_order() {
        let mut store = Store::in_memory().expect("open store");
        let handle_b = handle(2, 0xB);

        // Producer in block 100, consumer in block 101; inserted out of
        // order to prove the work list sorts.
        store
            .insert_events(&[
                binary_event(
                    CHAIN,
                    tx_hash(2),
                    101,
                    0,
                    EventName::FheMul,
                    handle_b,
                    handle(2, 9),
                    0x01,
                    handle(2, 0xC),
                ),
                binary_event(
                    CHAIN,
                    tx_hash(1),
                    100,
                    0,
                    EventName::FheAdd,
                    handle(2, 1),
                    handle(2, 2),
                    0x00,
                    handle_b,
                ),
            ])
            .expect("insert events");

        let summary = build_dfgs(&mut store, CHAIN, &BuildOptions::default()).expect("build");
        assert_eq!(summary.txs_built, 2);
        assert_eq!(summary.nodes, 2);

        // Dependency linkage proves the producer was committed first.
        let dep = store
            .tx_dependency(CHAIN, tx_hash(2))
            .expect("read")
            .expect("dep");
        assert_eq!(dep.upstream_txs, vec![tx_hash(1)]);
        assert_eq!(dep.chain_depth, 1);
    }

    #[test]
    fn rerun_without_new_events_is_a_noop() {
        let mut store = Store::in_memory().expect("open store");
        store
            .insert_events(&[trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle(3, 1))])
            .expect("insert");

        let first = build_dfgs(&mut store, CHAIN, &BuildOptions::default()).expect("build");
        assert_eq!(first.txs_built, 1);

        let second = build_dfgs(&mut store, CHAIN, &BuildOptions::default()).expect("rebuild");
        assert_eq!(second.txs_built, 0, "checkpoint skips processed txs");
    }

    #[test]
    fn force_full_reprocesses_everything() {
        let mut store = Store::in_memory().expect("open store");
        store
            .insert_events(&[trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle(3, 1))])
            .expect("insert");

        build_dfgs(&mut store, CHAIN, &BuildOptions::default()).expect("build");
        let forced = build_dfgs(
            &mut store,
            CHAIN,
            &BuildOptions {
                force_full: true,
                ..Default::default()
            },
        )
        .expect("forced rebuild");
        assert_eq!(forced.txs_built, 1);

        // Still exactly one summary row (delete-then-insert).
        let summary = store
            .dfg_summary(CHAIN, tx_hash(1))
            .expect("read")
            .expect("summary");
        assert_eq!(summary.node_count, 1);
    }

    #[test]
    fn rebuild_is_deterministic() {
        // P3: same events, byte-identical persisted rows.
        let mut store = Store::in_memory().expect("open store");
        let handle_a = handle(3, 0xA);
        let handle_b = handle(3, 0xB);
        store
            .insert_events(&[
                trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle_a),
                binary_event(
                    CHAIN,
                    tx_hash(1),
                    100,
                    1,
                    EventName::FheAdd,
                    handle_a,
                    handle_a,
                    0x00,
                    handle_b,
                ),
            ])
            .expect("insert");

        build_dfgs(&mut store, CHAIN, &BuildOptions::default()).expect("build");
        let nodes_1 = store.dfg_nodes_for_tx(CHAIN, tx_hash(1)).expect("nodes");
        let edges_1 = store.dfg_edges_for_tx(CHAIN, tx_hash(1)).expect("edges");
        let summary_1 = store
            .dfg_summary(CHAIN, tx_hash(1))
            .expect("read")
            .expect("summary");

        build_dfgs(
            &mut store,
            CHAIN,
            &BuildOptions {
                force_full: true,
                ..Default::default()
            },
        )
        .expect("rebuild");
        let nodes_2 = store.dfg_nodes_for_tx(CHAIN, tx_hash(1)).expect("nodes");
        let edges_2 = store.dfg_edges_for_tx(CHAIN, tx_hash(1)).expect("edges");
        let summary_2 = store
            .dfg_summary(CHAIN, tx_hash(1))
            .expect("read")
            .expect("summary");

        assert_eq!(nodes_1, nodes_2);
        assert_eq!(edges_1, edges_2);
        assert_eq!(summary_1.signature, summary_2.signature);
        assert_eq!(summary_1.stats, summary_2.stats);
        assert_eq!(summary_1.depth, summary_2.depth);
    }

    #[test]
    fn block_range_bounds_are_respected() {
        let mut store = Store::in_memory().expect("open store");
        store
            .insert_events(&[
                trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle(3, 1)),
                trivial_event(CHAIN, tx_hash(2), 200, 0, 3, handle(3, 2)),
            ])
            .expect("insert");

        let summary = build_dfgs(
            &mut store,
            CHAIN,
            &BuildOptions {
                from_block: Some(150),
                to_block: Some(250),
                ..Default::default()
            },
        )
        .expect("build");
        assert_eq!(summary.txs_built, 1);
        assert!(store.dfg_summary(CHAIN, tx_hash(1)).expect("read").is_none());
        assert!(store.dfg_summary(CHAIN, tx_hash(2)).expect("read").is_some());
    }
}
