//! Cross-transaction dependency engine.
//!
//! Links a freshly built tx to the transactions that produced its external
//! input handles, via the handle-producer registry. Trivial producers are
//! linked but excluded from chain-depth propagation. Relies on txs being
//! processed in `(block_number, tx_hash)` ascending order so that every
//! non-trivial upstream already has a persisted dependency record.

use std::collections::{BTreeSet, HashMap, HashSet};

use alloy::primitives::B256;

use crate::error::CoreError;
use crate::store::Store;
use crate::types::{to_hex, ChainId, TxDependency};

/// Compute the dependency record for one tx from its external-input set.
///
/// Must run against the store state *before* the tx's own rows are
/// committed, so producer lookups only see previously processed txs.
pub fn compute_tx_dependency(
    store: &Store,
    chain_id: ChainId,
    tx_hash: B256,
    block_number: u64,
    external_inputs: &[B256],
    own_depth: u32,
) -> Result<TxDependency, CoreError> {
    let mut upstream: BTreeSet<B256> = BTreeSet::new();
    let mut non_trivial: BTreeSet<B256> = BTreeSet::new();
    let mut handle_links = 0u64;

    for handle in external_inputs {
        let Some(producer) = store.handle_producer(chain_id, *handle, block_number)? else {
            continue;
        };
        if producer.tx_hash == tx_hash {
            continue;
        }
        upstream.insert(producer.tx_hash);
        handle_links += 1;
        if !producer.is_trivial {
            non_trivial.insert(producer.tx_hash);
        }
    }

    let mut chain_depth = 0u32;
    let mut max_upstream_intra = 0u32;
    for upstream_tx in &non_trivial {
        let dep = store
            .tx_dependency(chain_id, *upstream_tx)?
            .ok_or_else(|| order_violation(tx_hash, *upstream_tx))?;
        chain_depth = chain_depth.max(dep.chain_depth + 1);

        let depth = store
            .tx_depth(chain_id, *upstream_tx)?
            .ok_or_else(|| order_violation(tx_hash, *upstream_tx))?;
        max_upstream_intra = max_upstream_intra.max(depth);
    }

    Ok(TxDependency {
        chain_id,
        tx_hash,
        block_number,
        upstream_txs: upstream.into_iter().collect(),
        handle_links,
        chain_depth,
        total_depth: chain_depth + max_upstream_intra + own_depth,
    })
}

fn order_violation(tx_hash: B256, upstream: B256) -> CoreError {
    CoreError::UpstreamOrderViolation {
        tx_hash: to_hex(tx_hash.as_slice()),
        upstream: to_hex(upstream.as_slice()),
    }
}

// ==============================================================================
// Windowed Depth (query-side)
// ==============================================================================

/// Truncated chain depth within a block lookback window `W`: upstreams
/// older than `root.block − W + 1` are discarded, and the traversal is
/// iterative with a per-root visited set so registry-level cycles cannot
/// diverge (back-edges contribute no depth).
pub fn windowed_chain_depth(
    store: &Store,
    chain_id: ChainId,
    root: B256,
    window: u64,
) -> Result<u32, CoreError> {
    let Some(root_block) = store.tx_block(chain_id, root)? else {
        return Ok(0);
    };
    let lower_bound = root_block.saturating_sub(window.saturating_sub(1));

    struct Frame {
        tx: B256,
        upstreams: Vec<B256>,
        next: usize,
        best: u32,
    }

    let upstreams_of = |tx: B256, block: u64| -> Result<Vec<B256>, CoreError> {
        let mut found: BTreeSet<B256> = BTreeSet::new();
        for (handle, _) in store.dfg_inputs_for_tx(chain_id, tx)? {
            let Some(producer) = store.handle_producer(chain_id, handle, block)? else {
                continue;
            };
            if producer.tx_hash != tx
                && !producer.is_trivial
                && producer.block_number >= lower_bound
            {
                found.insert(producer.tx_hash);
            }
        }
        Ok(found.into_iter().collect())
    };

    let mut memo: HashMap<B256, u32> = HashMap::new();
    let mut on_path: HashSet<B256> = HashSet::new();
    let mut stack: Vec<Frame> = vec![Frame {
        tx: root,
        upstreams: upstreams_of(root, root_block)?,
        next: 0,
        best: 0,
    }];
    on_path.insert(root);

    while let Some(top) = stack.last_mut() {
        if top.next < top.upstreams.len() {
            let upstream = top.upstreams[top.next];
            top.next += 1;

            if let Some(depth) = memo.get(&upstream) {
                top.best = top.best.max(depth + 1);
                continue;
            }
            if on_path.contains(&upstream) {
                // Cycle through the registry; contributes no depth.
                continue;
            }
            let Some(block) = store.tx_block(chain_id, upstream)? else {
                continue;
            };
            let frame = Frame {
                tx: upstream,
                upstreams: upstreams_of(upstream, block)?,
                next: 0,
                best: 0,
            };
            on_path.insert(upstream);
            stack.push(frame);
        } else {
            let done = stack.pop().expect("stack is non-empty inside the loop");
            on_path.remove(&done.tx);
            let depth = if done.upstreams.is_empty() {
                0
            } else {
                done.best
            };
            memo.insert(done.tx, depth);
            if let Some(parent) = stack.last_mut() {
                parent.best = parent.best.max(depth + 1);
            }
        }
    }

    Ok(*memo.get(&root).expect("root is always memoized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfg::build_tx_dfg;
    use crate::test_util::*;
    use crate::types::EventName;

    const CHAIN: ChainId = ChainId(1);

    /// Build a tx from events, compute its dependency record against the
    /// current store state, and commit both.
    fn process_tx(
        store: &mut Store,
        tx: B256,
        block: u64,
        events: &[crate::types::EventRecord],
    ) -> TxDependency {
        let dfg = build_tx_dfg(CHAIN, tx, block, events).dfg;
        let dep = compute_tx_dependency(
            store,
            CHAIN,
            tx,
            block,
            &dfg.external_inputs,
            dfg.depth,
        )
        .expect("dependency");
        store.commit_tx_build(&dfg, &dep).expect("commit");
        dep
    }

    #[test]
    fn cross_tx_dependency_through_ciphertext() {
        // S4: T1 produces H_B non-trivially at block 100; T2 consumes it
        // as lhs at block 101.
        let mut store = Store::in_memory().expect("open store");
        let handle_b = handle(2, 0xB);

        let t1_events = vec![binary_event(
            CHAIN,
            tx_hash(1),
            100,
            0,
            EventName::FheAdd,
            handle(2, 1),
            handle(2, 2),
            0x00,
            handle_b,
        )];
        let t1_dep = process_tx(&mut store, tx_hash(1), 100, &t1_events);
        assert_eq!(t1_dep.chain_depth, 0);
        assert_eq!(t1_dep.total_depth, 1);

        let t2_events = vec![binary_event(
            CHAIN,
            tx_hash(2),
            101,
            0,
            EventName::FheMul,
            handle_b,
            handle(2, 9),
            0x01,
            handle(2, 0xC),
        )];
        let t2_dep = process_tx(&mut store, tx_hash(2), 101, &t2_events);

        assert_eq!(t2_dep.upstream_txs, vec![tx_hash(1)]);
        assert_eq!(t2_dep.handle_links, 1);
        assert_eq!(t2_dep.chain_depth, 1);
        // chain_depth + intra(T1) + intra(T2) = 1 + 1 + 1.
        assert_eq!(t2_dep.total_depth, 3);
    }

    #[test]
    fn trivial_upstream_is_linked_but_excluded_from_depth() {
        // S5: T1 trivially encrypts H_X; T2 consumes it.
        let mut store = Store::in_memory().expect("open store");
        let handle_x = handle(3, 0x1);

        process_tx(
            &mut store,
            tx_hash(1),
            100,
            &[trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle_x)],
        );

        let t2_events = vec![unary_event(
            CHAIN,
            tx_hash(2),
            101,
            0,
            EventName::FheNeg,
            handle_x,
            handle(3, 2),
        )];
        let t2_dep = process_tx(&mut store, tx_hash(2), 101, &t2_events);

        assert_eq!(t2_dep.upstream_txs, vec![tx_hash(1)]);
        assert_eq!(t2_dep.handle_links, 1);
        assert_eq!(t2_dep.chain_depth, 0);
        assert_eq!(t2_dep.total_depth, 1, "only T2's own intra depth");
    }

    #[test]
    fn chain_depth_accumulates_across_hops() {
        let mut store = Store::in_memory().expect("open store");
        let h1 = handle(2, 1);
        let h2 = handle(2, 2);

        process_tx(
            &mut store,
            tx_hash(1),
            100,
            &[binary_event(
                CHAIN,
                tx_hash(1),
                100,
                0,
                EventName::FheAdd,
                handle(2, 8),
                handle(2, 9),
                0x00,
                h1,
            )],
        );
        process_tx(
            &mut store,
            tx_hash(2),
            101,
            &[unary_event(CHAIN, tx_hash(2), 101, 0, EventName::FheNeg, h1, h2)],
        );
        let t3 = process_tx(
            &mut store,
            tx_hash(3),
            102,
            &[unary_event(
                CHAIN,
                tx_hash(3),
                102,
                0,
                EventName::FheNot,
                h2,
                handle(2, 3),
            )],
        );

        assert_eq!(t3.chain_depth, 2);
        assert_eq!(t3.total_depth, 2 + 1 + 1);
    }

    #[test]
    fn producers_in_future_blocks_are_ignored() {
        let mut store = Store::in_memory().expect("open store");
        let shared = handle(2, 1);

        // Producer at block 200 (committed first for the registry).
        process_tx(
            &mut store,
            tx_hash(9),
            200,
            &[trivial_event(CHAIN, tx_hash(9), 200, 0, 2, shared)],
        );

        // Consumer at earlier block 150 must not link forward in time.
        let dep = process_tx(
            &mut store,
            tx_hash(1),
            150,
            &[unary_event(
                CHAIN,
                tx_hash(1),
                150,
                0,
                EventName::FheNeg,
                shared,
                handle(2, 2),
            )],
        );
        assert!(dep.upstream_txs.is_empty());
        assert_eq!(dep.handle_links, 0);
    }

    #[test]
    fn missing_upstream_dependency_record_is_an_order_violation() {
        let mut store = Store::in_memory().expect("open store");
        let shared = handle(2, 1);

        // Forge a registry entry whose tx has no dependency record by
        // committing a producer DFG, then deleting its dependency row.
        process_tx(
            &mut store,
            tx_hash(1),
            100,
            &[binary_event(
                CHAIN,
                tx_hash(1),
                100,
                0,
                EventName::FheAdd,
                handle(2, 8),
                handle(2, 9),
                0x00,
                shared,
            )],
        );
        store
            .conn_mut()
            .execute("DELETE FROM dfg_tx_deps", [])
            .expect("delete deps");

        let result = compute_tx_dependency(&store, CHAIN, tx_hash(2), 101, &[shared], 1);
        assert!(matches!(
            result,
            Err(CoreError::UpstreamOrderViolation { .. })
        ));
    }

    #[test]
    fn windowed_depth_truncates_old_upstreams() {
        let mut store = Store::in_memory().expect("open store");
        let h1 = handle(2, 1);
        let h2 = handle(2, 2);

        process_tx(
            &mut store,
            tx_hash(1),
            100,
            &[binary_event(
                CHAIN,
                tx_hash(1),
                100,
                0,
                EventName::FheAdd,
                handle(2, 8),
                handle(2, 9),
                0x00,
                h1,
            )],
        );
        process_tx(
            &mut store,
            tx_hash(2),
            150,
            &[unary_event(CHAIN, tx_hash(2), 150, 0, EventName::FheNeg, h1, h2)],
        );
        process_tx(
            &mut store,
            tx_hash(3),
            200,
            &[unary_event(
                CHAIN,
                tx_hash(3),
                200,
                0,
                EventName::FheNot,
                h2,
                handle(2, 3),
            )],
        );

        // Unbounded window sees both hops.
        assert_eq!(
            windowed_chain_depth(&store, CHAIN, tx_hash(3), 1_000).expect("depth"),
            2
        );
        // Window of 60 blocks from block 200 reaches back to 141: block
        // 150 is in, block 100 is out.
        assert_eq!(
            windowed_chain_depth(&store, CHAIN, tx_hash(3), 60).expect("depth"),
            1
        );
        // Window of 1 sees only the root's own block.
        assert_eq!(
            windowed_chain_depth(&store, CHAIN, tx_hash(3), 1).expect("depth"),
            0
        );
    }

    #[test]
    fn windowed_depth_survives_registry_cycles() {
        let mut store = Store::in_memory().expect("open store");
        let h_a = handle(2, 0xA);
        let h_b = handle(2, 0xB);

        // T_A consumes H_B and produces H_A; T_B consumes H_A and
        // produces H_B, in the same block. Dependency records computed
        // in build order, then both registry entries exist and form a
        // cycle for the windowed traversal.
        let a_events = vec![binary_event(
            CHAIN,
            tx_hash(1),
            500,
            0,
            EventName::FheAdd,
            h_b,
            handle(2, 9),
            0x01,
            h_a,
        )];
        process_tx(&mut store, tx_hash(1), 500, &a_events);

        let b_events = vec![binary_event(
            CHAIN,
            tx_hash(2),
            500,
            0,
            EventName::FheAdd,
            h_a,
            handle(2, 8),
            0x01,
            h_b,
        )];
        process_tx(&mut store, tx_hash(2), 500, &b_events);

        // Must terminate; T_A's upstream (producer of H_B) is T_B, whose
        // upstream is T_A again (back-edge, skipped).
        let depth = windowed_chain_depth(&store, CHAIN, tx_hash(1), 10).expect("terminates");
        assert!(depth <= 2);
    }
}
