//! Per-transaction DFG builder.
//!
//! Consumes the events of a single transaction in log order and produces
//! nodes, intra-tx edges, the external-input handle set, per-operation
//! statistics, the graph depth, and the canonical signature. Pure over the
//! event list; persistence is the store's concern.

use std::collections::{HashMap, HashSet};

use alloy::primitives::B256;

use crate::derive::{event_inputs, output_handle, InputSource};
use crate::handle::handle_meta;
use crate::signature::dfg_signature;
use crate::types::{
    ChainId, DerivedFields, DfgEdge, DfgNode, DfgStats, EventName, EventRecord, InputKind,
    NodeInput, TxDfg, TypeRole,
};

// ==============================================================================
// Build Outcome
// ==============================================================================

/// An event that contributed no node because its argument map was
/// malformed. The build continues past it.
#[derive(Debug, Clone)]
pub struct BuildSkip {
    pub log_index: u64,
    pub reason: String,
}

/// A built DFG plus any per-event skip incidents.
#[derive(Debug, Clone)]
pub struct TxBuildOutcome {
    pub dfg: TxDfg,
    pub skipped: Vec<BuildSkip>,
}

/// Producer-side entry for a handle created earlier in the same tx.
struct Produced {
    node_id: u64,
    kind: InputKind,
    depth: u32,
}

// ==============================================================================
// Builder
// ==============================================================================

/// Build the DFG for one transaction from its events in ascending
/// `log_index` order.
///
/// `Unknown` events (undecodable) and `VerifyInput` events (input
/// provenance, not computation) are skipped by design. Events with
/// malformed argument maps are skipped and reported in the outcome.
pub fn build_tx_dfg(
    chain_id: ChainId,
    tx_hash: B256,
    block_number: u64,
    events: &[EventRecord],
) -> TxBuildOutcome {
    let mut nodes: Vec<DfgNode> = Vec::new();
    let mut edges: Vec<DfgEdge> = Vec::new();
    let mut edge_set: HashSet<(u64, u64, B256)> = HashSet::new();
    let mut produced: HashMap<B256, Produced> = HashMap::new();
    // External handles in first-consumption order; the set backs dedup.
    let mut external: Vec<B256> = Vec::new();
    let mut external_set: HashSet<B256> = HashSet::new();
    let mut stats = DfgStats::default();
    let mut skipped: Vec<BuildSkip> = Vec::new();
    let mut max_depth: u32 = 0;

    for event in events {
        let op = event.event_name;
        if matches!(op, EventName::Unknown | EventName::VerifyInput) {
            continue;
        }
        let node_id = event.log_index;

        let Some(args) = event.args.as_ref() else {
            skipped.push(BuildSkip {
                log_index: node_id,
                reason: format!("{op}: null argument map"),
            });
            continue;
        };
        let inputs = match event_inputs(op, args) {
            Ok(inputs) => inputs,
            Err(err) => {
                skipped.push(BuildSkip {
                    log_index: node_id,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let mut node_inputs: Vec<NodeInput> = Vec::with_capacity(inputs.len());
        let mut resolved_kinds: Vec<InputKind> = Vec::with_capacity(inputs.len());
        let mut parent_depths: Vec<u32> = Vec::new();

        for input in &inputs {
            let (kind, handle) = match input.source {
                InputSource::Scalar => (InputKind::Scalar, None),
                InputSource::Handle(handle) => {
                    let kind = match produced.get(&handle) {
                        Some(parent) => {
                            if edge_set.insert((parent.node_id, node_id, handle)) {
                                edges.push(DfgEdge {
                                    from_node_id: parent.node_id,
                                    to_node_id: node_id,
                                    input_handle: handle,
                                });
                            }
                            parent_depths.push(parent.depth);
                            parent.kind
                        }
                        None => {
                            if external_set.insert(handle) {
                                external.push(handle);
                            }
                            InputKind::External
                        }
                    };
                    (kind, Some(handle))
                }
            };

            node_inputs.push(NodeInput {
                role: input.role,
                kind,
                handle,
                fhe_type: handle.map(|h| handle_meta(&h).fhe_type),
            });
            stats.record_input_kind(op, kind);
            resolved_kinds.push(kind);
        }

        let depth = parent_depths
            .iter()
            .copied()
            .max()
            .map(|parent_max| parent_max + 1)
            .unwrap_or(1);
        max_depth = max_depth.max(depth);

        let out_handle = output_handle(args);
        if let Some(handle) = out_handle {
            let kind = if op == EventName::TrivialEncrypt {
                InputKind::Trivial
            } else {
                InputKind::Ciphertext
            };
            // Insert-or-replace: re-produced handles take the latest node.
            produced.insert(
                handle,
                Produced {
                    node_id,
                    kind,
                    depth,
                },
            );
            // A handle that was consumed before being produced would
            // otherwise sit in both sets; the producer wins.
            if external_set.remove(&handle) {
                external.retain(|h| *h != handle);
            }
        }

        stats.record_op(op);
        if op.is_binary_op() && resolved_kinds.len() == 2 {
            stats.record_operand_pair(op, resolved_kinds[0], resolved_kinds[1]);
        }
        record_type_stats(&mut stats, op, &event.derived);

        nodes.push(DfgNode {
            node_id,
            op,
            output_handle: out_handle,
            input_count: inputs.len() as u32,
            scalar_flag: event.derived.scalar_flag.unwrap_or(0),
            inputs: node_inputs,
        });
    }

    let signature = dfg_signature(&nodes, &edges);
    TxBuildOutcome {
        dfg: TxDfg {
            chain_id,
            tx_hash,
            block_number,
            depth: max_depth,
            nodes,
            edges,
            external_inputs: external,
            stats,
            signature,
        },
        skipped,
    }
}

/// Fold the derived per-role types of one event into the stats aggregate.
fn record_type_stats(stats: &mut DfgStats, op: EventName, derived: &DerivedFields) {
    let mut record = |role: TypeRole, fhe_type: Option<u8>| {
        if let Some(fhe_type) = fhe_type {
            stats.record_type(op, role, fhe_type);
        }
    };

    if op.is_binary_op() {
        record(TypeRole::Lhs, derived.lhs_type);
        record(TypeRole::Rhs, derived.rhs_type);
        record(TypeRole::Result, derived.result_type);
    } else if op.is_unary_op() {
        record(TypeRole::Ct, derived.lhs_type);
        record(TypeRole::Result, derived.result_type);
    } else {
        match op {
            EventName::FheIfThenElse => {
                record(TypeRole::Control, derived.control_type);
                record(TypeRole::IfTrue, derived.if_true_type);
                record(TypeRole::IfFalse, derived.if_false_type);
                record(TypeRole::Result, derived.result_type);
            }
            EventName::Cast => {
                record(TypeRole::Ct, derived.lhs_type);
                record(TypeRole::CastTo, derived.cast_to_type);
                record(TypeRole::Result, derived.result_type);
            }
            EventName::TrivialEncrypt => {
                record(TypeRole::CastTo, derived.cast_to_type);
                record(TypeRole::Result, derived.result_type);
            }
            EventName::FheRand | EventName::FheRandBounded => {
                record(TypeRole::Rand, derived.rand_type);
                record(TypeRole::Result, derived.result_type);
            }
            _ => {}
        }
    }
}
