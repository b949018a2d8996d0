//! DFG validator.
//!
//! Re-derives every transaction's DFG from its stored events and compares
//! the result against the persisted nodes, edges, inputs, and summary.
//! Produces a structured report with per-category counts and a bounded
//! sample of mismatches; the exit-code policy (report-only vs fail) is the
//! caller's.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use alloy::primitives::B256;
use tracing::{debug, info};

use crate::dfg::build_tx_dfg;
use crate::error::CoreError;
use crate::store::Store;
use crate::types::{ChainId, DfgNode, InputKind};

/// Default cap on retained mismatch samples.
const DEFAULT_MAX_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    NodeSet,
    NodeField,
    InputCount,
    TypeInfo,
    EdgeSet,
    InputSet,
    Depth,
    Counts,
    Signature,
}

impl MismatchKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::NodeSet => "node_set",
            Self::NodeField => "node_field",
            Self::InputCount => "input_count",
            Self::TypeInfo => "type_info",
            Self::EdgeSet => "edge_set",
            Self::InputSet => "input_set",
            Self::Depth => "depth",
            Self::Counts => "counts",
            Self::Signature => "signature",
        }
    }
}

/// One observed discrepancy between derived and persisted state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Mismatch {
    pub tx_hash: B256,
    pub kind: MismatchKind,
    pub detail: String,
}

/// Validation results for one chain.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationReport {
    pub txs_checked: u64,
    pub txs_with_mismatches: u64,
    pub mismatch_counts: BTreeMap<String, u64>,
    /// Bounded sample of concrete mismatches.
    pub samples: Vec<Mismatch>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.txs_with_mismatches == 0
    }

    fn record(&mut self, mismatch: Mismatch, max_samples: usize) {
        *self
            .mismatch_counts
            .entry(mismatch.kind.as_str().to_owned())
            .or_default() += 1;
        if self.samples.len() < max_samples {
            self.samples.push(mismatch);
        }
    }
}

/// Options for one validation run.
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub max_samples: usize,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            from_block: None,
            to_block: None,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

/// Re-derive and compare every built tx in range.
pub fn validate_chain(
    store: &Store,
    chain_id: ChainId,
    options: &ValidateOptions,
) -> Result<ValidationReport, CoreError> {
    let refs = store.tx_refs_after(chain_id, None, options.from_block, options.to_block)?;
    let mut report = ValidationReport::default();

    for (block_number, tx_hash) in refs {
        let Some(summary) = store.dfg_summary(chain_id, tx_hash)? else {
            // Not built yet; nothing to validate against.
            continue;
        };
        report.txs_checked += 1;

        let events = store.events_for_tx(chain_id, tx_hash)?;
        let expected = build_tx_dfg(chain_id, tx_hash, block_number, &events).dfg;

        let persisted_nodes = store.dfg_nodes_for_tx(chain_id, tx_hash)?;
        let persisted_edges = store.dfg_edges_for_tx(chain_id, tx_hash)?;
        let persisted_inputs = store.dfg_inputs_for_tx(chain_id, tx_hash)?;

        let mut mismatches: Vec<Mismatch> = Vec::new();
        compare_nodes(tx_hash, &expected.nodes, &persisted_nodes, &mut mismatches);

        let expected_edges: BTreeSet<(u64, u64, B256)> = expected
            .edges
            .iter()
            .map(|edge| (edge.from_node_id, edge.to_node_id, edge.input_handle))
            .collect();
        let stored_edges: BTreeSet<(u64, u64, B256)> = persisted_edges
            .iter()
            .map(|edge| (edge.from_node_id, edge.to_node_id, edge.input_handle))
            .collect();
        if expected_edges != stored_edges {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::EdgeSet,
                detail: format!(
                    "expected {} edges, persisted {}",
                    expected_edges.len(),
                    stored_edges.len()
                ),
            });
        }

        let expected_inputs: BTreeSet<B256> = expected.external_inputs.iter().copied().collect();
        let stored_inputs: BTreeSet<B256> = persisted_inputs
            .iter()
            .filter(|(_, kind)| *kind == InputKind::External)
            .map(|(handle, _)| *handle)
            .collect();
        if expected_inputs != stored_inputs {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::InputSet,
                detail: format!(
                    "expected {} external inputs, persisted {}",
                    expected_inputs.len(),
                    stored_inputs.len()
                ),
            });
        }

        if expected.depth != summary.depth {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::Depth,
                detail: format!("expected depth {}, persisted {}", expected.depth, summary.depth),
            });
        }
        if summary.node_count != persisted_nodes.len() as u64
            || summary.edge_count != persisted_edges.len() as u64
            || summary.node_count != expected.nodes.len() as u64
        {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::Counts,
                detail: format!(
                    "summary says {} nodes/{} edges, derived {}/{}, persisted {}/{}",
                    summary.node_count,
                    summary.edge_count,
                    expected.nodes.len(),
                    expected.edges.len(),
                    persisted_nodes.len(),
                    persisted_edges.len()
                ),
            });
        }
        if expected.signature != summary.signature {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::Signature,
                detail: format!(
                    "expected {}, persisted {}",
                    expected.signature, summary.signature
                ),
            });
        }

        if !mismatches.is_empty() {
            report.txs_with_mismatches += 1;
            debug!(
                chain = %chain_id,
                tx = %tx_hash,
                count = mismatches.len(),
                "validation mismatches"
            );
            for mismatch in mismatches {
                report.record(mismatch, options.max_samples);
            }
        }
    }

    info!(
        chain = %chain_id,
        checked = report.txs_checked,
        mismatched = report.txs_with_mismatches,
        "validation finished"
    );
    Ok(report)
}

/// Compare persisted nodes field-by-field against the re-derived set.
fn compare_nodes(
    tx_hash: B256,
    expected: &[DfgNode],
    persisted: &[DfgNode],
    mismatches: &mut Vec<Mismatch>,
) {
    let expected_by_id: HashMap<u64, &DfgNode> =
        expected.iter().map(|node| (node.node_id, node)).collect();
    let persisted_by_id: HashMap<u64, &DfgNode> =
        persisted.iter().map(|node| (node.node_id, node)).collect();

    for node in expected {
        if !persisted_by_id.contains_key(&node.node_id) {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::NodeSet,
                detail: format!("derived node {} is not persisted", node.node_id),
            });
        }
    }

    for node in persisted {
        let Some(derived) = expected_by_id.get(&node.node_id) else {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::NodeSet,
                detail: format!("persisted node {} is not derivable", node.node_id),
            });
            continue;
        };

        if node.op != derived.op
            || node.output_handle != derived.output_handle
            || node.scalar_flag != derived.scalar_flag
        {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::NodeField,
                detail: format!(
                    "node {}: op/output/scalar_flag differ (persisted {:?}/{:?}/{}, derived {:?}/{:?}/{})",
                    node.node_id,
                    node.op,
                    node.output_handle,
                    node.scalar_flag,
                    derived.op,
                    derived.output_handle,
                    derived.scalar_flag
                ),
            });
        }
        if node.input_count != derived.input_count
            || node.input_count as usize != node.inputs.len()
        {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::InputCount,
                detail: format!(
                    "node {}: input_count {} vs derived {} (type_info holds {})",
                    node.node_id,
                    node.input_count,
                    derived.input_count,
                    node.inputs.len()
                ),
            });
        }
        if node.inputs != derived.inputs {
            mismatches.push(Mismatch {
                tx_hash,
                kind: MismatchKind::TypeInfo,
                detail: format!("node {}: type_info differs", node.node_id),
            });
        }
    }
}
