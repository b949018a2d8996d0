//! Canonical DFG signature.
//!
//! Produces a SHA-256 fingerprint of a DFG's op sequence and topology that
//! is invariant to the absolute log-index numbering of its nodes: nodes are
//! sorted by `node_id` and relabelled to consecutive integers, edges are
//! projected onto those labels, deduplicated, and sorted. This is a
//! numbering-invariant fingerprint, not a graph-isomorphism canonical form;
//! it relies on logs keeping a stable relative order for functionally equal
//! computations.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{DfgEdge, DfgNode};

/// Canonical serialized shape. Field order is the wire format; the `v: 2`
/// discriminator allows future canonicalization changes.
#[derive(Serialize)]
struct CanonicalDfg<'a> {
    v: u32,
    ops: Vec<&'a str>,
    edges: Vec<(u64, u64)>,
}

/// Compute the canonical signature digest as lowercase `0x`-prefixed hex.
pub fn dfg_signature(nodes: &[DfgNode], edges: &[DfgEdge]) -> String {
    let mut sorted: Vec<&DfgNode> = nodes.iter().collect();
    sorted.sort_by_key(|node| node.node_id);

    let index: HashMap<u64, u64> = sorted
        .iter()
        .enumerate()
        .map(|(position, node)| (node.node_id, position as u64))
        .collect();
    let ops: Vec<&str> = sorted.iter().map(|node| node.op.as_str()).collect();

    // BTreeSet dedups parallel edges and yields lexicographic (from, to)
    // order. Edges with endpoints outside the node set are dropped.
    let canonical_edges: BTreeSet<(u64, u64)> = edges
        .iter()
        .filter_map(|edge| {
            Some((
                *index.get(&edge.from_node_id)?,
                *index.get(&edge.to_node_id)?,
            ))
        })
        .collect();

    let payload = serde_json::to_vec(&CanonicalDfg {
        v: 2,
        ops,
        edges: canonical_edges.into_iter().collect(),
    })
    .expect("canonical form serializes");

    format!("0x{}", hex::encode(Sha256::digest(&payload)))
}
