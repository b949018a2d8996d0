//! Domain types for fhegraph's data-flow model.
//!
//! Contains the normalized event record (`EventRecord`, `DerivedFields`),
//! the per-transaction DFG structures (`DfgNode`, `DfgEdge`, `TxDfg`,
//! `DfgStats`), dependency and registry records, rollup aggregates, and
//! shared enums like `EventName` and `InputKind`.

use std::collections::BTreeMap;

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// Lowercase `0x`-prefixed hex encoding used for every hex-valued column.
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

// ==============================================================================
// Chain Id
// ==============================================================================

/// An EVM chain id, wrapped for type safety.
///
/// `#[serde(transparent)]` preserves the JSON representation as a bare
/// integer, so this newtype is wire-compatible with plain `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChainId> for u64 {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ==============================================================================
// Event Names
// ==============================================================================

/// The closed set of executor events, plus `Unknown` for logs that could
/// not be decoded against any known signature.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EventName {
    FheAdd,
    FheSub,
    FheMul,
    FheDiv,
    FheRem,
    FheBitAnd,
    FheBitOr,
    FheBitXor,
    FheShl,
    FheShr,
    FheRotl,
    FheRotr,
    FheEq,
    FheNe,
    FheGe,
    FheGt,
    FheLe,
    FheLt,
    FheMin,
    FheMax,
    FheNeg,
    FheNot,
    FheIfThenElse,
    Cast,
    TrivialEncrypt,
    VerifyInput,
    FheRand,
    FheRandBounded,
    Unknown,
}

impl EventName {
    /// The 20 binary FHE operations with `(lhs, rhs, scalarByte, result)`
    /// argument layout.
    pub const BINARY_OPS: [EventName; 20] = [
        Self::FheAdd,
        Self::FheSub,
        Self::FheMul,
        Self::FheDiv,
        Self::FheRem,
        Self::FheBitAnd,
        Self::FheBitOr,
        Self::FheBitXor,
        Self::FheShl,
        Self::FheShr,
        Self::FheRotl,
        Self::FheRotr,
        Self::FheEq,
        Self::FheNe,
        Self::FheGe,
        Self::FheGt,
        Self::FheLe,
        Self::FheLt,
        Self::FheMin,
        Self::FheMax,
    ];

    pub fn is_binary_op(self) -> bool {
        Self::BINARY_OPS.contains(&self)
    }

    pub fn is_unary_op(self) -> bool {
        matches!(self, Self::FheNeg | Self::FheNot)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FheAdd => "FheAdd",
            Self::FheSub => "FheSub",
            Self::FheMul => "FheMul",
            Self::FheDiv => "FheDiv",
            Self::FheRem => "FheRem",
            Self::FheBitAnd => "FheBitAnd",
            Self::FheBitOr => "FheBitOr",
            Self::FheBitXor => "FheBitXor",
            Self::FheShl => "FheShl",
            Self::FheShr => "FheShr",
            Self::FheRotl => "FheRotl",
            Self::FheRotr => "FheRotr",
            Self::FheEq => "FheEq",
            Self::FheNe => "FheNe",
            Self::FheGe => "FheGe",
            Self::FheGt => "FheGt",
            Self::FheLe => "FheLe",
            Self::FheLt => "FheLt",
            Self::FheMin => "FheMin",
            Self::FheMax => "FheMax",
            Self::FheNeg => "FheNeg",
            Self::FheNot => "FheNot",
            Self::FheIfThenElse => "FheIfThenElse",
            Self::Cast => "Cast",
            Self::TrivialEncrypt => "TrivialEncrypt",
            Self::VerifyInput => "VerifyInput",
            Self::FheRand => "FheRand",
            Self::FheRandBounded => "FheRandBounded",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a stored event name. Anything unrecognized maps to `Unknown`
    /// rather than failing, matching the ingest-side decode semantics.
    pub fn from_name(name: &str) -> Self {
        match name {
            "FheAdd" => Self::FheAdd,
            "FheSub" => Self::FheSub,
            "FheMul" => Self::FheMul,
            "FheDiv" => Self::FheDiv,
            "FheRem" => Self::FheRem,
            "FheBitAnd" => Self::FheBitAnd,
            "FheBitOr" => Self::FheBitOr,
            "FheBitXor" => Self::FheBitXor,
            "FheShl" => Self::FheShl,
            "FheShr" => Self::FheShr,
            "FheRotl" => Self::FheRotl,
            "FheRotr" => Self::FheRotr,
            "FheEq" => Self::FheEq,
            "FheNe" => Self::FheNe,
            "FheGe" => Self::FheGe,
            "FheGt" => Self::FheGt,
            "FheLe" => Self::FheLe,
            "FheLt" => Self::FheLt,
            "FheMin" => Self::FheMin,
            "FheMax" => Self::FheMax,
            "FheNeg" => Self::FheNeg,
            "FheNot" => Self::FheNot,
            "FheIfThenElse" => Self::FheIfThenElse,
            "Cast" => Self::Cast,
            "TrivialEncrypt" => Self::TrivialEncrypt,
            "VerifyInput" => Self::VerifyInput,
            "FheRand" => Self::FheRand,
            "FheRandBounded" => Self::FheRandBounded,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// Derived Fields
// ==============================================================================

/// Scalar fields derived from an event's decoded arguments at ingest time.
///
/// All fields are optional; which ones are set depends on the event's
/// argument layout. `scalar_flag` is 0/1 for binary ops and unset otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub lhs_type: Option<u8>,
    pub rhs_type: Option<u8>,
    pub result_type: Option<u8>,
    pub control_type: Option<u8>,
    pub if_true_type: Option<u8>,
    pub if_false_type: Option<u8>,
    pub input_type: Option<u8>,
    pub cast_to_type: Option<u8>,
    pub rand_type: Option<u8>,
    pub scalar_flag: Option<u8>,
    pub result_handle_version: Option<u8>,
}

// ==============================================================================
// Event Record
// ==============================================================================

/// A normalized executor event, as persisted in the append-only event log.
/// Identity is `(chain_id, tx_hash, log_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
    pub address: Address,
    pub event_name: EventName,
    pub topic0: B256,
    /// Raw log data as lowercase `0x`-prefixed hex.
    pub data: String,
    /// Decoded argument map, or `None` when the log was undecodable.
    pub args: Option<serde_json::Value>,
    pub derived: DerivedFields,
}

// ==============================================================================
// DFG Structures
// ==============================================================================

/// Kind of a node input as seen by the DFG builder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Handle produced by an earlier non-trivial node in the same tx.
    Ciphertext,
    /// Handle produced by an earlier `TrivialEncrypt` node in the same tx.
    Trivial,
    /// Handle with no producer in this tx.
    External,
    /// Plaintext operand (scalar rhs, cast target, rand seed, ...).
    Scalar,
}

impl InputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ciphertext => "ciphertext",
            Self::Trivial => "trivial",
            Self::External => "external",
            Self::Scalar => "scalar",
        }
    }
}

impl std::fmt::Display for InputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role an input plays in its event's argument layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InputRole {
    Lhs,
    Rhs,
    Ct,
    Control,
    IfTrue,
    IfFalse,
    ToType,
    Pt,
    Seed,
    UpperBound,
    RandType,
}

/// Role used for per-type statistics. Unlike [`InputRole`] this includes
/// the result position and collapses scalar-only roles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TypeRole {
    Lhs,
    Rhs,
    Ct,
    Control,
    IfTrue,
    IfFalse,
    CastTo,
    Rand,
    Result,
}

/// One entry of a node's `type_info`: the input's role, how it was
/// classified, and (for handle inputs) the handle and its FHE type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInput {
    pub role: InputRole,
    pub kind: InputKind,
    pub handle: Option<B256>,
    pub fhe_type: Option<u8>,
}

/// A DFG node: one retained event within a transaction. `node_id` is the
/// log index of the producing event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfgNode {
    pub node_id: u64,
    pub op: EventName,
    pub output_handle: Option<B256>,
    pub input_count: u32,
    pub scalar_flag: u8,
    pub inputs: Vec<NodeInput>,
}

/// An intra-tx edge: the consuming node's input handle equals the
/// `output_handle` of an earlier node in the same tx.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DfgEdge {
    pub from_node_id: u64,
    pub to_node_id: u64,
    pub input_handle: B256,
}

/// Nested per-operation statistics accumulated while building a DFG and
/// merged across transactions by the op-mix rollup.
///
/// All maps are `BTreeMap` so serialized output has deterministic key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfgStats {
    /// op -> number of nodes.
    pub op_counts: BTreeMap<EventName, u64>,
    /// op -> input kind -> count.
    pub input_kinds: BTreeMap<EventName, BTreeMap<InputKind, u64>>,
    /// binary op -> "lhs_kind-rhs_kind" -> count.
    pub operand_pairs: BTreeMap<EventName, BTreeMap<String, u64>>,
    /// op -> role -> FHE type -> count.
    pub type_counts: BTreeMap<EventName, BTreeMap<TypeRole, BTreeMap<u8, u64>>>,
}

impl DfgStats {
    pub fn record_op(&mut self, op: EventName) {
        *self.op_counts.entry(op).or_default() += 1;
    }

    pub fn record_input_kind(&mut self, op: EventName, kind: InputKind) {
        *self
            .input_kinds
            .entry(op)
            .or_default()
            .entry(kind)
            .or_default() += 1;
    }

    pub fn record_operand_pair(&mut self, op: EventName, lhs: InputKind, rhs: InputKind) {
        *self
            .operand_pairs
            .entry(op)
            .or_default()
            .entry(format!("{lhs}-{rhs}"))
            .or_default() += 1;
    }

    pub fn record_type(&mut self, op: EventName, role: TypeRole, fhe_type: u8) {
        *self
            .type_counts
            .entry(op)
            .or_default()
            .entry(role)
            .or_default()
            .entry(fhe_type)
            .or_default() += 1;
    }

    /// Add another stats aggregate into this one (used by the op-mix rollup).
    pub fn merge(&mut self, other: &DfgStats) {
        for (op, count) in &other.op_counts {
            *self.op_counts.entry(*op).or_default() += count;
        }
        for (op, kinds) in &other.input_kinds {
            let entry = self.input_kinds.entry(*op).or_default();
            for (kind, count) in kinds {
                *entry.entry(*kind).or_default() += count;
            }
        }
        for (op, pairs) in &other.operand_pairs {
            let entry = self.operand_pairs.entry(*op).or_default();
            for (pair, count) in pairs {
                *entry.entry(pair.clone()).or_default() += count;
            }
        }
        for (op, roles) in &other.type_counts {
            let entry = self.type_counts.entry(*op).or_default();
            for (role, types) in roles {
                let role_entry = entry.entry(*role).or_default();
                for (fhe_type, count) in types {
                    *role_entry.entry(*fhe_type).or_default() += count;
                }
            }
        }
    }
}

/// A fully built per-transaction DFG, ready to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxDfg {
    pub chain_id: ChainId,
    pub tx_hash: B256,
    pub block_number: u64,
    pub nodes: Vec<DfgNode>,
    pub edges: Vec<DfgEdge>,
    /// Unique external-input handles in first-consumption order.
    pub external_inputs: Vec<B256>,
    /// Longest directed chain length, measured in nodes (leaves at 1;
    /// 0 when the tx retained no events).
    pub depth: u32,
    pub stats: DfgStats,
    /// Canonical signature digest, lowercase `0x`-prefixed hex.
    pub signature: String,
}

/// The persisted per-tx DFG summary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxDfgSummary {
    pub chain_id: ChainId,
    pub tx_hash: B256,
    pub block_number: u64,
    pub node_count: u64,
    pub edge_count: u64,
    pub depth: u32,
    pub signature: String,
    pub stats: DfgStats,
}

// ==============================================================================
// Registry and Dependency Records
// ==============================================================================

/// The transaction that last produced a given handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleProducer {
    pub tx_hash: B256,
    pub block_number: u64,
    pub is_trivial: bool,
}

/// Cross-transaction dependency record for one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDependency {
    pub chain_id: ChainId,
    pub tx_hash: B256,
    pub block_number: u64,
    /// Distinct upstream transactions, sorted.
    pub upstream_txs: Vec<B256>,
    /// Number of external handles that resolved to an upstream producer.
    pub handle_links: u64,
    /// Cross-tx hops through non-trivial producers (0 if none).
    pub chain_depth: u32,
    /// `chain_depth + max(upstream intra-tx depth) + own intra-tx depth`.
    pub total_depth: u32,
}

// ==============================================================================
// Checkpoints
// ==============================================================================

/// Per-(chain, subsystem) resume point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_block: u64,
    pub last_tx_hash: Option<B256>,
}

// ==============================================================================
// Rollup Aggregates
// ==============================================================================

/// Per-chain operation-mix rollup: merged `DfgStats` across all built txs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMixRollup {
    pub dfg_tx_count: u64,
    pub stats: DfgStats,
}

/// Per-chain dependency rollup with depth distributions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepRollup {
    pub total_txs: u64,
    pub dependent_txs: u64,
    /// Sum of upstream-tx set sizes, over dependent txs only.
    pub sum_upstream_txs: u64,
    /// Sum of handle links, over dependent txs only.
    pub sum_handle_links: u64,
    pub max_chain_depth: u32,
    pub max_total_depth: u32,
    pub chain_depth_hist: BTreeMap<u32, u64>,
    pub total_depth_hist: BTreeMap<u32, u64>,
}

impl DepRollup {
    /// Fold one dependency record into the aggregate.
    pub fn absorb(&mut self, dep: &TxDependency) {
        self.total_txs += 1;
        if dep.handle_links > 0 {
            self.dependent_txs += 1;
            self.sum_upstream_txs += dep.upstream_txs.len() as u64;
            self.sum_handle_links += dep.handle_links;
        }
        self.max_chain_depth = self.max_chain_depth.max(dep.chain_depth);
        self.max_total_depth = self.max_total_depth.max(dep.total_depth);
        *self.chain_depth_hist.entry(dep.chain_depth).or_default() += 1;
        *self.total_depth_hist.entry(dep.total_depth).or_default() += 1;
    }
}

/// Coarse per-chain summary over DFG summaries and the raw event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainStatsRollup {
    pub dfg_tx_count: u64,
    pub avg_node_count: f64,
    pub min_node_count: u64,
    pub max_node_count: u64,
    pub avg_edge_count: f64,
    pub max_edge_count: u64,
    pub max_depth: u32,
    pub distinct_signatures: u64,
    /// Total events ingested for this chain (cross-reference counter).
    pub event_count: u64,
    /// Distinct transactions seen in the raw event log.
    pub event_tx_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_roundtrip() {
        for op in EventName::BINARY_OPS {
            assert_eq!(EventName::from_name(op.as_str()), op);
            assert!(op.is_binary_op());
            assert!(!op.is_unary_op());
        }
        assert_eq!(EventName::from_name("FheNeg"), EventName::FheNeg);
        assert_eq!(EventName::from_name("definitely-not-an-event"), EventName::Unknown);
    }

    #[test]
    fn stats_merge_accumulates_nested_counters() {
        let mut a = DfgStats::default();
        a.record_op(EventName::FheAdd);
        a.record_input_kind(EventName::FheAdd, InputKind::External);
        a.record_operand_pair(EventName::FheAdd, InputKind::External, InputKind::Scalar);
        a.record_type(EventName::FheAdd, TypeRole::Lhs, 2);

        let mut b = DfgStats::default();
        b.record_op(EventName::FheAdd);
        b.record_type(EventName::FheAdd, TypeRole::Lhs, 2);
        b.record_type(EventName::FheAdd, TypeRole::Result, 2);

        a.merge(&b);
        assert_eq!(a.op_counts[&EventName::FheAdd], 2);
        assert_eq!(a.input_kinds[&EventName::FheAdd][&InputKind::External], 1);
        assert_eq!(
            a.operand_pairs[&EventName::FheAdd]["external-scalar"],
            1
        );
        assert_eq!(a.type_counts[&EventName::FheAdd][&TypeRole::Lhs][&2], 2);
        assert_eq!(a.type_counts[&EventName::FheAdd][&TypeRole::Result][&2], 1);
    }

    #[test]
    fn stats_json_keys_are_event_names() {
        let mut stats = DfgStats::default();
        stats.record_op(EventName::FheMul);
        stats.record_input_kind(EventName::FheMul, InputKind::Scalar);
        let json = serde_json::to_value(&stats).expect("stats serialize");
        assert_eq!(json["op_counts"]["FheMul"], 1);
        assert_eq!(json["input_kinds"]["FheMul"]["scalar"], 1);
    }

    #[test]
    fn dep_rollup_absorb_tracks_dependent_txs_only() {
        let mut rollup = DepRollup::default();
        let independent = TxDependency {
            chain_id: ChainId(1),
            tx_hash: B256::ZERO,
            block_number: 1,
            upstream_txs: vec![],
            handle_links: 0,
            chain_depth: 0,
            total_depth: 3,
        };
        let dependent = TxDependency {
            upstream_txs: vec![B256::repeat_byte(1)],
            handle_links: 2,
            chain_depth: 1,
            total_depth: 5,
            ..independent.clone()
        };
        rollup.absorb(&independent);
        rollup.absorb(&dependent);

        assert_eq!(rollup.total_txs, 2);
        assert_eq!(rollup.dependent_txs, 1);
        assert_eq!(rollup.sum_upstream_txs, 1);
        assert_eq!(rollup.sum_handle_links, 2);
        assert_eq!(rollup.max_chain_depth, 1);
        assert_eq!(rollup.max_total_depth, 5);
        assert_eq!(rollup.chain_depth_hist[&0], 1);
        assert_eq!(rollup.chain_depth_hist[&1], 1);
        assert_eq!(rollup.total_depth_hist[&3], 1);
        assert_eq!(rollup.total_depth_hist[&5], 1);
    }
}
