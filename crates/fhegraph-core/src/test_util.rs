//! Shared test helpers for `fhegraph-core` unit tests.
//!
//! Consolidates builder functions for handles, transaction hashes, and
//! normalized event records so that tests across modules share a single
//! source of truth for dummy data construction.

use alloy::primitives::{Address, B256};

use crate::derive::derive_fields;
use crate::types::{to_hex, ChainId, EventName, EventRecord};

// ==============================================================================
// Handle and Hash Helpers
// ==============================================================================

/// Build a handle with the given FHE type (byte 30), version 1 (byte 31),
/// and a distinguishing payload byte so handles of the same type differ.
pub fn handle(fhe_type: u8, seed: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    bytes[30] = fhe_type;
    bytes[31] = 1;
    B256::from(bytes)
}

/// Create a deterministic tx hash from a single distinguishing byte.
pub fn tx_hash(b: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    B256::from(bytes)
}

pub fn hex_of(value: B256) -> String {
    to_hex(value.as_slice())
}

pub fn caller_hex() -> String {
    to_hex(Address::repeat_byte(0x11).as_slice())
}

// ==============================================================================
// Event Record Builders
// ==============================================================================

/// Build a normalized event record. Derived fields are computed from the
/// argument map exactly as ingest would.
pub fn make_event(
    chain_id: ChainId,
    tx: B256,
    block_number: u64,
    log_index: u64,
    name: EventName,
    args: Option<serde_json::Value>,
) -> EventRecord {
    let derived = derive_fields(name, args.as_ref());
    EventRecord {
        chain_id,
        block_number,
        block_hash: tx_hash(0xB0),
        tx_hash: tx,
        log_index,
        address: Address::repeat_byte(0xEE),
        event_name: name,
        topic0: B256::ZERO,
        data: "0x".to_owned(),
        args,
        derived,
    }
}

/// A binary-op event (`lhs`, `rhs`, `scalarByte`, `result`).
pub fn binary_event(
    chain_id: ChainId,
    tx: B256,
    block_number: u64,
    log_index: u64,
    op: EventName,
    lhs: B256,
    rhs: B256,
    scalar_byte: u8,
    result: B256,
) -> EventRecord {
    let args = serde_json::json!({
        "caller": caller_hex(),
        "lhs": hex_of(lhs),
        "rhs": hex_of(rhs),
        "scalarByte": format!("0x{scalar_byte:02x}"),
        "result": hex_of(result),
    });
    make_event(chain_id, tx, block_number, log_index, op, Some(args))
}

/// A unary-op event (`ct`, `result`).
pub fn unary_event(
    chain_id: ChainId,
    tx: B256,
    block_number: u64,
    log_index: u64,
    op: EventName,
    ct: B256,
    result: B256,
) -> EventRecord {
    let args = serde_json::json!({
        "caller": caller_hex(),
        "ct": hex_of(ct),
        "result": hex_of(result),
    });
    make_event(chain_id, tx, block_number, log_index, op, Some(args))
}

/// A `TrivialEncrypt` event producing `result` from a plaintext.
pub fn trivial_event(
    chain_id: ChainId,
    tx: B256,
    block_number: u64,
    log_index: u64,
    to_type: u8,
    result: B256,
) -> EventRecord {
    let args = serde_json::json!({
        "caller": caller_hex(),
        "pt": "0x2a",
        "toType": to_type,
        "result": hex_of(result),
    });
    make_event(
        chain_id,
        tx,
        block_number,
        log_index,
        EventName::TrivialEncrypt,
        Some(args),
    )
}
