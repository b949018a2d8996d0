//! Executor event signatures and raw-log decoding.
//!
//! The executor contract emits a closed set of 28 events; every event
//! carries an indexed `caller` address. Logs are classified by matching
//! `topic0` against the compile-time `SIGNATURE_HASH` constants generated
//! by `alloy::sol!`, then ABI-decoded into a JSON argument map. Anything
//! that fails classification or decoding is reported as `Unknown` with a
//! null argument map; downstream builders skip such events.

use alloy::primitives::B256;
use alloy::sol_types::SolEvent;
use tracing::debug;

use crate::types::{to_hex, EventName};

// Hide the auto-generated alloy event structs inside this module.
mod sol {
    alloy::sol! {
        event FheAdd(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheSub(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheMul(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheDiv(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheRem(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheBitAnd(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheBitOr(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheBitXor(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheShl(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheShr(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheRotl(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheRotr(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheEq(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheNe(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheGe(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheGt(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheLe(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheLt(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheMin(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheMax(address indexed caller, bytes32 lhs, bytes32 rhs, bytes1 scalarByte, bytes32 result);
        event FheNeg(address indexed caller, bytes32 ct, bytes32 result);
        event FheNot(address indexed caller, bytes32 ct, bytes32 result);
        event FheIfThenElse(address indexed caller, bytes32 control, bytes32 ifTrue, bytes32 ifFalse, bytes32 result);
        event Cast(address indexed caller, bytes32 ct, uint8 toType, bytes32 result);
        event TrivialEncrypt(address indexed caller, uint256 pt, uint8 toType, bytes32 result);
        event VerifyInput(address indexed caller, bytes32 inputHandle, address userAddress, bytes inputProof, uint8 inputType, bytes32 result);
        event FheRand(address indexed caller, uint8 randType, bytes16 seed, bytes32 result);
        event FheRandBounded(address indexed caller, uint256 upperBound, uint8 randType, bytes16 seed, bytes32 result);
    }
}

/// `topic0` → event name table for all 28 signatures.
const EVENT_TOPICS: [(B256, EventName); 28] = [
    (sol::FheAdd::SIGNATURE_HASH, EventName::FheAdd),
    (sol::FheSub::SIGNATURE_HASH, EventName::FheSub),
    (sol::FheMul::SIGNATURE_HASH, EventName::FheMul),
    (sol::FheDiv::SIGNATURE_HASH, EventName::FheDiv),
    (sol::FheRem::SIGNATURE_HASH, EventName::FheRem),
    (sol::FheBitAnd::SIGNATURE_HASH, EventName::FheBitAnd),
    (sol::FheBitOr::SIGNATURE_HASH, EventName::FheBitOr),
    (sol::FheBitXor::SIGNATURE_HASH, EventName::FheBitXor),
    (sol::FheShl::SIGNATURE_HASH, EventName::FheShl),
    (sol::FheShr::SIGNATURE_HASH, EventName::FheShr),
    (sol::FheRotl::SIGNATURE_HASH, EventName::FheRotl),
    (sol::FheRotr::SIGNATURE_HASH, EventName::FheRotr),
    (sol::FheEq::SIGNATURE_HASH, EventName::FheEq),
    (sol::FheNe::SIGNATURE_HASH, EventName::FheNe),
    (sol::FheGe::SIGNATURE_HASH, EventName::FheGe),
    (sol::FheGt::SIGNATURE_HASH, EventName::FheGt),
    (sol::FheLe::SIGNATURE_HASH, EventName::FheLe),
    (sol::FheLt::SIGNATURE_HASH, EventName::FheLt),
    (sol::FheMin::SIGNATURE_HASH, EventName::FheMin),
    (sol::FheMax::SIGNATURE_HASH, EventName::FheMax),
    (sol::FheNeg::SIGNATURE_HASH, EventName::FheNeg),
    (sol::FheNot::SIGNATURE_HASH, EventName::FheNot),
    (sol::FheIfThenElse::SIGNATURE_HASH, EventName::FheIfThenElse),
    (sol::Cast::SIGNATURE_HASH, EventName::Cast),
    (sol::TrivialEncrypt::SIGNATURE_HASH, EventName::TrivialEncrypt),
    (sol::VerifyInput::SIGNATURE_HASH, EventName::VerifyInput),
    (sol::FheRand::SIGNATURE_HASH, EventName::FheRand),
    (sol::FheRandBounded::SIGNATURE_HASH, EventName::FheRandBounded),
];

/// Classify a log's `topic0`. Unrecognized topics map to `Unknown`.
pub fn classify_topic0(topic0: B256) -> EventName {
    EVENT_TOPICS
        .iter()
        .find(|(topic, _)| *topic == topic0)
        .map(|(_, name)| *name)
        .unwrap_or(EventName::Unknown)
}

/// A classified and (when possible) decoded log.
#[derive(Debug, Clone)]
pub struct DecodedLog {
    pub name: EventName,
    /// JSON argument map with the Solidity argument names as keys, or
    /// `None` when the log body could not be decoded.
    pub args: Option<serde_json::Value>,
}

macro_rules! decode_binary_op {
    ($ty:ty, $topics:expr, $data:expr) => {
        <$ty as SolEvent>::decode_raw_log($topics.iter().copied(), $data, true).map(|ev| {
            serde_json::json!({
                "caller": to_hex(ev.caller.as_slice()),
                "lhs": to_hex(ev.lhs.as_slice()),
                "rhs": to_hex(ev.rhs.as_slice()),
                "scalarByte": to_hex(ev.scalarByte.as_slice()),
                "result": to_hex(ev.result.as_slice()),
            })
        })
    };
}

macro_rules! decode_unary_op {
    ($ty:ty, $topics:expr, $data:expr) => {
        <$ty as SolEvent>::decode_raw_log($topics.iter().copied(), $data, true).map(|ev| {
            serde_json::json!({
                "caller": to_hex(ev.caller.as_slice()),
                "ct": to_hex(ev.ct.as_slice()),
                "result": to_hex(ev.result.as_slice()),
            })
        })
    };
}

/// Classify and decode a raw log into its argument map.
///
/// `topics` must be the full topic list including `topic0`. Both unknown
/// signatures and body-decode failures yield `Unknown` with null args.
pub fn decode_log(topics: &[B256], data: &[u8]) -> DecodedLog {
    let Some(topic0) = topics.first().copied() else {
        return DecodedLog {
            name: EventName::Unknown,
            args: None,
        };
    };
    let name = classify_topic0(topic0);

    let decoded = match name {
        EventName::FheAdd => decode_binary_op!(sol::FheAdd, topics, data),
        EventName::FheSub => decode_binary_op!(sol::FheSub, topics, data),
        EventName::FheMul => decode_binary_op!(sol::FheMul, topics, data),
        EventName::FheDiv => decode_binary_op!(sol::FheDiv, topics, data),
        EventName::FheRem => decode_binary_op!(sol::FheRem, topics, data),
        EventName::FheBitAnd => decode_binary_op!(sol::FheBitAnd, topics, data),
        EventName::FheBitOr => decode_binary_op!(sol::FheBitOr, topics, data),
        EventName::FheBitXor => decode_binary_op!(sol::FheBitXor, topics, data),
        EventName::FheShl => decode_binary_op!(sol::FheShl, topics, data),
        EventName::FheShr => decode_binary_op!(sol::FheShr, topics, data),
        EventName::FheRotl => decode_binary_op!(sol::FheRotl, topics, data),
        EventName::FheRotr => decode_binary_op!(sol::FheRotr, topics, data),
        EventName::FheEq => decode_binary_op!(sol::FheEq, topics, data),
        EventName::FheNe => decode_binary_op!(sol::FheNe, topics, data),
        EventName::FheGe => decode_binary_op!(sol::FheGe, topics, data),
        EventName::FheGt => decode_binary_op!(sol::FheGt, topics, data),
        EventName::FheLe => decode_binary_op!(sol::FheLe, topics, data),
        EventName::FheLt => decode_binary_op!(sol::FheLt, topics, data),
        EventName::FheMin => decode_binary_op!(sol::FheMin, topics, data),
        EventName::FheMax => decode_binary_op!(sol::FheMax, topics, data),
        EventName::FheNeg => decode_unary_op!(sol::FheNeg, topics, data),
        EventName::FheNot => decode_unary_op!(sol::FheNot, topics, data),
        EventName::FheIfThenElse => {
            <sol::FheIfThenElse as SolEvent>::decode_raw_log(topics.iter().copied(), data, true)
                .map(|ev| {
                    serde_json::json!({
                        "caller": to_hex(ev.caller.as_slice()),
                        "control": to_hex(ev.control.as_slice()),
                        "ifTrue": to_hex(ev.ifTrue.as_slice()),
                        "ifFalse": to_hex(ev.ifFalse.as_slice()),
                        "result": to_hex(ev.result.as_slice()),
                    })
                })
        }
        EventName::Cast => {
            <sol::Cast as SolEvent>::decode_raw_log(topics.iter().copied(), data, true).map(|ev| {
                serde_json::json!({
                    "caller": to_hex(ev.caller.as_slice()),
                    "ct": to_hex(ev.ct.as_slice()),
                    "toType": ev.toType,
                    "result": to_hex(ev.result.as_slice()),
                })
            })
        }
        EventName::TrivialEncrypt => {
            <sol::TrivialEncrypt as SolEvent>::decode_raw_log(topics.iter().copied(), data, true)
                .map(|ev| {
                    serde_json::json!({
                        "caller": to_hex(ev.caller.as_slice()),
                        "pt": format!("0x{:x}", ev.pt),
                        "toType": ev.toType,
                        "result": to_hex(ev.result.as_slice()),
                    })
                })
        }
        EventName::VerifyInput => {
            <sol::VerifyInput as SolEvent>::decode_raw_log(topics.iter().copied(), data, true)
                .map(|ev| {
                    serde_json::json!({
                        "caller": to_hex(ev.caller.as_slice()),
                        "inputHandle": to_hex(ev.inputHandle.as_slice()),
                        "userAddress": to_hex(ev.userAddress.as_slice()),
                        "inputProof": to_hex(&ev.inputProof),
                        "inputType": ev.inputType,
                        "result": to_hex(ev.result.as_slice()),
                    })
                })
        }
        EventName::FheRand => {
            <sol::FheRand as SolEvent>::decode_raw_log(topics.iter().copied(), data, true).map(
                |ev| {
                    serde_json::json!({
                        "caller": to_hex(ev.caller.as_slice()),
                        "randType": ev.randType,
                        "seed": to_hex(ev.seed.as_slice()),
                        "result": to_hex(ev.result.as_slice()),
                    })
                },
            )
        }
        EventName::FheRandBounded => {
            <sol::FheRandBounded as SolEvent>::decode_raw_log(topics.iter().copied(), data, true)
                .map(|ev| {
                    serde_json::json!({
                        "caller": to_hex(ev.caller.as_slice()),
                        "upperBound": format!("0x{:x}", ev.upperBound),
                        "randType": ev.randType,
                        "seed": to_hex(ev.seed.as_slice()),
                        "result": to_hex(ev.result.as_slice()),
                    })
                })
        }
        EventName::Unknown => {
            return DecodedLog {
                name: EventName::Unknown,
                args: None,
            }
        }
    };

    match decoded {
        Ok(args) => DecodedLog {
            name,
            args: Some(args),
        },
        Err(err) => {
            debug!(event = %name, error = %err, "log body failed ABI decoding");
            DecodedLog {
                name: EventName::Unknown,
                args: None,
            }
        }
    }
}
