//! Event-to-typed-record derivation.
//!
//! Pure functions that turn a classified event's decoded argument map into
//! the derived scalar fields persisted next to it (`derive_fields`), the
//! role-tagged input list the DFG builder consumes (`event_inputs`), and a
//! cross-check comparing the declared result type against the type the
//! event itself implies (`check_consistency`).

use alloy::primitives::B256;
use serde_json::Value;

use crate::error::CoreError;
use crate::handle::{decode_handle, parse_handle, scalar_flag};
use crate::types::{DerivedFields, EventName, InputRole};

// ==============================================================================
// Argument Accessors
// ==============================================================================

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn arg_u8(args: &Value, key: &str) -> Option<u8> {
    args.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u8::try_from(n).ok())
}

/// FHE type of a handle-valued argument, if it parses as a handle.
fn arg_handle_type(args: &Value, key: &str) -> Option<u8> {
    arg_str(args, key)
        .and_then(|raw| decode_handle(raw).ok())
        .map(|meta| meta.fhe_type)
}

/// Parse the `scalarByte` argument (`"0x00"`-style hex) into a 0/1 flag.
fn arg_scalar_flag(args: &Value) -> Option<u8> {
    let raw = arg_str(args, "scalarByte")?;
    let body = raw.strip_prefix("0x")?;
    let bytes = hex::decode(body).ok()?;
    Some(scalar_flag(*bytes.first()?))
}

fn required_handle(args: &Value, key: &str, event: EventName) -> Result<B256, CoreError> {
    let raw = arg_str(args, key).ok_or_else(|| {
        CoreError::InvalidEventData(format!("{event}: missing `{key}` argument"))
    })?;
    parse_handle(raw)
        .map_err(|e| CoreError::InvalidEventData(format!("{event}: bad `{key}` handle: {e}")))
}

// ==============================================================================
// Derived Fields
// ==============================================================================

/// Derive the typed scalar fields for an event from its argument map.
///
/// Total over its inputs: unparseable or missing arguments leave the
/// corresponding fields unset rather than failing.
pub fn derive_fields(name: EventName, args: Option<&Value>) -> DerivedFields {
    let mut out = DerivedFields::default();
    let Some(args) = args else {
        return out;
    };

    if name.is_binary_op() {
        out.lhs_type = arg_handle_type(args, "lhs");
        out.scalar_flag = arg_scalar_flag(args);
        if out.scalar_flag == Some(0) {
            out.rhs_type = arg_handle_type(args, "rhs");
        }
        set_result_fields(&mut out, args);
        return out;
    }
    if name.is_unary_op() {
        out.lhs_type = arg_handle_type(args, "ct");
        set_result_fields(&mut out, args);
        return out;
    }

    match name {
        EventName::FheIfThenElse => {
            out.control_type = arg_handle_type(args, "control");
            out.if_true_type = arg_handle_type(args, "ifTrue");
            out.if_false_type = arg_handle_type(args, "ifFalse");
            set_result_fields(&mut out, args);
        }
        EventName::Cast => {
            out.lhs_type = arg_handle_type(args, "ct");
            out.cast_to_type = arg_u8(args, "toType");
            set_result_fields(&mut out, args);
        }
        EventName::TrivialEncrypt => {
            out.cast_to_type = arg_u8(args, "toType");
            set_result_fields(&mut out, args);
        }
        EventName::VerifyInput => {
            out.input_type =
                arg_u8(args, "inputType").or_else(|| arg_handle_type(args, "inputHandle"));
            set_result_fields(&mut out, args);
        }
        EventName::FheRand | EventName::FheRandBounded => {
            out.rand_type = arg_u8(args, "randType");
            set_result_fields(&mut out, args);
        }
        _ => {}
    }
    out
}

fn set_result_fields(out: &mut DerivedFields, args: &Value) {
    if let Some(meta) = arg_str(args, "result").and_then(|raw| decode_handle(raw).ok()) {
        out.result_type = Some(meta.fhe_type);
        out.result_handle_version = Some(meta.version);
    }
}

// ==============================================================================
// Consistency Cross-Check
// ==============================================================================

/// A result type that contradicts the type the event itself declares.
/// Reported as a warning by the ingest pipeline; never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeriveInconsistency {
    pub event: EventName,
    pub expected: u8,
    pub actual: u8,
}

/// Compare the handle-derived result type against the expected type for
/// events that declare one (`Cast`/`TrivialEncrypt` → `toType`,
/// `VerifyInput` → `inputType`, `FheRand*` → `randType`).
pub fn check_consistency(name: EventName, derived: &DerivedFields) -> Option<DeriveInconsistency> {
    let expected = match name {
        EventName::Cast | EventName::TrivialEncrypt => derived.cast_to_type,
        EventName::VerifyInput => derived.input_type,
        EventName::FheRand | EventName::FheRandBounded => derived.rand_type,
        _ => None,
    }?;
    let actual = derived.result_type?;
    if expected == actual {
        return None;
    }
    Some(DeriveInconsistency {
        event: name,
        expected,
        actual,
    })
}

// ==============================================================================
// Input Role Table
// ==============================================================================

/// Where a node input comes from: a ciphertext handle or a plaintext
/// scalar operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Handle(B256),
    Scalar,
}

/// One input of an event, tagged with its argument role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInput {
    pub role: InputRole,
    pub source: InputSource,
}

impl EventInput {
    fn handle(role: InputRole, handle: B256) -> Self {
        Self {
            role,
            source: InputSource::Handle(handle),
        }
    }

    fn scalar(role: InputRole) -> Self {
        Self {
            role,
            source: InputSource::Scalar,
        }
    }
}

/// Compute an event's input list per its argument layout.
///
/// For binary ops with a set scalar byte the rhs contributes a scalar
/// input rather than a handle. `VerifyInput` and `Unknown` contribute no
/// inputs (they are skipped by the builder before reaching this table).
/// A malformed argument map is an error; the builder turns it into a
/// skip incident for that event.
pub fn event_inputs(name: EventName, args: &Value) -> Result<Vec<EventInput>, CoreError> {
    if name.is_binary_op() {
        let lhs = required_handle(args, "lhs", name)?;
        let flag = arg_scalar_flag(args).ok_or_else(|| {
            CoreError::InvalidEventData(format!("{name}: missing or bad `scalarByte`"))
        })?;
        let rhs = if flag == 1 {
            EventInput::scalar(InputRole::Rhs)
        } else {
            EventInput::handle(InputRole::Rhs, required_handle(args, "rhs", name)?)
        };
        return Ok(vec![EventInput::handle(InputRole::Lhs, lhs), rhs]);
    }
    if name.is_unary_op() {
        let ct = required_handle(args, "ct", name)?;
        return Ok(vec![EventInput::handle(InputRole::Ct, ct)]);
    }

    match name {
        EventName::FheIfThenElse => Ok(vec![
            EventInput::handle(InputRole::Control, required_handle(args, "control", name)?),
            EventInput::handle(InputRole::IfTrue, required_handle(args, "ifTrue", name)?),
            EventInput::handle(InputRole::IfFalse, required_handle(args, "ifFalse", name)?),
        ]),
        EventName::Cast => Ok(vec![
            EventInput::handle(InputRole::Ct, required_handle(args, "ct", name)?),
            EventInput::scalar(InputRole::ToType),
        ]),
        EventName::TrivialEncrypt => Ok(vec![
            EventInput::scalar(InputRole::Pt),
            EventInput::scalar(InputRole::ToType),
        ]),
        EventName::FheRand => Ok(vec![
            EventInput::scalar(InputRole::RandType),
            EventInput::scalar(InputRole::Seed),
        ]),
        EventName::FheRandBounded => Ok(vec![
            EventInput::scalar(InputRole::UpperBound),
            EventInput::scalar(InputRole::RandType),
            EventInput::scalar(InputRole::Seed),
        ]),
        _ => Ok(Vec::new()),
    }
}

/// The handle an event produces, if any. Events without a parseable
/// `result` argument produce nothing.
pub fn output_handle(args: &Value) -> Option<B256> {
    arg_str(args, "result").and_then(|raw| parse_handle(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{handle, hex_of};

    fn binary_args(lhs: B256, rhs: B256, scalar_byte: u8, result: B256) -> Value {
        serde_json::json!({
            "caller": "0x1111111111111111111111111111111111111111",
            "lhs": hex_of(lhs),
            "rhs": hex_of(rhs),
            "scalarByte": format!("0x{:02x}", scalar_byte),
            "result": hex_of(result),
        })
    }

    #[test]
    fn binary_op_with_encrypted_rhs() {
        let args = binary_args(handle(2, 1), handle(2, 2), 0x00, handle(2, 3));
        let derived = derive_fields(EventName::FheAdd, Some(&args));

        assert_eq!(derived.lhs_type, Some(2));
        assert_eq!(derived.rhs_type, Some(2));
        assert_eq!(derived.scalar_flag, Some(0));
        assert_eq!(derived.result_type, Some(2));
        assert_eq!(derived.result_handle_version, Some(1));
    }

    #[test]
    fn binary_op_with_scalar_rhs_leaves_rhs_type_unset() {
        let args = binary_args(handle(2, 1), B256::repeat_byte(0x99), 0x01, handle(2, 3));
        let derived = derive_fields(EventName::FheMul, Some(&args));

        assert_eq!(derived.lhs_type, Some(2));
        assert_eq!(derived.rhs_type, None);
        assert_eq!(derived.scalar_flag, Some(1));
        assert_eq!(derived.result_type, Some(2));
    }

    #[test]
    fn nonzero_scalar_byte_values_all_mean_scalar() {
        for byte in [0x01u8, 0x02, 0x80, 0xFF] {
            let args = binary_args(handle(2, 1), handle(2, 2), byte, handle(2, 3));
            let derived = derive_fields(EventName::FheSub, Some(&args));
            assert_eq!(derived.scalar_flag, Some(1), "byte {byte:#x}");
        }
    }

    #[test]
    fn unary_op_derives_lhs_from_ct() {
        let args = serde_json::json!({
            "ct": hex_of(handle(4, 1)),
            "result": hex_of(handle(4, 2)),
        });
        let derived = derive_fields(EventName::FheNeg, Some(&args));
        assert_eq!(derived.lhs_type, Some(4));
        assert_eq!(derived.result_type, Some(4));
    }

    #[test]
    fn if_then_else_derives_branch_types() {
        let args = serde_json::json!({
            "control": hex_of(handle(0, 1)),
            "ifTrue": hex_of(handle(5, 2)),
            "ifFalse": hex_of(handle(5, 3)),
            "result": hex_of(handle(5, 4)),
        });
        let derived = derive_fields(EventName::FheIfThenElse, Some(&args));
        assert_eq!(derived.control_type, Some(0));
        assert_eq!(derived.if_true_type, Some(5));
        assert_eq!(derived.if_false_type, Some(5));
        assert_eq!(derived.result_type, Some(5));
    }

    #[test]
    fn cast_and_trivial_encrypt_derive_cast_to_type() {
        let cast_args = serde_json::json!({
            "ct": hex_of(handle(2, 1)),
            "toType": 3,
            "result": hex_of(handle(3, 2)),
        });
        let derived = derive_fields(EventName::Cast, Some(&cast_args));
        assert_eq!(derived.lhs_type, Some(2));
        assert_eq!(derived.cast_to_type, Some(3));
        assert_eq!(derived.result_type, Some(3));

        let trivial_args = serde_json::json!({
            "pt": "0x2a",
            "toType": 3,
            "result": hex_of(handle(3, 9)),
        });
        let derived = derive_fields(EventName::TrivialEncrypt, Some(&trivial_args));
        assert_eq!(derived.cast_to_type, Some(3));
        assert_eq!(derived.lhs_type, None);
    }

    #[test]
    fn verify_input_falls_back_to_handle_type() {
        let args = serde_json::json!({
            "inputHandle": hex_of(handle(6, 1)),
            "result": hex_of(handle(6, 2)),
        });
        let derived = derive_fields(EventName::VerifyInput, Some(&args));
        assert_eq!(derived.input_type, Some(6));
    }

    #[test]
    fn unknown_or_null_args_derive_nothing() {
        assert_eq!(derive_fields(EventName::Unknown, None), DerivedFields::default());
        let args = serde_json::json!({ "lhs": hex_of(handle(2, 1)) });
        assert_eq!(
            derive_fields(EventName::Unknown, Some(&args)),
            DerivedFields::default()
        );
        assert_eq!(derive_fields(EventName::FheAdd, None), DerivedFields::default());
    }

    #[test]
    fn consistency_check_flags_mismatched_result_type() {
        let args = serde_json::json!({
            "pt": "0x01",
            "toType": 3,
            "result": hex_of(handle(4, 1)), // declares type 4, not 3
        });
        let derived = derive_fields(EventName::TrivialEncrypt, Some(&args));
        let inconsistency =
            check_consistency(EventName::TrivialEncrypt, &derived).expect("mismatch");
        assert_eq!(inconsistency.expected, 3);
        assert_eq!(inconsistency.actual, 4);

        // Binary ops declare no expected type; never flagged.
        let args = binary_args(handle(2, 1), handle(2, 2), 0x00, handle(9, 3));
        let derived = derive_fields(EventName::FheAdd, Some(&args));
        assert!(check_consistency(EventName::FheAdd, &derived).is_none());
    }

    #[test]
    fn binary_inputs_scalar_rhs() {
        let args = binary_args(handle(2, 1), handle(2, 2), 0x01, handle(2, 3));
        let inputs = event_inputs(EventName::FheMul, &args).expect("inputs");
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].role, InputRole::Lhs);
        assert!(matches!(inputs[0].source, InputSource::Handle(h) if h == handle(2, 1)));
        assert_eq!(inputs[1].role, InputRole::Rhs);
        assert_eq!(inputs[1].source, InputSource::Scalar);
    }

    #[test]
    fn rand_bounded_inputs_are_all_scalars() {
        let args = serde_json::json!({
            "upperBound": "0x64",
            "randType": 2,
            "seed": "0x00000000000000000000000000000001",
            "result": hex_of(handle(2, 1)),
        });
        let inputs = event_inputs(EventName::FheRandBounded, &args).expect("inputs");
        assert_eq!(inputs.len(), 3);
        assert!(inputs
            .iter()
            .all(|i| matches!(i.source, InputSource::Scalar)));
    }

    #[test]
    fn malformed_binary_args_are_rejected() {
        let args = serde_json::json!({ "lhs": "0x1234" });
        assert!(event_inputs(EventName::FheAdd, &args).is_err());

        let args = serde_json::json!({ "lhs": hex_of(handle(2, 1)) });
        assert!(event_inputs(EventName::FheAdd, &args).is_err(), "no scalarByte");
    }

    #[test]
    fn output_handle_requires_well_formed_result() {
        let args = serde_json::json!({ "result": hex_of(handle(2, 1)) });
        assert_eq!(output_handle(&args), Some(handle(2, 1)));

        let args = serde_json::json!({ "result": "0xbad" });
        assert_eq!(output_handle(&args), None);
        let args = serde_json::json!({});
        assert_eq!(output_handle(&args), None);
    }
}
