//! Ciphertext handle metadata codec.
//!
//! A handle is a 32-byte ciphertext identifier whose last two bytes carry
//! metadata: byte 30 (counting from the left) is the FHE type discriminant
//! and byte 31 is the handle format version.

use alloy::primitives::B256;

/// Offset of the FHE type byte within a 32-byte handle.
const TYPE_BYTE: usize = 30;
/// Offset of the version byte within a 32-byte handle.
const VERSION_BYTE: usize = 31;

/// Error for values that do not have the shape of a 32-byte handle.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("not a 32-byte hex handle: {0}")]
    InvalidFormat(String),
}

/// Metadata extracted from a handle's trailing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleMeta {
    pub fhe_type: u8,
    pub version: u8,
}

/// Extract `(type, version)` from a handle. Total: every 32-byte value has
/// readable metadata bytes.
pub fn handle_meta(handle: &B256) -> HandleMeta {
    HandleMeta {
        fhe_type: handle[TYPE_BYTE],
        version: handle[VERSION_BYTE],
    }
}

/// Parse a `0x`-prefixed 66-character hex string into a handle.
///
/// Anything that is not exactly 32 well-formed hex bytes is rejected with
/// [`HandleError::InvalidFormat`]; this function never panics on bad input.
pub fn parse_handle(raw: &str) -> Result<B256, HandleError> {
    let body = raw
        .strip_prefix("0x")
        .ok_or_else(|| HandleError::InvalidFormat(raw.to_owned()))?;
    if body.len() != 64 {
        return Err(HandleError::InvalidFormat(raw.to_owned()));
    }
    let bytes = hex::decode(body).map_err(|_| HandleError::InvalidFormat(raw.to_owned()))?;
    Ok(B256::from_slice(&bytes))
}

/// Decode handle metadata straight from a hex string.
pub fn decode_handle(raw: &str) -> Result<HandleMeta, HandleError> {
    parse_handle(raw).map(|h| handle_meta(&h))
}

/// Classify an event's scalar byte: `0x00` means the rhs operand is a
/// ciphertext handle (flag 0), any other value means it is a plaintext
/// scalar (flag 1). No other bit carries meaning.
pub fn scalar_flag(byte: u8) -> u8 {
    if byte == 0 {
        0
    } else {
        1
    }
}
