//! utils
//!
//! Small helpers shared across the workspace: node addresses, byte
//! concatenation and clock helpers.

pub mod address;
pub use address::Address;

pub mod time;

/// Concatenates byte slices in order. Used for every canonical byte encoding.
pub fn concat_bytes(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(len);
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

/// Concatenates byte slices, each preceded by its length as a big-endian
/// u64, so that distinct part lists never share an encoding.
pub fn concat_prefixed(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len() + 8).sum();
    let mut out = Vec::with_capacity(len);
    for p in parts {
        out.extend_from_slice(&(p.len() as u64).to_be_bytes());
        out.extend_from_slice(p);
    }
    out
}
