//! The value a reference resolves to, and the on-disk/on-KV encoding used by
//! the backends to store it.
//!
//! Grounded in `parse_ref_data`/`serialize_ref_value` style encoding from
//! `refs-be-lmdb.c`: a direct reference is stored as 40 hex characters, a
//! symbolic one as `ref: ` followed by the target name.

use bstr::{BStr, BString, ByteSlice};

use crate::object_id::ObjectId;

const SYMBOLIC_PREFIX: &[u8] = b"ref: ";

/// What a reference currently points to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// Points directly at an object.
    Direct(ObjectId),
    /// Points at another reference by name, which must be resolved in turn.
    Symbolic(BString),
}

impl Target {
    /// Encode this target the way a backend persists it.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Target::Direct(id) => id.to_hex().into_bytes(),
            Target::Symbolic(name) => {
                let mut out = Vec::with_capacity(SYMBOLIC_PREFIX.len() + name.len());
                out.extend_from_slice(SYMBOLIC_PREFIX);
                out.extend_from_slice(name);
                out
            }
        }
    }

    /// Decode a value as it was read back from a backend.
    pub fn decode(raw: &BStr) -> Result<Self, DecodeError> {
        if let Some(name) = raw.strip_prefix(SYMBOLIC_PREFIX) {
            if name.is_empty() {
                return Err(DecodeError::EmptySymbolicTarget);
            }
            return Ok(Target::Symbolic(name.as_bstr().to_owned()));
        }
        ObjectId::from_hex(raw)
            .map(Target::Direct)
            .map_err(DecodeError::BadObjectId)
    }
}

/// Failures while decoding a stored reference value.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("symbolic reference target is empty")]
    EmptySymbolicTarget,
    #[error("reference value is neither a symbolic target nor a valid object id")]
    BadObjectId(#[source] crate::object_id::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_direct() {
        let id = ObjectId::from_bytes([0xab; 20]);
        let encoded = Target::Direct(id).encode();
        assert_eq!(Target::decode(encoded.as_slice().as_bstr()).unwrap(), Target::Direct(id));
    }

    #[test]
    fn round_trips_symbolic() {
        let target = Target::Symbolic(BString::from("refs/heads/main"));
        let encoded = target.encode();
        assert_eq!(encoded.as_slice(), b"ref: refs/heads/main");
        assert_eq!(Target::decode(encoded.as_slice().as_bstr()).unwrap(), target);
    }

    #[test]
    fn rejects_empty_symbolic_target() {
        assert!(matches!(
            Target::decode(b"ref: ".as_bstr()),
            Err(DecodeError::EmptySymbolicTarget)
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Target::decode(b"not-a-hash".as_bstr()).is_err());
    }
}
