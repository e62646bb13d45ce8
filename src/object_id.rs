//! A 20-byte object identifier, the only kind of direct reference value this
//! store understands.

use std::fmt;

/// The length in bytes of a raw object id (SHA-1).
pub const SIZE: usize = 20;

/// A raw, owned object identifier.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct ObjectId([u8; SIZE]);

impl ObjectId {
    /// The all-zero id, used as a sentinel for "no object" / ref deletion.
    pub const NULL: ObjectId = ObjectId([0u8; SIZE]);

    /// Wrap raw bytes without validation.
    pub fn from_bytes(bytes: [u8; SIZE]) -> Self {
        ObjectId(bytes)
    }

    /// Access the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIZE] {
        &self.0
    }

    /// True if this is the all-zero id.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; SIZE]
    }

    /// Parse `src` as exactly 40 ASCII hex characters.
    pub fn from_hex(src: &[u8]) -> Result<Self, Error> {
        if src.len() != SIZE * 2 {
            return Err(Error::InvalidLength(src.len()));
        }
        let mut out = [0u8; SIZE];
        hex::decode_to_slice(src, &mut out).map_err(Error::InvalidHex)?;
        Ok(ObjectId(out))
    }

    /// Render as 40 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

/// Failures that can occur while parsing an [`ObjectId`] from hex.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expected 40 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex digits")]
    InvalidHex(#[source] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::from_bytes([0x11; SIZE]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(ObjectId::from_hex(hex.as_bytes()).unwrap(), id);
    }

    #[test]
    fn null_is_all_zero() {
        assert!(ObjectId::NULL.is_null());
        assert!(!ObjectId::from_bytes([1; SIZE]).is_null());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(ObjectId::from_hex(b"abcd"), Err(Error::InvalidLength(4))));
    }
}
