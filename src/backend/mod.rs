//! Backend polymorphism: a capability set implemented by the ordered-KV
//! backend and the files backend, selected at runtime.

pub mod files;
pub mod kv;

use bstr::BString;

use crate::object_id::ObjectId;
use crate::value::Target;

/// The fully-resolved result of following a (possibly symbolic) reference to
/// its terminal value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resolved {
    /// The name of the terminal (non-symbolic) reference.
    pub name: BString,
    /// The object it points at.
    pub id: ObjectId,
    /// How many symbolic hops were followed to get here.
    pub hop_count: u8,
}

/// A raw value plus the name it was read from, as returned by an
/// unresolved, single-hop read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawRef {
    pub name: BString,
    pub target: Target,
}
