//! The object-database contract this crate calls out to without
//! implementing: type lookup, parsing for the commit-on-branch check, and tag
//! peeling.

use crate::object_id::ObjectId;

/// The small set of object kinds the reference store needs to distinguish.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjType {
    Commit,
    Tree,
    Blob,
    Tag,
}

/// An opaque, read-only view onto a parsed object; the object database
/// chooses its own representation, this crate only needs `as_tag_target`.
pub trait Object {
    /// If this object is a tag, the id it points at.
    fn as_tag_target(&self) -> Option<ObjectId>;
}

/// External collaborator: the content-addressable object store.
pub trait ObjectDb {
    fn get_type(&self, id: ObjectId) -> Option<ObjType>;
    fn parse(&self, id: ObjectId) -> Option<Box<dyn Object>>;
    fn has(&self, id: ObjectId) -> bool;

    /// Follow a tag object to its target, recursively, stopping at the first
    /// non-tag object. Returns `Some(id)` unchanged if `id` was never a tag,
    /// and `None` only if `id` is unknown to this database.
    fn peel_tag(&self, mut id: ObjectId) -> Option<ObjectId> {
        loop {
            match self.get_type(id) {
                Some(ObjType::Tag) => {
                    let obj = self.parse(id)?;
                    id = obj.as_tag_target()?;
                }
                Some(_) => return Some(id),
                None => return None,
            }
        }
    }
}
