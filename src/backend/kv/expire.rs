//! Reflog expiry policy types.

use bstr::BStr;

use crate::object_id::ObjectId;

bitflags::bitflags! {
    /// Flags controlling [`super::KvBackend::reflog_expire`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ExpireFlags: u32 {
        /// Report what would be pruned without mutating the store.
        const DRY_RUN = 1 << 0;
        /// Emit a line per pruned entry via the `log` facade.
        const VERBOSE = 1 << 1;
        /// Rewrite each surviving entry's `old` field to the previous
        /// surviving entry's `new`, keeping the chain internally consistent.
        const REWRITE = 1 << 2;
        /// After pruning, point the ref itself at the last kept `new`.
        const UPDATE_REF = 1 << 3;
    }
}

/// Caller-supplied policy driving which entries survive expiry.
pub trait ExpirePolicy {
    /// Called once before any entry is examined.
    fn prepare(&mut self, refname: &BStr, id: ObjectId);

    /// Return `true` if this entry should be pruned.
    fn should_prune(&mut self, old: ObjectId, new: ObjectId, email: &BStr, timestamp_secs: i64, tz_offset_minutes: i32, message: &BStr) -> bool;

    /// Called once after every entry has been examined.
    fn cleanup(&mut self);
}
