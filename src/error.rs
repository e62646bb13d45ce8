//! Orchestration-layer error taxonomy.
//!
//! Lower-level storage failures are raised by [`crate::backend::kv::Error`]
//! (a `quick_error!` enum, kept distinct from the `thiserror` type at this
//! layer, closer to the storage engine) and wrapped into [`Error::Backend`].

use bstr::BString;

/// Errors raised by the transaction engine and the public dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("'{0}' is not a valid reference name")]
    BadName(BString),

    #[error("'{new}' intersects with existing reference '{existing}'")]
    NameConflict { new: BString, existing: BString },

    #[error("no such ref: '{0}'")]
    NotFound(BString),

    #[error("compare-and-swap failed for '{name}': expected {expected}, found {actual}")]
    UnexpectedValue {
        name: BString,
        expected: crate::object_id::ObjectId,
        actual: crate::object_id::ObjectId,
    },

    #[error("'{0}' is broken (symref chain too deep, malformed value, or missing object)")]
    Broken(BString),

    #[error("refusing to update branch '{0}' to a non-commit object")]
    NonCommitOnBranch(BString),

    #[error("multiple updates for ref {0} are not allowed")]
    DuplicateUpdate(BString),

    #[error("transaction error: {0}")]
    Generic(String),

    #[error(transparent)]
    Backend(#[from] crate::backend::kv::Error),

    #[error(
        "primary backend committed but the files partition failed: repository is now split between backends; run reconciliation before further writes"
    )]
    SplitTransactionPartial {
        #[source]
        source: Box<Error>,
    },
}
