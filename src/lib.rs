//! A transactional, pluggable reference store for content-addressable
//! version control repositories.
//!
//! A reference is a named pointer whose value is either a direct object id
//! or a symbolic pointer to another reference by name. This crate provides
//! the name-hierarchy model, the two-backend transaction engine, and the
//! reflog encoding/iteration/expiry built on top of an embedded ordered
//! key-value store ([`backend::kv`]).
//!
//! [`dispatch::Store`] is the entry point most embedders want: it owns the
//! active primary backend and the files backend together and exposes the
//! convenience API (`update_ref`, `read_ref`, `for_each_ref`, `dwim_ref`,
//! ...). Lower layers ([`transaction::Transaction`], [`backend::kv::KvBackend`],
//! [`backend::files::FilesBackend`]) are public for embedders who need finer
//! control than the convenience layer gives.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod name;
pub mod object_db;
pub mod object_id;
pub mod reflog;
pub mod registry;
pub mod transaction;
pub mod value;

pub use dispatch::Store;
pub use error::Error;
pub use object_id::ObjectId;
pub use value::Target;
