//! A versioned, branching value store built atop a relational database.
//!
//! Opaque values identified by stable [`ValueId`]s are staged into
//! [`Changeset`]s (atomic batches of edits) and committed to [`View`]s —
//! named pointers into a DAG of changesets. Views form a tree of
//! parent/child relationships, so branching histories can be maintained
//! concurrently, with explicit merge semantics and a well-defined error
//! taxonomy.

#[macro_use]
extern crate tracing;

mod backend;
pub mod errors;
mod payload;
mod store;
mod types;

pub use backend::{CancelToken, Pool};
pub use errors::{Conflict, ErrorKind, Result, StoreError};
pub use payload::{ColumnType, ColumnValue, NoPatch, PatchPayload, Payload};
pub use store::{Changeset, Latest, Store, StoreConfig, View};
pub use types::{
    Change, ChangesetId, CommittedChangeset, ValueId, Version, ViewId, MAX_PAGE_LENGTH,
};
