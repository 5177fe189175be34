use thiserror::Error;

use crate::payload::{ColumnType, ColumnValue};
use crate::types::{ChangesetId, ValueId, Version, ViewId};

/// Errors surfaced by the store.
///
/// Every variant corresponds to one error kind of the public taxonomy and
/// carries the details needed to diagnose which invariant was violated.
/// Match on [`StoreError::kind`] when only the kind matters.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("view not found ({})", view_ref(.name, .view_id))]
    ViewNotFound {
        name: Option<String>,
        view_id: Option<ViewId>,
    },

    #[error("value {value} has no committed change visible through this view")]
    ValueNotFound { value: ValueId },

    /// The resolved version is a deletion tombstone. The last known version
    /// and its still-encoded metadata column are returned so callers can
    /// decode the metadata with their `Payload` impl.
    #[error("value {value} is deleted as of version {version}")]
    ValueDeleted {
        value: ValueId,
        version: Version,
        metadata: ColumnValue,
    },

    #[error("changeset {changeset} does not exist or has no staged changes")]
    ChangesetNotFound { changeset: ChangesetId },

    #[error("changeset {changeset} is already committed")]
    AlreadyCommitted {
        changeset: ChangesetId,
        view: Option<ViewId>,
    },

    /// A named parent changeset does not contain a change for the value,
    /// or the parent list itself is malformed (`parent == None`).
    #[error("invalid parent {parent:?} for value {value}")]
    ParentInvalid {
        value: ValueId,
        parent: Option<ChangesetId>,
    },

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("changeset {changeset} is referenced as a parent by {referenced_by}")]
    InUse {
        changeset: ChangesetId,
        referenced_by: ChangesetId,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("cannot parse {what} from {input:?}")]
    Parse { what: &'static str, input: String },

    #[error("incompatible store configuration: {detail}")]
    Config { detail: String },

    #[error("payload does not fit column type {column:?}: {detail}")]
    Codec {
        column: ColumnType,
        detail: &'static str,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// Uniqueness violations. All map to [`ErrorKind::Conflict`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    #[error("changeset {changeset} already stages a change for value {value}")]
    DuplicateValue {
        changeset: ChangesetId,
        value: ValueId,
    },

    #[error("committing would leave value {value} with two tips in view {view}")]
    DivergentTips { view: ViewId, value: ValueId },

    #[error("view name {name:?} is in use")]
    NameInUse { name: String },
}

/// Flat tag of a [`StoreError`], for matching without the details.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorKind {
    ViewNotFound,
    ValueNotFound,
    ValueDeleted,
    ChangesetNotFound,
    AlreadyCommitted,
    ParentInvalid,
    Conflict,
    InUse,
    Cancelled,
    Parse,
    Config,
    Codec,
    Database,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ViewNotFound { .. } => ErrorKind::ViewNotFound,
            StoreError::ValueNotFound { .. } => ErrorKind::ValueNotFound,
            StoreError::ValueDeleted { .. } => ErrorKind::ValueDeleted,
            StoreError::ChangesetNotFound { .. } => ErrorKind::ChangesetNotFound,
            StoreError::AlreadyCommitted { .. } => ErrorKind::AlreadyCommitted,
            StoreError::ParentInvalid { .. } => ErrorKind::ParentInvalid,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::InUse { .. } => ErrorKind::InUse,
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::Parse { .. } => ErrorKind::Parse,
            StoreError::Config { .. } => ErrorKind::Config,
            StoreError::Codec { .. } => ErrorKind::Codec,
            StoreError::Database(_) | StoreError::Pool(_) => ErrorKind::Database,
        }
    }

    /// True for [`ErrorKind::ValueNotFound`] and its `ValueDeleted` subclass.
    pub fn is_value_not_found(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ValueNotFound | ErrorKind::ValueDeleted
        )
    }
}

fn view_ref(name: &Option<String>, view_id: &Option<ViewId>) -> String {
    match (name, view_id) {
        (Some(name), _) => format!("name {name:?}"),
        (None, Some(id)) => format!("id {id}"),
        (None, None) => "unknown".to_owned(),
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
