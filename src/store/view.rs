//! Views: named pointers into the changeset DAG with an ancestry path.
//!
//! A view's `path` is fixed at creation (self first, then ancestors), so
//! handles cache it; liveness (whether the name has been released) is
//! re-checked inside each mutating transaction.

use std::marker::PhantomData;
use std::sync::Arc;

use rusqlite::Transaction;

use super::changeset::Changeset;
use super::commit::ensure_view_live;
use super::resolve;
use super::schema::not_found_as_none;
use super::StoreInner;
use crate::errors::{Conflict, Result, StoreError};
use crate::payload::{ColumnValue, NoPatch, PatchPayload, Payload};
use crate::types::{ChangesetId, ValueId, Version, ViewId, MAX_PAGE_LENGTH};

/// Result of [`View::get_latest`]: the resolved tip of a value.
#[derive(Clone, Debug)]
pub struct Latest<D, M> {
    pub data: D,
    pub metadata: M,
    pub version: Version,
}

/// Handle to one view. Cheap to clone.
pub struct View<D, M, P = NoPatch> {
    inner: Arc<StoreInner>,
    view_id: ViewId,
    path: Vec<ViewId>,
    _payload: PhantomData<fn() -> (D, M, P)>,
}

impl<D, M, P> Clone for View<D, M, P> {
    fn clone(&self) -> Self {
        View {
            inner: self.inner.clone(),
            view_id: self.view_id,
            path: self.path.clone(),
            _payload: PhantomData,
        }
    }
}

impl<D, M, P> std::fmt::Debug for View<D, M, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("view_id", &self.view_id)
            .field("path", &self.path)
            .finish()
    }
}

impl<D, M, P> View<D, M, P> {
    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    /// The view itself at depth 0, followed by its ancestors.
    pub fn path(&self) -> &[ViewId] {
        &self.path
    }

    fn from_parts(inner: Arc<StoreInner>, view_id: ViewId, path: Vec<ViewId>) -> Self {
        View {
            inner,
            view_id,
            path,
            _payload: PhantomData,
        }
    }

    /// Loads a live view by ID.
    pub(crate) fn load(inner: Arc<StoreInner>, view_id: ViewId) -> Result<Self> {
        let row = inner.db.read(|txn| {
            txn.query_row(
                &format!(
                    "SELECT name, path FROM {} WHERE view_id = ?1",
                    inner.tables.current_views
                ),
                [view_id],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(not_found_as_none)
        })?;
        match row {
            Some((Some(_), path)) => Ok(Self::from_parts(inner, view_id, parse_path(&path)?)),
            _ => Err(StoreError::ViewNotFound {
                name: None,
                view_id: Some(view_id),
            }),
        }
    }

    /// Loads a live view by name.
    pub(crate) fn by_name(inner: Arc<StoreInner>, name: &str) -> Result<Self> {
        let row = inner.db.read(|txn| {
            txn.query_row(
                &format!(
                    "SELECT view_id, path FROM {} WHERE name = ?1",
                    inner.tables.current_views
                ),
                [name],
                |row| Ok((row.get::<_, ViewId>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(not_found_as_none)
        })?;
        match row {
            Some((view_id, path)) => Ok(Self::from_parts(inner, view_id, parse_path(&path)?)),
            None => Err(StoreError::ViewNotFound {
                name: Some(name.to_owned()),
                view_id: None,
            }),
        }
    }

    /// Current name; `None` once the view has been released.
    pub fn name(&self) -> Result<Option<String>> {
        self.inner.db.read(|txn| {
            let row: Option<Option<String>> = txn
                .query_row(
                    &format!(
                        "SELECT name FROM {} WHERE view_id = ?1",
                        self.inner.tables.current_views
                    ),
                    [self.view_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(not_found_as_none)?;
            row.ok_or(StoreError::ViewNotFound {
                name: None,
                view_id: Some(self.view_id),
            })
        })
    }
}

impl<D: Payload, M: Payload, P: PatchPayload> View<D, M, P> {
    /// Metadata of the view's current revision.
    pub fn metadata(&self) -> Result<M> {
        let raw = self.inner.db.read(|txn| {
            let raw: rusqlite::types::Value = txn.query_row(
                &format!(
                    "SELECT metadata FROM {} WHERE view_id = ?1",
                    self.inner.tables.current_views
                ),
                [self.view_id],
                |row| row.get(0),
            )?;
            ColumnValue::from_sql(self.inner.columns.metadata, raw)
        })?;
        M::decode(self.inner.columns.metadata, raw)
    }

    /// Resolves the latest committed version of `value` visible through
    /// this view's path.
    ///
    /// A tombstone tip yields `ValueDeleted`, which still carries the last
    /// known version and its encoded metadata.
    pub fn get_latest(&self, value: ValueId) -> Result<Latest<D, M>> {
        let columns = self.inner.columns;
        self.inner.db.read(|txn| {
            let (owning, changes) = resolve::owning_view(txn, &self.inner, &self.path, value)?
                .ok_or(StoreError::ValueNotFound { value })?;
            let tip = resolve::tip(&changes, owning, value)?;
            match &tip.data {
                None => Err(StoreError::ValueDeleted {
                    value,
                    version: tip.version(),
                    metadata: tip.metadata.clone(),
                }),
                Some(raw) => Ok(Latest {
                    data: D::decode(columns.data, raw.clone())?,
                    metadata: M::decode(columns.metadata, tip.metadata.clone())?,
                    version: tip.version(),
                }),
            }
        })
    }

    /// Resolves a specific version of `value`.
    ///
    /// The version must be reachable through the owning view;
    /// `ValueNotFound` otherwise, `ValueDeleted` for tombstones.
    pub fn get(&self, value: ValueId, version: Version) -> Result<(D, M)> {
        let columns = self.inner.columns;
        self.inner.db.read(|txn| {
            let (_, changes) = resolve::owning_view(txn, &self.inner, &self.path, value)?
                .ok_or(StoreError::ValueNotFound { value })?;
            let change = changes
                .iter()
                .find(|change| {
                    change.changeset == version.changeset && change.revision == version.revision
                })
                .ok_or(StoreError::ValueNotFound { value })?;
            match &change.data {
                None => Err(StoreError::ValueDeleted {
                    value,
                    version: change.version(),
                    metadata: change.metadata.clone(),
                }),
                Some(raw) => Ok((
                    D::decode(columns.data, raw.clone())?,
                    M::decode(columns.metadata, change.metadata.clone())?,
                )),
            }
        })
    }

    /// Value IDs with any commit in the view path, ordered by ID, at most
    /// [`MAX_PAGE_LENGTH`] per call.
    pub fn list(&self, after: Option<ValueId>) -> Result<Vec<ValueId>> {
        self.inner
            .db
            .read(|txn| resolve::list_values(txn, &self.inner, &self.path, after))
    }

    /// The changesets touching `value`, newest first: ordered by traversal
    /// depth from the owning view's tip, then by changeset ID. Pass the
    /// last changeset of the previous page to continue after it.
    pub fn changes(
        &self,
        value: ValueId,
        after: Option<ChangesetId>,
    ) -> Result<Vec<ChangesetId>> {
        self.inner.db.read(|txn| {
            let (owning, changes) = resolve::owning_view(txn, &self.inner, &self.path, value)?
                .ok_or(StoreError::ValueNotFound { value })?;
            let tip = resolve::tip(&changes, owning, value)?;
            let order = resolve::history_order(&changes, tip.changeset);
            let start = match after {
                None => 0,
                Some(after) => {
                    order
                        .iter()
                        .position(|&changeset| changeset == after)
                        .ok_or(StoreError::ChangesetNotFound { changeset: after })?
                        + 1
                }
            };
            Ok(order
                .into_iter()
                .skip(start)
                .take(MAX_PAGE_LENGTH)
                .collect())
        })
    }

    /// Creates a child view whose path extends this view's.
    ///
    /// Fails `Conflict` if `name` is currently in use and `ViewNotFound`
    /// if this view has been released in the meantime.
    pub fn create(&self, name: &str, metadata: &M) -> Result<Self> {
        let metadata = metadata.encode(self.inner.columns.metadata)?;
        let view_id = ViewId::generate();
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.push(view_id);
        path.extend_from_slice(&self.path);
        let path_json = serde_json::to_string(&path).expect("paths always serialize");

        self.inner.db.write(|txn| {
            ensure_view_live(txn, &self.inner, self.view_id)?;
            ensure_name_free(txn, &self.inner, name)?;
            txn.execute(
                &format!(
                    "INSERT INTO {} (view_id, revision, name, path, metadata)
                     VALUES (?1, 1, ?2, ?3, ?4)",
                    self.inner.tables.views
                ),
                rusqlite::params![view_id, name, path_json, metadata.clone().into_sql()],
            )?;
            debug!(view = %view_id, name, "created view");
            Ok(())
        })?;

        Ok(Self::from_parts(self.inner.clone(), view_id, path))
    }

    /// Releases the view's name by inserting a new revision with no name.
    /// The name becomes free for reuse; history stays queryable.
    pub fn release(&self, metadata: &M) -> Result<()> {
        let metadata = metadata.encode(self.inner.columns.metadata)?;
        self.inner.db.write(|txn| {
            let row: Option<(i64, Option<String>, String)> = txn
                .query_row(
                    &format!(
                        "SELECT revision, name, path FROM {} WHERE view_id = ?1",
                        self.inner.tables.current_views
                    ),
                    [self.view_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map(Some)
                .or_else(not_found_as_none)?;
            let Some((revision, Some(_), path)) = row else {
                return Err(StoreError::ViewNotFound {
                    name: None,
                    view_id: Some(self.view_id),
                });
            };
            txn.execute(
                &format!(
                    "INSERT INTO {} (view_id, revision, name, path, metadata)
                     VALUES (?1, ?2, NULL, ?3, ?4)",
                    self.inner.tables.views
                ),
                rusqlite::params![
                    self.view_id,
                    revision + 1,
                    path,
                    metadata.clone().into_sql()
                ],
            )?;
            debug!(view = %self.view_id, "released view");
            Ok(())
        })
    }

    /// Commits `changeset` to this view; see [`Changeset::commit`].
    pub fn commit(
        &self,
        changeset: &Changeset<D, M, P>,
        metadata: &M,
    ) -> Result<Vec<ChangesetId>> {
        changeset.commit(self, metadata)
    }

    /// Metadata recorded when `changeset` was committed to this view.
    /// Fails `ChangesetNotFound` if it is not committed here.
    pub fn commit_metadata(&self, changeset: ChangesetId) -> Result<M> {
        let raw = self.inner.db.read(|txn| {
            let raw: Option<rusqlite::types::Value> = txn
                .query_row(
                    &format!(
                        "SELECT metadata FROM {} WHERE view_id = ?1 AND changeset_id = ?2",
                        self.inner.tables.committed_changesets
                    ),
                    rusqlite::params![self.view_id, changeset],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(not_found_as_none)?;
            let raw = raw.ok_or(StoreError::ChangesetNotFound { changeset })?;
            ColumnValue::from_sql(self.inner.columns.metadata, raw)
        })?;
        M::decode(self.inner.columns.metadata, raw)
    }

    /// Stages one insert in a fresh changeset and commits it to this view.
    pub fn insert(&self, value: ValueId, data: &D, metadata: &M) -> Result<Version> {
        self.one_shot(metadata, |changeset| changeset.insert(value, data, metadata))
    }

    /// Stages one update in a fresh changeset and commits it to this view.
    pub fn update(
        &self,
        value: ValueId,
        parent: ChangesetId,
        data: &D,
        patch: &P,
        metadata: &M,
    ) -> Result<Version> {
        self.one_shot(metadata, |changeset| {
            changeset.update(value, parent, data, patch, metadata)
        })
    }

    /// Stages one replace in a fresh changeset and commits it to this view.
    pub fn replace(
        &self,
        value: ValueId,
        parent: ChangesetId,
        data: &D,
        metadata: &M,
    ) -> Result<Version> {
        self.one_shot(metadata, |changeset| {
            changeset.replace(value, parent, data, metadata)
        })
    }

    /// Stages one merge in a fresh changeset and commits it to this view.
    pub fn merge(
        &self,
        value: ValueId,
        parents: &[ChangesetId],
        data: &D,
        patches: &[P],
        metadata: &M,
    ) -> Result<Version> {
        self.one_shot(metadata, |changeset| {
            changeset.merge(value, parents, data, patches, metadata)
        })
    }

    /// Stages one delete in a fresh changeset and commits it to this view.
    pub fn delete(&self, value: ValueId, parent: ChangesetId, metadata: &M) -> Result<Version> {
        self.one_shot(metadata, |changeset| {
            changeset.delete(value, parent, metadata)
        })
    }

    fn one_shot(
        &self,
        metadata: &M,
        stage: impl FnOnce(&Changeset<D, M, P>) -> Result<Version>,
    ) -> Result<Version> {
        let changeset = Changeset::new(self.inner.clone(), ChangesetId::generate());
        let result = stage(&changeset)
            .and_then(|version| changeset.commit(self, metadata).map(|_| version));
        match result {
            Ok(version) => Ok(version),
            Err(err) => {
                if let Err(rollback_err) = changeset.rollback() {
                    warn!(error = %rollback_err, "rollback after failed one-shot operation");
                }
                Err(err)
            }
        }
    }
}

fn ensure_name_free(txn: &Transaction, inner: &StoreInner, name: &str) -> Result<()> {
    let taken: Option<i64> = txn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE name = ?1",
                inner.tables.current_views
            ),
            [name],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(not_found_as_none)?;
    match taken {
        Some(_) => Err(Conflict::NameInUse {
            name: name.to_owned(),
        }
        .into()),
        None => Ok(()),
    }
}

fn parse_path(json: &str) -> Result<Vec<ViewId>> {
    serde_json::from_str(json).map_err(|_| StoreError::Parse {
        what: "view path",
        input: json.to_owned(),
    })
}
