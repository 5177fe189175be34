//! Changesets: staging areas for atomic batches of changes.
//!
//! A changeset accumulates at most one change per value ID. Every staging
//! operation runs as one serializable transaction that checks the
//! changeset is still uncommitted, the value untouched, and all named
//! parents valid, then inserts the change row; the handle itself carries
//! no state besides the changeset ID.

use std::marker::PhantomData;
use std::sync::Arc;

use rusqlite::Transaction;

use super::commit;
use super::view::View;
use super::StoreInner;
use crate::errors::{Conflict, Result, StoreError};
use crate::payload::{encode_patches, ColumnValue, NoPatch, PatchPayload, Payload};
use crate::types::{Change, ChangesetId, ValueId, Version, ViewId, MAX_PAGE_LENGTH};

/// Revision assigned to a newly staged change.
const FIRST_REVISION: i64 = 1;

/// Handle to one changeset. Cheap to clone; all staged state lives in the
/// database.
pub struct Changeset<D, M, P = NoPatch> {
    inner: Arc<StoreInner>,
    id: ChangesetId,
    _payload: PhantomData<fn() -> (D, M, P)>,
}

impl<D, M, P> Clone for Changeset<D, M, P> {
    fn clone(&self) -> Self {
        Changeset {
            inner: self.inner.clone(),
            id: self.id,
            _payload: PhantomData,
        }
    }
}

impl<D, M, P> Changeset<D, M, P> {
    pub(crate) fn new(inner: Arc<StoreInner>, id: ChangesetId) -> Self {
        Changeset {
            inner,
            id,
            _payload: PhantomData,
        }
    }

    pub fn id(&self) -> ChangesetId {
        self.id
    }
}

impl<D: Payload, M: Payload, P: PatchPayload> Changeset<D, M, P> {
    /// Stages a new value.
    ///
    /// Fails `Conflict` if this changeset already touches the value.
    pub fn insert(&self, value: ValueId, data: &D, metadata: &M) -> Result<Version> {
        self.stage(value, &[], Some(data), &[], metadata)
    }

    /// Stages a new version of `value` whose parent is `parent`, recording
    /// `patch` alongside it.
    ///
    /// Fails `ParentInvalid` if `parent` does not contain the value.
    pub fn update(
        &self,
        value: ValueId,
        parent: ChangesetId,
        data: &D,
        patch: &P,
        metadata: &M,
    ) -> Result<Version> {
        self.stage(
            value,
            &[parent],
            Some(data),
            std::slice::from_ref(patch),
            metadata,
        )
    }

    /// Like [`Changeset::update`] but records no patch; the patches column
    /// is filled with the empty sentinel.
    pub fn replace(
        &self,
        value: ValueId,
        parent: ChangesetId,
        data: &D,
        metadata: &M,
    ) -> Result<Version> {
        self.stage(value, &[parent], Some(data), &[], metadata)
    }

    /// Combines several parent versions of `value` into one new version.
    ///
    /// When patches are enabled, `patches` must have one entry per parent.
    /// Fails `ParentInvalid` when the lists disagree, `parents` is empty,
    /// or any parent does not contain the value.
    pub fn merge(
        &self,
        value: ValueId,
        parents: &[ChangesetId],
        data: &D,
        patches: &[P],
        metadata: &M,
    ) -> Result<Version> {
        if parents.is_empty() || (P::ENABLED && patches.len() != parents.len()) {
            return Err(StoreError::ParentInvalid {
                value,
                parent: None,
            });
        }
        self.stage(value, parents, Some(data), patches, metadata)
    }

    /// Stages a deletion tombstone for `value`. History is retained.
    pub fn delete(&self, value: ValueId, parent: ChangesetId, metadata: &M) -> Result<Version> {
        self.stage(value, &[parent], None, &[], metadata)
    }

    fn stage(
        &self,
        value: ValueId,
        parents: &[ChangesetId],
        data: Option<&D>,
        patches: &[P],
        metadata: &M,
    ) -> Result<Version> {
        let columns = &self.inner.columns;
        let data = data.map(|d| d.encode(columns.data)).transpose()?;
        let metadata = metadata.encode(columns.metadata)?;
        let patches = if columns.patches_enabled {
            Some(encode_patches(patches, columns.patch)?)
        } else {
            None
        };
        let parents_json = serde_json::to_string(parents).expect("parents always serialize");

        let tables = &self.inner.tables;
        self.inner.db.write(|txn| {
            ensure_uncommitted(txn, &self.inner, self.id)?;

            let staged: Option<i64> = txn
                .query_row(
                    &format!(
                        "SELECT 1 FROM {} WHERE value_id = ?1 AND changeset_id = ?2 LIMIT 1",
                        tables.changes
                    ),
                    rusqlite::params![value, self.id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(super::schema::not_found_as_none)?;
            if staged.is_some() {
                return Err(Conflict::DuplicateValue {
                    changeset: self.id,
                    value,
                }
                .into());
            }

            for parent in parents {
                if !parent_contains(txn, &self.inner, *parent, value)? {
                    return Err(StoreError::ParentInvalid {
                        value,
                        parent: Some(*parent),
                    });
                }
            }

            let patches_column = if patches.is_some() { ", patches" } else { "" };
            let patches_placeholder = if patches.is_some() { ", ?7" } else { "" };
            let sql = format!(
                "INSERT INTO {} (value_id, changeset_id, revision, parents, data, metadata{patches_column})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6{patches_placeholder})",
                tables.changes,
            );
            let data_sql = match &data {
                Some(v) => v.clone().into_sql(),
                None => rusqlite::types::ToSqlOutput::Owned(rusqlite::types::Value::Null),
            };
            match &patches {
                Some(encoded) => txn.execute(
                    &sql,
                    rusqlite::params![
                        value,
                        self.id,
                        FIRST_REVISION,
                        parents_json,
                        data_sql,
                        metadata.clone().into_sql(),
                        encoded,
                    ],
                )?,
                None => txn.execute(
                    &sql,
                    rusqlite::params![
                        value,
                        self.id,
                        FIRST_REVISION,
                        parents_json,
                        data_sql,
                        metadata.clone().into_sql(),
                    ],
                )?,
            };

            debug!(changeset = %self.id, %value, "staged change");
            Ok(Version::new(self.id, FIRST_REVISION))
        })
    }

    /// Lists staged changes ordered by value ID, at most
    /// [`MAX_PAGE_LENGTH`] per call; pass the last value ID of the previous
    /// page to continue.
    pub fn changes(&self, after: Option<ValueId>) -> Result<Vec<Change<D, M, P>>> {
        let tables = &self.inner.tables;
        let columns = &self.inner.columns;
        let patches_select = if columns.patches_enabled {
            ", patches"
        } else {
            ""
        };
        self.inner.db.read(|txn| {
            let sql = format!(
                "SELECT value_id, revision, parents, data, metadata{patches_select}
                 FROM {}
                 WHERE changeset_id = ?1 AND (?2 IS NULL OR value_id > ?2)
                 ORDER BY value_id
                 LIMIT {MAX_PAGE_LENGTH}",
                tables.current_changes
            );
            let mut stmt = txn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![self.id, after])?;
            let mut changes = Vec::new();
            while let Some(row) = rows.next()? {
                changes.push(decode_change::<D, M, P>(&self.inner, self.id, row)?);
            }
            Ok(changes)
        })
    }

    /// Commits this changeset (and the uncommitted part of its ancestor
    /// closure) to `view`. See the commit engine for the full algorithm.
    pub fn commit(&self, view: &View<D, M, P>, metadata: &M) -> Result<Vec<ChangesetId>> {
        commit::commit_and_publish(&self.inner, view.view_id(), self.id, metadata)
    }

    /// Erases the staged changes.
    ///
    /// Fails `AlreadyCommitted` once the changeset is committed to any
    /// view, and `InUse` while another changeset references it as a
    /// parent.
    pub fn discard(self) -> Result<()> {
        let tables = &self.inner.tables;
        self.inner.db.write(|txn| {
            ensure_uncommitted(txn, &self.inner, self.id)?;

            let referenced_by: Option<ChangesetId> = txn
                .query_row(
                    &format!(
                        "SELECT c.changeset_id
                         FROM {} c, json_each(c.parents) p
                         WHERE p.value = ?1 AND c.changeset_id <> ?2
                         LIMIT 1",
                        tables.changes
                    ),
                    rusqlite::params![self.id.to_string(), self.id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(super::schema::not_found_as_none)?;
            if let Some(referenced_by) = referenced_by {
                return Err(StoreError::InUse {
                    changeset: self.id,
                    referenced_by,
                });
            }

            txn.execute(
                &format!("DELETE FROM {} WHERE changeset_id = ?1", tables.changes),
                [self.id],
            )?;
            debug!(changeset = %self.id, "discarded changeset");
            Ok(())
        })
    }

    /// [`Changeset::discard`], treating `AlreadyCommitted` as success.
    pub fn rollback(self) -> Result<()> {
        match self.discard() {
            Err(StoreError::AlreadyCommitted { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Fails `AlreadyCommitted` once the changeset has a committed link to any
/// view; committed changesets are immutable.
pub(crate) fn ensure_uncommitted(
    txn: &Transaction,
    inner: &StoreInner,
    changeset: ChangesetId,
) -> Result<()> {
    let committed_to: Option<ViewId> = txn
        .query_row(
            &format!(
                "SELECT view_id FROM {} WHERE changeset_id = ?1 LIMIT 1",
                inner.tables.committed_changesets
            ),
            [changeset],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(super::schema::not_found_as_none)?;
    match committed_to {
        Some(view) => Err(StoreError::AlreadyCommitted {
            changeset,
            view: Some(view),
        }),
        None => Ok(()),
    }
}

/// Whether `parent` contains a change for `value`.
pub(crate) fn parent_contains(
    txn: &Transaction,
    inner: &StoreInner,
    parent: ChangesetId,
    value: ValueId,
) -> Result<bool> {
    let found: Option<i64> = txn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE changeset_id = ?1 AND value_id = ?2 LIMIT 1",
                inner.tables.current_changes
            ),
            rusqlite::params![parent, value],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(super::schema::not_found_as_none)?;
    Ok(found.is_some())
}

/// Decodes one `current_changes` row selected as
/// `value_id, revision, parents, data, metadata[, patches]`.
pub(crate) fn decode_change<D: Payload, M: Payload, P: PatchPayload>(
    inner: &StoreInner,
    changeset_id: ChangesetId,
    row: &rusqlite::Row,
) -> Result<Change<D, M, P>> {
    let columns = &inner.columns;
    let value_id: ValueId = row.get(0)?;
    let revision: i64 = row.get(1)?;
    let parents_json: String = row.get(2)?;
    let parents: Vec<ChangesetId> =
        serde_json::from_str(&parents_json).map_err(|_| StoreError::Parse {
            what: "parent changeset list",
            input: parents_json,
        })?;

    let data = match row.get::<_, rusqlite::types::Value>(3)? {
        rusqlite::types::Value::Null => None,
        raw => Some(D::decode(
            columns.data,
            ColumnValue::from_sql(columns.data, raw)?,
        )?),
    };
    let metadata = M::decode(
        columns.metadata,
        ColumnValue::from_sql(columns.metadata, row.get(4)?)?,
    )?;
    let patches = if columns.patches_enabled {
        crate::payload::decode_patches(&row.get::<_, String>(5)?, columns.patch)?
    } else {
        Vec::new()
    };

    Ok(Change {
        value_id,
        changeset_id,
        revision,
        parents,
        data,
        metadata,
        patches,
    })
}
