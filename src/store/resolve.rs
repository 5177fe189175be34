//! Read-path resolution over committed changes.
//!
//! Resolution follows the owning-view rule: walking a view's path from
//! depth 0 upward, the first view holding any committed change for a value
//! owns that value; within the owning view the value's tip is the unique
//! committed change not superseded by a descendant.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use rusqlite::types::Value as SqlValue;
use rusqlite::Transaction;

use super::StoreInner;
use crate::errors::{Conflict, Result, StoreError};
use crate::payload::ColumnValue;
use crate::types::{ChangesetId, ValueId, Version, ViewId, MAX_PAGE_LENGTH};

/// One committed change for a single value in a single view, payloads
/// still in their encoded column form.
#[derive(Clone, Debug)]
pub(crate) struct CommittedChange {
    pub changeset: ChangesetId,
    pub revision: i64,
    pub parents: Vec<ChangesetId>,
    pub data: Option<ColumnValue>,
    pub metadata: ColumnValue,
}

impl CommittedChange {
    pub(crate) fn version(&self) -> Version {
        Version::new(self.changeset, self.revision)
    }
}

/// All committed changes for `value` in one view.
pub(crate) fn committed_changes_for_value(
    txn: &Transaction,
    inner: &StoreInner,
    view_id: ViewId,
    value: ValueId,
) -> Result<Vec<CommittedChange>> {
    let columns = &inner.columns;
    let sql = format!(
        "SELECT changeset_id, revision, parents, data, metadata
         FROM {}
         WHERE view_id = ?1 AND value_id = ?2",
        inner.tables.committed_values
    );
    let mut stmt = txn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params![view_id, value])?;
    let mut changes = Vec::new();
    while let Some(row) = rows.next()? {
        let parents_json: String = row.get(2)?;
        let parents = serde_json::from_str(&parents_json).map_err(|_| StoreError::Parse {
            what: "parent changeset list",
            input: parents_json,
        })?;
        let data = match row.get::<_, SqlValue>(3)? {
            SqlValue::Null => None,
            raw => Some(ColumnValue::from_sql(columns.data, raw)?),
        };
        changes.push(CommittedChange {
            changeset: row.get(0)?,
            revision: row.get(1)?,
            parents,
            data,
            metadata: ColumnValue::from_sql(columns.metadata, row.get(4)?)?,
        });
    }
    Ok(changes)
}

/// Finds the owning view of `value` under `path`: the smallest-depth view
/// with any committed change for it, together with those changes.
pub(crate) fn owning_view(
    txn: &Transaction,
    inner: &StoreInner,
    path: &[ViewId],
    value: ValueId,
) -> Result<Option<(ViewId, Vec<CommittedChange>)>> {
    for view_id in path {
        let changes = committed_changes_for_value(txn, inner, *view_id, value)?;
        if !changes.is_empty() {
            return Ok(Some((*view_id, changes)));
        }
    }
    Ok(None)
}

/// The unique change among `changes` whose changeset is not referenced as
/// a parent by any of the others. Two tips cannot occur while the
/// single-version invariant holds; observing them reports the conflict.
pub(crate) fn tip<'a>(
    changes: &'a [CommittedChange],
    view: ViewId,
    value: ValueId,
) -> Result<&'a CommittedChange> {
    let superseded: HashSet<ChangesetId> = changes
        .iter()
        .flat_map(|change| change.parents.iter().copied())
        .collect();
    let mut tips = changes
        .iter()
        .filter(|change| !superseded.contains(&change.changeset));
    match (tips.next(), tips.next()) {
        (Some(tip), None) => Ok(tip),
        _ => Err(Conflict::DivergentTips { view, value }.into()),
    }
}

/// Orders the value's committed changesets by breadth-first traversal
/// depth from `tip` (newest first), changeset ID ascending within a depth.
pub(crate) fn history_order(changes: &[CommittedChange], tip: ChangesetId) -> Vec<ChangesetId> {
    let parents: HashMap<ChangesetId, &[ChangesetId]> = changes
        .iter()
        .map(|change| (change.changeset, change.parents.as_slice()))
        .collect();

    let mut order = Vec::with_capacity(changes.len());
    let mut visited = HashSet::from([tip]);
    let mut level = vec![tip];
    while !level.is_empty() {
        level.sort();
        order.extend(level.iter().copied());
        let mut next = Vec::new();
        for changeset in level {
            let Some(changeset_parents) = parents.get(&changeset) else {
                continue;
            };
            for parent in *changeset_parents {
                // only changesets committed in the owning view take part
                if parents.contains_key(parent) && visited.insert(*parent) {
                    next.push(*parent);
                }
            }
        }
        level = next;
    }
    order
}

/// Value IDs with any commit in the view path, ordered, keyset-paginated.
pub(crate) fn list_values(
    txn: &Transaction,
    inner: &StoreInner,
    path: &[ViewId],
    after: Option<ValueId>,
) -> Result<Vec<ValueId>> {
    let placeholders = (1..=path.len()).map(|i| format!("?{i}")).join(", ");
    let after_param = path.len() + 1;
    let sql = format!(
        "SELECT DISTINCT value_id
         FROM {}
         WHERE view_id IN ({placeholders})
           AND (?{after_param} IS NULL OR value_id > ?{after_param})
         ORDER BY value_id
         LIMIT {MAX_PAGE_LENGTH}",
        inner.tables.committed_values
    );
    let params = path
        .iter()
        .map(|view_id| SqlValue::Blob(view_id.as_bytes().to_vec()))
        .chain(std::iter::once(match after {
            Some(value) => SqlValue::Blob(value.as_bytes().to_vec()),
            None => SqlValue::Null,
        }));
    let mut stmt = txn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        values.push(row.get(0)?);
    }
    Ok(values)
}
