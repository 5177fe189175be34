//! The commit engine: one serializable transaction that commits a
//! changeset together with the uncommitted part of its ancestor closure.
//!
//! Invariants enforced here:
//! - the target view exists and is live,
//! - the target changeset has staged changes,
//! - after insertion every touched value keeps exactly one tip in the
//!   view (single-version-per-view),
//! - committed links are inserted parents-before-children, so a reader
//!   never observes a child without its ancestors.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rusqlite::Transaction;

use super::resolve;
use super::schema::not_found_as_none;
use super::StoreInner;
use crate::backend::constraint_to;
use crate::errors::{Conflict, Result, StoreError};
use crate::payload::Payload;
use crate::types::{ChangesetId, CommittedChangeset, ValueId, ViewId};

/// Commits `changeset` to `view_id` and publishes the newly committed
/// changesets to the notification sink, in commit order.
pub(crate) fn commit_and_publish<M: Payload>(
    inner: &Arc<StoreInner>,
    view_id: ViewId,
    changeset: ChangesetId,
    metadata: &M,
) -> Result<Vec<ChangesetId>> {
    let metadata = metadata.encode(inner.columns.metadata)?;

    let committed = inner.db.write(|txn| {
        commit_in_txn(txn, inner, view_id, changeset, &metadata)
    })?;

    if let Some(sink) = &inner.committed {
        for changeset in &committed {
            let notification = CommittedChangeset {
                changeset: *changeset,
                view: view_id,
            };
            // a dropped receiver cannot be delivered to; the commit itself
            // is already durable
            if sink.send(notification).is_err() {
                warn!(changeset = %changeset, "commit notification receiver is gone");
                break;
            }
        }
    }

    Ok(committed)
}

fn commit_in_txn(
    txn: &Transaction,
    inner: &StoreInner,
    view_id: ViewId,
    target: ChangesetId,
    metadata: &crate::payload::ColumnValue,
) -> Result<Vec<ChangesetId>> {
    ensure_view_live(txn, inner, view_id)?;

    let staged: Option<i64> = txn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE changeset_id = ?1 LIMIT 1",
                inner.tables.changes
            ),
            [target],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(not_found_as_none)?;
    if staged.is_none() {
        return Err(StoreError::ChangesetNotFound { changeset: target });
    }

    // an already committed target means its whole closure is committed
    // too; succeed without committing anything
    if is_committed(txn, inner, view_id, target)? {
        debug!(changeset = %target, view = %view_id, "commit is a no-op");
        return Ok(Vec::new());
    }

    // ancestor closure: transitive value-level parents without a committed
    // link to this view, discovered breadth-first from the target
    let mut parents_of: HashMap<ChangesetId, HashSet<ChangesetId>> = HashMap::new();
    let mut to_commit = vec![target];
    let mut visited = HashSet::from([target]);
    let mut queue = VecDeque::from([target]);
    while let Some(changeset) = queue.pop_front() {
        let parents = changeset_parents(txn, inner, changeset)?;
        for parent in &parents {
            if !visited.insert(*parent) {
                continue;
            }
            if is_committed(txn, inner, view_id, *parent)? {
                continue;
            }
            to_commit.push(*parent);
            queue.push_back(*parent);
        }
        parents_of.insert(changeset, parents);
    }

    enforce_single_version(txn, inner, view_id, &to_commit)?;

    let ordered = topological(&to_commit, &parents_of);
    for changeset in ordered.iter().copied() {
        let inserted = txn.execute(
            &format!(
                "INSERT INTO {} (view_id, changeset_id, metadata) VALUES (?1, ?2, ?3)",
                inner.tables.committed_changesets
            ),
            rusqlite::params![view_id, changeset, metadata.clone().into_sql()],
        );
        constraint_to(inserted, || StoreError::AlreadyCommitted {
            changeset,
            view: Some(view_id),
        })?;
        debug!(changeset = %changeset, view = %view_id, "committed changeset");
    }

    Ok(ordered)
}

/// Fails `ViewNotFound` unless the view's current revision is live (has a
/// name).
pub(crate) fn ensure_view_live(
    txn: &Transaction,
    inner: &StoreInner,
    view_id: ViewId,
) -> Result<()> {
    let name: Option<Option<String>> = txn
        .query_row(
            &format!(
                "SELECT name FROM {} WHERE view_id = ?1",
                inner.tables.current_views
            ),
            [view_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(not_found_as_none)?;
    match name {
        Some(Some(_)) => Ok(()),
        _ => Err(StoreError::ViewNotFound {
            name: None,
            view_id: Some(view_id),
        }),
    }
}

pub(crate) fn is_committed(
    txn: &Transaction,
    inner: &StoreInner,
    view_id: ViewId,
    changeset: ChangesetId,
) -> Result<bool> {
    let found: Option<i64> = txn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE view_id = ?1 AND changeset_id = ?2",
                inner.tables.committed_changesets
            ),
            rusqlite::params![view_id, changeset],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(not_found_as_none)?;
    Ok(found.is_some())
}

/// Distinct parent changesets across all of a changeset's current changes.
fn changeset_parents(
    txn: &Transaction,
    inner: &StoreInner,
    changeset: ChangesetId,
) -> Result<HashSet<ChangesetId>> {
    let sql = format!(
        "SELECT parents FROM {} WHERE changeset_id = ?1",
        inner.tables.current_changes
    );
    let mut stmt = txn.prepare(&sql)?;
    let mut rows = stmt.query([changeset])?;
    let mut parents = HashSet::new();
    while let Some(row) = rows.next()? {
        let parents_json: String = row.get(0)?;
        let row_parents: Vec<ChangesetId> =
            serde_json::from_str(&parents_json).map_err(|_| StoreError::Parse {
                what: "parent changeset list",
                input: parents_json,
            })?;
        parents.extend(row_parents);
    }
    Ok(parents)
}

/// For each value touched by `to_commit`, checks that inserting those
/// links leaves exactly one tip among the view's committed changes for
/// that value.
fn enforce_single_version(
    txn: &Transaction,
    inner: &StoreInner,
    view_id: ViewId,
    to_commit: &[ChangesetId],
) -> Result<()> {
    // (changeset, value-level parents) per value across the incoming set
    let mut incoming: HashMap<ValueId, Vec<(ChangesetId, Vec<ChangesetId>)>> = HashMap::new();
    for changeset in to_commit {
        let sql = format!(
            "SELECT value_id, parents FROM {} WHERE changeset_id = ?1",
            inner.tables.current_changes
        );
        let mut stmt = txn.prepare(&sql)?;
        let mut rows = stmt.query([*changeset])?;
        while let Some(row) = rows.next()? {
            let value: ValueId = row.get(0)?;
            let parents_json: String = row.get(1)?;
            let parents: Vec<ChangesetId> =
                serde_json::from_str(&parents_json).map_err(|_| StoreError::Parse {
                    what: "parent changeset list",
                    input: parents_json,
                })?;
            incoming.entry(value).or_default().push((*changeset, parents));
        }
    }

    for (value, mut candidates) in incoming {
        for existing in resolve::committed_changes_for_value(txn, inner, view_id, value)? {
            candidates.push((existing.changeset, existing.parents));
        }
        let superseded: HashSet<ChangesetId> = candidates
            .iter()
            .flat_map(|(_, parents)| parents.iter().copied())
            .collect();
        let tips = candidates
            .iter()
            .filter(|(changeset, _)| !superseded.contains(changeset))
            .count();
        if tips != 1 {
            return Err(Conflict::DivergentTips {
                view: view_id,
                value,
            }
            .into());
        }
    }
    Ok(())
}

/// Orders `to_commit` parents-before-children; ties resolve by changeset
/// ID so the order is deterministic.
fn topological(
    to_commit: &[ChangesetId],
    parents_of: &HashMap<ChangesetId, HashSet<ChangesetId>>,
) -> Vec<ChangesetId> {
    let set: HashSet<ChangesetId> = to_commit.iter().copied().collect();
    let mut blocking: HashMap<ChangesetId, usize> = HashMap::new();
    let mut children: HashMap<ChangesetId, Vec<ChangesetId>> = HashMap::new();
    for changeset in to_commit {
        let in_set_parents: Vec<ChangesetId> = parents_of
            .get(changeset)
            .map(|parents| parents.iter().copied().filter(|p| set.contains(p)).collect())
            .unwrap_or_default();
        blocking.insert(*changeset, in_set_parents.len());
        for parent in in_set_parents {
            children.entry(parent).or_default().push(*changeset);
        }
    }

    // kept sorted descending so `pop` yields the smallest ready ID
    let mut ready: Vec<ChangesetId> = blocking
        .iter()
        .filter(|(_, blocked)| **blocked == 0)
        .map(|(changeset, _)| *changeset)
        .collect();
    ready.sort_unstable_by(|a, b| b.cmp(a));

    let mut order = Vec::with_capacity(to_commit.len());
    while let Some(changeset) = ready.pop() {
        order.push(changeset);
        for child in children.remove(&changeset).unwrap_or_default() {
            let blocked = blocking.get_mut(&child).expect("child is in the set");
            *blocked -= 1;
            if *blocked == 0 {
                ready.push(child);
                ready.sort_unstable_by(|a, b| b.cmp(a));
            }
        }
    }
    debug_assert_eq!(order.len(), to_commit.len(), "parent links form a DAG");
    order
}
