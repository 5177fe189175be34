//! End-to-end tests over a real SQLite-backed store, plus a randomized
//! differential run against an in-memory mock model.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaChaRng;
use serde_json::json;
use tempfile::TempDir;

use crate::{
    CancelToken, ChangesetId, ColumnType, CommittedChangeset, Conflict, ErrorKind, NoPatch,
    Payload, Store, StoreConfig, StoreError, ValueId, View, MAX_PAGE_LENGTH,
};

type TestStore = Store<String, serde_json::Value, String>;
type TestView = View<String, serde_json::Value, String>;

fn test_config() -> StoreConfig {
    StoreConfig {
        data_column: ColumnType::Text,
        metadata_column: ColumnType::Jsonb,
        patch_column: ColumnType::Text,
        ..Default::default()
    }
}

fn open_store() -> (TempDir, TestStore) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("store.db"), test_config()).unwrap();
    (dir, store)
}

fn meta(n: u64) -> serde_json::Value {
    json!({ "rev": n })
}

#[test]
fn value_lifecycle() {
    let (_dir, store) = open_store();
    let x = ValueId::generate();

    let v1 = store.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    let latest = store.get_latest(x).unwrap();
    assert_eq!(latest.data, "A");
    assert_eq!(latest.metadata, meta(0));
    assert_eq!(latest.version, v1);

    let v2 = store
        .update(x, v1.changeset, &"B".to_owned(), &"patch-ab".to_owned(), &meta(1))
        .unwrap();
    let latest = store.get_latest(x).unwrap();
    assert_eq!((latest.data.as_str(), latest.version), ("B", v2));
    assert_eq!(latest.metadata, meta(1));
    let (data, metadata) = store.get(x, v1).unwrap();
    assert_eq!((data.as_str(), metadata), ("A", meta(0)));

    let v3 = store
        .replace(x, v2.changeset, &"C".to_owned(), &meta(2))
        .unwrap();
    let latest = store.get_latest(x).unwrap();
    assert_eq!((latest.data.as_str(), latest.version), ("C", v3));

    let v4 = store.delete(x, v3.changeset, &meta(3)).unwrap();
    match store.get_latest(x).unwrap_err() {
        StoreError::ValueDeleted {
            value,
            version,
            metadata,
        } => {
            assert_eq!(value, x);
            assert_eq!(version, v4);
            let metadata =
                serde_json::Value::decode(ColumnType::Jsonb, metadata).unwrap();
            assert_eq!(metadata, meta(3));
        }
        other => panic!("expected ValueDeleted, got {other:?}"),
    }

    assert_eq!(
        store.changes(x, None).unwrap(),
        vec![v4.changeset, v3.changeset, v2.changeset, v1.changeset]
    );
    // keyset pagination continues strictly after the cursor
    assert_eq!(
        store.changes(x, Some(v3.changeset)).unwrap(),
        vec![v2.changeset, v1.changeset]
    );
}

#[test]
fn duplicate_staging_is_a_conflict() {
    let (_dir, store) = open_store();
    let x = ValueId::generate();

    let changeset = store.begin();
    changeset.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    let err = changeset.insert(x, &"B".to_owned(), &meta(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(matches!(
        err,
        StoreError::Conflict(Conflict::DuplicateValue { value, .. }) if value == x
    ));
}

#[test]
fn update_with_foreign_parent_is_invalid() {
    let (_dir, store) = open_store();
    let x = ValueId::generate();
    let y = ValueId::generate();

    store.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    let vy = store.insert(y, &"B".to_owned(), &meta(1)).unwrap();

    let changeset = store.begin();
    let err = changeset
        .update(x, vy.changeset, &"C".to_owned(), &"p".to_owned(), &meta(2))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParentInvalid);
    assert!(matches!(
        err,
        StoreError::ParentInvalid { value, parent: Some(parent) }
            if value == x && parent == vy.changeset
    ));
}

#[test]
fn view_branching_shadowing_and_merge() {
    let (_dir, store) = open_store();
    let main = store.main_view().unwrap();
    let x = ValueId::generate();

    let v1 = main.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    let child = main.create("branch", &meta(1)).unwrap();
    assert_eq!(&child.path()[1..], main.path());

    let v2 = child
        .update(x, v1.changeset, &"B".to_owned(), &"p2".to_owned(), &meta(2))
        .unwrap();
    assert_eq!(main.get_latest(x).unwrap().data, "A");
    assert_eq!(child.get_latest(x).unwrap().data, "B");
    assert_eq!(child.get_latest(x).unwrap().version, v2);

    // main advances on its own
    let v1b = main
        .update(x, v1.changeset, &"A2".to_owned(), &"p1".to_owned(), &meta(3))
        .unwrap();

    // committing the branch changeset onto main would leave two tips
    let err = store
        .changeset(v2.changeset)
        .commit(&main, &meta(4))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // an explicit merge reconciles both lines
    let v3 = main
        .merge(
            x,
            &[v2.changeset, v1b.changeset],
            &"M".to_owned(),
            &["p2".to_owned(), "p1".to_owned()],
            &meta(5),
        )
        .unwrap();
    let latest = main.get_latest(x).unwrap();
    assert_eq!((latest.data.as_str(), latest.version), ("M", v3));

    // the child still resolves its own tip
    assert_eq!(child.get_latest(x).unwrap().data, "B");
}

#[test]
fn merge_requires_matching_patches() {
    let (_dir, store) = open_store();
    let x = ValueId::generate();
    let v1 = store.insert(x, &"A".to_owned(), &meta(0)).unwrap();

    let changeset = store.begin();
    let err = changeset
        .merge(x, &[v1.changeset], &"B".to_owned(), &[], &meta(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParentInvalid);

    let err = changeset
        .merge(x, &[], &"B".to_owned(), &[], &meta(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParentInvalid);
}

#[test]
fn transitive_commit_delivers_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let (sender, receiver) = crossbeam_channel::bounded(16);
    let mut config = test_config();
    config.committed = Some(sender);
    let store: TestStore = Store::open(dir.path().join("store.db"), config).unwrap();
    let main = store.main_view().unwrap();
    let y = ValueId::generate();

    let c1 = store.begin();
    c1.insert(y, &"one".to_owned(), &meta(0)).unwrap();
    let c2 = store.begin();
    c2.update(y, c1.id(), &"two".to_owned(), &"p".to_owned(), &meta(1))
        .unwrap();

    let committed = c2.commit(&main, &meta(2)).unwrap();
    assert_eq!(committed, vec![c1.id(), c2.id()]);
    assert_eq!(store.get_latest(y).unwrap().data, "two");

    let first = receiver.try_recv().unwrap();
    let second = receiver.try_recv().unwrap();
    assert_eq!(
        (first, second),
        (
            CommittedChangeset {
                changeset: c1.id(),
                view: main.view_id()
            },
            CommittedChangeset {
                changeset: c2.id(),
                view: main.view_id()
            },
        )
    );
    assert!(receiver.try_recv().is_err());

    // re-attaching the notification yields a readable changeset
    let changes = first.with_store(&store).changes(None).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].value_id, y);
}

#[test]
fn commit_is_a_no_op_once_fully_committed() {
    let (_dir, store) = open_store();
    let main = store.main_view().unwrap();
    let x = ValueId::generate();

    let c1 = store.begin();
    c1.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    assert_eq!(c1.commit(&main, &meta(1)).unwrap(), vec![c1.id()]);
    assert_eq!(c1.commit(&main, &meta(2)).unwrap(), vec![]);
}

#[test]
fn commit_of_empty_changeset_fails() {
    let (_dir, store) = open_store();
    let main = store.main_view().unwrap();
    let changeset = store.begin();
    let err = changeset.commit(&main, &meta(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChangesetNotFound);
}

#[test]
fn committed_changesets_are_immutable() {
    let (_dir, store) = open_store();
    let x = ValueId::generate();
    let v1 = store.insert(x, &"A".to_owned(), &meta(0)).unwrap();

    let committed = store.changeset(v1.changeset);
    let err = committed
        .insert(ValueId::generate(), &"B".to_owned(), &meta(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyCommitted);

    let err = store.changeset(v1.changeset).discard().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyCommitted);
    // rollback treats AlreadyCommitted as success
    store.changeset(v1.changeset).rollback().unwrap();
}

#[test]
fn discard_respects_parent_references() {
    let (_dir, store) = open_store();
    let y = ValueId::generate();

    let c1 = store.begin();
    c1.insert(y, &"one".to_owned(), &meta(0)).unwrap();
    let c2 = store.begin();
    c2.update(y, c1.id(), &"two".to_owned(), &"p".to_owned(), &meta(1))
        .unwrap();

    let err = store.changeset(c1.id()).discard().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);
    assert!(matches!(
        err,
        StoreError::InUse { changeset, referenced_by }
            if changeset == c1.id() && referenced_by == c2.id()
    ));

    // once the child is gone the parent can be discarded too
    c2.discard().unwrap();
    let c1_id = c1.id();
    c1.discard().unwrap();

    let main = store.main_view().unwrap();
    let err = store.changeset(c1_id).commit(&main, &meta(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChangesetNotFound);
}

#[test]
fn view_create_release_and_name_reuse() {
    let (_dir, store) = open_store();
    let main = store.main_view().unwrap();

    let branch = main.create("branch", &meta(0)).unwrap();
    assert_eq!(branch.name().unwrap().as_deref(), Some("branch"));
    assert_eq!(branch.metadata().unwrap(), meta(0));

    let err = main.create("branch", &meta(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = main.create("main", &meta(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    branch.release(&meta(2)).unwrap();
    assert_eq!(branch.name().unwrap(), None);
    let err = store.view("branch").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ViewNotFound);
    let err = branch.release(&meta(3)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ViewNotFound);

    // committing into a released view is refused
    let changeset = store.begin();
    changeset
        .insert(ValueId::generate(), &"A".to_owned(), &meta(4))
        .unwrap();
    let err = changeset.commit(&branch, &meta(5)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ViewNotFound);

    // creating children under a released view is refused too
    let err = branch.create("grandchild", &meta(6)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ViewNotFound);

    // the name is free again
    let branch2 = main.create("branch", &meta(7)).unwrap();
    assert_ne!(branch2.view_id(), branch.view_id());
}

#[test]
fn commit_metadata_is_readable() {
    let (_dir, store) = open_store();
    let main = store.main_view().unwrap();
    let x = ValueId::generate();

    let changeset = store.begin();
    changeset.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    changeset.commit(&main, &meta(41)).unwrap();

    assert_eq!(main.commit_metadata(changeset.id()).unwrap(), meta(41));
    let err = main.commit_metadata(ChangesetId::generate()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChangesetNotFound);
}

#[test]
fn get_enforces_owning_view_reachability() {
    let (_dir, store) = open_store();
    let main = store.main_view().unwrap();
    let x = ValueId::generate();

    let v1 = main.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    let child = main.create("branch", &meta(1)).unwrap();
    let v2 = child
        .update(x, v1.changeset, &"B".to_owned(), &"p".to_owned(), &meta(2))
        .unwrap();

    // the child owns x through its own commits and sees both versions
    assert_eq!(child.get(x, v2).unwrap().0, "B");
    assert_eq!(child.get(x, v1).unwrap().0, "A");
    // main never committed v2, so it is unreachable there
    let err = main.get(x, v2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueNotFound);

    let unknown = ValueId::generate();
    let err = main.get_latest(unknown).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueNotFound);
    assert!(err.is_value_not_found());
}

#[test]
fn list_paginates_at_page_boundary() {
    let (_dir, store) = open_store();
    let main = store.main_view().unwrap();

    let changeset = store.begin();
    for i in 0..6000u64 {
        changeset
            .insert(ValueId::generate(), &format!("v{i}"), &meta(i))
            .unwrap();
    }
    changeset.commit(&main, &meta(0)).unwrap();

    let staged = changeset.changes(None).unwrap();
    assert_eq!(staged.len(), MAX_PAGE_LENGTH);

    let page1 = main.list(None).unwrap();
    assert_eq!(page1.len(), MAX_PAGE_LENGTH);
    let page2 = main.list(Some(page1[MAX_PAGE_LENGTH - 1])).unwrap();
    assert_eq!(page2.len(), 1000);
    assert!(page1.last().unwrap() < page2.first().unwrap());
    let page3 = main.list(Some(page2[999])).unwrap();
    assert!(page3.is_empty());
}

#[test]
fn concurrent_writers_to_distinct_values_succeed() {
    let (_dir, store) = open_store();
    let threads: Vec<_> = (0..8u64)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                let value = ValueId::generate();
                store.insert(value, &format!("t{i}"), &meta(i)).unwrap();
                value
            })
        })
        .collect();
    let values: Vec<ValueId> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    for value in values {
        store.get_latest(value).unwrap();
    }
}

#[test]
fn concurrent_writers_to_one_value_conflict() {
    let (_dir, store) = open_store();
    let x = ValueId::generate();
    let v1 = store.insert(x, &"A".to_owned(), &meta(0)).unwrap();

    let results: Vec<_> = (0..4u64)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                store.update(
                    x,
                    v1.changeset,
                    &format!("B{i}"),
                    &"p".to_owned(),
                    &meta(i),
                )
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1, "exactly one writer may win: {results:?}");
    for err in results.into_iter().filter_map(|r| r.err()) {
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}

#[test]
fn cancellation_aborts_operations() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancelToken::new();
    let mut config = test_config();
    config.cancel = Some(token.clone());
    let store: TestStore = Store::open(dir.path().join("store.db"), config).unwrap();

    token.cancel();
    let err = store
        .insert(ValueId::generate(), &"A".to_owned(), &meta(0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[test]
fn init_is_idempotent_and_checks_compatibility() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    let store: TestStore = Store::open(&path, test_config()).unwrap();
    let x = ValueId::generate();
    store.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    let main_id = store.main_view().unwrap().view_id();

    // reopening keeps the bootstrap view and the data
    let reopened: TestStore = Store::open(&path, test_config()).unwrap();
    assert_eq!(reopened.main_view().unwrap().view_id(), main_id);
    assert_eq!(reopened.get_latest(x).unwrap().data, "A");

    // a different data column type is rejected
    let mut config = test_config();
    config.data_column = ColumnType::Bytea;
    let err = Store::<Vec<u8>, serde_json::Value, String>::open(&path, config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    // disabling patches against a patched schema is rejected
    let err =
        Store::<String, serde_json::Value, NoPatch>::open(&path, test_config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn patchless_store_trims_the_schema() {
    let dir = tempfile::tempdir().unwrap();
    let store: Store<String, serde_json::Value, NoPatch> =
        Store::open(dir.path().join("store.db"), test_config()).unwrap();
    let x = ValueId::generate();

    let v1 = store.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    let v2 = store
        .replace(x, v1.changeset, &"B".to_owned(), &meta(1))
        .unwrap();
    store.delete(x, v2.changeset, &meta(2)).unwrap();

    let changes = store.changeset(v2.changeset).changes(None).unwrap();
    assert!(changes[0].patches.is_empty());
}

#[test]
fn prefixed_stores_share_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let mut config_a = test_config();
    config_a.prefix = "a_".to_owned();
    let mut config_b = test_config();
    config_b.prefix = "b_".to_owned();

    let store_a: TestStore = Store::open(&path, config_a).unwrap();
    let store_b: TestStore = Store::open(&path, config_b).unwrap();

    let x = ValueId::generate();
    store_a.insert(x, &"A".to_owned(), &meta(0)).unwrap();
    assert_eq!(
        store_b.get_latest(x).unwrap_err().kind(),
        ErrorKind::ValueNotFound
    );
    assert!(store_b.list(None).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Randomized differential run: the real store against an in-memory model.

#[derive(Clone, Debug)]
struct ModelChange {
    parents: Vec<ChangesetId>,
    data: Option<String>,
}

/// In-memory model of the store's committed-state semantics.
#[derive(Default)]
struct ModelStore {
    changes: HashMap<ChangesetId, BTreeMap<ValueId, ModelChange>>,
    committed: HashMap<ViewKey, BTreeSet<ChangesetId>>,
    paths: HashMap<ViewKey, Vec<ViewKey>>,
}

type ViewKey = crate::ViewId;

impl ModelStore {
    fn committed_for_value(
        &self,
        view: ViewKey,
        value: ValueId,
    ) -> Vec<(ChangesetId, Vec<ChangesetId>)> {
        let Some(committed) = self.committed.get(&view) else {
            return Vec::new();
        };
        committed
            .iter()
            .filter_map(|changeset| {
                self.changes
                    .get(changeset)
                    .and_then(|changes| changes.get(&value))
                    .map(|change| (*changeset, change.parents.clone()))
            })
            .collect()
    }

    fn closure(&self, view: ViewKey, target: ChangesetId) -> Vec<ChangesetId> {
        let committed = self.committed.get(&view).cloned().unwrap_or_default();
        let mut to_commit = vec![target];
        let mut visited = HashSet::from([target]);
        let mut queue = VecDeque::from([target]);
        while let Some(changeset) = queue.pop_front() {
            let parents: BTreeSet<ChangesetId> = self.changes[&changeset]
                .values()
                .flat_map(|change| change.parents.iter().copied())
                .collect();
            for parent in parents {
                if visited.insert(parent) && !committed.contains(&parent) {
                    to_commit.push(parent);
                    queue.push_back(parent);
                }
            }
        }
        to_commit
    }

    fn single_version_ok(&self, view: ViewKey, to_commit: &[ChangesetId]) -> bool {
        let mut by_value: HashMap<ValueId, Vec<(ChangesetId, Vec<ChangesetId>)>> = HashMap::new();
        for changeset in to_commit {
            for (value, change) in &self.changes[changeset] {
                by_value
                    .entry(*value)
                    .or_default()
                    .push((*changeset, change.parents.clone()));
            }
        }
        for (value, mut candidates) in by_value {
            candidates.extend(self.committed_for_value(view, value));
            let superseded: HashSet<ChangesetId> = candidates
                .iter()
                .flat_map(|(_, parents)| parents.iter().copied())
                .collect();
            let tips = candidates
                .iter()
                .filter(|(changeset, _)| !superseded.contains(changeset))
                .count();
            if tips != 1 {
                return false;
            }
        }
        true
    }

    fn commit(&mut self, view: ViewKey, to_commit: &[ChangesetId]) {
        let committed = self.committed.entry(view).or_default();
        committed.extend(to_commit.iter().copied());
    }

    fn get_latest(
        &self,
        path: &[ViewKey],
        value: ValueId,
    ) -> Option<(ChangesetId, Option<String>)> {
        for view in path {
            let candidates = self.committed_for_value(*view, value);
            if candidates.is_empty() {
                continue;
            }
            let superseded: HashSet<ChangesetId> = candidates
                .iter()
                .flat_map(|(_, parents)| parents.iter().copied())
                .collect();
            let mut tips = candidates
                .iter()
                .filter(|(changeset, _)| !superseded.contains(changeset));
            let tip = tips.next().expect("at least one tip in a DAG").0;
            assert!(tips.next().is_none(), "invariant: single tip per view");
            let data = self.changes[&tip][&value].data.clone();
            return Some((tip, data));
        }
        None
    }

    fn list(&self, path: &[ViewKey]) -> Vec<ValueId> {
        let mut values = BTreeSet::new();
        for view in path {
            for changeset in self.committed.get(view).into_iter().flatten() {
                values.extend(self.changes[changeset].keys().copied());
            }
        }
        values.into_iter().collect()
    }
}

fn pick<'a, T>(rng: &mut ChaChaRng, items: &'a [T]) -> &'a T {
    &items[rng.next_u64() as usize % items.len()]
}

/// Checks the store's universal invariants directly against the tables:
/// single tip per (view, value), parent containment, commit closure, and
/// acyclicity of each value's parent graph.
fn check_invariants(store: &TestStore) {
    let inner = &store.inner;
    let (change_rows, committed_rows) = inner
        .db
        .read(|txn| {
            let mut stmt = txn.prepare(&format!(
                "SELECT value_id, changeset_id, parents FROM {}",
                inner.tables.current_changes
            ))?;
            let mut rows = stmt.query([])?;
            let mut change_rows: Vec<(ValueId, ChangesetId, Vec<ChangesetId>)> = Vec::new();
            while let Some(row) = rows.next()? {
                let parents: Vec<ChangesetId> =
                    serde_json::from_str(&row.get::<_, String>(2)?).unwrap();
                change_rows.push((row.get(0)?, row.get(1)?, parents));
            }

            let mut stmt = txn.prepare(&format!(
                "SELECT view_id, changeset_id FROM {}",
                inner.tables.committed_changesets
            ))?;
            let mut rows = stmt.query([])?;
            let mut committed_rows: Vec<(crate::ViewId, ChangesetId)> = Vec::new();
            while let Some(row) = rows.next()? {
                committed_rows.push((row.get(0)?, row.get(1)?));
            }
            Ok((change_rows, committed_rows))
        })
        .unwrap();

    let mut by_changeset: HashMap<ChangesetId, Vec<(ValueId, Vec<ChangesetId>)>> = HashMap::new();
    let mut by_value: HashMap<ValueId, HashMap<ChangesetId, Vec<ChangesetId>>> = HashMap::new();
    for (value, changeset, parents) in &change_rows {
        by_changeset
            .entry(*changeset)
            .or_default()
            .push((*value, parents.clone()));
        by_value
            .entry(*value)
            .or_default()
            .insert(*changeset, parents.clone());
    }

    // parent containment: every named parent contains the same value
    for (value, _, parents) in &change_rows {
        for parent in parents {
            assert!(
                by_value[value].contains_key(parent),
                "parent {parent} lacks a change for {value}"
            );
        }
    }

    // acyclicity: each value's parent graph has a topological order
    for (value, graph) in &by_value {
        let mut unresolved: HashMap<ChangesetId, usize> = graph
            .iter()
            .map(|(changeset, parents)| (*changeset, parents.len()))
            .collect();
        let mut resolved: HashSet<ChangesetId> = HashSet::new();
        loop {
            let next: Vec<ChangesetId> = unresolved
                .iter()
                .filter(|(changeset, _)| {
                    graph[changeset]
                        .iter()
                        .all(|parent| resolved.contains(parent))
                })
                .map(|(changeset, _)| *changeset)
                .collect();
            if next.is_empty() {
                break;
            }
            for changeset in next {
                unresolved.remove(&changeset);
                resolved.insert(changeset);
            }
        }
        assert!(unresolved.is_empty(), "cycle in parent graph of {value}");
    }

    let mut committed: HashMap<crate::ViewId, HashSet<ChangesetId>> = HashMap::new();
    for (view, changeset) in &committed_rows {
        committed.entry(*view).or_default().insert(*changeset);
    }

    for (view, changesets) in &committed {
        // commit closure: ancestors of committed changesets are committed
        for changeset in changesets {
            for (_, parents) in by_changeset.get(changeset).into_iter().flatten() {
                for parent in parents {
                    assert!(
                        changesets.contains(parent),
                        "ancestor {parent} of {changeset} missing from view {view}"
                    );
                }
            }
        }

        // single version: exactly one tip per value with commits here
        let mut values: HashMap<ValueId, Vec<(ChangesetId, &[ChangesetId])>> = HashMap::new();
        for changeset in changesets {
            for (value, parents) in by_changeset.get(changeset).into_iter().flatten() {
                values
                    .entry(*value)
                    .or_default()
                    .push((*changeset, parents.as_slice()));
            }
        }
        for (value, candidates) in values {
            let superseded: HashSet<ChangesetId> = candidates
                .iter()
                .flat_map(|(_, parents)| parents.iter().copied())
                .collect();
            let tips = candidates
                .iter()
                .filter(|(changeset, _)| !superseded.contains(changeset))
                .count();
            assert_eq!(tips, 1, "value {value} has {tips} tips in view {view}");
        }
    }
}

#[test]
fn differential_run_against_model() {
    let (_dir, store) = open_store();
    let mut rng = ChaChaRng::from_seed([7; 32]);
    let mut model = ModelStore::default();

    let main = store.main_view().unwrap();
    model
        .paths
        .insert(main.view_id(), main.path().to_vec());
    let mut views: Vec<TestView> = vec![main];

    // all changesets with at least one staged change, committed or not
    let mut changesets: Vec<ChangesetId> = Vec::new();
    let mut values: Vec<ValueId> = Vec::new();
    // changesets containing each value, as parent candidates
    let mut containing: HashMap<ValueId, Vec<ChangesetId>> = HashMap::new();

    let mut data_counter = 0u64;
    for step in 0..180u64 {
        match rng.next_u64() % 10 {
            // stage a fresh changeset with a handful of changes
            0..=3 => {
                let changeset = store.begin();
                let mut staged: BTreeMap<ValueId, ModelChange> = BTreeMap::new();
                for _ in 0..(rng.next_u64() % 4 + 1) {
                    data_counter += 1;
                    let data = format!("d{data_counter}");
                    let fresh = values.is_empty() || rng.next_u64() % 10 < 6;
                    if fresh {
                        let value = ValueId::generate();
                        changeset.insert(value, &data, &meta(step)).unwrap();
                        values.push(value);
                        containing.entry(value).or_default().push(changeset.id());
                        staged.insert(
                            value,
                            ModelChange {
                                parents: Vec::new(),
                                data: Some(data),
                            },
                        );
                    } else {
                        let value = *pick(&mut rng, &values);
                        if staged.contains_key(&value) {
                            continue;
                        }
                        let parent = *pick(&mut rng, &containing[&value]);
                        let delete = rng.next_u64() % 10 == 0;
                        let result = if delete {
                            changeset.delete(value, parent, &meta(step))
                        } else {
                            changeset.update(value, parent, &data, &"p".to_owned(), &meta(step))
                        };
                        result.unwrap();
                        containing.entry(value).or_default().push(changeset.id());
                        staged.insert(
                            value,
                            ModelChange {
                                parents: vec![parent],
                                data: (!delete).then_some(data),
                            },
                        );
                    }
                }
                if staged.is_empty() {
                    continue;
                }
                model.changes.insert(changeset.id(), staged);
                changesets.push(changeset.id());
            }
            // commit a random changeset to a random view
            4..=6 => {
                if changesets.is_empty() {
                    continue;
                }
                let target = *pick(&mut rng, &changesets);
                let view = pick(&mut rng, &views).clone();
                let already = model
                    .committed
                    .get(&view.view_id())
                    .is_some_and(|set| set.contains(&target));
                let result = store.changeset(target).commit(&view, &meta(step));
                if already {
                    assert_eq!(result.unwrap(), vec![]);
                    continue;
                }
                let to_commit = model.closure(view.view_id(), target);
                if model.single_version_ok(view.view_id(), &to_commit) {
                    let committed = result.unwrap();
                    assert_eq!(
                        committed.iter().copied().collect::<HashSet<_>>(),
                        to_commit.iter().copied().collect::<HashSet<_>>()
                    );
                    model.commit(view.view_id(), &to_commit);
                } else {
                    assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);
                }
            }
            // branch a new view off a random one
            7 => {
                let parent = pick(&mut rng, &views).clone();
                let child = parent.create(&format!("view-{step}"), &meta(step)).unwrap();
                model
                    .paths
                    .insert(child.view_id(), child.path().to_vec());
                views.push(child);
            }
            // spot-check one view against the model
            _ => {
                let view = pick(&mut rng, &views).clone();
                compare_view(&view, &model, &values);
            }
        }

        if step % 30 == 0 {
            check_invariants(&store);
        }
    }

    check_invariants(&store);
    for view in &views {
        compare_view(view, &model, &values);
    }
}

fn compare_view(view: &TestView, model: &ModelStore, values: &[ValueId]) {
    let path = &model.paths[&view.view_id()];
    assert_eq!(view.list(None).unwrap(), model.list(path));

    for value in values {
        let expected = model.get_latest(path, *value);
        let actual = view.get_latest(*value);
        match expected {
            None => {
                assert_eq!(actual.unwrap_err().kind(), ErrorKind::ValueNotFound);
            }
            Some((changeset, None)) => match actual.unwrap_err() {
                StoreError::ValueDeleted { version, .. } => {
                    assert_eq!(version.changeset, changeset);
                }
                other => panic!("expected ValueDeleted, got {other:?}"),
            },
            Some((changeset, Some(data))) => {
                let latest = actual.unwrap();
                assert_eq!(latest.version.changeset, changeset);
                assert_eq!(latest.data, data);
            }
        }
    }
}
