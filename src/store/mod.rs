//! The store façade: owns the connection pool, schema configuration, the
//! commit-notification sink and the bootstrap `MainView`.

mod changeset;
mod commit;
mod resolve;
mod schema;
#[cfg(test)]
mod tests;
mod view;

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

pub use changeset::Changeset;
pub use view::{Latest, View};

use crate::backend::{CancelToken, Db, Pool};
use crate::errors::Result;
use crate::payload::{ColumnType, NoPatch, PatchPayload, Payload};
use crate::types::{ChangesetId, CommittedChangeset, ValueId, Version, ViewId};
use schema::{Columns, Tables};

/// Deployment configuration for one store instance.
///
/// `prefix` is prepended to every table, view and index name so several
/// stores can share a database. Whether patches are enabled is not part
/// of the configuration: it derives from the `Patch` type parameter.
pub struct StoreConfig {
    pub prefix: String,
    pub data_column: ColumnType,
    pub metadata_column: ColumnType,
    pub patch_column: ColumnType,
    /// Commit-notification sink. Bounded: a slow receiver back-pressures
    /// committers.
    pub committed: Option<crossbeam_channel::Sender<CommittedChangeset>>,
    pub cancel: Option<CancelToken>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            prefix: String::new(),
            data_column: ColumnType::Bytea,
            metadata_column: ColumnType::Jsonb,
            patch_column: ColumnType::Bytea,
            committed: None,
            cancel: None,
        }
    }
}

pub(crate) struct StoreInner {
    pub(crate) db: Db,
    pub(crate) tables: Tables,
    pub(crate) columns: Columns,
    pub(crate) committed: Option<crossbeam_channel::Sender<CommittedChangeset>>,
    pub(crate) main_view: ViewId,
}

/// A versioned, branching value store over a relational database.
///
/// `D`, `M` and `P` are the caller's data, metadata and patch types; use
/// [`crate::NoPatch`] for `P` to disable the patches column entirely.
/// Handles are cheap to clone and shareable across threads.
pub struct Store<D, M, P = NoPatch> {
    inner: Arc<StoreInner>,
    _payload: PhantomData<fn() -> (D, M, P)>,
}

impl<D, M, P> Clone for Store<D, M, P> {
    fn clone(&self) -> Self {
        Store {
            inner: self.inner.clone(),
            _payload: PhantomData,
        }
    }
}

impl<D: Payload, M: Payload + Default, P: PatchPayload> Store<D, M, P> {
    /// Opens (and initializes if needed) a store backed by the database at
    /// `path`.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let pool = Db::open_pool(path.as_ref())?;
        Self::with_pool(pool, config)
    }

    /// Like [`Store::open`] with a caller-built connection pool.
    ///
    /// Initialization is idempotent: on an existing schema it only
    /// verifies that the layout matches the configuration.
    pub fn with_pool(pool: Pool, config: StoreConfig) -> Result<Self> {
        let columns = Columns {
            data: config.data_column,
            metadata: config.metadata_column,
            patch: config.patch_column,
            patches_enabled: P::ENABLED,
        };
        let tables = Tables::new(&config.prefix);
        let db = Db::new(pool, config.cancel);

        let bootstrap_metadata = M::default().encode(columns.metadata)?;
        let main_view = db.write(|txn| {
            schema::create_all(txn, &tables, &columns)?;
            schema::verify_compatible(txn, &tables, &columns)?;
            schema::bootstrap_main_view(txn, &tables, &bootstrap_metadata)
        })?;
        info!(prefix = %config.prefix, "store ready");

        Ok(Store {
            inner: Arc::new(StoreInner {
                db,
                tables,
                columns,
                committed: config.committed,
                main_view,
            }),
            _payload: PhantomData,
        })
    }
}

impl<D: Payload, M: Payload, P: PatchPayload> Store<D, M, P> {
    /// Starts a new, empty changeset.
    pub fn begin(&self) -> Changeset<D, M, P> {
        Changeset::new(self.inner.clone(), ChangesetId::generate())
    }

    /// Re-attaches a handle to an existing changeset.
    pub fn changeset(&self, id: ChangesetId) -> Changeset<D, M, P> {
        Changeset::new(self.inner.clone(), id)
    }

    /// The bootstrap view every store starts with.
    pub fn main_view(&self) -> Result<View<D, M, P>> {
        View::load(self.inner.clone(), self.inner.main_view)
    }

    /// Resolves a live view by name.
    pub fn view(&self, name: &str) -> Result<View<D, M, P>> {
        View::by_name(self.inner.clone(), name)
    }

    // Convenience passthroughs over `MainView`.

    pub fn insert(&self, value: ValueId, data: &D, metadata: &M) -> Result<Version> {
        self.main_view()?.insert(value, data, metadata)
    }

    pub fn update(
        &self,
        value: ValueId,
        parent: ChangesetId,
        data: &D,
        patch: &P,
        metadata: &M,
    ) -> Result<Version> {
        self.main_view()?.update(value, parent, data, patch, metadata)
    }

    pub fn replace(
        &self,
        value: ValueId,
        parent: ChangesetId,
        data: &D,
        metadata: &M,
    ) -> Result<Version> {
        self.main_view()?.replace(value, parent, data, metadata)
    }

    pub fn merge(
        &self,
        value: ValueId,
        parents: &[ChangesetId],
        data: &D,
        patches: &[P],
        metadata: &M,
    ) -> Result<Version> {
        self.main_view()?.merge(value, parents, data, patches, metadata)
    }

    pub fn delete(&self, value: ValueId, parent: ChangesetId, metadata: &M) -> Result<Version> {
        self.main_view()?.delete(value, parent, metadata)
    }

    pub fn get_latest(&self, value: ValueId) -> Result<Latest<D, M>> {
        self.main_view()?.get_latest(value)
    }

    pub fn get(&self, value: ValueId, version: Version) -> Result<(D, M)> {
        self.main_view()?.get(value, version)
    }

    pub fn list(&self, after: Option<ValueId>) -> Result<Vec<ValueId>> {
        self.main_view()?.list(after)
    }

    pub fn changes(
        &self,
        value: ValueId,
        after: Option<ChangesetId>,
    ) -> Result<Vec<ChangesetId>> {
        self.main_view()?.changes(value, after)
    }

    pub fn commit(&self, changeset: &Changeset<D, M, P>, metadata: &M) -> Result<Vec<ChangesetId>> {
        let view = self.main_view()?;
        changeset.commit(&view, metadata)
    }

    pub fn create(&self, name: &str, metadata: &M) -> Result<View<D, M, P>> {
        self.main_view()?.create(name, metadata)
    }
}

impl<D, M, P> std::fmt::Debug for Store<D, M, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("main_view", &self.inner.main_view)
            .finish_non_exhaustive()
    }
}

impl CommittedChangeset {
    /// Re-attaches a published notification to a store, yielding a handle
    /// to the committed changeset for inspection.
    pub fn with_store<D: Payload, M: Payload, P: PatchPayload>(
        &self,
        store: &Store<D, M, P>,
    ) -> Changeset<D, M, P> {
        store.changeset(self.changeset)
    }
}
