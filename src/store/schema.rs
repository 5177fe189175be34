//! Schema and storage layout: the seven logical relations, their indexes,
//! and idempotent initialization.
//!
//! Every object name carries the configured prefix so several stores can
//! share one database. Re-running initialization against an existing
//! schema is a no-op apart from verifying that the on-disk layout matches
//! the configuration.

use std::collections::HashMap;

use rusqlite::Transaction;

use crate::errors::{Result, StoreError};
use crate::payload::{ColumnType, ColumnValue};
use crate::types::ViewId;

/// Name of the bootstrap view every store starts with.
pub(crate) const MAIN_VIEW_NAME: &str = "main";

/// Resolved names of all schema objects for one store instance.
#[derive(Clone, Debug)]
pub(crate) struct Tables {
    pub changes: String,
    pub current_changes: String,
    pub views: String,
    pub current_views: String,
    pub committed_changesets: String,
    pub current_committed_changesets: String,
    pub committed_values: String,
}

impl Tables {
    pub(crate) fn new(prefix: &str) -> Self {
        let name = |base: &str| format!("{prefix}{base}");
        Tables {
            changes: name("changes"),
            current_changes: name("current_changes"),
            views: name("views"),
            current_views: name("current_views"),
            committed_changesets: name("committed_changesets"),
            current_committed_changesets: name("current_committed_changesets"),
            committed_values: name("committed_values"),
        }
    }
}

/// Column configuration derived from `StoreConfig` and the `Patch` type.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Columns {
    pub data: ColumnType,
    pub metadata: ColumnType,
    pub patch: ColumnType,
    pub patches_enabled: bool,
}

/// Creates all schema objects that do not exist yet.
pub(crate) fn create_all(txn: &Transaction, tables: &Tables, columns: &Columns) -> Result<()> {
    let Tables {
        changes,
        current_changes,
        views,
        current_views,
        committed_changesets,
        current_committed_changesets,
        committed_values,
    } = tables;

    let data_decl = columns.data.decl();
    let metadata_decl = columns.metadata.decl();
    let patches_column = if columns.patches_enabled {
        "patches TEXT NOT NULL,"
    } else {
        ""
    };
    let patches_select = if columns.patches_enabled {
        ", ch.patches AS patches"
    } else {
        ""
    };

    let ddl = format!(
        "
        CREATE TABLE IF NOT EXISTS {changes} (
            value_id BLOB NOT NULL,
            changeset_id BLOB NOT NULL,
            revision INTEGER NOT NULL CHECK (revision >= 1),
            parents TEXT NOT NULL,
            data {data_decl},
            metadata {metadata_decl} NOT NULL,
            {patches_column}
            PRIMARY KEY (value_id, changeset_id, revision)
        );

        CREATE INDEX IF NOT EXISTS {changes}_by_changeset
            ON {changes} (changeset_id, value_id);

        CREATE VIEW IF NOT EXISTS {current_changes} AS
            SELECT c.*
            FROM {changes} c
            WHERE c.revision = (
                SELECT MAX(c2.revision) FROM {changes} c2
                WHERE c2.value_id = c.value_id AND c2.changeset_id = c.changeset_id
            );

        CREATE TABLE IF NOT EXISTS {views} (
            view_id BLOB NOT NULL,
            revision INTEGER NOT NULL CHECK (revision >= 1),
            name TEXT,
            path TEXT NOT NULL,
            metadata {metadata_decl} NOT NULL,
            PRIMARY KEY (view_id, revision)
        );

        CREATE INDEX IF NOT EXISTS {views}_by_name
            ON {views} (name) WHERE name IS NOT NULL;

        CREATE VIEW IF NOT EXISTS {current_views} AS
            SELECT v.*
            FROM {views} v
            WHERE v.revision = (
                SELECT MAX(v2.revision) FROM {views} v2
                WHERE v2.view_id = v.view_id
            );

        CREATE TABLE IF NOT EXISTS {committed_changesets} (
            view_id BLOB NOT NULL,
            changeset_id BLOB NOT NULL,
            metadata {metadata_decl} NOT NULL,
            PRIMARY KEY (view_id, changeset_id)
        );

        CREATE INDEX IF NOT EXISTS {committed_changesets}_by_changeset
            ON {committed_changesets} (changeset_id);

        CREATE VIEW IF NOT EXISTS {current_committed_changesets} AS
            SELECT cc.*
            FROM {committed_changesets} cc
            JOIN {current_views} cv ON cv.view_id = cc.view_id;

        CREATE VIEW IF NOT EXISTS {committed_values} AS
            SELECT cc.view_id AS view_id,
                   ch.value_id AS value_id,
                   ch.changeset_id AS changeset_id,
                   ch.revision AS revision,
                   ch.parents AS parents,
                   ch.data AS data,
                   ch.metadata AS metadata{patches_select}
            FROM {committed_changesets} cc
            JOIN {current_changes} ch ON ch.changeset_id = cc.changeset_id;
        "
    );
    txn.execute_batch(&ddl)?;
    Ok(())
}

/// Verifies that an existing schema matches the configuration; the check
/// covers declared column types and the presence of the patches column.
pub(crate) fn verify_compatible(
    txn: &Transaction,
    tables: &Tables,
    columns: &Columns,
) -> Result<()> {
    let changes = table_columns(txn, &tables.changes)?;

    let mismatch = |detail: String| StoreError::Config { detail };

    expect_decl(&changes, "data", columns.data, &tables.changes)?;
    expect_decl(&changes, "metadata", columns.metadata, &tables.changes)?;
    match (columns.patches_enabled, changes.contains_key("patches")) {
        (true, false) => {
            return Err(mismatch(format!(
                "{} has no patches column but patches are enabled",
                tables.changes
            )))
        }
        (false, true) => {
            return Err(mismatch(format!(
                "{} has a patches column but patches are disabled",
                tables.changes
            )))
        }
        _ => {}
    }

    let views = table_columns(txn, &tables.views)?;
    expect_decl(&views, "metadata", columns.metadata, &tables.views)?;
    let committed = table_columns(txn, &tables.committed_changesets)?;
    expect_decl(
        &committed,
        "metadata",
        columns.metadata,
        &tables.committed_changesets,
    )?;

    Ok(())
}

fn table_columns(txn: &Transaction, table: &str) -> Result<HashMap<String, String>> {
    let mut stmt = txn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut columns = HashMap::new();
    for row in rows {
        let (name, decl) = row?;
        columns.insert(name, decl);
    }
    if columns.is_empty() {
        return Err(StoreError::Config {
            detail: format!("table {table} is missing"),
        });
    }
    Ok(columns)
}

fn expect_decl(
    columns: &HashMap<String, String>,
    column: &str,
    expected: ColumnType,
    table: &str,
) -> Result<()> {
    match columns.get(column) {
        Some(decl) if decl.eq_ignore_ascii_case(expected.decl()) => Ok(()),
        Some(decl) => Err(StoreError::Config {
            detail: format!(
                "column {table}.{column} is declared {decl}, configuration wants {}",
                expected.decl()
            ),
        }),
        None => Err(StoreError::Config {
            detail: format!("column {table}.{column} is missing"),
        }),
    }
}

/// Returns the MainView's ID, inserting the bootstrap revision if this is
/// a fresh schema.
pub(crate) fn bootstrap_main_view(
    txn: &Transaction,
    tables: &Tables,
    metadata: &ColumnValue,
) -> Result<ViewId> {
    let existing: Option<ViewId> = txn
        .query_row(
            &format!(
                "SELECT view_id FROM {} WHERE name = ?1",
                tables.current_views
            ),
            [MAIN_VIEW_NAME],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(not_found_as_none)?;
    if let Some(view_id) = existing {
        return Ok(view_id);
    }

    let view_id = ViewId::generate();
    let path = serde_json::to_string(&[view_id]).expect("paths always serialize");
    txn.execute(
        &format!(
            "INSERT INTO {} (view_id, revision, name, path, metadata)
             VALUES (?1, 1, ?2, ?3, ?4)",
            tables.views
        ),
        rusqlite::params![
            view_id,
            MAIN_VIEW_NAME,
            path,
            metadata.clone().into_sql()
        ],
    )?;
    info!(%view_id, "bootstrapped main view");
    Ok(view_id)
}

/// Adapter for optional `query_row` results.
pub(crate) fn not_found_as_none<T>(err: rusqlite::Error) -> Result<Option<T>> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        err => Err(err.into()),
    }
}
