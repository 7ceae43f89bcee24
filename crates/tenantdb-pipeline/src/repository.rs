//! Entity repositories.
//!
//! Writes (`add`, `update`, `remove`) are staged on the owning unit of work
//! and reach the database on `save_changes` or `commit_transaction`. Reads go
//! straight to the database and only see flushed rows.

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row};
use std::marker::PhantomData;
use std::sync::Arc;
use tenantdb_core::Result;
use tenantdb_storage::DatabaseHandle;

/// A row type mapped onto one table.
///
/// `from_row` receives the key column followed by `COLUMNS`, in order.
pub trait Entity: Send + Sync + Sized + 'static {
    const TABLE: &'static str;
    const KEY: &'static str;
    /// Non-key columns.
    const COLUMNS: &'static [&'static str];

    fn key(&self) -> Value;

    /// Values for `COLUMNS`, same order.
    fn values(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// A write waiting for the next flush.
#[derive(Debug, Clone)]
pub(crate) struct StagedChange {
    sql: String,
    params: Vec<Value>,
}

pub(crate) type ChangeSet = Arc<Mutex<Vec<StagedChange>>>;

/// Apply staged changes on `conn`, returning rows affected.
pub(crate) fn flush(conn: &Connection, changes: &[StagedChange]) -> Result<usize> {
    let mut affected = 0;
    for change in changes {
        affected += conn.execute(&change.sql, rusqlite::params_from_iter(change.params.iter()))?;
    }
    Ok(affected)
}

fn select_list<E: Entity>() -> String {
    std::iter::once(E::KEY)
        .chain(E::COLUMNS.iter().copied())
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct Repository<E: Entity> {
    handle: Arc<DatabaseHandle>,
    staged: ChangeSet,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Repository<E> {
    pub(crate) fn new(handle: Arc<DatabaseHandle>, staged: ChangeSet) -> Self {
        Self {
            handle,
            staged,
            _entity: PhantomData,
        }
    }

    fn stage(&self, sql: String, params: Vec<Value>) {
        self.staged.lock().push(StagedChange { sql, params });
    }

    pub fn add(&self, entity: &E) {
        let columns = select_list::<E>();
        let placeholders = (1..=E::COLUMNS.len() + 1)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params = vec![entity.key()];
        params.extend(entity.values());
        self.stage(
            format!("INSERT INTO {} ({}) VALUES ({})", E::TABLE, columns, placeholders),
            params,
        );
    }

    pub fn update(&self, entity: &E) {
        let assignments = E::COLUMNS
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", column, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params = entity.values();
        params.push(entity.key());
        self.stage(
            format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                E::TABLE,
                assignments,
                E::KEY,
                E::COLUMNS.len() + 1
            ),
            params,
        );
    }

    pub fn remove(&self, entity: &E) {
        self.remove_by_key(entity.key());
    }

    pub fn remove_by_key(&self, key: impl Into<Value>) {
        self.stage(
            format!("DELETE FROM {} WHERE {} = ?1", E::TABLE, E::KEY),
            vec![key.into()],
        );
    }

    pub async fn find(&self, key: impl Into<Value>) -> Result<Option<E>> {
        let key = key.into();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            select_list::<E>(),
            E::TABLE,
            E::KEY
        );
        self.handle
            .with_connection(move |conn| {
                Ok(conn
                    .query_row(&sql, rusqlite::params![key], |row| E::from_row(row))
                    .optional()?)
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<E>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            select_list::<E>(),
            E::TABLE,
            E::KEY
        );
        self.handle
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| E::from_row(row))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", E::TABLE);
        self.handle
            .with_connection(move |conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))
            .await
    }
}
