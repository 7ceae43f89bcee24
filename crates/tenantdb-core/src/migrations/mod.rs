//! Master catalog schema migrations.
//!
//! A [`Migration`] is an ordered list of [`Step`]s. All steps of one migration
//! and its `schema_migrations` row commit in a single transaction, so a failed
//! migration leaves no trace. Applying is forward-only and guarded by a lease
//! row in `migration_lock`; a lease older than [`LOCK_LEASE_MINUTES`] is taken
//! over.
//!
//! Run migrations from a single actor (`tenantdb init`) before routers start
//! serving traffic.

use crate::{Result, TenancyError};
use rusqlite::{Connection, OptionalExtension};
use std::fmt;
use tracing::{debug, info, warn};

mod v1_0_0;
mod v1_1_0;

/// Age after which an unreleased migration lease is considered abandoned.
pub const LOCK_LEASE_MINUTES: u32 = 5;

const LOCK_HOLDER: &str = "tenantdb";

const MIGRATIONS: &[Migration] = &[v1_0_0::MIGRATION, v1_1_0::MIGRATION];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    major: u16,
    minor: u16,
    patch: u16,
}

impl SchemaVersion {
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Packed form stored in `schema_migrations.version`.
    pub fn as_i64(self) -> i64 {
        i64::from(self.major) * 1_000_000 + i64::from(self.minor) * 1_000 + i64::from(self.patch)
    }

    pub fn from_i64(packed: i64) -> Self {
        Self::new(
            (packed / 1_000_000) as u16,
            (packed / 1_000 % 1_000) as u16,
            (packed % 1_000) as u16,
        )
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One schema change inside a migration.
#[derive(Debug)]
pub enum Step {
    /// SQL batch; must be safe to re-run (`IF NOT EXISTS`).
    Sql(&'static str),
    /// `ALTER TABLE ... ADD COLUMN`, skipped when the column is already there.
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
    },
}

impl Step {
    fn apply(&self, conn: &Connection) -> Result<()> {
        match *self {
            Step::Sql(batch) => conn.execute_batch(batch)?,
            Step::AddColumn {
                table,
                column,
                decl,
            } => {
                if column_exists(conn, table, column)? {
                    debug!(table, column, "Column already present");
                } else {
                    conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl), [])?;
                    info!(table, column, decl, "Added column");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Migration {
    pub version: SchemaVersion,
    pub description: &'static str,
    pub steps: &'static [Step],
}

/// A row of `schema_migrations`.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: SchemaVersion,
    pub description: String,
    pub applied_at: String,
}

/// Every known migration, oldest first.
pub fn all_migrations() -> &'static [Migration] {
    MIGRATIONS
}

pub fn latest_version() -> SchemaVersion {
    MIGRATIONS
        .last()
        .map(|m| m.version)
        .unwrap_or(SchemaVersion::ZERO)
}

fn ensure_bookkeeping(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS migration_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT,
            leased_at TEXT
        );

        INSERT OR IGNORE INTO migration_lock (id) VALUES (1);
        "#,
    )?;
    Ok(())
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Exclusive right to migrate; released on drop.
struct LockLease<'c> {
    conn: &'c Connection,
}

impl<'c> LockLease<'c> {
    fn acquire(conn: &'c Connection) -> Result<Option<Self>> {
        let stale_before = format!("-{} minutes", LOCK_LEASE_MINUTES);
        let taken = conn.execute(
            "UPDATE migration_lock SET holder = ?1, leased_at = datetime('now')
             WHERE id = 1 AND (leased_at IS NULL OR leased_at < datetime('now', ?2))",
            rusqlite::params![LOCK_HOLDER, stale_before],
        )?;
        Ok((taken == 1).then_some(Self { conn }))
    }
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let released = self.conn.execute(
            "UPDATE migration_lock SET holder = NULL, leased_at = NULL WHERE id = 1",
            [],
        );
        if let Err(e) = released {
            warn!(error = %e, "Failed to release migration lock");
        }
    }
}

/// Highest applied version, or [`SchemaVersion::ZERO`] for a fresh catalog.
pub fn current_version(conn: &Connection) -> Result<SchemaVersion> {
    ensure_bookkeeping(conn)?;
    let packed: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
    Ok(packed.map_or(SchemaVersion::ZERO, SchemaVersion::from_i64))
}

/// Migrations not yet recorded in `schema_migrations`, oldest first.
pub fn pending(conn: &Connection) -> Result<Vec<&'static Migration>> {
    ensure_bookkeeping(conn)?;
    let mut applied = conn.prepare("SELECT 1 FROM schema_migrations WHERE version = ?1")?;
    let mut todo = Vec::new();
    for migration in MIGRATIONS {
        let done = applied
            .query_row([migration.version.as_i64()], |_| Ok(()))
            .optional()?
            .is_some();
        if !done {
            todo.push(migration);
        }
    }
    Ok(todo)
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    info!(
        version = %migration.version,
        description = migration.description,
        "Applying migration"
    );
    let tx = conn.unchecked_transaction()?;
    for step in migration.steps {
        step.apply(&tx).map_err(|e| {
            TenancyError::Other(format!("Migration {} failed: {}", migration.version, e))
        })?;
    }
    tx.execute(
        "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
        rusqlite::params![migration.version.as_i64(), migration.description],
    )?;
    tx.commit()?;
    Ok(())
}

/// Apply every pending migration and return how many ran.
///
/// Fails fast while another process holds a fresh lease.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    ensure_bookkeeping(conn)?;
    let Some(_lease) = LockLease::acquire(conn)? else {
        return Err(TenancyError::Other(
            "Another process is migrating the master catalog. Wait and retry.".to_string(),
        ));
    };

    let todo = pending(conn)?;
    for migration in &todo {
        apply(conn, migration)?;
    }
    if todo.is_empty() {
        debug!(version = %latest_version(), "Master catalog schema is current");
    }
    Ok(todo.len())
}

pub fn history(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    ensure_bookkeeping(conn)?;
    let mut stmt = conn.prepare(
        "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AppliedMigration {
                version: SchemaVersion::from_i64(row.get(0)?),
                description: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn needs_migration(conn: &Connection) -> Result<bool> {
    Ok(current_version(conn)? < latest_version())
}
