//! Unit of work over one lazily created database handle.
//!
//! A [`UnitOfWork`] is registered per database context in each call scope.
//! It asks its [`ContextFactory`] for a handle on first use only, so a scope
//! that never touches a database never resolves a tenant or opens a file.
//! Repositories stage writes in a change set shared with the unit; writes
//! reach the database on [`save_changes`](UnitOfWork::save_changes) or
//! commit.
//!
//! # Architecture
//!
//! ```text
//! Unopened ──► Open ──► Transacting ──► Committed ─┐
//!                 ▲          │                     │
//!                 │          └────► RolledBack ────┤
//!                 └────────────────────────────────┘
//!                         (any) ──► Disposed
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let app = scope.unit_of_work::<AppDb>()?;
//! let notes = app.repository::<Note>().await?;
//! notes.add(&Note::new(1, "hello"));
//! app.save_changes().await?;
//! ```

use crate::context::DbContext;
use crate::repository::{self, ChangeSet, Entity, Repository};
use crate::BoxFuture;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tenantdb_core::{DatabaseRole, Result, TenancyError};
use tenantdb_storage::{ContextFactory, DatabaseHandle, IdentityContext};
use tokio::sync::OnceCell;
use tracing::debug;

/// Transaction surface the coordinator drives.
pub trait TransactionalUnit: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin_transaction(&self) -> BoxFuture<'_, Result<()>>;

    fn commit_transaction(&self) -> BoxFuture<'_, Result<()>>;

    /// No-op without an open transaction.
    fn rollback_transaction(&self) -> BoxFuture<'_, Result<()>>;

    /// Release resources. Returns `false` if already disposed.
    fn dispose(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Unopened,
    Open,
    Transacting,
    Committed,
    RolledBack,
    Disposed,
}

pub struct UnitOfWork<C: DbContext> {
    factory: Arc<dyn ContextFactory>,
    identity: Arc<IdentityContext>,
    handle: OnceCell<Arc<DatabaseHandle>>,
    state: Mutex<UnitState>,
    staged: ChangeSet,
    repositories: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    _context: PhantomData<fn() -> C>,
}

impl<C: DbContext> fmt::Debug for UnitOfWork<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("context", &C::NAME)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: DbContext> UnitOfWork<C> {
    /// # Errors
    ///
    /// `Configuration` if the factory serves a different role than `C`.
    pub fn new(factory: Arc<dyn ContextFactory>, identity: Arc<IdentityContext>) -> Result<Self> {
        if factory.role() != C::ROLE {
            return Err(TenancyError::Configuration(format!(
                "{} needs a {} factory, got {}",
                C::NAME,
                C::ROLE,
                factory.role()
            )));
        }
        Ok(Self {
            factory,
            identity,
            handle: OnceCell::new(),
            state: Mutex::new(UnitState::Unopened),
            staged: ChangeSet::default(),
            repositories: Mutex::new(HashMap::new()),
            _context: PhantomData,
        })
    }

    pub fn state(&self) -> UnitState {
        *self.state.lock()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.initialized()
    }

    /// Number of staged, unflushed writes.
    pub fn pending_changes(&self) -> usize {
        self.staged.lock().len()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state() == UnitState::Disposed {
            return Err(TenancyError::Disposed(C::NAME.to_string()));
        }
        Ok(())
    }

    /// The handle, created through the factory on first use.
    pub async fn handle(&self) -> Result<Arc<DatabaseHandle>> {
        self.ensure_live()?;
        let handle = self
            .handle
            .get_or_try_init(|| async {
                let handle = self.factory.create(&self.identity).await?;
                debug!(context = C::NAME, tenant_id = ?handle.tenant_id(), "Created database handle");
                Ok::<_, TenancyError>(Arc::new(handle))
            })
            .await?;

        let mut state = self.state.lock();
        match *state {
            UnitState::Unopened => *state = UnitState::Open,
            UnitState::Disposed => return Err(TenancyError::Disposed(C::NAME.to_string())),
            _ => {}
        }
        Ok(Arc::clone(handle))
    }

    /// Repository for `E`, memoized per unit of work.
    ///
    /// Opens the handle if this is the unit's first use. Every repository of
    /// a unit shares its change set, so staged writes from all of them flush
    /// together.
    ///
    /// # Errors
    ///
    /// - `Disposed` once the unit has been disposed
    /// - Any error from the factory while creating the handle
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let users = identity.repository::<User>().await?;
    /// users.add(&User::new(7, "ada@acme.test"));
    /// assert_eq!(identity.pending_changes(), 1);
    /// assert!(Arc::ptr_eq(&users, &identity.repository::<User>().await?));
    /// ```
    pub async fn repository<E: Entity>(&self) -> Result<Arc<Repository<E>>> {
        let handle = self.handle().await?;
        let mut repositories = self.repositories.lock();
        let entry = repositories
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                Arc::new(Repository::<E>::new(handle, self.staged.clone())) as Arc<dyn Any + Send + Sync>
            });
        Arc::clone(entry)
            .downcast::<Repository<E>>()
            .map_err(|_| TenancyError::Other(format!("repository type mismatch in {}", C::NAME)))
    }

    /// Flush staged writes. Outside a transaction the flush commits on its own.
    ///
    /// The batch applies atomically. On failure nothing is written and the
    /// batch stays staged ahead of anything staged meanwhile.
    pub async fn save_changes(&self) -> Result<usize> {
        self.ensure_live()?;
        if self.pending_changes() == 0 {
            return Ok(0);
        }
        let handle = self.handle().await?;
        let changes = std::mem::take(&mut *self.staged.lock());
        if changes.is_empty() {
            return Ok(0);
        }

        let batch = changes.clone();
        let flushed = handle
            .with_connection(move |conn| {
                let savepoint = conn.savepoint()?;
                let affected = repository::flush(&savepoint, &batch)?;
                savepoint.commit()?;
                Ok(affected)
            })
            .await;

        if let Err(err) = &flushed {
            let mut staged = self.staged.lock();
            let newer = std::mem::replace(&mut *staged, changes);
            staged.extend(newer);
            debug!(context = C::NAME, error = %err, pending = staged.len(), "Flush failed; changes kept staged");
        }
        flushed
    }

    /// Open a transaction on the handle.
    ///
    /// Master units begin deferred so an idle master participant takes no
    /// lock. Tenant units take the write lock up front.
    pub async fn begin_transaction(&self) -> Result<()> {
        self.ensure_live()?;
        if self.state() == UnitState::Transacting {
            return Err(TenancyError::Other(format!(
                "{} already has a transaction in progress",
                C::NAME
            )));
        }
        let handle = self.handle().await?;
        let begin = match C::ROLE {
            DatabaseRole::Master => "BEGIN DEFERRED",
            DatabaseRole::TenantApp | DatabaseRole::TenantIdentity => "BEGIN IMMEDIATE",
        };
        handle.execute_batch(begin).await?;
        *self.state.lock() = UnitState::Transacting;
        debug!(context = C::NAME, "Began transaction");
        Ok(())
    }

    /// Flush staged writes and commit in one step on the connection.
    pub async fn commit_transaction(&self) -> Result<()> {
        self.ensure_live()?;
        if self.state() != UnitState::Transacting {
            return Err(TenancyError::Other(format!(
                "{} has no transaction to commit",
                C::NAME
            )));
        }
        let handle = self.handle().await?;
        let changes = std::mem::take(&mut *self.staged.lock());
        handle
            .with_connection(move |conn| {
                repository::flush(conn, &changes)?;
                conn.execute_batch("COMMIT")?;
                Ok(())
            })
            .await?;
        *self.state.lock() = UnitState::Committed;
        debug!(context = C::NAME, "Committed transaction");
        Ok(())
    }

    /// Discard staged writes and roll back any open transaction.
    pub async fn rollback_transaction(&self) -> Result<()> {
        self.staged.lock().clear();
        if self.state() != UnitState::Transacting {
            return Ok(());
        }
        *self.state.lock() = UnitState::RolledBack;

        let Some(handle) = self.handle.get() else {
            return Ok(());
        };
        handle
            .with_connection(|conn| {
                // SQLite may already have rolled back after certain errors.
                if !conn.is_autocommit() {
                    conn.execute_batch("ROLLBACK")?;
                }
                Ok(())
            })
            .await?;
        debug!(context = C::NAME, "Rolled back transaction");
        Ok(())
    }

    /// Release the handle exactly once.
    pub fn dispose(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == UnitState::Disposed {
                return false;
            }
            *state = UnitState::Disposed;
        }
        self.staged.lock().clear();
        self.repositories.lock().clear();
        if let Some(handle) = self.handle.get() {
            handle.close();
        }
        debug!(context = C::NAME, "Disposed unit of work");
        true
    }
}

impl<C: DbContext> TransactionalUnit for UnitOfWork<C> {
    fn name(&self) -> &'static str {
        C::NAME
    }

    fn begin_transaction(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(UnitOfWork::begin_transaction(self))
    }

    fn commit_transaction(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(UnitOfWork::commit_transaction(self))
    }

    fn rollback_transaction(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(UnitOfWork::rollback_transaction(self))
    }

    fn dispose(&self) -> bool {
        UnitOfWork::dispose(self)
    }
}

impl<C: DbContext> Drop for UnitOfWork<C> {
    fn drop(&mut self) {
        UnitOfWork::dispose(self);
    }
}
