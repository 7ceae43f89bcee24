//! tenantdb Storage
//!
//! Everything between a caller's credential and an open SQLite connection:
//! the master-catalog tenant registry, the short-TTL metadata cache in front
//! of it, tenant identity resolution, and the per-role connection factories.
//!
//! # Safety
//!
//! **Never hold a `rusqlite::Connection` lock across `.await` points.** All
//! SQLite work runs inside `tokio::task::spawn_blocking` through
//! [`DatabaseHandle::with_connection`].

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::sync::Arc;
use tenantdb_core::{ConnectionDescriptor, DatabaseRole, Result, TenancyError};
use tracing::debug;

pub mod cache;
pub mod crypto;
pub mod factory;
pub mod identity;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod registry;
pub mod tenant;

pub use cache::{Clock, ManualClock, SystemClock, TenantMetadata, TenantMetadataCache};
pub use crypto::{AesGcmEncryption, EncryptionService, TenantClaimIssuer};
pub use factory::{ContextFactory, MasterContextFactory, TenantContextFactory};
pub use identity::{routing_key_from_host, IdentityContext, Principal, TenantIdentityResolver};
pub use registry::{
    AuditContext, AuditLogEntry, CreateTenantRequest, RegistryObserver, SqliteTenantRegistry,
    TenantRegistry, UpdateTenantRequest,
};
pub use tenant::TenantContext;

/// Proof that the holder may open raw database handles.
///
/// Only this crate can mint one, so handles come exclusively from the
/// connection factories.
#[derive(Debug)]
pub struct HandleCapability {
    _private: (),
}

impl HandleCapability {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

enum ConnectionSlot {
    Pending,
    Open(Arc<Mutex<Connection>>),
    Closed,
}

/// A database handle bound to one connection descriptor.
///
/// Creating a handle performs no I/O. The SQLite connection is opened on the
/// first call to [`with_connection`](Self::with_connection) and lives until
/// [`close`](Self::close) or drop. Dropping an open connection rolls back any
/// transaction still open on it.
pub struct DatabaseHandle {
    role: DatabaseRole,
    tenant_id: Option<String>,
    descriptor: ConnectionDescriptor,
    slot: Mutex<ConnectionSlot>,
}

impl fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("role", &self.role)
            .field("tenant_id", &self.tenant_id)
            .field("descriptor", &self.descriptor.to_string())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl DatabaseHandle {
    pub fn new(
        _capability: &HandleCapability,
        role: DatabaseRole,
        tenant_id: Option<String>,
        descriptor: ConnectionDescriptor,
    ) -> Self {
        Self {
            role,
            tenant_id,
            descriptor,
            slot: Mutex::new(ConnectionSlot::Pending),
        }
    }

    pub fn role(&self) -> DatabaseRole {
        self.role
    }

    /// Tenant the handle was resolved for; `None` for the master catalog.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.slot.lock(), ConnectionSlot::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.slot.lock(), ConnectionSlot::Closed)
    }

    /// Run `f` against the underlying connection on the blocking pool.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection().await?;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(TenancyError::join)?
    }

    pub async fn execute_batch(&self, sql: &'static str) -> Result<()> {
        self.with_connection(move |conn| Ok(conn.execute_batch(sql)?))
            .await
    }

    /// Whether the connection is outside an explicit transaction.
    ///
    /// A handle that never connected is trivially in autocommit mode.
    pub fn is_autocommit(&self) -> bool {
        match &*self.slot.lock() {
            ConnectionSlot::Open(conn) => conn.lock().is_autocommit(),
            _ => true,
        }
    }

    /// Close the connection. Returns `true` if a live connection was dropped.
    ///
    /// Subsequent use fails with [`TenancyError::Disposed`].
    pub fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *self.slot.lock(), ConnectionSlot::Closed);
        let was_open = matches!(previous, ConnectionSlot::Open(_));
        if was_open {
            debug!(role = %self.role, tenant_id = ?self.tenant_id, "Closed database connection");
        }
        was_open
    }

    async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        match &*self.slot.lock() {
            ConnectionSlot::Open(conn) => return Ok(Arc::clone(conn)),
            ConnectionSlot::Closed => return Err(self.closed_error()),
            ConnectionSlot::Pending => {}
        }

        let descriptor = self.descriptor.clone();
        let opened = tokio::task::spawn_blocking(move || open_connection(&descriptor))
            .await
            .map_err(TenancyError::join)??;

        let mut slot = self.slot.lock();
        match &*slot {
            // Lost a race with a concurrent first use; keep the winner.
            ConnectionSlot::Open(conn) => Ok(Arc::clone(conn)),
            ConnectionSlot::Closed => Err(self.closed_error()),
            ConnectionSlot::Pending => {
                let conn = Arc::new(Mutex::new(opened));
                *slot = ConnectionSlot::Open(Arc::clone(&conn));
                debug!(
                    role = %self.role,
                    tenant_id = ?self.tenant_id,
                    descriptor = %self.descriptor,
                    "Opened database connection"
                );
                Ok(conn)
            }
        }
    }

    fn closed_error(&self) -> TenancyError {
        TenancyError::Disposed(format!("{} handle is closed", self.role))
    }
}

/// Open a SQLite connection for a descriptor.
pub(crate) fn open_connection(descriptor: &ConnectionDescriptor) -> Result<Connection> {
    let conn = if descriptor.is_in_memory() {
        Connection::open_in_memory()?
    } else if descriptor.is_read_only() {
        Connection::open_with_flags(
            descriptor.path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?
    } else {
        Connection::open(descriptor.path())?
    };
    conn.busy_timeout(descriptor.busy_timeout())?;
    Ok(conn)
}
