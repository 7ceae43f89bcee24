//! tenantdb Core
//!
//! Core types, errors and the master catalog schema shared by every tenantdb crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod descriptor;
pub mod migrations;
pub mod validation;

pub use descriptor::ConnectionDescriptor;

/// Logical database a context is bound to.
///
/// `Master` is the shared catalog holding the tenant registry. The tenant roles
/// resolve to a physically separate database per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseRole {
    /// Shared master catalog (tenant registry)
    Master,
    /// Tenant application data
    TenantApp,
    /// Tenant identity/auth data
    TenantIdentity,
}

impl DatabaseRole {
    /// Get role as string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseRole::Master => "master",
            DatabaseRole::TenantApp => "tenant-app",
            DatabaseRole::TenantIdentity => "tenant-identity",
        }
    }

    /// Whether the role needs a resolved tenant to pick a database.
    pub fn is_tenant_scoped(&self) -> bool {
        !matches!(self, DatabaseRole::Master)
    }
}

impl fmt::Display for DatabaseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatabaseRole {
    type Err = TenancyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(DatabaseRole::Master),
            "tenant-app" | "app" => Ok(DatabaseRole::TenantApp),
            "tenant-identity" | "identity" => Ok(DatabaseRole::TenantIdentity),
            _ => Err(TenancyError::ValidationError(format!(
                "Unknown database role: {}",
                s
            ))),
        }
    }
}

/// Tenant record from the master catalog.
///
/// Only registry management operations create or mutate these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Row id in the master catalog
    pub id: i64,
    /// Stable opaque tenant identifier
    pub tenant_id: String,
    /// Display name, unique among non-deleted tenants
    pub name: String,
    /// Subdomain-like slug used for branding only, never for security
    pub routing_key: String,
    /// Connection descriptor of the tenant application database
    pub app_db: String,
    /// Connection descriptor of the tenant identity database
    pub identity_db: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Tenant {
    /// Check if the tenant may be routed to.
    pub fn is_operational(&self) -> bool {
        self.is_active && !self.is_deleted
    }

    /// Raw connection descriptor for a tenant-scoped role.
    ///
    /// Returns `None` for [`DatabaseRole::Master`], which is never stored per tenant.
    pub fn descriptor_for(&self, role: DatabaseRole) -> Option<&str> {
        match role {
            DatabaseRole::Master => None,
            DatabaseRole::TenantApp => Some(&self.app_db),
            DatabaseRole::TenantIdentity => Some(&self.identity_db),
        }
    }
}

/// Errors that can occur while routing and coordinating tenant databases
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Caller presented no usable tenant identity.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// A tenant-scoped context was requested without a resolved tenant.
    #[error("Tenant identity missing for {role} context")]
    TenantIdentityMissing { role: DatabaseRole },

    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Tenant is unknown, deactivated or deleted.
    #[error("Tenant unavailable: {0}")]
    TenantUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict detected: {0}")]
    ConflictError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unit of work disposed: {0}")]
    Disposed(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Some contexts committed before another failed to.
    ///
    /// The committed databases are not compensated; this is a real
    /// cross-database inconsistency.
    #[error("Partial commit: committed {committed:?}, failed on {failed}: {source}")]
    PartialCommit {
        committed: Vec<String>,
        failed: String,
        #[source]
        source: Box<TenancyError>,
    },

    #[error("Other error: {0}")]
    Other(String),
}

impl TenancyError {
    /// Identity errors surface as "unauthenticated" at the call boundary.
    pub fn is_identity_error(&self) -> bool {
        matches!(
            self,
            TenancyError::Unauthenticated(_)
                | TenancyError::TenantIdentityMissing { .. }
                | TenancyError::Decryption(_)
        )
    }

    /// Routing errors surface as "tenant unavailable" at the call boundary.
    pub fn is_routing_error(&self) -> bool {
        matches!(self, TenancyError::TenantUnavailable(_))
    }

    /// Map a `spawn_blocking` join failure.
    pub fn join(err: impl fmt::Display) -> Self {
        TenancyError::Other(format!("Task join error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, TenancyError>;

/// Initialize (or upgrade) the master catalog schema.
///
/// Returns the number of migrations applied.
pub fn init_master_catalog(conn: &rusqlite::Connection) -> Result<usize> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrations::run_migrations(conn)
}
