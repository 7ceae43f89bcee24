//! Database context markers.
//!
//! A context type names one logical database. `UnitOfWork<AppDb>` and
//! `UnitOfWork<IdentityDb>` are distinct types, so handlers declare and
//! resolve them by type.

use tenantdb_core::DatabaseRole;

pub trait DbContext: Send + Sync + 'static {
    const ROLE: DatabaseRole;
    /// Short name used in logs and partial-commit reports.
    const NAME: &'static str;
}

/// Shared master catalog.
#[derive(Debug, Clone, Copy)]
pub struct MasterDb;

/// Tenant application database.
#[derive(Debug, Clone, Copy)]
pub struct AppDb;

/// Tenant identity database.
#[derive(Debug, Clone, Copy)]
pub struct IdentityDb;

impl DbContext for MasterDb {
    const ROLE: DatabaseRole = DatabaseRole::Master;
    const NAME: &'static str = "MasterDb";
}

impl DbContext for AppDb {
    const ROLE: DatabaseRole = DatabaseRole::TenantApp;
    const NAME: &'static str = "AppDb";
}

impl DbContext for IdentityDb {
    const ROLE: DatabaseRole = DatabaseRole::TenantIdentity;
    const NAME: &'static str = "IdentityDb";
}
