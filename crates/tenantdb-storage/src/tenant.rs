//! Validated tenant identifiers.
//!
//! A [`TenantContext`] is the only form in which a tenant id travels past the
//! identity resolver. Everything downstream keys on it: metadata cache
//! entries, descriptor templates and the `tenant_id` log field.
//!
//! # Architecture
//!
//! ```text
//! claim / explicit tenant ──► TenantContext ──► TenantMetadataCache ──► descriptor
//!                                  │
//!                              validation
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantdb_storage::TenantContext;
//!
//! let ctx = TenantContext::new("acme-corp")?;
//! assert_eq!(ctx.tenant_id(), "acme-corp");
//! ```

use std::fmt;
use tenantdb_core::{validation, Result};

/// Tenant id that passed [`validation::validate_tenant_id`].
///
/// Holding one means the id is safe to embed in descriptor templates and
/// log fields; it says nothing about whether the tenant exists or is active.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantContext {
    tenant_id: String,
}

impl TenantContext {
    /// Validate `tenant_id` and wrap it.
    ///
    /// # Arguments
    ///
    /// * `tenant_id` - Tenant identifier as stored in the master catalog
    ///
    /// # Errors
    ///
    /// Returns `TenancyError::ValidationError` if the id:
    /// - Is shorter than 3 or longer than 63 characters
    /// - Contains anything but lowercase alphanumerics, `_` and `-`
    /// - Does not start with an alphanumeric or ends with `-`
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let ctx = TenantContext::new("tenant_123")?;
    /// assert_eq!(ctx.to_string(), "tenant_123");
    ///
    /// assert!(TenantContext::new("ab").is_err());
    /// assert!(TenantContext::new("Acme").is_err());
    /// assert!(TenantContext::new("../etc").is_err());
    /// ```
    pub fn new(tenant_id: impl Into<String>) -> Result<Self> {
        let tenant_id = tenant_id.into();
        validation::validate_tenant_id(&tenant_id)?;
        Ok(Self { tenant_id })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn into_tenant_id(self) -> String {
        self.tenant_id
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tenant_id)
    }
}

impl AsRef<str> for TenantContext {
    fn as_ref(&self) -> &str {
        &self.tenant_id
    }
}

impl std::str::FromStr for TenantContext {
    type Err = tenantdb_core::TenancyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}
