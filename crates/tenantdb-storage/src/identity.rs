//! Tenant identity resolution.
//!
//! Resolution order for a call scope:
//!
//! 1. Tenant set explicitly on the scope by trusted internal code
//! 2. The encrypted tenant claim carried by the authenticated principal
//! 3. Nothing, in which case tenant-scoped work is rejected
//!
//! Hosts, headers and query strings never establish identity.
//! [`routing_key_from_host`] exists for branding only.

use crate::crypto::EncryptionService;
use crate::tenant::TenantContext;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tenantdb_core::{validation, Result, TenancyError};
use tracing::{debug, warn};

/// Claim carrying the encrypted tenant id.
pub const TENANT_CLAIM: &str = "tenant";

/// Authenticated caller, attached by authentication middleware.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    subject: String,
    claims: HashMap<String, String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }
}

/// Identity state of one call scope.
///
/// The principal is fixed at construction; only the explicit tenant changes.
#[derive(Debug, Default)]
pub struct IdentityContext {
    principal: Option<Principal>,
    explicit: RwLock<Option<TenantContext>>,
}

impl IdentityContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_principal(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            explicit: RwLock::new(None),
        }
    }

    /// Identity for background work acting on behalf of one tenant.
    pub fn for_tenant(tenant: TenantContext) -> Self {
        Self {
            principal: None,
            explicit: RwLock::new(Some(tenant)),
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn set_explicit(&self, tenant: TenantContext) {
        *self.explicit.write() = Some(tenant);
    }

    pub fn clear_explicit(&self) {
        *self.explicit.write() = None;
    }

    pub fn explicit_tenant(&self) -> Option<TenantContext> {
        self.explicit.read().clone()
    }
}

#[derive(Clone)]
pub struct TenantIdentityResolver {
    encryption: Arc<dyn EncryptionService>,
}

impl TenantIdentityResolver {
    pub fn new(encryption: Arc<dyn EncryptionService>) -> Self {
        Self { encryption }
    }

    /// Resolve the calling tenant, or `None` if no trusted source names one.
    pub fn resolve(&self, identity: &IdentityContext) -> Option<TenantContext> {
        if let Some(tenant) = identity.explicit_tenant() {
            return Some(tenant);
        }

        let principal = identity.principal()?;
        let Some(sealed) = principal.claim(TENANT_CLAIM) else {
            debug!(subject = %principal.subject(), "Principal carries no tenant claim");
            return None;
        };

        let tenant_id = match self.encryption.decrypt(sealed) {
            Ok(tenant_id) => tenant_id,
            Err(e) => {
                warn!(subject = %principal.subject(), error = %e, "Failed to decrypt tenant claim");
                return None;
            }
        };

        match TenantContext::new(tenant_id) {
            Ok(tenant) => Some(tenant),
            Err(e) => {
                warn!(subject = %principal.subject(), error = %e, "Tenant claim holds an invalid tenant id");
                None
            }
        }
    }

    /// Like [`resolve`](Self::resolve) but absence is an `Unauthenticated` error.
    pub fn require(&self, identity: &IdentityContext) -> Result<TenantContext> {
        self.resolve(identity).ok_or_else(|| {
            TenancyError::Unauthenticated("no trusted tenant identity for this call".to_string())
        })
    }
}

/// Cosmetic routing key from a request host, e.g. `acme` from
/// `acme.app.example.com:8443`.
///
/// Branding only. Never use the result to pick a database.
pub fn routing_key_from_host(host: &str) -> Option<String> {
    let host = host.trim().to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or_default();
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    let candidate = labels[0];
    if candidate == "www" || validation::validate_routing_key(candidate).is_err() {
        return None;
    }
    Some(candidate.to_string())
}
