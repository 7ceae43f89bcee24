//! Connection context factories.
//!
//! One factory per [`DatabaseRole`]. A factory only resolves *where* a handle
//! points; no connection is opened until the handle is first used.
//!
//! ```text
//! IdentityContext ──► TenantIdentityResolver ──► TenantMetadataCache ──► DatabaseHandle
//!                          (tenant id)              (descriptor)          (lazy connect)
//! ```
//!
//! Factories hold the [`HandleCapability`]; nothing else can build a handle.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantdb_storage::{ContextFactory, IdentityContext, TenantContext, TenantContextFactory};
//!
//! let factory = TenantContextFactory::new(DatabaseRole::TenantApp, resolver, cache)?;
//! let identity = IdentityContext::for_tenant(TenantContext::new("acme")?);
//! let handle = factory.create(&identity).await?;
//! assert_eq!(handle.tenant_id(), Some("acme"));
//! ```

use crate::cache::TenantMetadataCache;
use crate::identity::{IdentityContext, TenantIdentityResolver};
use crate::{DatabaseHandle, HandleCapability};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tenantdb_core::{ConnectionDescriptor, DatabaseRole, Result, TenancyError};
use tracing::debug;

/// Produces fresh, caller-owned database handles for one role.
pub trait ContextFactory: Send + Sync {
    fn role(&self) -> DatabaseRole;

    /// Build a new, unconnected handle for the caller described by `identity`.
    ///
    /// Each call returns a distinct handle; the caller owns and closes it.
    /// Tenant factories resolve the tenant from `identity` and its descriptor
    /// through the metadata cache. The master factory ignores `identity`.
    ///
    /// # Arguments
    ///
    /// * `identity` - Identity of the current call scope
    ///
    /// # Errors
    ///
    /// - `TenantIdentityMissing` when `identity` yields no tenant
    /// - `TenantUnavailable` for an unknown, inactive or deleted tenant
    /// - `Configuration` when the stored descriptor does not parse
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let handle = factory.create(scope.identity()).await?;
    /// let users: i64 = handle
    ///     .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?))
    ///     .await?;
    /// ```
    fn create<'a>(
        &'a self,
        identity: &'a IdentityContext,
    ) -> Pin<Box<dyn Future<Output = Result<DatabaseHandle>> + Send + 'a>>;
}

/// Factory for the shared master catalog. Ignores tenant identity.
pub struct MasterContextFactory {
    descriptor: ConnectionDescriptor,
    capability: HandleCapability,
}

impl MasterContextFactory {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            capability: HandleCapability::new(),
        }
    }
}

impl ContextFactory for MasterContextFactory {
    fn role(&self) -> DatabaseRole {
        DatabaseRole::Master
    }

    fn create<'a>(
        &'a self,
        _identity: &'a IdentityContext,
    ) -> Pin<Box<dyn Future<Output = Result<DatabaseHandle>> + Send + 'a>> {
        Box::pin(async move {
            Ok(DatabaseHandle::new(
                &self.capability,
                DatabaseRole::Master,
                None,
                self.descriptor.clone(),
            ))
        })
    }
}

/// Factory for a tenant-scoped role (app or identity database).
pub struct TenantContextFactory {
    role: DatabaseRole,
    resolver: TenantIdentityResolver,
    cache: Arc<TenantMetadataCache>,
    capability: HandleCapability,
}

impl TenantContextFactory {
    pub fn new(
        role: DatabaseRole,
        resolver: TenantIdentityResolver,
        cache: Arc<TenantMetadataCache>,
    ) -> Result<Self> {
        if !role.is_tenant_scoped() {
            return Err(TenancyError::Configuration(format!(
                "{} is not a tenant-scoped role",
                role
            )));
        }
        Ok(Self {
            role,
            resolver,
            cache,
            capability: HandleCapability::new(),
        })
    }

    async fn create_handle(&self, identity: &IdentityContext) -> Result<DatabaseHandle> {
        let tenant = self
            .resolver
            .resolve(identity)
            .ok_or(TenancyError::TenantIdentityMissing { role: self.role })?;

        let metadata = self.cache.get_tenant(tenant.tenant_id()).await?;
        if !metadata.is_active {
            return Err(TenancyError::TenantUnavailable(tenant.into_tenant_id()));
        }

        let descriptor = metadata
            .descriptor(self.role)
            .cloned()
            .ok_or_else(|| TenancyError::Configuration(format!("no descriptor for {}", self.role)))?;

        debug!(tenant_id = %tenant, role = %self.role, descriptor = %descriptor, "Resolved tenant database");
        Ok(DatabaseHandle::new(
            &self.capability,
            self.role,
            Some(tenant.into_tenant_id()),
            descriptor,
        ))
    }
}

impl ContextFactory for TenantContextFactory {
    fn role(&self) -> DatabaseRole {
        self.role
    }

    fn create<'a>(
        &'a self,
        identity: &'a IdentityContext,
    ) -> Pin<Box<dyn Future<Output = Result<DatabaseHandle>> + Send + 'a>> {
        Box::pin(self.create_handle(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_TENANT_CACHE_TTL;
    use crate::crypto::{AesGcmEncryption, EncryptionService};
    use crate::identity::{Principal, TENANT_CLAIM};
    use crate::registry::{AuditContext, CreateTenantRequest, SqliteTenantRegistry};
    use crate::tenant::TenantContext;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: Arc<SqliteTenantRegistry>,
        encryption: Arc<dyn EncryptionService>,
        app: TenantContextFactory,
        identity: TenantContextFactory,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let master = ConnectionDescriptor::new(dir.path().join("master.db").to_string_lossy().to_string()).unwrap();
        let registry = Arc::new(
            SqliteTenantRegistry::new(master)
                .unwrap()
                .with_descriptor_template(format!("{}/{{tenant_id}}-{{role}}.db", dir.path().display()))
                .unwrap(),
        );
        registry.initialize().await.unwrap();

        let encryption: Arc<dyn EncryptionService> =
            Arc::new(AesGcmEncryption::new(&[3u8; 32]).unwrap());
        let resolver = TenantIdentityResolver::new(encryption.clone());
        let cache = Arc::new(TenantMetadataCache::new(registry.clone(), DEFAULT_TENANT_CACHE_TTL));

        Fixture {
            app: TenantContextFactory::new(DatabaseRole::TenantApp, resolver.clone(), cache.clone()).unwrap(),
            identity: TenantContextFactory::new(DatabaseRole::TenantIdentity, resolver, cache).unwrap(),
            registry,
            encryption,
            _dir: dir,
        }
    }

    async fn create(registry: &SqliteTenantRegistry, id: &str) {
        registry
            .create_tenant(
                CreateTenantRequest {
                    tenant_id: id.to_string(),
                    name: id.to_string(),
                    routing_key: id.to_string(),
                    app_db: None,
                    identity_db: None,
                },
                AuditContext::new("test"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tenant_factory_resolves_role_descriptor() {
        let f = fixture().await;
        create(&f.registry, "acme").await;

        let principal = Principal::new("user-1").with_claim(TENANT_CLAIM, f.encryption.encrypt("acme").unwrap());
        let identity = IdentityContext::for_principal(principal);

        let app = f.app.create(&identity).await.unwrap();
        assert_eq!(app.role(), DatabaseRole::TenantApp);
        assert_eq!(app.tenant_id(), Some("acme"));
        assert!(app.descriptor().path().ends_with("acme-app.db"));
        assert!(!app.is_connected());

        let ident = f.identity.create(&identity).await.unwrap();
        assert!(ident.descriptor().path().ends_with("acme-identity.db"));
    }

    #[tokio::test]
    async fn test_missing_identity_is_rejected() {
        let f = fixture().await;
        let err = f.app.create(&IdentityContext::anonymous()).await.unwrap_err();
        assert!(matches!(
            err,
            TenancyError::TenantIdentityMissing { role: DatabaseRole::TenantApp }
        ));
    }

    #[tokio::test]
    async fn test_inactive_tenant_never_yields_handle() {
        let f = fixture().await;
        create(&f.registry, "zeta").await;
        f.registry
            .deactivate_tenant("zeta", AuditContext::new("test"))
            .await
            .unwrap();

        let identity = IdentityContext::for_tenant(TenantContext::new("zeta").unwrap());
        let err = f.app.create(&identity).await.unwrap_err();
        assert!(err.is_routing_error());

        let unknown = IdentityContext::for_tenant(TenantContext::new("ghost").unwrap());
        assert!(f.identity.create(&unknown).await.unwrap_err().is_routing_error());
    }

    #[tokio::test]
    async fn test_master_factory_ignores_identity() {
        let descriptor = ConnectionDescriptor::parse("/srv/master.db").unwrap();
        let factory = MasterContextFactory::new(descriptor.clone());

        let identity = IdentityContext::for_tenant(TenantContext::new("acme").unwrap());
        let a = factory.create(&identity).await.unwrap();
        let b = factory.create(&IdentityContext::anonymous()).await.unwrap();

        assert_eq!(a.descriptor(), &descriptor);
        assert_eq!(b.descriptor(), &descriptor);
        assert_eq!(a.tenant_id(), None);
        assert_eq!(factory.role(), DatabaseRole::Master);
    }

    #[tokio::test]
    async fn test_master_role_rejected_for_tenant_factory() {
        let f = fixture().await;
        let resolver = TenantIdentityResolver::new(f.encryption.clone());
        let cache = Arc::new(TenantMetadataCache::new(f.registry.clone(), DEFAULT_TENANT_CACHE_TTL));
        assert!(TenantContextFactory::new(DatabaseRole::Master, resolver, cache).is_err());
    }
}
