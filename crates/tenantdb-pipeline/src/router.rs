//! Tenant router.
//!
//! Owns the long-lived pieces (registry, metadata cache, identity resolver,
//! factories, handler descriptors, coordinator) and hands out call scopes
//! pre-populated with lazy units of work. Tenant scopes get the app and
//! identity units; the master unit is attached on request.

use crate::config::RoutingConfig;
use crate::context::{AppDb, IdentityDb, MasterDb};
use crate::coordinator::TransactionCoordinator;
use crate::descriptors::{HandlerDescriptorCache, HandlerModule};
use crate::handler::Operation;
use crate::scope::CallScope;
use crate::unit_of_work::UnitOfWork;
use std::sync::Arc;
use tenantdb_core::{DatabaseRole, Result};
use tenantdb_storage::{
    Clock, ContextFactory, EncryptionService, IdentityContext, MasterContextFactory, Principal,
    RegistryObserver, SqliteTenantRegistry, SystemClock, TenantClaimIssuer, TenantContext,
    TenantContextFactory, TenantIdentityResolver, TenantMetadataCache, TenantRegistry,
};
use tracing::{debug, info};

pub struct TenantRouterBuilder {
    config: RoutingConfig,
    modules: Vec<Arc<dyn HandlerModule>>,
    encryption: Option<Arc<dyn EncryptionService>>,
    clock: Option<Arc<dyn Clock>>,
}

impl TenantRouterBuilder {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            modules: Vec::new(),
            encryption: None,
            clock: None,
        }
    }

    pub fn module(mut self, module: Arc<dyn HandlerModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Use this encryption service instead of the configured claim key.
    pub fn encryption(mut self, encryption: Arc<dyn EncryptionService>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Time source for metadata cache expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<TenantRouter> {
        self.config.validate()?;
        let master = self.config.master_descriptor()?;

        let mut registry = SqliteTenantRegistry::new(master.clone())?;
        if let Some(template) = &self.config.tenant_db_template {
            registry = registry.with_descriptor_template(template.clone())?;
        }
        let registry = Arc::new(registry);

        let encryption = match self.encryption {
            Some(encryption) => encryption,
            None => self.config.encryption()?,
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = Arc::new(TenantMetadataCache::with_clock(
            registry.clone() as Arc<dyn TenantRegistry>,
            self.config.tenant_cache_ttl,
            clock,
        ));
        let observer: Arc<dyn RegistryObserver> = cache.clone();
        registry.observe(&observer);

        let resolver = TenantIdentityResolver::new(encryption.clone());
        let app_factory: Arc<dyn ContextFactory> = Arc::new(TenantContextFactory::new(
            DatabaseRole::TenantApp,
            resolver.clone(),
            cache.clone(),
        )?);
        let identity_factory: Arc<dyn ContextFactory> = Arc::new(TenantContextFactory::new(
            DatabaseRole::TenantIdentity,
            resolver.clone(),
            cache.clone(),
        )?);

        let descriptors = Arc::new(HandlerDescriptorCache::build(self.modules));
        info!(master = %master, ttl_secs = self.config.tenant_cache_ttl.as_secs(), "Built tenant router");

        Ok(TenantRouter {
            config: self.config,
            registry,
            cache,
            resolver,
            encryption,
            master_factory: Arc::new(MasterContextFactory::new(master)),
            app_factory,
            identity_factory,
            coordinator: TransactionCoordinator::new(descriptors),
        })
    }
}

pub struct TenantRouter {
    config: RoutingConfig,
    registry: Arc<SqliteTenantRegistry>,
    cache: Arc<TenantMetadataCache>,
    resolver: TenantIdentityResolver,
    encryption: Arc<dyn EncryptionService>,
    master_factory: Arc<dyn ContextFactory>,
    app_factory: Arc<dyn ContextFactory>,
    identity_factory: Arc<dyn ContextFactory>,
    coordinator: TransactionCoordinator,
}

impl TenantRouter {
    pub fn builder(config: RoutingConfig) -> TenantRouterBuilder {
        TenantRouterBuilder::new(config)
    }

    /// Create or upgrade the master catalog.
    pub async fn initialize(&self) -> Result<usize> {
        self.registry.initialize().await
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SqliteTenantRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<TenantMetadataCache> {
        &self.cache
    }

    pub fn resolver(&self) -> &TenantIdentityResolver {
        &self.resolver
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn descriptors(&self) -> &Arc<HandlerDescriptorCache> {
        self.coordinator.descriptors()
    }

    pub fn claim_issuer(&self) -> TenantClaimIssuer {
        TenantClaimIssuer::new(self.encryption.clone())
    }

    pub fn factory(&self, role: DatabaseRole) -> Arc<dyn ContextFactory> {
        match role {
            DatabaseRole::Master => self.master_factory.clone(),
            DatabaseRole::TenantApp => self.app_factory.clone(),
            DatabaseRole::TenantIdentity => self.identity_factory.clone(),
        }
    }

    /// Attach a handler module after startup.
    pub fn attach_module(&self, module: Arc<dyn HandlerModule>) {
        self.descriptors().attach_module(module);
    }

    fn populate(&self, scope: CallScope) -> Result<CallScope> {
        scope.register_unit_of_work::<AppDb>(self.app_factory.clone())?;
        scope.register_unit_of_work::<IdentityDb>(self.identity_factory.clone())?;
        debug!(scope_id = %scope.id(), "Opened call scope");
        Ok(scope)
    }

    /// Scope for an authenticated inbound call.
    ///
    /// Holds the tenant app and identity units. Call
    /// [`attach_master`](Self::attach_master) to reach the master catalog.
    pub fn request_scope(&self, principal: Principal) -> Result<CallScope> {
        self.populate(CallScope::for_principal(principal))
    }

    /// Scope for background work on behalf of `tenant`. Same units as
    /// [`request_scope`](Self::request_scope).
    pub fn background_scope(&self, tenant: TenantContext) -> Result<CallScope> {
        self.populate(CallScope::background(tenant))
    }

    /// Scope with no caller identity, holding all three units. Only master
    /// data is reachable until an explicit tenant is set.
    pub fn anonymous_scope(&self) -> Result<CallScope> {
        let scope = self.populate(CallScope::new(IdentityContext::anonymous()))?;
        scope.register_unit_of_work::<MasterDb>(self.master_factory.clone())?;
        Ok(scope)
    }

    /// Add the master catalog unit to `scope`, or return the one already there.
    ///
    /// Once attached, operations declaring `MasterDb` open a master transaction
    /// in this scope.
    pub fn attach_master(&self, scope: &CallScope) -> Result<Arc<UnitOfWork<MasterDb>>> {
        if let Ok(unit) = scope.unit_of_work::<MasterDb>() {
            return Ok(unit);
        }
        scope.register_unit_of_work::<MasterDb>(self.master_factory.clone())
    }

    /// The tenant the scope currently routes to.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` if neither an explicit tenant nor a valid claim is present.
    pub fn current_tenant(&self, scope: &CallScope) -> Result<TenantContext> {
        self.resolver.require(scope.identity())
    }

    pub async fn dispatch<O: Operation>(&self, scope: &CallScope, operation: O) -> Result<O::Output> {
        self.coordinator.dispatch(scope, operation).await
    }
}
