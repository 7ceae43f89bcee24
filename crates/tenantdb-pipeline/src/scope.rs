//! Call scopes.
//!
//! One [`CallScope`] per inbound unit of work. It owns the caller's identity,
//! a container of live units of work and a cancellation signal. Nothing in a
//! scope is shared with another scope.

use crate::context::DbContext;
use crate::unit_of_work::{TransactionalUnit, UnitOfWork};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tenantdb_core::{Result, TenancyError};
use tenantdb_storage::{ContextFactory, IdentityContext, Principal, TenantContext};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

struct ScopeEntry {
    instance: Arc<dyn Any + Send + Sync>,
    unit: Option<Arc<dyn TransactionalUnit>>,
}

/// Per-scope service container keyed by type.
#[derive(Default)]
pub struct ScopeContainer {
    entries: RwLock<HashMap<TypeId, ScopeEntry>>,
    registration_order: RwLock<Vec<TypeId>>,
}

impl ScopeContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, type_id: TypeId, entry: ScopeEntry) {
        if self.entries.write().insert(type_id, entry).is_none() {
            self.registration_order.write().push(type_id);
        }
    }

    /// Register a plain scoped service.
    pub fn register<T: Any + Send + Sync>(&self, value: Arc<T>) {
        self.insert(
            TypeId::of::<T>(),
            ScopeEntry {
                instance: value,
                unit: None,
            },
        );
    }

    /// Register a transactional unit, resolvable by its concrete type.
    pub fn register_unit<U: TransactionalUnit + Any>(&self, unit: Arc<U>) {
        self.insert(
            TypeId::of::<U>(),
            ScopeEntry {
                instance: unit.clone(),
                unit: Some(unit),
            },
        );
    }

    pub fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let instance = self.entries.read().get(&TypeId::of::<T>())?.instance.clone();
        instance.downcast::<T>().ok()
    }

    /// Resolve a registered unit by type id.
    pub fn resolve_unit(&self, type_id: TypeId) -> Option<Arc<dyn TransactionalUnit>> {
        self.entries.read().get(&type_id)?.unit.clone()
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.entries.read().contains_key(&type_id)
    }

    /// Dispose every registered unit, in registration order.
    ///
    /// Returns how many were disposed by this call.
    pub fn dispose_all(&self) -> usize {
        let order = self.registration_order.read().clone();
        let entries = self.entries.read();
        order
            .iter()
            .filter_map(|type_id| entries.get(type_id)?.unit.as_ref())
            .filter(|unit| unit.dispose())
            .count()
    }
}

pub struct CallScope {
    id: Uuid,
    identity: Arc<IdentityContext>,
    container: ScopeContainer,
    cancel: watch::Sender<bool>,
    ended: AtomicBool,
}

impl std::fmt::Debug for CallScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallScope")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CallScope {
    pub fn new(identity: IdentityContext) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            identity: Arc::new(identity),
            container: ScopeContainer::new(),
            cancel,
            ended: AtomicBool::new(false),
        }
    }

    pub fn for_principal(principal: Principal) -> Self {
        Self::new(IdentityContext::for_principal(principal))
    }

    /// Scope for scheduled or background work acting as `tenant`.
    pub fn background(tenant: TenantContext) -> Self {
        Self::new(IdentityContext::for_tenant(tenant))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &Arc<IdentityContext> {
        &self.identity
    }

    pub fn container(&self) -> &ScopeContainer {
        &self.container
    }

    pub fn set_explicit_tenant(&self, tenant: TenantContext) {
        self.identity.set_explicit(tenant);
    }

    pub fn clear_explicit_tenant(&self) {
        self.identity.clear_explicit();
    }

    /// Create and register a unit of work for `C` backed by `factory`.
    pub fn register_unit_of_work<C: DbContext>(
        &self,
        factory: Arc<dyn ContextFactory>,
    ) -> Result<Arc<UnitOfWork<C>>> {
        let unit = Arc::new(UnitOfWork::<C>::new(factory, self.identity.clone())?);
        self.container.register_unit(unit.clone());
        Ok(unit)
    }

    /// The scope's unit of work for `C`.
    pub fn unit_of_work<C: DbContext>(&self) -> Result<Arc<UnitOfWork<C>>> {
        self.container.resolve::<UnitOfWork<C>>().ok_or_else(|| {
            TenancyError::Configuration(format!("no {} unit of work in this scope", C::NAME))
        })
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Completes once the scope is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// End the scope: dispose all units and clear the explicit tenant.
    pub fn end(&self) -> usize {
        if self.ended.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let disposed = self.container.dispose_all();
        self.identity.clear_explicit();
        debug!(scope_id = %self.id, disposed, "Ended call scope");
        disposed
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        self.end();
    }
}
