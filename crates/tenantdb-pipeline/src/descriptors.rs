//! Handler descriptor cache.
//!
//! Handlers are registered through [`HandlerModule`]s at startup. The cache
//! maps each operation type to its handler implementation and the units of
//! work that implementation declares.
//!
//! ## Lookup
//!
//! - Startup: every module registers its handlers; a module that fails is
//!   logged and skipped
//! - Miss: all attached modules are rescanned once for the operation and the
//!   result is cached, including a "not found" marker
//! - [`attach_module`](HandlerDescriptorCache::attach_module) purges cached
//!   "not found" markers so late handlers become visible

use crate::context::DbContext;
use crate::handler::{Operation, OperationHandler};
use crate::unit_of_work::{TransactionalUnit, UnitOfWork};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tenantdb_core::Result;
use tracing::{debug, info, warn};

/// A type identity with a readable name for logs.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub type OperationType = TypeKey;
pub type ImplementationType = TypeKey;

/// A unit of work type a handler depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitOfWorkType(TypeKey);

impl UnitOfWorkType {
    /// The unit of work for a database context.
    pub fn of<C: DbContext>() -> Self {
        Self(TypeKey {
            id: TypeId::of::<UnitOfWork<C>>(),
            name: C::NAME,
        })
    }

    /// Any other transactional unit registered in a scope.
    pub fn of_unit<U: TransactionalUnit + Any>() -> Self {
        Self(TypeKey::of::<U>())
    }

    pub fn id(&self) -> TypeId {
        self.0.id
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }
}

/// What the pipeline knows about one registered handler.
pub struct HandlerDescriptor {
    operation: OperationType,
    implementation: ImplementationType,
    dependencies: Vec<UnitOfWorkType>,
    requires_transaction: bool,
    // Holds an `Arc<dyn OperationHandler<O>>`.
    handler: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("operation", &self.operation)
            .field("implementation", &self.implementation)
            .field("dependencies", &self.dependencies)
            .field("requires_transaction", &self.requires_transaction)
            .finish()
    }
}

impl HandlerDescriptor {
    pub fn new<O, H>(handler: H) -> Self
    where
        O: Operation,
        H: OperationHandler<O>,
    {
        let handler: Arc<dyn OperationHandler<O>> = Arc::new(handler);
        Self {
            operation: TypeKey::of::<O>(),
            implementation: TypeKey::of::<H>(),
            dependencies: H::dependencies(),
            requires_transaction: O::REQUIRES_TRANSACTION,
            handler: Arc::new(handler),
        }
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn implementation(&self) -> ImplementationType {
        self.implementation
    }

    /// Declared units of work, in declaration order.
    pub fn dependencies(&self) -> &[UnitOfWorkType] {
        &self.dependencies
    }

    pub fn requires_transaction(&self) -> bool {
        self.requires_transaction
    }

    pub fn handler<O: Operation>(&self) -> Option<Arc<dyn OperationHandler<O>>> {
        self.handler
            .downcast_ref::<Arc<dyn OperationHandler<O>>>()
            .cloned()
    }
}

/// Collects descriptors while a module registers.
#[derive(Default)]
pub struct ModuleBuilder {
    descriptors: Vec<HandlerDescriptor>,
}

impl ModuleBuilder {
    pub fn handler<O, H>(&mut self, handler: H) -> &mut Self
    where
        O: Operation,
        H: OperationHandler<O>,
    {
        self.descriptors.push(HandlerDescriptor::new::<O, H>(handler));
        self
    }

    pub fn descriptor(&mut self, descriptor: HandlerDescriptor) -> &mut Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// A group of handlers registered together.
pub trait HandlerModule: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, builder: &mut ModuleBuilder) -> Result<()>;
}

#[derive(Clone)]
enum Slot {
    Found(Arc<HandlerDescriptor>),
    NotFound,
}

pub struct HandlerDescriptorCache {
    modules: RwLock<Vec<Arc<dyn HandlerModule>>>,
    by_operation: DashMap<TypeId, Slot>,
    by_implementation: DashMap<TypeId, Arc<HandlerDescriptor>>,
}

impl Default for HandlerDescriptorCache {
    fn default() -> Self {
        Self::build(Vec::new())
    }
}

impl HandlerDescriptorCache {
    /// Register every module's handlers.
    pub fn build(modules: Vec<Arc<dyn HandlerModule>>) -> Self {
        let cache = Self {
            modules: RwLock::new(Vec::new()),
            by_operation: DashMap::new(),
            by_implementation: DashMap::new(),
        };
        for module in modules {
            cache.load_module(&module);
            cache.modules.write().push(module);
        }
        info!(
            modules = cache.modules.read().len(),
            handlers = cache.by_implementation.len(),
            "Built handler descriptor cache"
        );
        cache
    }

    /// Attach a module after startup.
    pub fn attach_module(&self, module: Arc<dyn HandlerModule>) {
        let loaded = self.load_module(&module);
        self.modules.write().push(module);
        self.by_operation
            .retain(|_, slot| matches!(slot, Slot::Found(_)));
        debug!(loaded, "Attached handler module");
    }

    fn collect(module: &Arc<dyn HandlerModule>) -> Option<Vec<HandlerDescriptor>> {
        let mut builder = ModuleBuilder::default();
        match module.register(&mut builder) {
            Ok(()) => Some(builder.descriptors),
            Err(e) => {
                warn!(module = %module.name(), error = %e, "Skipping handler module that failed to load");
                None
            }
        }
    }

    fn load_module(&self, module: &Arc<dyn HandlerModule>) -> usize {
        Self::collect(module)
            .map(|descriptors| {
                descriptors
                    .into_iter()
                    .map(|descriptor| self.insert(module.name(), Arc::new(descriptor)))
                    .filter(|inserted| *inserted)
                    .count()
            })
            .unwrap_or(0)
    }

    fn insert(&self, module: &str, descriptor: Arc<HandlerDescriptor>) -> bool {
        match self.by_operation.entry(descriptor.operation.id()) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Found(existing) = occupied.get() {
                    warn!(
                        module = %module,
                        operation = descriptor.operation.name(),
                        existing = existing.implementation.name(),
                        ignored = descriptor.implementation.name(),
                        "Duplicate handler registration ignored"
                    );
                    return false;
                }
                occupied.insert(Slot::Found(descriptor.clone()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Found(descriptor.clone()));
            }
        }
        self.by_implementation
            .entry(descriptor.implementation.id())
            .or_insert(descriptor);
        true
    }

    fn rescan(&self, operation: TypeId) -> Option<Arc<HandlerDescriptor>> {
        let modules = self.modules.read().clone();
        debug!(modules = modules.len(), "Rescanning handler modules for unregistered operation");
        for module in &modules {
            for descriptor in Self::collect(module).into_iter().flatten() {
                if descriptor.operation.id() == operation {
                    self.insert(module.name(), Arc::new(descriptor));
                }
            }
        }
        match self.by_operation.entry(operation).or_insert(Slot::NotFound).clone() {
            Slot::Found(descriptor) => Some(descriptor),
            Slot::NotFound => None,
        }
    }

    /// Descriptor for an operation type, rescanning modules on a miss.
    pub fn descriptor_for(&self, operation: TypeId) -> Option<Arc<HandlerDescriptor>> {
        let cached = self.by_operation.get(&operation).map(|slot| slot.clone());
        match cached {
            Some(Slot::Found(descriptor)) => Some(descriptor),
            Some(Slot::NotFound) => None,
            None => self.rescan(operation),
        }
    }

    pub fn descriptor_of<O: Operation>(&self) -> Option<Arc<HandlerDescriptor>> {
        self.descriptor_for(TypeId::of::<O>())
    }

    pub fn implementation_of(&self, operation: TypeId) -> Option<ImplementationType> {
        self.descriptor_for(operation)
            .map(|descriptor| descriptor.implementation)
    }

    /// Declared units of work for an implementation; empty if unknown.
    pub fn dependencies_of(&self, implementation: ImplementationType) -> Vec<UnitOfWorkType> {
        self.by_implementation
            .get(&implementation.id())
            .map(|descriptor| descriptor.dependencies.clone())
            .unwrap_or_default()
    }

    pub fn handler_for<O: Operation>(&self) -> Option<Arc<dyn OperationHandler<O>>> {
        self.descriptor_of::<O>()?.handler::<O>()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.by_implementation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_implementation.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AppDb, IdentityDb};
    use crate::scope::CallScope;
    use crate::test_utils::FnModule;
    use crate::BoxFuture;
    use tenantdb_core::TenancyError;

    struct Ping;
    impl Operation for Ping {
        type Output = &'static str;
    }

    struct Pong;
    impl Operation for Pong {
        type Output = ();
        const REQUIRES_TRANSACTION: bool = false;
    }

    struct PingHandler;
    impl OperationHandler<Ping> for PingHandler {
        fn dependencies() -> Vec<UnitOfWorkType> {
            vec![UnitOfWorkType::of::<AppDb>(), UnitOfWorkType::of::<IdentityDb>()]
        }

        fn handle<'a>(&'a self, _scope: &'a CallScope, _op: Ping) -> BoxFuture<'a, Result<&'static str>> {
            Box::pin(async { Ok("pong") })
        }
    }

    struct OtherPingHandler;
    impl OperationHandler<Ping> for OtherPingHandler {
        fn dependencies() -> Vec<UnitOfWorkType> {
            Vec::new()
        }

        fn handle<'a>(&'a self, _scope: &'a CallScope, _op: Ping) -> BoxFuture<'a, Result<&'static str>> {
            Box::pin(async { Ok("other") })
        }
    }

    struct PongHandler;
    impl OperationHandler<Pong> for PongHandler {
        fn dependencies() -> Vec<UnitOfWorkType> {
            Vec::new()
        }

        fn handle<'a>(&'a self, _scope: &'a CallScope, _op: Pong) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn ping_fn_module() -> Arc<FnModule> {
        Arc::new(FnModule::new("ping", |builder| {
            builder.handler::<Ping, _>(PingHandler);
            Ok(())
        }))
    }

    fn ping_module() -> Arc<dyn HandlerModule> {
        ping_fn_module()
    }

    #[test]
    fn test_build_registers_descriptors() {
        let cache = HandlerDescriptorCache::build(vec![ping_module()]);
        assert_eq!(cache.len(), 1);

        let descriptor = cache.descriptor_of::<Ping>().unwrap();
        assert_eq!(descriptor.operation(), TypeKey::of::<Ping>());
        assert!(descriptor.requires_transaction());

        let implementation = cache.implementation_of(TypeId::of::<Ping>()).unwrap();
        assert_eq!(implementation, TypeKey::of::<PingHandler>());
        let names: Vec<_> = cache
            .dependencies_of(implementation)
            .iter()
            .map(|dep| dep.name())
            .collect();
        assert_eq!(names, vec!["AppDb", "IdentityDb"]);
        assert!(cache
            .dependencies_of(TypeKey::of::<PongHandler>())
            .is_empty());
    }

    #[tokio::test]
    async fn test_handler_for_returns_callable_handler() {
        let cache = HandlerDescriptorCache::build(vec![ping_module()]);
        let handler = cache.handler_for::<Ping>().unwrap();
        let scope = CallScope::new(tenantdb_storage::IdentityContext::anonymous());
        assert_eq!(handler.handle(&scope, Ping).await.unwrap(), "pong");
    }

    #[test]
    fn test_failing_module_is_skipped() {
        let broken: Arc<dyn HandlerModule> = Arc::new(FnModule::new("broken", |builder| {
            builder.handler::<Pong, _>(PongHandler);
            Err(TenancyError::Configuration("missing setting".into()))
        }));
        let cache = HandlerDescriptorCache::build(vec![broken, ping_module()]);
        assert!(cache.descriptor_of::<Ping>().is_some());
        assert!(cache.descriptor_of::<Pong>().is_none());
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let other: Arc<dyn HandlerModule> = Arc::new(FnModule::new("other", |builder| {
            builder.handler::<Ping, _>(OtherPingHandler);
            Ok(())
        }));
        let cache = HandlerDescriptorCache::build(vec![ping_module(), other]);
        assert_eq!(
            cache.implementation_of(TypeId::of::<Ping>()),
            Some(TypeKey::of::<PingHandler>())
        );
    }

    #[test]
    fn test_miss_rescans_once_and_caches_not_found() {
        let module = ping_fn_module();
        let cache = HandlerDescriptorCache::build(vec![module.clone() as Arc<dyn HandlerModule>]);
        assert_eq!(module.loads(), 1);

        assert!(cache.descriptor_of::<Pong>().is_none());
        assert_eq!(module.loads(), 2);

        assert!(cache.descriptor_of::<Pong>().is_none());
        assert_eq!(module.loads(), 2);
    }

    #[test]
    fn test_late_module_purges_not_found_markers() {
        let cache = HandlerDescriptorCache::build(vec![ping_module()]);
        assert!(cache.descriptor_of::<Pong>().is_none());

        cache.attach_module(Arc::new(FnModule::new("late", |builder| {
            builder.handler::<Pong, _>(PongHandler);
            Ok(())
        })));

        let descriptor = cache.descriptor_of::<Pong>().unwrap();
        assert!(!descriptor.requires_transaction());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_rescan_finds_handler_missing_from_cache() {
        let cache = HandlerDescriptorCache::build(vec![ping_module()]);
        cache.by_operation.remove(&TypeId::of::<Ping>());

        assert!(cache.descriptor_of::<Ping>().is_some());
    }

    #[test]
    fn test_unit_of_work_type_names() {
        assert_eq!(UnitOfWorkType::of::<AppDb>().name(), "AppDb");
        assert_eq!(
            UnitOfWorkType::of::<AppDb>().id(),
            TypeId::of::<UnitOfWork<AppDb>>()
        );
        assert_ne!(UnitOfWorkType::of::<AppDb>(), UnitOfWorkType::of::<IdentityDb>());
    }
}
