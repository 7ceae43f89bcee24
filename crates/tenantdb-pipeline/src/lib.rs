//! tenantdb Pipeline
//!
//! Treats several lazily opened tenant and master databases as one unit of
//! work per call:
//!
//! ```text
//! dispatch ─► TransactionCoordinator ─► HandlerDescriptorCache (declared units)
//!                   │                         │
//!                   ▼                         ▼
//!            CallScope container ─► UnitOfWork<C> ─► ContextFactory ─► DatabaseHandle
//!                   │
//!                   └─► begin-all ─► handler ─► commit-all | rollback-all
//! ```
//!
//! There is no two-phase commit. A failure after the first commit leaves the
//! already committed databases committed and surfaces
//! [`TenancyError::PartialCommit`](tenantdb_core::TenancyError::PartialCommit).

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod context;
pub mod coordinator;
pub mod descriptors;
pub mod handler;
pub mod repository;
pub mod router;
pub mod scope;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod unit_of_work;

pub use config::RoutingConfig;
pub use context::{AppDb, DbContext, IdentityDb, MasterDb};
pub use coordinator::{TransactionCoordinator, PARTIAL_COMMIT_TARGET};
pub use descriptors::{
    HandlerDescriptor, HandlerDescriptorCache, HandlerModule, ImplementationType, ModuleBuilder,
    OperationType, TypeKey, UnitOfWorkType,
};
pub use handler::{Operation, OperationHandler};
pub use repository::{Entity, Repository};
pub use router::{TenantRouter, TenantRouterBuilder};
pub use scope::{CallScope, ScopeContainer};
pub use unit_of_work::{TransactionalUnit, UnitOfWork, UnitState};

/// Boxed `Send` future used at the crate's trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
