//! Operations and their handlers.

use crate::descriptors::UnitOfWorkType;
use crate::scope::CallScope;
use crate::BoxFuture;
use tenantdb_core::Result;

/// A request dispatched through the pipeline.
pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    /// Queries set this to `false` and run without coordination.
    const REQUIRES_TRANSACTION: bool = true;
}

/// Executes one operation type.
///
/// `dependencies` lists the units of work the handler touches, in the order
/// they are begun and committed.
pub trait OperationHandler<O: Operation>: Send + Sync + 'static {
    fn dependencies() -> Vec<UnitOfWorkType>
    where
        Self: Sized;

    fn handle<'a>(&'a self, scope: &'a CallScope, operation: O) -> BoxFuture<'a, Result<O::Output>>;
}
