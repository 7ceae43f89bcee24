//! Cross-database transaction coordination.
//!
//! ```text
//! intercept(scope, op, next)
//!   │
//!   ├─ no transaction required ───────────────────► next(op)
//!   ├─ declared units ∩ live units == ∅ ──────────► next(op)   (no-op)
//!   │
//!   ├─ begin A, begin B, ...      (begin failure ─► rollback begun, fail)
//!   ├─ next(op) raced against scope cancellation
//!   ├─ ok   ─► commit A, commit B, ...
//!   │            └─ failure after a commit ─► PartialCommit
//!   └─ fail ─► rollback every begun unit, return the original error
//! ```
//!
//! Commits are sequential and there is no prepare phase. A commit failure after
//! another unit has committed leaves that database committed. This is reported
//! as [`TenancyError::PartialCommit`] and logged at error level under the
//! [`PARTIAL_COMMIT_TARGET`] target; nothing is compensated.

use crate::descriptors::HandlerDescriptorCache;
use crate::handler::Operation;
use crate::scope::CallScope;
use crate::unit_of_work::TransactionalUnit;
use std::future::Future;
use std::sync::Arc;
use tenantdb_core::{Result, TenancyError};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Log target for partial commits and ambiguous commit outcomes.
pub const PARTIAL_COMMIT_TARGET: &str = "tenantdb::partial_commit";

fn record_outcome(outcome: &str) {
    #[cfg(feature = "metrics")]
    tenantdb_storage::metrics::record_transaction(outcome);
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Logs an ambiguous outcome if dropped while commits are in flight.
struct CommitGuard {
    scope_id: Uuid,
    committed: Vec<&'static str>,
    armed: bool,
}

impl CommitGuard {
    fn new(scope_id: Uuid) -> Self {
        Self {
            scope_id,
            committed: Vec::new(),
            armed: true,
        }
    }

    fn disarm(&mut self) -> Vec<String> {
        self.armed = false;
        self.committed.iter().map(|name| name.to_string()).collect()
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(
                target: PARTIAL_COMMIT_TARGET,
                scope_id = %self.scope_id,
                committed = ?self.committed,
                "Coordinator dropped during commit; transaction outcome is ambiguous"
            );
        }
    }
}

pub struct TransactionCoordinator {
    descriptors: Arc<HandlerDescriptorCache>,
}

impl TransactionCoordinator {
    pub fn new(descriptors: Arc<HandlerDescriptorCache>) -> Self {
        Self { descriptors }
    }

    pub fn descriptors(&self) -> &Arc<HandlerDescriptorCache> {
        &self.descriptors
    }

    /// Run `next` inside transactions on every live unit the operation's
    /// handler declares.
    ///
    /// Units begin in declaration order and commit in the same order once
    /// `next` succeeds. Declared units missing from the scope are skipped.
    /// With none left, or when `O` opts out of transactions, `next` runs
    /// unwrapped.
    ///
    /// # Arguments
    ///
    /// * `scope` - Call scope holding the live units and the cancellation signal
    /// * `operation` - Operation passed through to `next`
    /// * `next` - The handler body
    ///
    /// # Errors
    ///
    /// - The body's error, unchanged, after every begun unit rolled back
    /// - A begin error, or a commit error from the first unit
    /// - `Cancelled` if the scope was cancelled before the body finished
    /// - `PartialCommit` if a commit failed after another unit committed
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let id = coordinator
    ///     .intercept(&scope, RegisterUser { id: 7 }, |op| handler.handle(&scope, op))
    ///     .await?;
    /// ```
    pub async fn intercept<O, F, Fut>(&self, scope: &CallScope, operation: O, next: F) -> Result<O::Output>
    where
        O: Operation,
        F: FnOnce(O) -> Fut,
        Fut: Future<Output = Result<O::Output>>,
    {
        let operation_name = std::any::type_name::<O>();
        if !O::REQUIRES_TRANSACTION {
            return next(operation).await;
        }

        let Some(descriptor) = self.descriptors.descriptor_of::<O>() else {
            debug!(scope_id = %scope.id(), operation = operation_name, "No handler descriptor; running without transaction");
            return next(operation).await;
        };

        let units: Vec<Arc<dyn TransactionalUnit>> = descriptor
            .dependencies()
            .iter()
            .filter_map(|dependency| {
                let unit = scope.container().resolve_unit(dependency.id());
                if unit.is_none() {
                    debug!(
                        scope_id = %scope.id(),
                        operation = operation_name,
                        unit = dependency.name(),
                        "Declared unit of work not live in scope; skipping"
                    );
                }
                unit
            })
            .collect();

        if units.is_empty() {
            warn!(scope_id = %scope.id(), operation = operation_name, "No live units of work; running without transaction");
            record_outcome("no_op");
            return next(operation).await;
        }

        let mut begun: Vec<Arc<dyn TransactionalUnit>> = Vec::with_capacity(units.len());
        for unit in units {
            if let Err(err) = unit.begin_transaction().await {
                warn!(scope_id = %scope.id(), unit = unit.name(), error = %err, "Failed to begin transaction");
                self.rollback_all(scope, &begun).await;
                record_outcome("rolled_back");
                return Err(err);
            }
            begun.push(unit);
        }

        let outcome = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(TenancyError::Cancelled(format!("scope {}", scope.id()))),
            result = next(operation) => result,
        };

        let result = match outcome {
            Ok(value) => self.commit_all(scope, &begun).await.map(|()| value),
            Err(err) => Err(err),
        };

        match result {
            Ok(value) => {
                record_outcome("committed");
                Ok(value)
            }
            Err(err) => {
                self.rollback_all(scope, &begun).await;
                if matches!(err, TenancyError::PartialCommit { .. }) {
                    record_outcome("partial_commit");
                } else {
                    record_outcome("rolled_back");
                }
                Err(err)
            }
        }
    }

    /// Run the registered handler for `operation` through [`intercept`](Self::intercept).
    pub async fn dispatch<O: Operation>(&self, scope: &CallScope, operation: O) -> Result<O::Output> {
        let handler = self.descriptors.handler_for::<O>().ok_or_else(|| {
            TenancyError::NotFound(format!("handler for {}", std::any::type_name::<O>()))
        })?;
        self.intercept(scope, operation, |op| handler.handle(scope, op))
            .await
    }

    async fn commit_all(&self, scope: &CallScope, units: &[Arc<dyn TransactionalUnit>]) -> Result<()> {
        let mut guard = CommitGuard::new(scope.id());
        for unit in units {
            if let Err(err) = unit.commit_transaction().await {
                let committed = guard.disarm();
                if committed.is_empty() {
                    return Err(err);
                }
                error!(
                    target: PARTIAL_COMMIT_TARGET,
                    scope_id = %scope.id(),
                    committed = ?committed,
                    failed = unit.name(),
                    error = %err,
                    "Partial commit: earlier units committed, later unit failed"
                );
                return Err(TenancyError::PartialCommit {
                    committed,
                    failed: unit.name().to_string(),
                    source: Box::new(err),
                });
            }
            guard.committed.push(unit.name());
        }
        let committed = guard.disarm();

        if scope.is_cancelled() {
            error!(
                target: PARTIAL_COMMIT_TARGET,
                scope_id = %scope.id(),
                committed = ?committed,
                "Scope cancelled during commit; all units committed but the caller may report failure"
            );
        }
        Ok(())
    }

    async fn rollback_all(&self, scope: &CallScope, units: &[Arc<dyn TransactionalUnit>]) {
        let mut failures = Vec::new();
        for unit in units {
            if let Err(err) = unit.rollback_transaction().await {
                error!(scope_id = %scope.id(), unit = unit.name(), error = %err, "Rollback failed");
                #[cfg(feature = "metrics")]
                tenantdb_storage::metrics::record_rollback_failure();
                failures.push(unit.name());
            }
        }
        if !failures.is_empty() {
            error!(scope_id = %scope.id(), failed = ?failures, "Rollback incomplete");
        }
    }
}
