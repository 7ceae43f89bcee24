//! End-to-end routing and transaction scenarios over real SQLite files.
//!
//! Run with: cargo test -p tenantdb-pipeline --features test-utils

#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::time::Duration;
use tenantdb_core::{Result, TenancyError};
use tenantdb_pipeline::test_utils::{LogCapture, Note, TestRegistry, TestTenantBuilder, User};
use tenantdb_pipeline::{
    AppDb, BoxFuture, CallScope, HandlerModule, IdentityDb, MasterDb, ModuleBuilder, Operation,
    OperationHandler, RoutingConfig, TenantRouter, UnitOfWorkType, PARTIAL_COMMIT_TARGET,
};
use tenantdb_storage::identity::TENANT_CLAIM;
use tenantdb_storage::{Principal, TenantContext};

struct RegisterUser {
    id: i64,
    email: &'static str,
    reject: bool,
}

impl Operation for RegisterUser {
    type Output = i64;
}

struct RegisterUserHandler;

impl OperationHandler<RegisterUser> for RegisterUserHandler {
    fn dependencies() -> Vec<UnitOfWorkType> {
        vec![UnitOfWorkType::of::<AppDb>(), UnitOfWorkType::of::<IdentityDb>()]
    }

    fn handle<'a>(&'a self, scope: &'a CallScope, op: RegisterUser) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let app = scope.unit_of_work::<AppDb>()?;
            app.repository::<Note>()
                .await?
                .add(&Note::new(op.id, &format!("welcome {}", op.email)));
            app.save_changes().await?;

            if let Ok(identity) = scope.unit_of_work::<IdentityDb>() {
                identity
                    .repository::<User>()
                    .await?
                    .add(&User::new(op.id, op.email));
            }

            if op.reject {
                return Err(TenancyError::ValidationError(format!(
                    "{} is not allowed",
                    op.email
                )));
            }
            Ok(op.id)
        })
    }
}

struct SlowImport;

impl Operation for SlowImport {
    type Output = ();
}

struct SlowImportHandler;

impl OperationHandler<SlowImport> for SlowImportHandler {
    fn dependencies() -> Vec<UnitOfWorkType> {
        vec![UnitOfWorkType::of::<AppDb>()]
    }

    fn handle<'a>(&'a self, scope: &'a CallScope, _op: SlowImport) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let app = scope.unit_of_work::<AppDb>()?;
            app.repository::<Note>().await?.add(&Note::new(1, "imported"));
            app.save_changes().await?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
    }
}

/// Records a visit note in the tenant app database and, with `audit`, a row
/// in the master audit log.
struct RecordVisit {
    id: i64,
    audit: bool,
    duplicate_note: bool,
    hold: Duration,
}

impl RecordVisit {
    fn new(id: i64) -> Self {
        Self {
            id,
            audit: false,
            duplicate_note: false,
            hold: Duration::ZERO,
        }
    }
}

impl Operation for RecordVisit {
    type Output = i64;
}

struct RecordVisitHandler;

impl OperationHandler<RecordVisit> for RecordVisitHandler {
    fn dependencies() -> Vec<UnitOfWorkType> {
        vec![UnitOfWorkType::of::<MasterDb>(), UnitOfWorkType::of::<AppDb>()]
    }

    fn handle<'a>(&'a self, scope: &'a CallScope, op: RecordVisit) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let app = scope.unit_of_work::<AppDb>()?;
            let tenant_id = app
                .handle()
                .await?
                .tenant_id()
                .unwrap_or_default()
                .to_string();

            if let Ok(master) = scope.unit_of_work::<MasterDb>() {
                let handle = master.handle().await?;
                let live: i64 = handle
                    .with_connection(|conn| {
                        Ok(conn.query_row(
                            "SELECT COUNT(*) FROM tenants WHERE deleted_at IS NULL",
                            [],
                            |row| row.get(0),
                        )?)
                    })
                    .await?;
                assert!(live > 0);
                if op.audit {
                    let tenant_id = tenant_id.clone();
                    handle
                        .with_connection(move |conn| {
                            conn.execute(
                                "INSERT INTO tenant_audit_log (action, tenant_id, actor) VALUES ('visit', ?1, 'scenario')",
                                [tenant_id],
                            )?;
                            Ok(())
                        })
                        .await?;
                }
            }

            let notes = app.repository::<Note>().await?;
            notes.add(&Note::new(op.id, &format!("visit to {}", tenant_id)));
            if op.duplicate_note {
                notes.add(&Note::new(op.id, "again"));
            }
            tokio::time::sleep(op.hold).await;
            Ok(op.id)
        })
    }
}

struct AccountsModule;

impl HandlerModule for AccountsModule {
    fn name(&self) -> &str {
        "accounts"
    }

    fn register(&self, builder: &mut ModuleBuilder) -> Result<()> {
        builder
            .handler::<RegisterUser, _>(RegisterUserHandler)
            .handler::<SlowImport, _>(SlowImportHandler)
            .handler::<RecordVisit, _>(RecordVisitHandler);
        Ok(())
    }
}

fn router(registry: &TestRegistry) -> TenantRouter {
    router_with(registry, registry.config())
}

fn router_with(registry: &TestRegistry, config: RoutingConfig) -> TenantRouter {
    TenantRouter::builder(config)
        .module(Arc::new(AccountsModule))
        .clock(registry.clock().clone())
        .build()
        .unwrap()
}

fn count(registry: &TestRegistry, tenant: &str, role: &str, table: &str) -> i64 {
    registry
        .tenant_connection(tenant, role)
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

fn visits(registry: &TestRegistry, tenant: &str) -> i64 {
    registry
        .master_connection()
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM tenant_audit_log WHERE action = 'visit' AND tenant_id = ?1",
            [tenant],
            |row| row.get(0),
        )
        .unwrap()
}

#[tokio::test]
async fn test_happy_path_commits_both_tenant_databases() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let scope = router
        .request_scope(registry.principal_for("user-1", "acme").unwrap())
        .unwrap();
    let id = router
        .dispatch(
            &scope,
            RegisterUser {
                id: 1,
                email: "ada@acme.test",
                reject: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(id, 1);
    scope.end();

    assert_eq!(count(&registry, "acme", "app", "notes"), 1);
    assert_eq!(count(&registry, "acme", "identity", "users"), 1);
}

#[tokio::test]
async fn test_failure_mid_operation_rolls_back_every_database() {
    let (logs, _guard) = LogCapture::install();
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let scope = router
        .request_scope(registry.principal_for("user-1", "acme").unwrap())
        .unwrap();
    let err = router
        .dispatch(
            &scope,
            RegisterUser {
                id: 1,
                email: "mallory@acme.test",
                reject: true,
            },
        )
        .await
        .unwrap_err();
    match err {
        TenancyError::ValidationError(message) => {
            assert_eq!(message, "mallory@acme.test is not allowed")
        }
        other => panic!("expected the handler's error, got {other:?}"),
    }
    scope.end();

    assert_eq!(count(&registry, "acme", "app", "notes"), 0);
    assert_eq!(count(&registry, "acme", "identity", "users"), 0);
    assert!(logs.lines_for(PARTIAL_COMMIT_TARGET).is_empty());
}

#[tokio::test]
async fn test_only_live_app_database_is_coordinated() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let scope = CallScope::for_principal(registry.principal_for("user-1", "acme").unwrap());
    scope
        .register_unit_of_work::<AppDb>(registry.app_factory())
        .unwrap();

    router
        .dispatch(
            &scope,
            RegisterUser {
                id: 7,
                email: "ada@acme.test",
                reject: false,
            },
        )
        .await
        .unwrap();
    scope.end();

    assert_eq!(count(&registry, "acme", "app", "notes"), 1);
    assert_eq!(count(&registry, "acme", "identity", "users"), 0);
}

#[tokio::test]
async fn test_inactive_tenant_is_unavailable() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("zeta")
        .inactive()
        .build(&registry)
        .await
        .unwrap();
    let router = router(&registry);

    let scope = router
        .request_scope(registry.principal_for("user-1", "zeta").unwrap())
        .unwrap();
    let err = router
        .dispatch(
            &scope,
            RegisterUser {
                id: 1,
                email: "ada@zeta.test",
                reject: false,
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_routing_error(), "unexpected error: {err:?}");
    assert!(!scope.unit_of_work::<AppDb>().unwrap().has_handle());
    assert_eq!(count(&registry, "zeta", "app", "notes"), 0);
}

#[tokio::test]
async fn test_missing_tenant_claim_is_unauthenticated() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let forged = Principal::new("intruder").with_claim(TENANT_CLAIM, "not-a-real-claim");
    let scope = router.request_scope(forged).unwrap();
    let err = router
        .dispatch(
            &scope,
            RegisterUser {
                id: 1,
                email: "x@acme.test",
                reject: false,
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_identity_error(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_cached_metadata_lives_for_ttl() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);
    let minute = Duration::from_secs(60);

    let app_path = |scope: &CallScope| {
        let unit = scope.unit_of_work::<AppDb>().unwrap();
        async move { unit.handle().await.unwrap().descriptor().path().to_string() }
    };

    let scope = router.background_scope(TenantContext::new("acme").unwrap()).unwrap();
    let original = app_path(&scope).await;

    registry.clock().advance(5 * minute);
    let moved = registry.root().join("acme-app-v2.db");
    registry
        .master_connection()
        .unwrap()
        .execute(
            "UPDATE tenants SET app_db = ?1 WHERE tenant_id = 'acme'",
            [moved.to_string_lossy().to_string()],
        )
        .unwrap();

    registry.clock().advance(5 * minute);
    let scope = router.background_scope(TenantContext::new("acme").unwrap()).unwrap();
    assert_eq!(app_path(&scope).await, original);

    registry.clock().advance(21 * minute);
    let scope = router.background_scope(TenantContext::new("acme").unwrap()).unwrap();
    assert_eq!(app_path(&scope).await, moved.to_string_lossy());
}

#[tokio::test]
async fn test_concurrent_scopes_keep_their_own_explicit_tenant() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    TestTenantBuilder::new("beta").build(&registry).await.unwrap();
    let router = Arc::new(router(&registry));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let router = router.clone();
            tokio::spawn(async move {
                let tenant = if i % 2 == 0 { "acme" } else { "beta" };
                let scope = router.anonymous_scope()?;
                scope.set_explicit_tenant(TenantContext::new(tenant)?);
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    assert_eq!(router.current_tenant(&scope)?.tenant_id(), tenant);
                }
                let handle = scope.unit_of_work::<AppDb>()?.handle().await?;
                assert_eq!(handle.tenant_id(), Some(tenant));
                scope.end();
                assert!(router.current_tenant(&scope).is_err());
                Ok::<_, TenancyError>(())
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_cancelled_scope_rolls_back_flushed_writes() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let scope = router.background_scope(TenantContext::new("acme").unwrap()).unwrap();
    let (result, ()) = tokio::join!(router.dispatch(&scope, SlowImport), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        scope.cancel();
    });
    assert!(matches!(result, Err(TenancyError::Cancelled(_))));
    scope.end();

    assert_eq!(count(&registry, "acme", "app", "notes"), 0);
}

#[tokio::test]
async fn test_master_and_app_commit_together() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let scope = router
        .request_scope(registry.principal_for("user-1", "acme").unwrap())
        .unwrap();
    router.attach_master(&scope).unwrap();
    let op = RecordVisit {
        audit: true,
        ..RecordVisit::new(3)
    };
    assert_eq!(router.dispatch(&scope, op).await.unwrap(), 3);
    scope.end();

    assert_eq!(visits(&registry, "acme"), 1);
    assert_eq!(count(&registry, "acme", "app", "notes"), 1);
}

#[tokio::test]
async fn test_unattached_master_is_skipped() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let scope = router
        .request_scope(registry.principal_for("user-1", "acme").unwrap())
        .unwrap();
    let op = RecordVisit {
        audit: true,
        ..RecordVisit::new(4)
    };
    router.dispatch(&scope, op).await.unwrap();
    assert!(scope.unit_of_work::<MasterDb>().is_err());
    scope.end();

    assert_eq!(visits(&registry, "acme"), 0);
    assert_eq!(count(&registry, "acme", "app", "notes"), 1);
}

#[tokio::test]
async fn test_app_commit_failure_after_master_commit_is_partial() {
    let (logs, _guard) = LogCapture::install();
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    let router = router(&registry);

    let scope = router.background_scope(TenantContext::new("acme").unwrap()).unwrap();
    router.attach_master(&scope).unwrap();
    let op = RecordVisit {
        audit: true,
        duplicate_note: true,
        ..RecordVisit::new(5)
    };
    let err = router.dispatch(&scope, op).await.unwrap_err();
    match err {
        TenancyError::PartialCommit {
            committed, failed, ..
        } => {
            assert_eq!(committed, vec!["MasterDb".to_string()]);
            assert_eq!(failed, "AppDb");
        }
        other => panic!("expected partial commit, got {other:?}"),
    }
    scope.end();

    // Master stays committed; the app database rolled back.
    assert_eq!(visits(&registry, "acme"), 1);
    assert_eq!(count(&registry, "acme", "app", "notes"), 0);

    let lines = logs.lines_for(PARTIAL_COMMIT_TARGET);
    assert_eq!(lines.len(), 1, "captured: {}", logs.contents());
    assert!(lines[0].contains("AppDb"));
}

async fn visit_with_master(router: &TenantRouter, tenant: &str, id: i64, delay: Duration) -> Result<i64> {
    tokio::time::sleep(delay).await;
    let scope = router.background_scope(TenantContext::new(tenant)?)?;
    router.attach_master(&scope)?;
    let op = RecordVisit {
        hold: Duration::from_millis(600),
        ..RecordVisit::new(id)
    };
    let result = router.dispatch(&scope, op).await;
    scope.end();
    result
}

#[tokio::test]
async fn test_master_participant_does_not_serialize_tenants() {
    let registry = TestRegistry::new().await.unwrap();
    TestTenantBuilder::new("acme").build(&registry).await.unwrap();
    TestTenantBuilder::new("beta").build(&registry).await.unwrap();
    let config = RoutingConfig {
        busy_timeout: Duration::from_millis(200),
        ..registry.config()
    };
    let router = router_with(&registry, config);

    let (acme, beta) = tokio::join!(
        visit_with_master(&router, "acme", 1, Duration::ZERO),
        visit_with_master(&router, "beta", 2, Duration::from_millis(100)),
    );
    assert_eq!(acme.unwrap(), 1);
    assert_eq!(beta.unwrap(), 2);

    assert_eq!(count(&registry, "acme", "app", "notes"), 1);
    assert_eq!(count(&registry, "beta", "app", "notes"), 1);
}
