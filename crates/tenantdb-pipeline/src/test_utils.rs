//! Test Utilities Module
//!
//! Shared fixtures for unit and integration tests. Enable via the
//! `test-utils` feature flag.
//!
//! # Features
//!
//! - `TestRegistry`: master catalog and tenant databases in a temporary directory
//! - `TestTenantBuilder`: registers a tenant and creates its schemas
//! - `Note` and `User` entities for the app and identity databases
//! - `RecordingUnit` and `EventLog` for observing coordinator behavior
//! - `CountingFactory` and `FnModule` fakes
//! - `LogCapture` for asserting on emitted log lines
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantdb_pipeline::test_utils::{TestRegistry, TestTenantBuilder};
//!
//! #[tokio::test]
//! async fn test_tenant_creation() {
//!     let registry = TestRegistry::new().await.unwrap();
//!     let tenant = TestTenantBuilder::new("acme").build(&registry).await.unwrap();
//!     assert!(tenant.is_operational());
//! }
//! ```

use crate::config::RoutingConfig;
use crate::descriptors::{HandlerModule, ModuleBuilder};
use crate::repository::Entity;
use crate::unit_of_work::TransactionalUnit;
use crate::BoxFuture;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tenantdb_core::{ConnectionDescriptor, DatabaseRole, Result, TenancyError, Tenant};
use tenantdb_storage::cache::DEFAULT_TENANT_CACHE_TTL;
use tenantdb_storage::identity::TENANT_CLAIM;
use tenantdb_storage::{
    AesGcmEncryption, AuditContext, ContextFactory, CreateTenantRequest, DatabaseHandle,
    EncryptionService, IdentityContext, ManualClock, MasterContextFactory, Principal,
    RegistryObserver, SqliteTenantRegistry, TenantClaimIssuer, TenantContext,
    TenantContextFactory, TenantIdentityResolver, TenantMetadataCache, TenantRegistry,
};

/// Schema created in every test tenant's app database.
pub const APP_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);";

/// Schema created in every test tenant's identity database.
pub const IDENTITY_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE);";

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: i64,
    pub body: String,
}

impl Note {
    pub fn new(id: i64, body: &str) -> Self {
        Self {
            id,
            body: body.to_string(),
        }
    }
}

impl Entity for Note {
    const TABLE: &'static str = "notes";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["body"];

    fn key(&self) -> Value {
        Value::Integer(self.id)
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Text(self.body.clone())]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            body: row.get(1)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub email: String,
}

impl User {
    pub fn new(id: i64, email: &str) -> Self {
        Self {
            id,
            email: email.to_string(),
        }
    }
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["email"];

    fn key(&self) -> Value {
        Value::Integer(self.id)
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Text(self.email.clone())]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
        })
    }
}

// ============================================================================
// Registry Infrastructure
// ============================================================================

/// Master catalog plus tenant databases in a temporary directory.
///
/// Tenant descriptors come from `{dir}/{tenant_id}-{role}.db`. The metadata
/// cache runs on a [`ManualClock`] and observes registry changes.
pub struct TestRegistry {
    _temp_dir: TempDir,
    root: PathBuf,
    claim_key: String,
    encryption: Arc<dyn EncryptionService>,
    registry: Arc<SqliteTenantRegistry>,
    cache: Arc<TenantMetadataCache>,
    clock: Arc<ManualClock>,
    master_factory: Arc<dyn ContextFactory>,
    app_factory: Arc<dyn ContextFactory>,
    identity_factory: Arc<dyn ContextFactory>,
}

impl TestRegistry {
    pub async fn new() -> Result<Self> {
        Self::with_ttl(DEFAULT_TENANT_CACHE_TTL).await
    }

    pub async fn with_ttl(ttl: Duration) -> Result<Self> {
        let temp_dir = tempdir()
            .map_err(|e| TenancyError::Other(format!("Failed to create temp dir: {}", e)))?;
        let root = temp_dir.path().to_path_buf();

        let master = ConnectionDescriptor::new(root.join("master.db").to_string_lossy().to_string())?;
        let registry = Arc::new(
            SqliteTenantRegistry::new(master.clone())?.with_descriptor_template(Self::template(&root))?,
        );
        registry.initialize().await?;

        let claim_key = AesGcmEncryption::generate_key()?;
        let encryption: Arc<dyn EncryptionService> =
            Arc::new(AesGcmEncryption::from_base64_key(&claim_key)?);

        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(TenantMetadataCache::with_clock(
            registry.clone() as Arc<dyn TenantRegistry>,
            ttl,
            clock.clone(),
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
            resolver,
            cache.clone(),
        )?);

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            claim_key,
            encryption,
            registry,
            cache,
            clock,
            master_factory: Arc::new(MasterContextFactory::new(master)),
            app_factory,
            identity_factory,
        })
    }

    fn template(root: &Path) -> String {
        format!("{}/{{tenant_id}}-{{role}}.db", root.to_string_lossy())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_path(&self) -> PathBuf {
        self.root.join("master.db")
    }

    pub fn registry(&self) -> &Arc<SqliteTenantRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<TenantMetadataCache> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn encryption(&self) -> Arc<dyn EncryptionService> {
        self.encryption.clone()
    }

    pub fn master_factory(&self) -> Arc<dyn ContextFactory> {
        self.master_factory.clone()
    }

    pub fn app_factory(&self) -> Arc<dyn ContextFactory> {
        self.app_factory.clone()
    }

    pub fn identity_factory(&self) -> Arc<dyn ContextFactory> {
        self.identity_factory.clone()
    }

    /// Routing config pointing at this registry's files and claim key.
    pub fn config(&self) -> RoutingConfig {
        RoutingConfig {
            master_db: self.master_path().to_string_lossy().to_string(),
            claim_key: Some(self.claim_key.clone()),
            tenant_db_template: Some(Self::template(&self.root)),
            ..Default::default()
        }
    }

    /// A principal carrying an encrypted claim for `tenant_id`.
    pub fn principal_for(&self, subject: &str, tenant_id: &str) -> Result<Principal> {
        let claim = TenantClaimIssuer::new(self.encryption()).issue(&TenantContext::new(tenant_id)?)?;
        Ok(Principal::new(subject).with_claim(TENANT_CLAIM, claim))
    }

    /// Open the master catalog directly, bypassing the registry and its
    /// change notifications.
    pub fn master_connection(&self) -> Result<Connection> {
        Ok(Connection::open(self.master_path())?)
    }

    /// Open a tenant database directly.
    pub fn tenant_connection(&self, tenant_id: &str, role: &str) -> Result<Connection> {
        Ok(Connection::open(self.root.join(format!("{}-{}.db", tenant_id, role)))?)
    }
}

/// Builder for registering test tenants.
pub struct TestTenantBuilder {
    tenant_id: String,
    name: Option<String>,
    routing_key: Option<String>,
    active: bool,
}

impl TestTenantBuilder {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            name: None,
            routing_key: None,
            active: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Register the tenant and create its app and identity schemas.
    pub async fn build(self, registry: &TestRegistry) -> Result<Tenant> {
        let audit = AuditContext::new("test");
        let tenant = registry
            .registry()
            .create_tenant(
                CreateTenantRequest {
                    name: self
                        .name
                        .unwrap_or_else(|| format!("Test Tenant {}", self.tenant_id)),
                    routing_key: self
                        .routing_key
                        .unwrap_or_else(|| self.tenant_id.replace('_', "-")),
                    tenant_id: self.tenant_id,
                    app_db: None,
                    identity_db: None,
                },
                audit.clone(),
            )
            .await?;

        for (raw, schema) in [(&tenant.app_db, APP_SCHEMA), (&tenant.identity_db, IDENTITY_SCHEMA)] {
            let descriptor = ConnectionDescriptor::parse(raw)?;
            Connection::open(descriptor.path())?.execute_batch(schema)?;
        }

        if self.active {
            Ok(tenant)
        } else {
            registry
                .registry()
                .deactivate_tenant(&tenant.tenant_id, audit)
                .await
        }
    }
}

// ============================================================================
// Fakes
// ============================================================================

/// Shared, ordered record of events.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Transactional unit that records `name:begin`, `name:commit`,
/// `name:rollback` and `name:dispose`.
///
/// Rollback is only recorded while a transaction is open. `Tag` makes
/// distinct types for the scope container.
pub struct RecordingUnit<Tag> {
    name: &'static str,
    log: EventLog,
    transacting: AtomicBool,
    disposed: AtomicBool,
    fail_begin: bool,
    fail_commit: bool,
    fail_rollback: bool,
    commit_delay: Option<Duration>,
    _tag: PhantomData<fn() -> Tag>,
}

impl<Tag> RecordingUnit<Tag> {
    pub fn new(name: &'static str, log: EventLog) -> Self {
        Self {
            name,
            log,
            transacting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            fail_begin: false,
            fail_commit: false,
            fail_rollback: false,
            commit_delay: None,
            _tag: PhantomData,
        }
    }

    pub fn failing_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    /// Sleep for `delay` inside commit, after recording it.
    pub fn slow_commit(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    pub fn is_transacting(&self) -> bool {
        self.transacting.load(Ordering::SeqCst)
    }

    fn fail(&self, step: &str) -> Result<()> {
        Err(TenancyError::Other(format!("{} {} failed", self.name, step)))
    }
}

impl<Tag: 'static> TransactionalUnit for RecordingUnit<Tag> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn begin_transaction(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.log.push(format!("{}:begin", self.name));
            if self.fail_begin {
                return self.fail("begin");
            }
            self.transacting.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn commit_transaction(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.log.push(format!("{}:commit", self.name));
            if let Some(delay) = self.commit_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_commit {
                return self.fail("commit");
            }
            self.transacting.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn rollback_transaction(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.transacting.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            self.log.push(format!("{}:rollback", self.name));
            if self.fail_rollback {
                return self.fail("rollback");
            }
            Ok(())
        })
    }

    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.log.push(format!("{}:dispose", self.name));
        true
    }
}

/// Factory wrapper counting `create` calls.
pub struct CountingFactory {
    inner: Arc<dyn ContextFactory>,
    calls: AtomicUsize,
}

impl CountingFactory {
    pub fn new(inner: Arc<dyn ContextFactory>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContextFactory for CountingFactory {
    fn role(&self) -> DatabaseRole {
        self.inner.role()
    }

    fn create<'a>(
        &'a self,
        identity: &'a IdentityContext,
    ) -> Pin<Box<dyn Future<Output = Result<DatabaseHandle>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create(identity)
    }
}

type RegisterFn = dyn Fn(&mut ModuleBuilder) -> Result<()> + Send + Sync;

/// Handler module built from a closure. Counts how often it is loaded.
pub struct FnModule {
    name: String,
    register: Box<RegisterFn>,
    loads: AtomicUsize,
}

impl FnModule {
    pub fn new(
        name: impl Into<String>,
        register: impl Fn(&mut ModuleBuilder) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            register: Box::new(register),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl HandlerModule for FnModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, builder: &mut ModuleBuilder) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        (self.register)(builder)
    }
}

// ============================================================================
// Log Capture
// ============================================================================

/// Formatted `tracing` output collected in memory.
///
/// [`install`](Self::install) sets a thread-local subscriber, so events are
/// captured from the current thread only. Use it with the current-thread
/// `#[tokio::test]` runtime.
#[derive(Debug, Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Start capturing. Capture stops when the guard drops.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Captured lines emitted under `target`.
    pub fn lines_for(&self, target: &str) -> Vec<String> {
        let marker = format!(" {}: ", target);
        self.contents()
            .lines()
            .filter(|line| line.contains(&marker))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
