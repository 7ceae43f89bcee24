//! Tenant registry store.
//!
//! The registry lives in the master catalog and is the source of truth for
//! which tenants exist and where their databases are. Management operations
//! on [`SqliteTenantRegistry`] are the only code paths that create or mutate
//! tenant rows; each one writes an audit entry in the same transaction.

use crate::open_connection;
use crate::tenant::TenantContext;
use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tenantdb_core::{
    init_master_catalog, validation, ConnectionDescriptor, DatabaseRole, Result, TenancyError,
    Tenant,
};
use tracing::{debug, info};

/// Read access to tenant records.
///
/// Uses a manual boxed future so implementations can be stored as
/// `Arc<dyn TenantRegistry>` with explicit `Send` bounds.
pub trait TenantRegistry: Send + Sync {
    /// Look up a tenant by id, including inactive and deleted rows.
    fn find_tenant<'a>(
        &'a self,
        tenant_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Tenant>>> + Send + 'a>>;
}

/// Notified after a management operation changes a tenant.
pub trait RegistryObserver: Send + Sync {
    fn tenant_changed(&self, tenant_id: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTenantRequest {
    pub tenant_id: String,
    pub name: String,
    pub routing_key: String,
    /// App database descriptor; derived from the registry template when absent.
    #[serde(default)]
    pub app_db: Option<String>,
    /// Identity database descriptor; derived from the registry template when absent.
    #[serde(default)]
    pub identity_db: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub routing_key: Option<String>,
    pub app_db: Option<String>,
    pub identity_db: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub tenant_id: String,
    pub actor: Option<String>,
    pub details: Option<String>,
    pub request_id: Option<String>,
}

/// Who performed a management operation.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub actor: String,
    pub request_id: Option<String>,
}

impl AuditContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

const TENANT_COLUMNS: &str = "id, tenant_id, name, routing_key, app_db, identity_db, \
     is_active, is_deleted, created_at, updated_at, deactivated_at, deleted_at";

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        routing_key: row.get(3)?,
        app_db: row.get(4)?,
        identity_db: row.get(5)?,
        is_active: row.get(6)?,
        is_deleted: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deactivated_at: row.get(10)?,
        deleted_at: row.get(11)?,
    })
}

fn fetch_tenant(conn: &Connection, tenant_id: &str) -> Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            &format!("SELECT {} FROM tenants WHERE tenant_id = ?1", TENANT_COLUMNS),
            [tenant_id],
            row_to_tenant,
        )
        .optional()?;
    Ok(tenant)
}

fn fetch_live_tenant(conn: &Connection, tenant_id: &str) -> Result<Tenant> {
    match fetch_tenant(conn, tenant_id)? {
        Some(tenant) if !tenant.is_deleted => Ok(tenant),
        _ => Err(TenancyError::NotFound(format!("Tenant {}", tenant_id))),
    }
}

fn record_audit(
    conn: &Connection,
    action: &str,
    tenant_id: &str,
    details: Option<String>,
    audit: &AuditContext,
) -> Result<()> {
    conn.execute(
        "INSERT INTO tenant_audit_log (action, tenant_id, details, actor, request_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![action, tenant_id, details, audit.actor, audit.request_id],
    )?;
    Ok(())
}

/// Unique-index violations become `ConflictError`.
fn map_write_error(err: rusqlite::Error, context: &str) -> TenancyError {
    let is_constraint = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    );
    if is_constraint {
        TenancyError::ConflictError(format!("{}: {}", context, err))
    } else {
        TenancyError::Sqlite(err)
    }
}

fn validate_descriptor(raw: &str, role: DatabaseRole) -> Result<String> {
    ConnectionDescriptor::parse(raw)
        .map(|d| d.to_string())
        .map_err(|e| TenancyError::ValidationError(format!("{} descriptor: {}", role, e)))
}

/// Tenant registry backed by the master SQLite catalog.
pub struct SqliteTenantRegistry {
    master: ConnectionDescriptor,
    descriptor_template: Option<String>,
    observers: RwLock<Vec<Weak<dyn RegistryObserver>>>,
}

impl SqliteTenantRegistry {
    /// The master descriptor must point at a file; an in-memory master would
    /// be a fresh database on every operation.
    pub fn new(master: ConnectionDescriptor) -> Result<Self> {
        if master.is_in_memory() {
            return Err(TenancyError::Configuration(
                "master catalog cannot be an in-memory database".to_string(),
            ));
        }
        Ok(Self {
            master,
            descriptor_template: None,
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Template used to derive descriptors for tenants created without them.
    ///
    /// Must contain `{tenant_id}`; `{role}` expands to `app` or `identity`.
    pub fn with_descriptor_template(mut self, template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if !template.contains("{tenant_id}") {
            return Err(TenancyError::ValidationError(
                "descriptor template must contain {tenant_id} placeholder".to_string(),
            ));
        }
        self.descriptor_template = Some(template);
        Ok(self)
    }

    pub fn master(&self) -> &ConnectionDescriptor {
        &self.master
    }

    /// Register an observer. Held weakly; dropped observers are pruned.
    pub fn observe(&self, observer: &Arc<dyn RegistryObserver>) {
        self.observers.write().push(Arc::downgrade(observer));
    }

    fn notify(&self, tenant_id: &str) {
        let mut observers = self.observers.write();
        observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                observer.tenant_changed(tenant_id);
                true
            }
            None => false,
        });
    }

    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let master = self.master.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&master)?;
            f(&mut conn)
        })
        .await
        .map_err(TenancyError::join)?
    }

    /// Create or upgrade the master catalog schema.
    pub async fn initialize(&self) -> Result<usize> {
        let applied = self.run(|conn| init_master_catalog(conn)).await?;
        info!(master = %self.master, applied, "Initialized master catalog");
        Ok(applied)
    }

    fn derive_descriptor(
        &self,
        explicit: Option<String>,
        tenant_id: &str,
        role: DatabaseRole,
    ) -> Result<String> {
        if let Some(raw) = explicit {
            return validate_descriptor(&raw, role);
        }
        let template = self.descriptor_template.as_deref().ok_or_else(|| {
            TenancyError::ValidationError(format!(
                "{} descriptor required: no descriptor template configured",
                role
            ))
        })?;
        let role_name = match role {
            DatabaseRole::TenantIdentity => "identity",
            _ => "app",
        };
        Ok(ConnectionDescriptor::from_template(template, tenant_id, role_name)?.to_string())
    }

    pub async fn create_tenant(
        &self,
        req: CreateTenantRequest,
        audit: AuditContext,
    ) -> Result<Tenant> {
        let tenant_id = TenantContext::new(&req.tenant_id)?.into_tenant_id();
        validation::validate_tenant_name(&req.name)?;
        validation::validate_routing_key(&req.routing_key)?;
        let app_db = self.derive_descriptor(req.app_db, &tenant_id, DatabaseRole::TenantApp)?;
        let identity_db =
            self.derive_descriptor(req.identity_db, &tenant_id, DatabaseRole::TenantIdentity)?;

        let name = req.name;
        let routing_key = req.routing_key;
        let tid = tenant_id.clone();

        let tenant = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO tenants (tenant_id, name, routing_key, app_db, identity_db,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    rusqlite::params![tid, name, routing_key, app_db, identity_db, now],
                )
                .map_err(|e| map_write_error(e, "tenant id, name or routing key already in use"))?;
                record_audit(
                    &tx,
                    "create",
                    &tid,
                    Some(serde_json::json!({ "name": name, "routing_key": routing_key }).to_string()),
                    &audit,
                )?;
                let tenant = fetch_live_tenant(&tx, &tid)?;
                tx.commit()?;
                Ok(tenant)
            })
            .await?;

        info!(tenant_id = %tenant.tenant_id, routing_key = %tenant.routing_key, "Created tenant");
        Ok(tenant)
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| fetch_tenant(conn, &tenant_id)).await
    }

    /// Find a non-deleted tenant by routing key.
    pub async fn find_by_routing_key(&self, routing_key: &str) -> Result<Option<Tenant>> {
        let routing_key = routing_key.to_string();
        self.run(move |conn| {
            let tenant = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM tenants WHERE routing_key = ?1 AND is_deleted = 0",
                        TENANT_COLUMNS
                    ),
                    [&routing_key],
                    row_to_tenant,
                )
                .optional()?;
            Ok(tenant)
        })
        .await
    }

    pub async fn list_tenants(&self, include_deleted: bool) -> Result<Vec<Tenant>> {
        self.run(move |conn| {
            let sql = if include_deleted {
                format!("SELECT {} FROM tenants ORDER BY tenant_id", TENANT_COLUMNS)
            } else {
                format!(
                    "SELECT {} FROM tenants WHERE is_deleted = 0 ORDER BY tenant_id",
                    TENANT_COLUMNS
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let tenants = stmt
                .query_map([], row_to_tenant)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tenants)
        })
        .await
    }

    /// Update name, routing key or descriptors of a live tenant.
    pub async fn update_tenant(
        &self,
        tenant_id: &str,
        req: UpdateTenantRequest,
        audit: AuditContext,
    ) -> Result<Tenant> {
        if let Some(name) = &req.name {
            validation::validate_tenant_name(name)?;
        }
        if let Some(key) = &req.routing_key {
            validation::validate_routing_key(key)?;
        }
        let app_db = req
            .app_db
            .as_deref()
            .map(|raw| validate_descriptor(raw, DatabaseRole::TenantApp))
            .transpose()?;
        let identity_db = req
            .identity_db
            .as_deref()
            .map(|raw| validate_descriptor(raw, DatabaseRole::TenantIdentity))
            .transpose()?;

        let tid = tenant_id.to_string();
        let name = req.name;
        let routing_key = req.routing_key;

        let tenant = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx
                    .execute(
                        "UPDATE tenants SET
                            name = COALESCE(?2, name),
                            routing_key = COALESCE(?3, routing_key),
                            app_db = COALESCE(?4, app_db),
                            identity_db = COALESCE(?5, identity_db),
                            updated_at = ?6
                         WHERE tenant_id = ?1 AND is_deleted = 0",
                        rusqlite::params![tid, name, routing_key, app_db, identity_db, Utc::now()],
                    )
                    .map_err(|e| map_write_error(e, "name or routing key already in use"))?;
                if changed == 0 {
                    return Err(TenancyError::NotFound(format!("Tenant {}", tid)));
                }
                let details = serde_json::json!({
                    "name": name,
                    "routing_key": routing_key,
                    "app_db": app_db,
                    "identity_db": identity_db,
                });
                record_audit(&tx, "update", &tid, Some(details.to_string()), &audit)?;
                let tenant = fetch_live_tenant(&tx, &tid)?;
                tx.commit()?;
                Ok(tenant)
            })
            .await?;

        self.notify(tenant_id);
        info!(tenant_id = %tenant_id, "Updated tenant");
        Ok(tenant)
    }

    /// Deactivate a tenant. Routing to it stops once cached metadata expires
    /// or is invalidated.
    pub async fn deactivate_tenant(&self, tenant_id: &str, audit: AuditContext) -> Result<Tenant> {
        let tenant = self
            .set_active(tenant_id, false, audit)
            .await?;
        info!(tenant_id = %tenant_id, "Deactivated tenant");
        Ok(tenant)
    }

    pub async fn activate_tenant(&self, tenant_id: &str, audit: AuditContext) -> Result<Tenant> {
        let tenant = self.set_active(tenant_id, true, audit).await?;
        info!(tenant_id = %tenant_id, "Activated tenant");
        Ok(tenant)
    }

    async fn set_active(&self, tenant_id: &str, active: bool, audit: AuditContext) -> Result<Tenant> {
        let tid = tenant_id.to_string();
        let tenant = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let current = fetch_live_tenant(&tx, &tid)?;
                if current.is_active == active {
                    return Err(TenancyError::ValidationError(format!(
                        "Tenant {} is already {}",
                        tid,
                        if active { "active" } else { "inactive" }
                    )));
                }
                let now = Utc::now();
                let deactivated_at = if active { None } else { Some(now) };
                tx.execute(
                    "UPDATE tenants SET is_active = ?2, deactivated_at = ?3, updated_at = ?4
                     WHERE tenant_id = ?1",
                    rusqlite::params![tid, active, deactivated_at, now],
                )?;
                let action = if active { "activate" } else { "deactivate" };
                record_audit(&tx, action, &tid, None, &audit)?;
                let tenant = fetch_live_tenant(&tx, &tid)?;
                tx.commit()?;
                Ok(tenant)
            })
            .await?;

        self.notify(tenant_id);
        Ok(tenant)
    }

    /// Soft-delete a tenant, releasing its name and routing key.
    pub async fn delete_tenant(&self, tenant_id: &str, audit: AuditContext) -> Result<Tenant> {
        let tid = tenant_id.to_string();
        let tenant = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                fetch_live_tenant(&tx, &tid)?;
                let now = Utc::now();
                tx.execute(
                    "UPDATE tenants SET is_deleted = 1, is_active = 0, deleted_at = ?2, updated_at = ?2
                     WHERE tenant_id = ?1",
                    rusqlite::params![tid, now],
                )?;
                record_audit(&tx, "delete", &tid, None, &audit)?;
                let tenant = fetch_tenant(&tx, &tid)?
                    .ok_or_else(|| TenancyError::NotFound(format!("Tenant {}", tid)))?;
                tx.commit()?;
                Ok(tenant)
            })
            .await?;

        self.notify(tenant_id);
        info!(tenant_id = %tenant_id, "Deleted tenant");
        Ok(tenant)
    }

    /// Audit entries, newest first, optionally for one tenant.
    pub async fn get_audit_log(
        &self,
        tenant_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>> {
        let tenant_id = tenant_id.map(String::from);
        let limit = limit as i64;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, action, tenant_id, actor, details, request_id
                 FROM tenant_audit_log
                 WHERE ?1 IS NULL OR tenant_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(rusqlite::params![tenant_id, limit], |row| {
                    Ok(AuditLogEntry {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        action: row.get(2)?,
                        tenant_id: row.get(3)?,
                        actor: row.get(4)?,
                        details: row.get(5)?,
                        request_id: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

impl TenantRegistry for SqliteTenantRegistry {
    fn find_tenant<'a>(
        &'a self,
        tenant_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Tenant>>> + Send + 'a>> {
        Box::pin(async move {
            let tenant = self.get_tenant(tenant_id).await?;
            debug!(tenant_id = %tenant_id, found = tenant.is_some(), "Registry lookup");
            Ok(tenant)
        })
    }
}
