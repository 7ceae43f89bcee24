//! Migration v1.0.0: tenant registry.
//!
//! Name and routing key are unique among non-deleted tenants only, so a
//! soft-deleted tenant releases both for reuse.

use super::{Migration, SchemaVersion, Step};

pub const MIGRATION: Migration = Migration {
    version: SchemaVersion::new(1, 0, 0),
    description: "Tenant registry",
    steps: &[Step::Sql(SQL)],
};

const SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    app_db TEXT NOT NULL,
    identity_db TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    deleted_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_name_live
    ON tenants(name) WHERE is_deleted = 0;

CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_routing_key_live
    ON tenants(routing_key) WHERE is_deleted = 0;

CREATE INDEX IF NOT EXISTS idx_tenants_active
    ON tenants(is_active, is_deleted);
"#;
