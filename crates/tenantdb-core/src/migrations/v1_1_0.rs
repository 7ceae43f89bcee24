//! Migration v1.1.0: registry audit log and deactivation timestamps.

use super::{Migration, SchemaVersion, Step};

pub const MIGRATION: Migration = Migration {
    version: SchemaVersion::new(1, 1, 0),
    description: "Registry audit log",
    steps: &[
        Step::Sql(SQL),
        Step::AddColumn {
            table: "tenants",
            column: "deactivated_at",
            decl: "TEXT",
        },
    ],
};

const SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
    action TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    details TEXT,
    actor TEXT,
    request_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_tenant_audit_log_tenant
    ON tenant_audit_log(tenant_id, timestamp);
"#;
