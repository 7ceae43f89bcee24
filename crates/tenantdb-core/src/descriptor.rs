//! Connection descriptors.
//!
//! A descriptor carries everything needed to open a database handle without
//! touching the database. Accepted forms:
//!
//! - `sqlite:///var/tenants/acme/app.db?busy_timeout=2000&mode=ro`
//! - `file:///var/tenants/acme/app.db`
//! - `/var/tenants/acme/app.db` (bare path)
//! - `:memory:`

use crate::{validation, Result, TenancyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const IN_MEMORY: &str = ":memory:";

/// Parsed connection descriptor for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionDescriptor {
    path: String,
    /// `None` until set by `?busy_timeout=` or [`with_busy_timeout`](Self::with_busy_timeout).
    busy_timeout: Option<Duration>,
    read_only: bool,
}

impl ConnectionDescriptor {
    /// Create a read-write descriptor for a path with default settings.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;
        Ok(Self {
            path,
            busy_timeout: None,
            read_only: false,
        })
    }

    /// Parse a descriptor string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let rest = raw
            .strip_prefix("sqlite://")
            .or_else(|| raw.strip_prefix("file://"))
            .unwrap_or(raw);

        let mut parts = rest.splitn(2, '?');
        let path = parts.next().unwrap_or_default();
        let mut descriptor = Self::new(path)?;

        if let Some(query) = parts.next() {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    TenancyError::ValidationError(format!(
                        "Malformed descriptor parameter '{}'",
                        pair
                    ))
                })?;
                match key {
                    "busy_timeout" => {
                        let ms = value.parse::<u64>().map_err(|_| {
                            TenancyError::ValidationError(format!(
                                "busy_timeout must be milliseconds, got '{}'",
                                value
                            ))
                        })?;
                        descriptor.busy_timeout = Some(Duration::from_millis(ms));
                    }
                    "mode" => match value {
                        "ro" => descriptor.read_only = true,
                        "rw" => descriptor.read_only = false,
                        other => {
                            return Err(TenancyError::ValidationError(format!(
                                "Unknown descriptor mode '{}'",
                                other
                            )))
                        }
                    },
                    other => {
                        return Err(TenancyError::ValidationError(format!(
                            "Unknown descriptor parameter '{}'",
                            other
                        )))
                    }
                }
            }
        }

        Ok(descriptor)
    }

    /// Expand a template containing `{tenant_id}` (and optionally `{role}`).
    pub fn from_template(template: &str, tenant_id: &str, role: &str) -> Result<Self> {
        if !template.contains("{tenant_id}") {
            return Err(TenancyError::Configuration(
                "descriptor template must contain {tenant_id} placeholder".to_string(),
            ));
        }
        Self::parse(
            &template
                .replace("{tenant_id}", tenant_id)
                .replace("{role}", role),
        )
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    /// Use `timeout` unless the descriptor already names its own.
    pub fn or_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout.get_or_insert(timeout);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Effective busy timeout, [`DEFAULT_BUSY_TIMEOUT`] when unset.
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout.unwrap_or(DEFAULT_BUSY_TIMEOUT)
    }

    pub fn has_busy_timeout(&self) -> bool {
        self.busy_timeout.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY
    }

    fn validate_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(TenancyError::ValidationError(
                "Connection descriptor path cannot be empty".to_string(),
            ));
        }
        if path == IN_MEMORY {
            return Ok(());
        }
        validation::validate_descriptor_path(path)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sqlite://{}", self.path)?;
        let mut params = Vec::new();
        if let Some(timeout) = self.busy_timeout {
            params.push(format!("busy_timeout={}", timeout.as_millis()));
        }
        if self.read_only {
            params.push("mode=ro".to_string());
        }
        if !params.is_empty() {
            write!(f, "?{}", params.join("&"))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ConnectionDescriptor {
    type Err = TenancyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConnectionDescriptor {
    type Error = TenancyError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConnectionDescriptor> for String {
    fn from(value: ConnectionDescriptor) -> Self {
        value.to_string()
    }
}
