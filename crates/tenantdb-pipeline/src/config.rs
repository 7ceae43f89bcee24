//! Routing configuration.

use std::sync::Arc;
use std::time::Duration;
use tenantdb_core::descriptor::DEFAULT_BUSY_TIMEOUT;
use tenantdb_core::{ConnectionDescriptor, Result, TenancyError};
use tenantdb_storage::cache::DEFAULT_TENANT_CACHE_TTL;
use tenantdb_storage::{AesGcmEncryption, EncryptionService};

/// Configuration for a [`TenantRouter`](crate::TenantRouter).
#[derive(Clone)]
pub struct RoutingConfig {
    /// Master catalog descriptor
    pub master_db: String,
    /// How long tenant metadata stays cached
    pub tenant_cache_ttl: Duration,
    /// Base64 AES-256 key for tenant claims
    pub claim_key: Option<String>,
    /// Descriptor template for tenants created without descriptors (must contain {tenant_id})
    pub tenant_db_template: Option<String>,
    /// Master busy timeout when `master_db` has no `?busy_timeout=`
    pub busy_timeout: Duration,
}

impl std::fmt::Debug for RoutingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingConfig")
            .field("master_db", &self.master_db)
            .field("tenant_cache_ttl", &self.tenant_cache_ttl)
            .field("claim_key", &self.claim_key.as_ref().map(|_| "<redacted>"))
            .field("tenant_db_template", &self.tenant_db_template)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            master_db: "master.db".to_string(),
            tenant_cache_ttl: DEFAULT_TENANT_CACHE_TTL,
            claim_key: None,
            tenant_db_template: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl RoutingConfig {
    /// Create config from environment variables.
    ///
    /// Reads:
    /// - `TENANTDB_MASTER_DB`: master catalog descriptor (default: master.db)
    /// - `TENANTDB_TENANT_CACHE_TTL_SECS`: metadata TTL (default: 1800)
    /// - `TENANTDB_CLAIM_KEY`: base64 32-byte claim key
    /// - `TENANTDB_TENANT_DB_TEMPLATE`: descriptor template with {tenant_id} and {role}
    /// - `TENANTDB_BUSY_TIMEOUT_MS`: master busy timeout unless the descriptor sets one (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let master_db = std::env::var("TENANTDB_MASTER_DB").unwrap_or(defaults.master_db);

        let tenant_cache_ttl = std::env::var("TENANTDB_TENANT_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.tenant_cache_ttl);

        let claim_key = std::env::var("TENANTDB_CLAIM_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let tenant_db_template = std::env::var("TENANTDB_TENANT_DB_TEMPLATE")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let busy_timeout = std::env::var("TENANTDB_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.busy_timeout);

        Self {
            master_db,
            tenant_cache_ttl,
            claim_key,
            tenant_db_template,
            busy_timeout,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let master = self.master_descriptor()?;
        if master.is_in_memory() {
            return Err(TenancyError::Configuration(
                "TENANTDB_MASTER_DB cannot be an in-memory database".into(),
            ));
        }
        if self.tenant_cache_ttl.is_zero() {
            return Err(TenancyError::Configuration(
                "TENANTDB_TENANT_CACHE_TTL_SECS must be greater than zero".into(),
            ));
        }
        if let Some(template) = &self.tenant_db_template {
            if !template.contains("{tenant_id}") {
                return Err(TenancyError::Configuration(
                    "TENANTDB_TENANT_DB_TEMPLATE must contain {tenant_id}".into(),
                ));
            }
        }
        if self.claim_key.is_some() {
            self.encryption()?;
        }
        Ok(())
    }

    pub fn master_descriptor(&self) -> Result<ConnectionDescriptor> {
        ConnectionDescriptor::parse(&self.master_db)
            .map(|d| d.or_busy_timeout(self.busy_timeout))
            .map_err(|e| TenancyError::Configuration(format!("TENANTDB_MASTER_DB: {}", e)))
    }

    /// Claim encryption from `claim_key`.
    pub fn encryption(&self) -> Result<Arc<dyn EncryptionService>> {
        let key = self.claim_key.as_deref().ok_or_else(|| {
            TenancyError::Configuration("TENANTDB_CLAIM_KEY is not set".into())
        })?;
        Ok(Arc::new(AesGcmEncryption::from_base64_key(key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_without_claim_key() {
        let config = RoutingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tenant_cache_ttl, Duration::from_secs(1800));
        assert!(config.encryption().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let in_memory = RoutingConfig {
            master_db: ":memory:".into(),
            ..Default::default()
        };
        assert!(in_memory.validate().is_err());

        let template = RoutingConfig {
            tenant_db_template: Some("/var/tenants/app.db".into()),
            ..Default::default()
        };
        assert!(template.validate().is_err());

        let zero_ttl = RoutingConfig {
            tenant_cache_ttl: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_ttl.validate().is_err());

        let short_key = RoutingConfig {
            claim_key: Some("c2hvcnQ=".into()),
            ..Default::default()
        };
        assert!(short_key.validate().is_err());
    }

    #[test]
    fn test_master_descriptor_applies_busy_timeout() {
        let config = RoutingConfig {
            master_db: "sqlite:///var/tenantdb/master.db".into(),
            busy_timeout: Duration::from_millis(750),
            ..Default::default()
        };
        let descriptor = config.master_descriptor().unwrap();
        assert_eq!(descriptor.path(), "/var/tenantdb/master.db");
        assert_eq!(descriptor.busy_timeout(), Duration::from_millis(750));
    }

    #[test]
    fn test_master_descriptor_keeps_its_own_busy_timeout() {
        let config = RoutingConfig {
            master_db: "sqlite:///var/tenantdb/master.db?busy_timeout=2500".into(),
            busy_timeout: Duration::from_millis(750),
            ..Default::default()
        };
        let descriptor = config.master_descriptor().unwrap();
        assert_eq!(descriptor.busy_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_encryption_from_generated_key() {
        let config = RoutingConfig {
            claim_key: Some(AesGcmEncryption::generate_key().unwrap()),
            ..Default::default()
        };
        config.validate().unwrap();
        let encryption = config.encryption().unwrap();
        let sealed = encryption.encrypt("acme").unwrap();
        assert_eq!(encryption.decrypt(&sealed).unwrap(), "acme");

        assert!(format!("{:?}", config).contains("<redacted>"));
    }
}
