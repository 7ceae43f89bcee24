//! Tenant metadata cache.
//!
//! Sits in front of the [`TenantRegistry`] so routing a call does not hit the
//! master catalog every time.
//!
//! ## Invalidation
//!
//! - **TTL expiration**: entries older than the TTL (default 30 minutes) are
//!   treated as absent and re-read on the next lookup
//! - **Explicit**: [`invalidate`](TenantMetadataCache::invalidate) and
//!   [`clear`](TenantMetadataCache::clear), also driven by registry change
//!   notifications when the cache is registered as an observer
//!
//! Unknown, inactive and deleted tenants are never cached.

use crate::registry::{RegistryObserver, TenantRegistry};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenantdb_core::{ConnectionDescriptor, DatabaseRole, Result, TenancyError};
use tracing::debug;

/// Default time-to-live for cached tenant metadata.
pub const DEFAULT_TENANT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Time source for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }
}

/// Routing-relevant view of an operational tenant.
#[derive(Debug, Clone)]
pub struct TenantMetadata {
    pub tenant_id: String,
    pub app_db: ConnectionDescriptor,
    pub identity_db: ConnectionDescriptor,
    pub is_active: bool,
    pub cached_at: Instant,
}

impl TenantMetadata {
    pub fn descriptor(&self, role: DatabaseRole) -> Option<&ConnectionDescriptor> {
        match role {
            DatabaseRole::Master => None,
            DatabaseRole::TenantApp => Some(&self.app_db),
            DatabaseRole::TenantIdentity => Some(&self.identity_db),
        }
    }
}

pub struct TenantMetadataCache {
    registry: Arc<dyn TenantRegistry>,
    entries: DashMap<String, TenantMetadata>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TenantMetadataCache {
    pub fn new(registry: Arc<dyn TenantRegistry>, ttl: Duration) -> Self {
        Self::with_clock(registry, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(registry: Arc<dyn TenantRegistry>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Metadata for an operational tenant.
    ///
    /// # Errors
    ///
    /// `TenantUnavailable` if the tenant is unknown, inactive or deleted.
    /// `Configuration` if the registry holds an unparseable descriptor.
    pub async fn get_tenant(&self, tenant_id: &str) -> Result<TenantMetadata> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(tenant_id) {
            if now.saturating_duration_since(entry.cached_at) < self.ttl {
                debug!(tenant_id = %tenant_id, "Tenant metadata cache hit");
                #[cfg(feature = "metrics")]
                crate::metrics::record_cache_lookup("hit");
                return Ok(entry.clone());
            }
            debug!(tenant_id = %tenant_id, "Tenant metadata cache entry expired");
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_cache_lookup("miss");

        let tenant = match self.registry.find_tenant(tenant_id).await? {
            Some(tenant) if tenant.is_operational() => tenant,
            Some(_) | None => {
                self.entries.remove(tenant_id);
                debug!(tenant_id = %tenant_id, "Tenant unknown or not operational");
                return Err(TenancyError::TenantUnavailable(tenant_id.to_string()));
            }
        };

        let parse = |raw: &str, role: DatabaseRole| {
            ConnectionDescriptor::parse(raw).map_err(|e| {
                TenancyError::Configuration(format!(
                    "tenant {} has an invalid {} descriptor: {}",
                    tenant_id, role, e
                ))
            })
        };

        let metadata = TenantMetadata {
            tenant_id: tenant.tenant_id.clone(),
            app_db: parse(&tenant.app_db, DatabaseRole::TenantApp)?,
            identity_db: parse(&tenant.identity_db, DatabaseRole::TenantIdentity)?,
            is_active: tenant.is_active,
            cached_at: self.clock.now(),
        };

        // Concurrent misses both insert; last fresh read wins.
        self.entries
            .insert(tenant_id.to_string(), metadata.clone());
        debug!(tenant_id = %tenant_id, ttl_secs = self.ttl.as_secs(), "Cached tenant metadata");
        Ok(metadata)
    }

    pub fn invalidate(&self, tenant_id: &str) -> bool {
        self.entries.remove(tenant_id).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RegistryObserver for TenantMetadataCache {
    fn tenant_changed(&self, tenant_id: &str) {
        if self.invalidate(tenant_id) {
            debug!(tenant_id = %tenant_id, "Invalidated tenant metadata after registry change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tenantdb_core::Tenant;

    #[derive(Default)]
    struct MapRegistry {
        tenants: Mutex<HashMap<String, Tenant>>,
        lookups: AtomicUsize,
    }

    impl MapRegistry {
        fn put(&self, id: &str, app_db: &str, active: bool) {
            let now = Utc::now();
            self.tenants.lock().insert(
                id.to_string(),
                Tenant {
                    id: 1,
                    tenant_id: id.to_string(),
                    name: id.to_string(),
                    routing_key: id.to_string(),
                    app_db: app_db.to_string(),
                    identity_db: format!("/data/{}/identity.db", id),
                    is_active: active,
                    is_deleted: false,
                    created_at: now,
                    updated_at: now,
                    deactivated_at: None,
                    deleted_at: None,
                },
            );
        }
    }

    impl TenantRegistry for MapRegistry {
        fn find_tenant<'a>(
            &'a self,
            tenant_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Tenant>>> + Send + 'a>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let tenant = self.tenants.lock().get(tenant_id).cloned();
            Box::pin(async move { Ok(tenant) })
        }
    }

    fn cache(registry: &Arc<MapRegistry>, clock: &Arc<ManualClock>) -> TenantMetadataCache {
        TenantMetadataCache::with_clock(
            registry.clone(),
            DEFAULT_TENANT_CACHE_TTL,
            clock.clone(),
        )
    }

    #[tokio::test]
    async fn test_hit_avoids_registry() {
        let registry = Arc::new(MapRegistry::default());
        registry.put("acme", "/data/acme/app.db", true);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&registry, &clock);

        let first = cache.get_tenant("acme").await.unwrap();
        let second = cache.get_tenant("acme").await.unwrap();
        assert_eq!(first.app_db, second.app_db);
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_picks_up_registry_change() {
        let registry = Arc::new(MapRegistry::default());
        registry.put("acme", "/data/acme/app.db", true);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&registry, &clock);

        cache.get_tenant("acme").await.unwrap();

        clock.advance(Duration::from_secs(5 * 60));
        registry.put("acme", "/data/acme/app-v2.db", true);

        clock.advance(Duration::from_secs(5 * 60));
        let stale = cache.get_tenant("acme").await.unwrap();
        assert_eq!(stale.app_db.path(), "/data/acme/app.db");

        clock.advance(Duration::from_secs(21 * 60));
        let fresh = cache.get_tenant("acme").await.unwrap();
        assert_eq!(fresh.app_db.path(), "/data/acme/app-v2.db");
    }

    #[tokio::test]
    async fn test_inactive_and_unknown_tenants_not_cached() {
        let registry = Arc::new(MapRegistry::default());
        registry.put("zeta", "/data/zeta/app.db", false);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&registry, &clock);

        for _ in 0..2 {
            let err = cache.get_tenant("zeta").await.unwrap_err();
            assert!(err.is_routing_error());
            assert!(cache.get_tenant("ghost").await.is_err());
        }
        assert!(cache.is_empty());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_expired_entry_dropped_when_tenant_deactivated() {
        let registry = Arc::new(MapRegistry::default());
        registry.put("acme", "/data/acme/app.db", true);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&registry, &clock);

        cache.get_tenant("acme").await.unwrap();
        registry.put("acme", "/data/acme/app.db", false);
        clock.advance(DEFAULT_TENANT_CACHE_TTL);

        assert!(cache.get_tenant("acme").await.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_and_observer() {
        let registry = Arc::new(MapRegistry::default());
        registry.put("acme", "/data/acme/app.db", true);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&registry, &clock);

        cache.get_tenant("acme").await.unwrap();
        assert!(cache.invalidate("acme"));
        assert!(!cache.invalidate("acme"));

        cache.get_tenant("acme").await.unwrap();
        cache.tenant_changed("acme");
        assert!(cache.is_empty());

        cache.get_tenant("acme").await.unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_configuration_error() {
        let registry = Arc::new(MapRegistry::default());
        registry.put("acme", "/data/../acme/app.db", true);
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&registry, &clock);

        let err = cache.get_tenant("acme").await.unwrap_err();
        assert!(matches!(err, TenancyError::Configuration(_)));
    }

    #[test]
    fn test_metadata_descriptor_by_role() {
        let metadata = TenantMetadata {
            tenant_id: "acme".to_string(),
            app_db: ConnectionDescriptor::parse("/a/app.db").unwrap(),
            identity_db: ConnectionDescriptor::parse("/a/identity.db").unwrap(),
            is_active: true,
            cached_at: Instant::now(),
        };
        assert_eq!(
            metadata.descriptor(DatabaseRole::TenantIdentity).unwrap().path(),
            "/a/identity.db"
        );
        assert!(metadata.descriptor(DatabaseRole::Master).is_none());
    }
}
