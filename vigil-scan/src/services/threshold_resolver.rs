//! Threshold Resolver
//!
//! Priority chain: account override > service default > global. The global
//! row is read through an injected cache that is refreshed on miss and
//! dropped on every global write; when no global row exists the compiled
//! default applies.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use vigil_common::Tier;

use crate::db;
use crate::db::thresholds::GLOBAL_SCOPE_ID;
use crate::error::{ScanError, ScanResult};
use crate::models::{ResolvedThresholds, ThresholdConfig, ThresholdSource};

/// Process-wide cache of the global threshold row
///
/// Cloned handles share one slot. Recomputable from the database at any time.
#[derive(Debug, Clone, Default)]
pub struct GlobalThresholdCache {
    slot: Arc<RwLock<Option<ThresholdConfig>>>,
}

impl GlobalThresholdCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self) -> Option<ThresholdConfig> {
        *self.slot.read().await
    }

    async fn put(&self, config: ThresholdConfig) {
        *self.slot.write().await = Some(config);
    }

    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}

#[derive(Clone)]
pub struct ThresholdResolver {
    db: SqlitePool,
    global_cache: GlobalThresholdCache,
}

impl ThresholdResolver {
    pub fn new(db: SqlitePool, global_cache: GlobalThresholdCache) -> Self {
        Self { db, global_cache }
    }

    /// Effective thresholds for an account, optionally scoped to a service
    pub async fn resolve(&self, account_id: &str, service_id: Option<&str>) -> ScanResult<ResolvedThresholds> {
        if let Some(config) = db::thresholds::get_threshold(&self.db, ThresholdSource::User, account_id).await? {
            return Ok(ResolvedThresholds {
                config,
                source: ThresholdSource::User,
            });
        }

        if let Some(service_id) = service_id {
            if let Some(config) =
                db::thresholds::get_threshold(&self.db, ThresholdSource::Service, service_id).await?
            {
                return Ok(ResolvedThresholds {
                    config,
                    source: ThresholdSource::Service,
                });
            }
        }

        Ok(ResolvedThresholds {
            config: self.global().await?,
            source: ThresholdSource::Global,
        })
    }

    async fn global(&self) -> ScanResult<ThresholdConfig> {
        if let Some(config) = self.global_cache.get().await {
            return Ok(config);
        }

        let config = db::thresholds::get_threshold(&self.db, ThresholdSource::Global, GLOBAL_SCOPE_ID)
            .await?
            .unwrap_or(ThresholdConfig::DEFAULT);
        self.global_cache.put(config).await;
        Ok(config)
    }

    pub fn validate(config: &ThresholdConfig) -> ScanResult<()> {
        config.validate().map_err(ScanError::InvalidThreshold)
    }

    pub async fn set_account_override(&self, account_id: &str, config: ThresholdConfig) -> ScanResult<()> {
        Self::validate(&config)?;
        db::thresholds::put_threshold(&self.db, ThresholdSource::User, account_id, &config).await?;
        tracing::info!(account_id, high = config.high, medium = config.medium, low = config.low, "Account threshold override set");
        Ok(())
    }

    /// Returns whether an override existed
    pub async fn clear_account_override(&self, account_id: &str) -> ScanResult<bool> {
        Ok(db::thresholds::delete_threshold(&self.db, ThresholdSource::User, account_id).await?)
    }

    pub async fn set_service_default(&self, service_id: &str, config: ThresholdConfig) -> ScanResult<()> {
        Self::validate(&config)?;
        db::thresholds::put_threshold(&self.db, ThresholdSource::Service, service_id, &config).await?;
        tracing::info!(service_id, "Service threshold default set");
        Ok(())
    }

    pub async fn set_global(&self, config: ThresholdConfig) -> ScanResult<()> {
        Self::validate(&config)?;
        db::thresholds::put_threshold(&self.db, ThresholdSource::Global, GLOBAL_SCOPE_ID, &config).await?;
        self.global_cache.invalidate().await;
        tracing::info!(high = config.high, medium = config.medium, low = config.low, "Global thresholds updated");
        Ok(())
    }

    /// Drop the cached global value; next resolve re-reads the store
    pub async fn invalidate(&self) {
        self.global_cache.invalidate().await;
    }

    pub fn classify(score: f64, thresholds: &ThresholdConfig) -> Option<Tier> {
        thresholds.classify(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;

    #[tokio::test]
    async fn test_priority_chain() {
        let (_dir, pool) = test_pool().await;
        let resolver = ThresholdResolver::new(pool, GlobalThresholdCache::new());

        let resolved = resolver.resolve("acct", Some("svc")).await.unwrap();
        assert_eq!(resolved.source, ThresholdSource::Global);
        assert_eq!(resolved.config, ThresholdConfig::DEFAULT);

        resolver
            .set_service_default("svc", ThresholdConfig::new(90.0, 70.0, 40.0))
            .await
            .unwrap();
        let resolved = resolver.resolve("acct", Some("svc")).await.unwrap();
        assert_eq!(resolved.source, ThresholdSource::Service);

        // Service default does not apply without a service id
        assert_eq!(
            resolver.resolve("acct", None).await.unwrap().source,
            ThresholdSource::Global
        );

        resolver
            .set_account_override("acct", ThresholdConfig::new(95.0, 85.0, 60.0))
            .await
            .unwrap();
        let resolved = resolver.resolve("acct", Some("svc")).await.unwrap();
        assert_eq!(resolved.source, ThresholdSource::User);
        assert_eq!(resolved.config.high, 95.0);

        assert!(resolver.clear_account_override("acct").await.unwrap());
        assert_eq!(
            resolver.resolve("acct", Some("svc")).await.unwrap().source,
            ThresholdSource::Service
        );
    }

    #[tokio::test]
    async fn test_rejected_write_leaves_prior_config() {
        let (_dir, pool) = test_pool().await;
        let resolver = ThresholdResolver::new(pool, GlobalThresholdCache::new());
        resolver
            .set_account_override("acct", ThresholdConfig::new(90.0, 70.0, 40.0))
            .await
            .unwrap();

        let err = resolver
            .set_account_override("acct", ThresholdConfig::new(50.0, 70.0, 40.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidThreshold(_)));

        let resolved = resolver.resolve("acct", None).await.unwrap();
        assert_eq!(resolved.config, ThresholdConfig::new(90.0, 70.0, 40.0));
    }

    #[tokio::test]
    async fn test_global_write_invalidates_cache() {
        let (_dir, pool) = test_pool().await;
        let cache = GlobalThresholdCache::new();
        let resolver = ThresholdResolver::new(pool.clone(), cache.clone());

        assert_eq!(resolver.resolve("a", None).await.unwrap().config, ThresholdConfig::DEFAULT);

        resolver.set_global(ThresholdConfig::new(80.0, 60.0, 30.0)).await.unwrap();
        assert_eq!(
            resolver.resolve("a", None).await.unwrap().config,
            ThresholdConfig::new(80.0, 60.0, 30.0)
        );

        // Out-of-band write is only seen after explicit invalidation
        db::thresholds::put_threshold(
            &pool,
            ThresholdSource::Global,
            GLOBAL_SCOPE_ID,
            &ThresholdConfig::new(70.0, 60.0, 30.0),
        )
        .await
        .unwrap();
        assert_eq!(resolver.resolve("a", None).await.unwrap().config.high, 80.0);
        cache.invalidate().await;
        assert_eq!(resolver.resolve("a", None).await.unwrap().config.high, 70.0);
    }

    #[test]
    fn test_classify_uses_strict_floors() {
        let t = ThresholdConfig::DEFAULT;
        assert_eq!(ThresholdResolver::classify(95.0, &t), Some(Tier::High));
        assert_eq!(ThresholdResolver::classify(89.0, &t), Some(Tier::Medium));
        assert_eq!(ThresholdResolver::classify(75.0, &t), Some(Tier::Low));
        assert_eq!(ThresholdResolver::classify(50.0, &t), None);
    }
}
