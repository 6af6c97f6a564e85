//! Provider credential pool with failover and cooldowns.
//!
//! Key order, cooldowns and failure counts live in the shared store, so every
//! API process and worker pointed at the same database sees the same state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::ProviderError;
use crate::store::{DbHandle, ProviderKey, ProviderKind};

/// Consecutive failures that put a key on a health cooldown.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_HEALTH_COOLDOWN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Keys for a provider, in failover order.
    async fn keys_for(&self, provider: ProviderKind) -> Result<Vec<ProviderKey>>;
    async fn key(&self, id: i64) -> Result<Option<ProviderKey>>;
    async fn set_cooldown(&self, id: i64, until: DateTime<Utc>) -> Result<()>;
    /// Returns the new consecutive failure count.
    async fn record_failure(&self, id: i64) -> Result<u32>;
    async fn reset_failures(&self, id: i64) -> Result<()>;
}

#[async_trait]
impl KeyStore for DbHandle {
    async fn keys_for(&self, provider: ProviderKind) -> Result<Vec<ProviderKey>> {
        self.call(move |db| db.list_provider_keys(Some(provider)))
            .await
    }

    async fn key(&self, id: i64) -> Result<Option<ProviderKey>> {
        self.call(move |db| db.get_provider_key(id)).await
    }

    async fn set_cooldown(&self, id: i64, until: DateTime<Utc>) -> Result<()> {
        self.call(move |db| db.set_key_cooldown(id, until)).await
    }

    async fn record_failure(&self, id: i64) -> Result<u32> {
        self.call(move |db| db.record_key_failure(id)).await
    }

    async fn reset_failures(&self, id: i64) -> Result<()> {
        self.call(move |db| db.record_key_success(id)).await
    }
}

#[derive(Clone)]
pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    failure_threshold: u32,
    health_cooldown: Duration,
}

impl KeyPool {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            health_cooldown: DEFAULT_HEALTH_COOLDOWN,
        }
    }

    pub fn with_health_policy(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self.health_cooldown = cooldown;
        self
    }

    /// First key, in pool order, whose cooldown has passed. `None` when every
    /// key is cooling down or the provider has no keys.
    pub async fn get_key_with_failover(&self, provider: ProviderKind) -> Result<Option<ProviderKey>> {
        self.get_key_with_failover_at(provider, Utc::now()).await
    }

    pub async fn get_key_with_failover_at(
        &self,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Result<Option<ProviderKey>> {
        let keys = self.store.keys_for(provider).await?;
        let total = keys.len();
        let selected = keys.into_iter().find(|k| k.is_available(now));
        match &selected {
            Some(key) => debug!(
                provider = %provider,
                key = %key.fingerprint(),
                "Selected provider key"
            ),
            None => warn!(provider = %provider, total, "No provider key available"),
        }
        Ok(selected)
    }

    /// Prefer the key chosen at admission; fall back to the pool if it has
    /// since cooled down or disappeared.
    pub async fn resolve(&self, id: i64, provider: ProviderKind) -> Result<Option<ProviderKey>> {
        let now = Utc::now();
        if let Some(key) = self.store.key(id).await?
            && key.provider == provider
            && key.is_available(now)
        {
            return Ok(Some(key));
        }
        self.get_key_with_failover_at(provider, now).await
    }

    pub async fn mark_rate_limited(&self, key: &ProviderKey, retry_after_secs: u64) -> Result<()> {
        self.mark_rate_limited_at(key, retry_after_secs, Utc::now())
            .await
    }

    pub async fn mark_rate_limited_at(
        &self,
        key: &ProviderKey,
        retry_after_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let secs = retry_after_secs.max(1) as i64;
        let until = now + chrono::Duration::seconds(secs);
        info!(
            provider = %key.provider,
            key = %key.fingerprint(),
            retry_after_secs = secs,
            "Provider key rate limited"
        );
        self.store.set_cooldown(key.id, until).await
    }

    /// Feed a provider call outcome back into key health.
    pub async fn record_outcome(&self, key: &ProviderKey, outcome: Result<(), &ProviderError>) {
        let result = match outcome {
            Ok(()) => self.store.reset_failures(key.id).await,
            Err(ProviderError::RateLimited { retry_after_secs }) => {
                self.mark_rate_limited(key, *retry_after_secs).await
            }
            Err(ProviderError::Cancelled) => Ok(()),
            Err(_) => self.record_failure_at(key, Utc::now()).await,
        };
        if let Err(e) = result {
            warn!(key = %key.fingerprint(), error = %e, "Failed to update provider key health");
        }
    }

    async fn record_failure_at(&self, key: &ProviderKey, now: DateTime<Utc>) -> Result<()> {
        let failures = self.store.record_failure(key.id).await?;
        if failures >= self.failure_threshold {
            let until = now
                + chrono::Duration::from_std(self.health_cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            warn!(
                key = %key.fingerprint(),
                failures,
                "Provider key unhealthy, cooling down"
            );
            self.store.set_cooldown(key.id, until).await?;
            self.store.reset_failures(key.id).await?;
        }
        Ok(())
    }
}
