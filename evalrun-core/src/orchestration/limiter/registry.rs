use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;

use super::{LimiterStats, ProviderLimiter, ScheduleContext};
use crate::error::Result;
use crate::orchestration::config::LimiterConfig;
use crate::orchestration::limits::CachedProviderLimits;
use crate::types::ProviderLimits;

/// Owns one [`ProviderLimiter`] per provider, created on first use.
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<ProviderLimiter>>,
    limits: Arc<CachedProviderLimits>,
    config: LimiterConfig,
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("providers", &self.limiters.len())
            .field("config", &self.config)
            .finish()
    }
}

impl LimiterRegistry {
    pub fn new(limits: Arc<CachedProviderLimits>, config: LimiterConfig) -> Self {
        Self {
            limiters: DashMap::new(),
            limits,
            config,
        }
    }

    pub fn limits_cache(&self) -> &Arc<CachedProviderLimits> {
        &self.limits
    }

    /// Configured limits for `provider`, or the conservative fallback.
    pub async fn resolve_limits(&self, provider: &str) -> Result<ProviderLimits> {
        match self.limits.get(provider).await? {
            Some(limits) => Ok(limits),
            None => {
                let fallback = self.config.fallback_limits(provider);
                tracing::warn!(
                    target: "evalrun::limiter",
                    provider,
                    max_parallel = fallback.max_parallel_requests,
                    requests_per_minute = fallback.requests_per_minute,
                    "no limits configured for provider; using defaults"
                );
                Ok(fallback)
            }
        }
    }

    pub async fn limiter(&self, provider: &str) -> Result<Arc<ProviderLimiter>> {
        if let Some(existing) = self.limiters.get(provider) {
            return Ok(Arc::clone(existing.value()));
        }
        let limits = self.resolve_limits(provider).await?;
        let limiter = self
            .limiters
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderLimiter::new(limits, self.config.recent_completions)));
        Ok(Arc::clone(limiter.value()))
    }

    /// The only sanctioned path to an upstream provider.
    pub async fn schedule<T, F>(
        &self,
        provider: &str,
        context: ScheduleContext<'_>,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limiter = self.limiter(provider).await?;
        limiter.schedule(context, work).await
    }

    /// Drops every limiter, reloads configuration, and creates one limiter
    /// per configured provider. Work already running on a dropped limiter
    /// finishes there.
    pub async fn reload_limiters(&self) -> Result<usize> {
        self.limiters.clear();
        self.limits.invalidate().await;
        let configured = self.limits.all().await?;
        for limits in configured {
            let name = limits.provider_name.clone();
            self.limiters.insert(
                name,
                Arc::new(ProviderLimiter::new(limits, self.config.recent_completions)),
            );
        }
        let count = self.limiters.len();
        tracing::info!(target: "evalrun::limiter", providers = count, "limiters reloaded");
        Ok(count)
    }

    /// Replaces the limiter for one provider with a fresh instance built from
    /// the currently cached limits.
    pub async fn reload_limiter(&self, provider: &str) -> Result<Arc<ProviderLimiter>> {
        self.limiters.remove(provider);
        let limits = self.resolve_limits(provider).await?;
        let limiter = Arc::new(ProviderLimiter::new(limits, self.config.recent_completions));
        self.limiters
            .insert(provider.to_string(), Arc::clone(&limiter));
        tracing::info!(
            target: "evalrun::limiter",
            provider,
            max_parallel = limiter.limits().max_parallel_requests,
            requests_per_minute = limiter.limits().requests_per_minute,
            "limiter reloaded"
        );
        Ok(limiter)
    }

    /// Current limiters with their stats, sorted by provider name.
    pub fn snapshot(&self) -> Vec<(ProviderLimits, LimiterStats)> {
        let mut out: Vec<(ProviderLimits, LimiterStats)> = self
            .limiters
            .iter()
            .map(|entry| (entry.value().limits().clone(), entry.value().stats()))
            .collect();
        out.sort_by(|a, b| a.0.provider_name.cmp(&b.0.provider_name));
        out
    }

    pub fn provider_snapshot(&self, provider: &str) -> Option<(ProviderLimits, LimiterStats)> {
        self.limiters
            .get(provider)
            .map(|entry| (entry.value().limits().clone(), entry.value().stats()))
    }
}
