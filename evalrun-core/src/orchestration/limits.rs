//! Provider limit configuration sources and the cache in front of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::ProviderLimits;

/// External configuration storage for per-provider limits.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderLimitsSource: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ProviderLimits>>;
}

/// Limits fixed at construction time, typically from the config file.
#[derive(Clone, Debug, Default)]
pub struct StaticProviderLimits {
    limits: Vec<ProviderLimits>,
}

impl StaticProviderLimits {
    pub fn new(limits: Vec<ProviderLimits>) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl ProviderLimitsSource for StaticProviderLimits {
    async fn load_all(&self) -> Result<Vec<ProviderLimits>> {
        Ok(self.limits.clone())
    }
}

/// Read-through cache keyed by provider name. The source is hit at most once
/// between invalidations.
pub struct CachedProviderLimits {
    source: Arc<dyn ProviderLimitsSource>,
    cache: RwLock<Option<HashMap<String, ProviderLimits>>>,
}

impl fmt::Debug for CachedProviderLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CachedProviderLimits");
        match self.cache.try_read() {
            Ok(cache) => {
                debug.field("cached", &cache.as_ref().map(HashMap::len));
            }
            Err(_) => {
                debug.field("cache", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl CachedProviderLimits {
    pub fn new(source: Arc<dyn ProviderLimitsSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    pub async fn get(&self, provider: &str) -> Result<Option<ProviderLimits>> {
        {
            let cache = self.cache.read().await;
            if let Some(cache) = cache.as_ref() {
                return Ok(cache.get(provider).cloned());
            }
        }
        let cache = self.populate().await?;
        Ok(cache.get(provider).cloned())
    }

    /// Every configured provider, sorted by name.
    pub async fn all(&self) -> Result<Vec<ProviderLimits>> {
        let cached: Option<Vec<ProviderLimits>> = {
            let cache = self.cache.read().await;
            cache.as_ref().map(|cache| cache.values().cloned().collect())
        };
        let mut limits = match cached {
            Some(limits) => limits,
            None => self.populate().await?.into_values().collect(),
        };
        limits.sort_by(|a, b| a.provider_name.cmp(&b.provider_name));
        Ok(limits)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
        tracing::debug!(target: "evalrun::limiter", "provider limits cache invalidated");
    }

    async fn populate(&self) -> Result<HashMap<String, ProviderLimits>> {
        let mut cache = self.cache.write().await;
        if let Some(existing) = cache.as_ref() {
            return Ok(existing.clone());
        }
        let loaded: HashMap<String, ProviderLimits> = self
            .source
            .load_all()
            .await?
            .into_iter()
            .map(|limits| (limits.provider_name.clone(), limits))
            .collect();
        *cache = Some(loaded.clone());
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_is_read_once_until_invalidated() {
        let mut source = MockProviderLimitsSource::new();
        source
            .expect_load_all()
            .times(2)
            .returning(|| Ok(vec![ProviderLimits::new("openai", 4, 120)]));
        let cache = CachedProviderLimits::new(Arc::new(source));

        assert_eq!(
            cache.get("openai").await.unwrap().map(|l| l.max_parallel_requests),
            Some(4)
        );
        assert!(cache.get("anthropic").await.unwrap().is_none());
        assert_eq!(cache.all().await.unwrap().len(), 1);

        cache.invalidate().await;
        assert!(cache.get("openai").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn source_errors_are_not_cached() {
        let mut source = MockProviderLimitsSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_load_all()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(crate::error::OrchestratorError::Internal("down".into())));
        source
            .expect_load_all()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![ProviderLimits::new("openai", 2, 60)]));
        let cache = CachedProviderLimits::new(Arc::new(source));

        assert!(cache.get("openai").await.is_err());
        assert!(cache.get("openai").await.unwrap().is_some());
    }
}
