use std::collections::HashSet;

use evalrun_core::orchestration::OrchestratorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

/// Non-fatal problems found while composing the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Clamps provider limits to usable values and flags suspicious settings.
pub fn sanitize_orchestrator(config: &mut OrchestratorConfig, warnings: &mut ConfigWarnings) {
    let mut seen = HashSet::new();
    for limits in config.providers.iter_mut() {
        if limits.max_parallel_requests == 0 {
            warnings.push(format!(
                "provider {} has max_parallel_requests = 0; using 1",
                limits.provider_name
            ));
            limits.max_parallel_requests = 1;
        }
        if limits.requests_per_minute == 0 {
            warnings.push(format!(
                "provider {} has requests_per_minute = 0; using 1",
                limits.provider_name
            ));
            limits.requests_per_minute = 1;
        }
        if !seen.insert(limits.provider_name.clone()) {
            warnings.push_with_hint(
                format!("provider {} is configured more than once", limits.provider_name),
                "Only the last entry takes effect",
            );
        }
    }

    let recovery = &config.recovery;
    if recovery.stale_threshold_secs < recovery.interval_secs {
        warnings.push_with_hint(
            format!(
                "recovery stale threshold ({}s) is shorter than the sweep interval ({}s)",
                recovery.stale_threshold_secs, recovery.interval_secs
            ),
            "Runs with slow providers may be re-enqueued while their jobs are still live",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalrun_core::types::ProviderLimits;

    #[test]
    fn zero_limits_are_clamped_with_a_warning() {
        let mut config = OrchestratorConfig::default();
        config.providers.push(ProviderLimits {
            provider_name: "openai".into(),
            max_parallel_requests: 0,
            requests_per_minute: 60,
        });
        let mut warnings = ConfigWarnings::default();

        sanitize_orchestrator(&mut config, &mut warnings);

        assert_eq!(config.providers[0].max_parallel_requests, 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings.items[0].message.contains("openai"));
    }

    #[test]
    fn duplicate_providers_are_flagged() {
        let mut config = OrchestratorConfig::default();
        config.providers.push(ProviderLimits::new("openai", 2, 60));
        config.providers.push(ProviderLimits::new("openai", 4, 60));
        let mut warnings = ConfigWarnings::default();

        sanitize_orchestrator(&mut config, &mut warnings);

        assert_eq!(warnings.len(), 1);
        assert!(warnings.items[0].hint.is_some());
    }
}
