use serde::{Deserialize, Serialize};

/// Name fragments used to infer a provider from a bare model id.
const PROVIDER_PATTERNS: &[(&str, &[&str])] = &[
    ("anthropic", &["claude"]),
    ("google", &["gemini"]),
    ("xai", &["grok"]),
    ("deepseek", &["deepseek"]),
    ("mistral", &["mistral"]),
    (
        "openai",
        &["gpt", "text-", "o1", "davinci", "curie", "babbage", "ada"],
    ),
];

/// Concurrency and rate configuration for one upstream provider.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub provider_name: String,
    pub max_parallel_requests: u32,
    pub requests_per_minute: u32,
}

impl ProviderLimits {
    pub const DEFAULT_MAX_PARALLEL: u32 = 1;
    pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 30;

    pub fn new(
        provider_name: impl Into<String>,
        max_parallel_requests: u32,
        requests_per_minute: u32,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            max_parallel_requests: max_parallel_requests.max(1),
            requests_per_minute: requests_per_minute.max(1),
        }
    }

    /// Conservative limits used when a provider has no configuration row.
    pub fn fallback(provider_name: impl Into<String>) -> Self {
        Self::new(
            provider_name,
            Self::DEFAULT_MAX_PARALLEL,
            Self::DEFAULT_REQUESTS_PER_MINUTE,
        )
    }

    pub fn queue_name(&self) -> String {
        probe_queue_name(&self.provider_name)
    }

    /// Worker fetch quota for the provider's probe queue.
    pub fn batch_size(&self) -> usize {
        self.max_parallel_requests.max(1) as usize
    }
}

/// Stable physical queue name for a provider's probe work.
pub fn probe_queue_name(provider: &str) -> String {
    let sanitized: String = provider
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("probe_{sanitized}")
}

/// Resolves the provider for a model id. An explicit `provider:model` prefix
/// wins; otherwise well-known name fragments are matched.
pub fn infer_provider(model_id: &str) -> Option<&'static str> {
    let lower = model_id.to_ascii_lowercase();
    if let Some((prefix, _)) = lower.split_once(':')
        && let Some((name, _)) = PROVIDER_PATTERNS.iter().find(|(name, _)| *name == prefix)
    {
        return Some(name);
    }
    PROVIDER_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(name, _)| *name)
}
