//! The `Provider` capability every channel/plugin backend implements, and
//! the registry (C9) that the search core and batch writer look providers
//! up through. Providers are constructor-injected collaborators, never a
//! process-global table.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::SearchResult;

/// Default priority assigned to a provider absent from the registry.
pub const DEFAULT_PROVIDER_PRIORITY: u8 = 4;

/// A searchable backend: a Telegram channel adapter, a plugin, or any other
/// keyword-searchable source. Implementations own their own I/O and must
/// not block the calling task.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable, lowercase-comparable identifier used as the registry key.
    fn name(&self) -> &str;

    /// Lower value means higher priority when results are tied during
    /// ranking; 1 is highest priority, values above `DEFAULT_PROVIDER_PRIORITY`
    /// are treated as background/low-priority sources.
    fn priority(&self) -> u8 {
        DEFAULT_PROVIDER_PRIORITY
    }

    async fn search(&self, keyword: &str) -> anyhow::Result<Vec<SearchResult>>;
}

/// Process-wide-conceptually but constructor-injected map from lowercased
/// provider name to the provider instance.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_lowercase(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(&name.to_lowercase()).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    /// Every registered name, lowercased, used to resolve "all plugins"
    /// style requests during query normalization.
    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn priority_of(&self, name: &str) -> u8 {
        self.get(name).map(|p| p.priority()).unwrap_or(DEFAULT_PROVIDER_PRIORITY)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        name: String,
        priority: u8,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        async fn search(&self, _keyword: &str) -> anyhow::Result<Vec<SearchResult>> {
            Ok(vec![])
        }
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider {
            name: "MyChannel".into(),
            priority: 1,
        }));
        assert!(registry.get("mychannel").is_some());
        assert!(registry.get("MYCHANNEL").is_some());
    }

    #[test]
    fn unknown_provider_gets_default_priority() {
        let registry = ProviderRegistry::new();
        assert_eq!(registry.priority_of("nope"), DEFAULT_PROVIDER_PRIORITY);
    }
}
