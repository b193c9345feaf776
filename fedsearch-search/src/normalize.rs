//! Query normalization: turns caller-supplied parameters into a canonical
//! shape before anything touches the cache or the provider registry, so
//! that equivalent requests (differing only in argument order, casing, or
//! an explicit-vs-implicit plugin set) always resolve to the same cache key
//! and provider set.

use fedsearch_core::{CacheKey, ProviderRegistry, SourceType};

/// Which parts of a `SearchResponse` the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultView {
    #[default]
    Full,
    Results,
    MergedByType,
}

impl ResultView {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "results" => ResultView::Results,
            "merged_by_type" => ResultView::MergedByType,
            _ => ResultView::Full,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub keyword: String,
    pub source_type: SourceType,
    pub channels: Vec<String>,
    /// `None` means "every registered plugin"; `Some(vec![])` means "no
    /// plugins", distinct cases that must not collapse together.
    pub plugins: Option<Vec<String>>,
    pub view: ResultView,
    /// Skips the cache read and forces provider re-dispatch. The response
    /// is still written back to the cache afterward.
    pub force_refresh: bool,
}

/// The request after normalization: resolved provider names, a stable
/// cache key, and the keyword split into its filter tokens.
pub struct NormalizedQuery {
    pub cache_key: CacheKey,
    pub provider_names: Vec<String>,
    pub keyword_tokens: Vec<String>,
    pub view: ResultView,
    pub force_refresh: bool,
    /// Per-call worker pool width: `channels + plugins + 10`.
    pub concurrency: usize,
}

/// Resolves an explicit plugin list to the canonical form used in the cache
/// key: an explicit set equal to every registered provider is the same
/// request as "unspecified" (`None`), and a set made up only of empty
/// strings is the same request as the explicit empty set.
fn canonicalize_plugins(plugins: Option<&[String]>, registry: &ProviderRegistry) -> Option<Vec<String>> {
    let plugins = plugins?;
    let mut lowered: Vec<String> = plugins.iter().map(|p| p.to_lowercase()).collect();

    if !lowered.is_empty() && lowered.iter().all(|p| p.is_empty()) {
        return Some(Vec::new());
    }

    lowered.sort();
    lowered.dedup();

    let mut registered = registry.names();
    registered.sort();

    if !lowered.is_empty() && lowered == registered {
        None
    } else {
        Some(lowered)
    }
}

impl QueryRequest {
    pub fn normalize(&self, registry: &ProviderRegistry) -> NormalizedQuery {
        let resolved_plugins: Vec<String> = match &self.plugins {
            Some(plugins) => plugins.iter().map(|p| p.to_lowercase()).collect(),
            None => registry.names(),
        };
        let channels: Vec<String> = self.channels.iter().map(|c| c.to_lowercase()).collect();

        let (provider_names, plugin_count) = match self.source_type {
            SourceType::Tg => (channels.clone(), 0),
            SourceType::Plugin => (resolved_plugins.clone(), resolved_plugins.len()),
            SourceType::All => {
                let mut names = channels.clone();
                names.extend(resolved_plugins.iter().cloned());
                (names, resolved_plugins.len())
            }
        };

        // `tg` requests never carry plugins in their identity; every other
        // source type canonicalizes its explicit plugin set.
        let cache_key_plugins = match self.source_type {
            SourceType::Tg => None,
            _ => canonicalize_plugins(self.plugins.as_deref(), registry),
        };

        let cache_key = CacheKey::build(
            &self.keyword,
            self.source_type,
            &self.channels,
            cache_key_plugins.as_deref(),
        );

        let keyword_tokens = self
            .keyword
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();

        NormalizedQuery {
            cache_key,
            provider_names,
            keyword_tokens,
            view: self.view,
            force_refresh: self.force_refresh,
            concurrency: channels.len() + plugin_count + 10,
        }
    }
}
