//! C8: the search fan-out and rank core. Ties the provider registry (C9),
//! worker pool (C1), two-level cache (C4), and batch writer (C7) together
//! behind one `search` entry point.

use std::sync::Arc;
use std::time::Duration;

use fedsearch_cache::{CacheOperation, TwoLevelCache};
use fedsearch_core::config::WriteStrategy;
use fedsearch_core::{Config, ProviderRegistry, SearchResponse, SearchResult};
use fedsearch_writer::DelayedBatchWriter;
use tracing::{debug, info, warn};

use crate::filter::filter_results;
use crate::normalize::{NormalizedQuery, QueryRequest, ResultView};
use crate::pool::WorkerPool;
use crate::rank::{priority_score, sort_results};

pub struct SearchCore {
    providers: Arc<ProviderRegistry>,
    cache: Arc<TwoLevelCache>,
    writer: Arc<DelayedBatchWriter>,
    pool: WorkerPool,
    max_concurrency: usize,
}

impl SearchCore {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        cache: Arc<TwoLevelCache>,
        writer: Arc<DelayedBatchWriter>,
        config: &Config,
    ) -> Self {
        Self {
            providers,
            cache,
            writer,
            pool: WorkerPool::new(Duration::from_millis(config.provider_timeout_ms)),
            max_concurrency: config.search_concurrency,
        }
    }

    /// Aggregates C2/C3/C4/C7 counters into one observability snapshot.
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "cache": self.cache.stats(),
            "writer": self.writer.stats(),
            "providers_registered": self.providers.len(),
        })
    }

    pub async fn search(&self, request: QueryRequest) -> anyhow::Result<SearchResponse> {
        let normalized = request.normalize(&self.providers);

        if !normalized.force_refresh {
            if let Some(cached) = self.cache.get(normalized.cache_key.as_str()).await? {
                debug!(cache_key = %normalized.cache_key, "search served from cache");
                let response: SearchResponse = bincode::deserialize(&cached)?;
                return Ok(apply_view(response, normalized.view));
            }
        }

        let results = self.dispatch(&normalized).await;
        let mut filtered = filter_results(results, &normalized.keyword_tokens);
        sort_results(&mut filtered);

        let response = SearchResponse::new(filtered);
        let priority = normalized
            .provider_names
            .iter()
            .map(|name| self.providers.priority_of(name))
            .min()
            .unwrap_or(fedsearch_core::DEFAULT_PROVIDER_PRIORITY);
        self.store_async(&normalized, &response, priority);

        Ok(apply_view(response, normalized.view))
    }

    async fn dispatch(&self, normalized: &NormalizedQuery) -> Vec<SearchResult> {
        let providers: Vec<_> = normalized
            .provider_names
            .iter()
            .filter_map(|name| self.providers.get(name))
            .collect();

        if providers.is_empty() {
            warn!("no providers matched the request");
            return Vec::new();
        }

        let keyword_text = normalized.keyword_tokens.join(" ");
        let tasks: Vec<_> = providers
            .into_iter()
            .map(|provider| {
                let keyword_text = keyword_text.clone();
                move || async move {
                    match provider.search(&keyword_text).await {
                        Ok(results) => results,
                        Err(err) => {
                            warn!(provider = provider.name(), error = %err, "provider search failed");
                            Vec::new()
                        }
                    }
                }
            })
            .collect();

        let concurrency = normalized.concurrency.min(self.max_concurrency);
        let batches = self.pool.execute_batch(tasks, concurrency).await;
        batches.into_iter().flatten().flatten().collect()
    }

    /// Stores the final response asynchronously: the caller gets its
    /// answer immediately, the cache write happens in the background and
    /// its failure is logged, never propagated to the search caller.
    fn store_async(&self, normalized: &NormalizedQuery, response: &SearchResponse, priority: u8) {
        let cache = self.cache.clone();
        let writer = self.writer.clone();
        let key = normalized.cache_key.as_str().to_string();
        let write_strategy = self.cache.write_strategy();

        let encoded = match bincode::serialize(response) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode search response for caching");
                return;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = cache.set_with_final_flag(&key, encoded.clone(), true).await {
                warn!(error = %err, "failed to cache search response");
                return;
            }
            if write_strategy == WriteStrategy::Hybrid {
                let op = CacheOperation {
                    key: key.clone(),
                    value: encoded,
                    is_final: true,
                    timestamp_ms: 0,
                    priority,
                };
                if writer.handle_cache_write(None, None, op).await.is_err() {
                    warn!(key = %key, "failed to enqueue deferred disk write");
                }
            }
            info!(key = %key, "search response cached");
        });
    }
}

/// Prunes and re-derives `total`/`results`/`merged_by_type` to match the
/// requested view. The `results` view keeps only entries carrying either a
/// `datetime` or a non-zero keyword-priority score; `total` is recomputed
/// from whatever survives into the returned shape rather than from the
/// pre-pruning result count.
fn apply_view(mut response: SearchResponse, view: ResultView) -> SearchResponse {
    match view {
        ResultView::Full => response,
        ResultView::Results => {
            response.merged_by_type.clear();
            response
                .results
                .retain(|r| r.datetime.is_some() || priority_score(&r.title) > 0);
            response.total = response.results.len();
            response
        }
        ResultView::MergedByType => {
            response.results.clear();
            response.total = response.merged_by_type.values().map(|v| v.len()).sum();
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fedsearch_cache::{DiskTier, MemoryTier};
    use fedsearch_core::{Link, LinkType, Provider, SourceType};
    use fedsearch_writer::{BufferManager, BufferManagerConfig};

    struct StubProvider {
        name: String,
        hits: Vec<SearchResult>,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn search(&self, _keyword: &str) -> anyhow::Result<Vec<SearchResult>> {
            Ok(self.hits.clone())
        }
    }

    async fn build_core(hits: Vec<SearchResult>) -> (SearchCore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskTier::new(dir.path(), 2, 3600, 100, u64::MAX).await.unwrap());
        let memory = Arc::new(MemoryTier::new(2, 3600, 100, u64::MAX, Some(disk.clone())));
        let cache = Arc::new(TwoLevelCache::new(memory, disk, WriteStrategy::Immediate));

        let buffers = BufferManager::new(BufferManagerConfig {
            strategy: fedsearch_core::BufferStrategy::ByPlugin,
            max_batch_size: 50,
            max_batch_bytes: 1_000_000,
            max_batch_interval_ms: 1_000_000,
            priority_ratio: 2.0,
            global_max_bytes: 1_000_000,
        });
        let writer = DelayedBatchWriter::new(
            cache.clone(),
            buffers,
            16,
            1_000_000,
            50,
            1_000_000,
            (100, 10_000),
            (1, 100),
        );
        writer
            .initialize(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(StubProvider { name: "alpha".into(), hits }));

        let config = Config {
            search_concurrency: 4,
            provider_timeout_ms: 500,
            ..Config::default()
        };
        (SearchCore::new(registry, cache, writer, &config), dir)
    }

    fn result(title: &str) -> SearchResult {
        SearchResult::new(
            "alpha",
            "m1",
            title,
            "content",
            vec![Link::new(LinkType::Baidu, "https://pan.baidu.com/a", None)],
            vec![],
            None,
        )
        .unwrap()
    }

    fn request(view: ResultView) -> QueryRequest {
        QueryRequest {
            keyword: "rust".into(),
            source_type: SourceType::Plugin,
            channels: vec![],
            plugins: None,
            view,
            force_refresh: false,
        }
    }

    #[tokio::test]
    async fn search_returns_provider_results() {
        let (core, _dir) = build_core(vec![result("Rust Book")]).await;
        let response = core.search(request(ResultView::Full)).await.unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].title, "Rust Book");
    }

    #[tokio::test]
    async fn second_identical_search_is_served_from_cache() {
        let (core, _dir) = build_core(vec![result("Rust Book")]).await;
        core.search(request(ResultView::Full)).await.unwrap();
        // give the background cache-store task a moment to complete
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = core.search(request(ResultView::Full)).await.unwrap();
        assert_eq!(second.total, 1);
    }

    #[tokio::test]
    async fn force_refresh_skips_the_cache_and_redispatches() {
        let (core, _dir) = build_core(vec![result("Rust Book")]).await;
        core.search(request(ResultView::Full)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut forced = request(ResultView::Full);
        forced.force_refresh = true;
        let response = core.search(forced).await.unwrap();
        assert_eq!(response.total, 1);
    }

    #[tokio::test]
    async fn results_view_clears_merged_by_type_and_prunes_unranked_entries() {
        let (core, _dir) = build_core(vec![result("plain title")]).await;
        let response = core.search(request(ResultView::Results)).await.unwrap();
        assert!(response.merged_by_type.is_empty());
        assert_eq!(response.results.len(), 0);
        assert_eq!(response.total, 0);
    }

    #[tokio::test]
    async fn merged_by_type_view_clears_results_and_recomputes_total() {
        let (core, _dir) = build_core(vec![result("Rust Book")]).await;
        let response = core.search(request(ResultView::MergedByType)).await.unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.total, 1);
    }
}
