// Federated search aggregator — demo entry point.
//
// Wires the provider registry, two-level cache, batch writer, and search
// core together and runs a couple of sample queries so the pieces can be
// exercised end to end. Real channel/plugin backends are out of scope here;
// `DemoProvider` below exists only to give the core something to fan out to.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fedsearch_cache::{DiskTier, MemoryTier, TwoLevelCache};
use fedsearch_core::{Config, Link, LinkType, Provider, ProviderRegistry, SearchResult, SourceType};
use fedsearch_search::{QueryRequest, ResultView, SearchCore};
use fedsearch_writer::{BufferManager, BufferManagerConfig, DelayedBatchWriter};
use tokio::signal;
use tracing::{error, info};

struct DemoProvider {
    name: String,
}

#[async_trait]
impl Provider for DemoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, keyword: &str) -> Result<Vec<SearchResult>> {
        Ok(vec![SearchResult::new(
            &self.name,
            "demo-1",
            format!("{keyword} — sample result from {}", self.name),
            format!("a placeholder hit for '{keyword}'"),
            vec![Link::new(LinkType::Quark, "https://quark.example/demo", None)],
            vec!["demo".into()],
            None,
        )?])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("fedsearch=info".parse()?),
        )
        .json()
        .init();

    info!("starting fedsearch");

    let config = Config::from_env();

    let disk = match DiskTier::new(
        &config.disk_root,
        config.disk_shard_count,
        config.disk_ttl_secs,
        config.memory_max_entries_per_shard,
        config.disk_shard_max_bytes,
    )
    .await
    {
        Ok(disk) => Arc::new(disk),
        Err(err) => {
            error!("failed to initialize disk tier: {err}");
            return Err(err.into());
        }
    };

    let memory = Arc::new(MemoryTier::new(
        config.memory_shard_count,
        config.memory_ttl_secs,
        config.memory_max_entries_per_shard,
        config.memory_shard_max_bytes,
        Some(disk.clone()),
    ));
    let cache = Arc::new(TwoLevelCache::new(memory, disk, config.write_strategy));
    cache.spawn_sweepers();

    let buffers = BufferManager::new(BufferManagerConfig {
        strategy: config.buffer_strategy,
        max_batch_size: config.batch_max_size,
        max_batch_bytes: config.batch_max_bytes,
        max_batch_interval_ms: config.batch_max_interval_ms,
        priority_ratio: config.batch_priority_ratio,
        global_max_bytes: config.buffer_max_bytes,
    });
    buffers.spawn_cleanup_task(
        Duration::from_secs(config.buffer_cleanup_interval_secs),
        config.buffer_window_secs * 1000,
    );

    let writer = DelayedBatchWriter::new(
        cache.clone(),
        buffers,
        config.batch_channel_capacity,
        config.batch_max_interval_ms,
        config.batch_max_size,
        config.batch_idle_flush_ms,
        (config.batch_max_interval_floor_ms, config.batch_max_interval_ceiling_ms),
        (config.batch_max_size_floor, config.batch_max_size_ceiling),
    );
    if let Err(err) = writer
        .initialize(
            Duration::from_secs(config.batch_autotune_interval_secs),
            Duration::from_secs(config.buffer_sweep_interval_secs),
        )
        .await
    {
        error!("failed to initialize batch writer: {err}");
        return Err(err.into());
    }

    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(DemoProvider { name: "demo-channel".into() }));

    let core = SearchCore::new(registry, cache, writer.clone(), &config);

    let request = QueryRequest {
        keyword: "rust book".into(),
        source_type: SourceType::Plugin,
        channels: vec![],
        plugins: None,
        view: ResultView::Full,
        force_refresh: false,
    };

    match core.search(request).await {
        Ok(response) => info!(total = response.total, "sample search completed"),
        Err(err) => error!("sample search failed: {err}"),
    }

    info!("fedsearch running, press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping fedsearch"),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    if let Err(err) = writer.shutdown(Duration::from_secs(10)).await {
        error!("error during batch writer shutdown: {err}");
    }

    info!("fedsearch stopped");
    Ok(())
}
