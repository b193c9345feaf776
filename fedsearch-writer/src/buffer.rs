//! C6: the global buffer manager. Operations waiting to be flushed to disk
//! are grouped into buffers keyed by plugin, by keyword, or a hybrid of
//! both with a 5-minute time window, and a buffer is handed to the batch
//! writer once any flush trigger fires.
//!
//! Lock ordering is manager-lock (the `DashMap` bucket the buffer id hashes
//! to) before buffer-lock (the per-`Buffer` `RwLock`) — never the reverse —
//! so a concurrent cleanup sweep and an in-flight `add_operation` can never
//! deadlock on each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fedsearch_cache::CacheOperation;
use fedsearch_core::config::BufferStrategy;
use tokio::sync::RwLock;
use tracing::{debug, info};

const HYBRID_WINDOW_SECS: u64 = 300;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub id: String,
    pub plugin: Option<String>,
    pub keyword: Option<String>,
    pub operations: Vec<CacheOperation>,
    pub total_bytes: usize,
    pub created_at_ms: u64,
    pub last_updated_ms: u64,
}

impl Buffer {
    fn new(id: String, plugin: Option<String>, keyword: Option<String>) -> Self {
        let now = now_ms();
        Self {
            id,
            plugin,
            keyword,
            operations: Vec::new(),
            total_bytes: 0,
            created_at_ms: now,
            last_updated_ms: now,
        }
    }

    fn push(&mut self, op: CacheOperation) {
        self.total_bytes += op.value.len();
        self.last_updated_ms = now_ms();
        self.operations.push(op);
    }

    fn high_priority_ratio(&self) -> f64 {
        if self.operations.is_empty() {
            return 0.0;
        }
        let high = self.operations.iter().filter(|op| op.priority <= 1).count();
        high as f64 / self.operations.len() as f64
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

pub struct BufferManagerConfig {
    pub strategy: BufferStrategy,
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
    pub max_batch_interval_ms: u64,
    pub priority_ratio: f64,
    pub global_max_bytes: usize,
}

pub struct BufferManager {
    buffers: DashMap<String, Arc<RwLock<Buffer>>>,
    by_plugin: DashMap<String, Vec<String>>,
    by_keyword: DashMap<String, Vec<String>>,
    global_bytes: AtomicU64,
    config: BufferManagerConfig,
}

impl BufferManager {
    pub fn new(config: BufferManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            buffers: DashMap::new(),
            by_plugin: DashMap::new(),
            by_keyword: DashMap::new(),
            global_bytes: AtomicU64::new(0),
            config,
        })
    }

    pub fn buffer_id(&self, plugin: Option<&str>, keyword: Option<&str>) -> String {
        let plugin_key = plugin.map(str::to_lowercase).unwrap_or_else(|| "default".into());
        let keyword_key = keyword.map(|k| k.trim().to_lowercase()).unwrap_or_else(|| "default".into());
        match self.config.strategy {
            BufferStrategy::ByPlugin => format!("plugin:{plugin_key}"),
            BufferStrategy::ByKeyword => format!("keyword:{keyword_key}"),
            BufferStrategy::Hybrid => {
                let window = (now_ms() / 1000 / HYBRID_WINDOW_SECS) * HYBRID_WINDOW_SECS;
                format!("hybrid:{plugin_key}:{keyword_key}:{window}")
            }
        }
    }

    /// Adds `op` to the buffer selected by the configured strategy for
    /// (`plugin`, `keyword`), creating it if needed, cross-indexing it by
    /// both plugin and keyword regardless of strategy (so a cleanup sweep
    /// by either axis can always find it). Returns `true` if the buffer
    /// should now be flushed.
    pub async fn add_operation(
        &self,
        plugin: Option<&str>,
        keyword: Option<&str>,
        op: CacheOperation,
    ) -> bool {
        let id = self.buffer_id(plugin, keyword);
        let op_bytes = op.value.len() as u64;

        // Manager-lock (the DashMap entry api) acquired before the
        // buffer-lock (the per-buffer RwLock) below. The `Arc` is cloned
        // out and the DashMap guard dropped before we ever await, so a
        // synchronous shard lock is never held across a suspension point.
        let buffer_lock = self
            .buffers
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(Buffer::new(
                    id.clone(),
                    plugin.map(String::from),
                    keyword.map(String::from),
                )))
            })
            .clone();

        {
            let mut buffer = buffer_lock.write().await;
            buffer.push(op);
        }

        self.index_buffer_id(plugin, keyword, &id);
        self.global_bytes.fetch_add(op_bytes, Ordering::Relaxed);

        self.should_flush(&id).await
    }

    fn index_buffer_id(&self, plugin: Option<&str>, keyword: Option<&str>, id: &str) {
        if let Some(plugin) = plugin {
            let mut ids = self.by_plugin.entry(plugin.to_lowercase()).or_default();
            if !ids.contains(&id.to_string()) {
                ids.push(id.to_string());
            }
        }
        if let Some(keyword) = keyword {
            let mut ids = self.by_keyword.entry(keyword.trim().to_lowercase()).or_default();
            if !ids.contains(&id.to_string()) {
                ids.push(id.to_string());
            }
        }
    }

    async fn should_flush(&self, id: &str) -> bool {
        let Some(buffer_lock) = self.buffers.get(id).map(|e| e.clone()) else {
            return false;
        };
        let buffer = buffer_lock.read().await;
        if buffer.operations.len() >= self.config.max_batch_size {
            return true;
        }
        if buffer.total_bytes >= self.config.max_batch_bytes {
            return true;
        }
        if now_ms().saturating_sub(buffer.created_at_ms) >= self.config.max_batch_interval_ms {
            return true;
        }
        if self.global_bytes.load(Ordering::Relaxed) as usize >= self.config.global_max_bytes {
            return true;
        }
        if buffer.high_priority_ratio() >= self.config.priority_ratio {
            return true;
        }
        false
    }

    /// Removes and returns the buffer for `id`, if any, clearing it from
    /// both secondary indexes.
    pub async fn take_buffer(&self, id: &str) -> Option<Buffer> {
        let (_, lock) = self.buffers.remove(id)?;
        let buffer = match Arc::try_unwrap(lock) {
            Ok(rwlock) => rwlock.into_inner(),
            // Another in-flight `should_flush`/`add_operation` still holds
            // a clone of the Arc; fall back to copying the data out.
            Err(shared) => shared.read().await.clone(),
        };
        self.global_bytes.fetch_sub(buffer.total_bytes as u64, Ordering::Relaxed);

        if let Some(plugin) = &buffer.plugin {
            if let Some(mut ids) = self.by_plugin.get_mut(&plugin.to_lowercase()) {
                ids.retain(|i| i != id);
            }
        }
        if let Some(keyword) = &buffer.keyword {
            if let Some(mut ids) = self.by_keyword.get_mut(&keyword.to_lowercase()) {
                ids.retain(|i| i != id);
            }
        }
        Some(buffer)
    }

    /// Scans every buffer, draining and returning the ones that currently
    /// satisfy a flush trigger. Driven by the periodic sweeper task.
    pub async fn collect_flushable(&self) -> Vec<Buffer> {
        let ids: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        let mut ready = Vec::new();
        for id in ids {
            if self.should_flush(&id).await {
                if let Some(buffer) = self.take_buffer(&id).await {
                    ready.push(buffer);
                }
            }
        }
        ready
    }

    /// Drains and returns every non-empty buffer idle past `idle_ms`,
    /// regardless of whether any other trigger fired (T5). Distinct from
    /// [`Self::cleanup_idle`], which drops stale buffers outright instead of
    /// handing them back to be flushed.
    pub async fn collect_idle(&self, idle_ms: u64) -> Vec<Buffer> {
        let now = now_ms();
        let ids: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        let mut ready = Vec::new();
        for id in ids {
            let is_idle = {
                let Some(entry) = self.buffers.get(&id) else {
                    continue;
                };
                let buffer = entry.read().await;
                !buffer.is_empty() && now.saturating_sub(buffer.last_updated_ms) >= idle_ms
            };
            if is_idle {
                if let Some(buffer) = self.take_buffer(&id).await {
                    ready.push(buffer);
                }
            }
        }
        ready
    }

    /// Drops buffers that are empty or have been idle longer than
    /// `idle_ms`. Driven by the periodic cleanup task.
    pub async fn cleanup_idle(&self, idle_ms: u64) -> usize {
        let now = now_ms();
        let ids: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for id in ids {
            let is_idle = {
                let Some(entry) = self.buffers.get(&id) else {
                    continue;
                };
                let buffer = entry.read().await;
                buffer.is_empty() || now.saturating_sub(buffer.last_updated_ms) >= idle_ms
            };
            if is_idle && self.take_buffer(&id).await.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "buffer manager cleanup removed idle buffers");
        }
        removed
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn global_bytes(&self) -> u64 {
        self.global_bytes.load(Ordering::Relaxed)
    }

    /// Spawns the idle-buffer GC task described by C6. The trigger-check
    /// sweep that actually flushes buffers lives on the batch writer's own
    /// interval ticker (`DelayedBatchWriter::initialize`), since only the
    /// writer knows how to turn a ready `Buffer` into a disk write.
    pub fn spawn_cleanup_task(self: &Arc<Self>, cleanup_interval: std::time::Duration, idle_ms: u64) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                interval.tick().await;
                manager.cleanup_idle(idle_ms).await;
            }
        });

        info!("buffer manager cleanup task started");
        handle
    }
}
