//! C4: the two-level cache itself, composing the memory tier (C2) and disk
//! tier (C3) behind one API. Memory writes are always synchronous; disk
//! writes are synchronous under `WriteStrategy::Immediate` and deferred
//! (left to the batch writer to flush later) under `WriteStrategy::Hybrid`.

use std::sync::Arc;
use std::time::Duration;

use fedsearch_core::config::WriteStrategy;
use tracing::info;

use crate::disk::DiskTier;
use crate::error::CacheError;
use crate::memory::MemoryTier;

pub struct TwoLevelCache {
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    write_strategy: WriteStrategy,
}

impl TwoLevelCache {
    pub fn new(memory: Arc<MemoryTier>, disk: Arc<DiskTier>, write_strategy: WriteStrategy) -> Self {
        Self {
            memory,
            disk,
            write_strategy,
        }
    }

    /// Checks memory first; on a disk hit, promotes the value back into
    /// memory so the next lookup is served from the faster tier, preserving
    /// the disk entry's original expiry rather than minting a fresh TTL.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(value) = self.memory.get(key).await {
            return Ok(Some(value));
        }
        if let Some((value, expires_at_ms)) = self.disk.get_with_expiry(key).await? {
            self.memory.set_with_expiry(key, value.clone(), true, expires_at_ms).await;
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// Writes through to both tiers synchronously regardless of strategy.
    /// Used for entries that must be durable immediately (e.g. a final,
    /// complete search response being cached under `Immediate`).
    pub async fn set_both_levels(&self, key: &str, value: Vec<u8>, is_final: bool) -> Result<(), CacheError> {
        self.memory.set(key, value.clone(), is_final).await;
        self.disk.set(key, value, is_final).await
    }

    pub async fn set_memory_only(&self, key: &str, value: Vec<u8>, is_final: bool) {
        self.memory.set(key, value, is_final).await;
    }

    /// Picks between [`Self::set_both_levels`] and [`Self::set_memory_only`]
    /// purely on `is_final`: a final write lands on both tiers, a partial
    /// write stays in memory until the disk write is enqueued separately
    /// (under `Hybrid`) or never needed (a partial write is never the last
    /// word on a key).
    pub async fn set_with_final_flag(&self, key: &str, value: Vec<u8>, is_final: bool) -> Result<(), CacheError> {
        if is_final {
            self.set_both_levels(key, value, is_final).await
        } else {
            self.set_memory_only(key, value, is_final).await;
            Ok(())
        }
    }

    /// Shutdown flush: writes every live memory entry to disk, each with
    /// its own remaining TTL preserved, rather than a fresh one.
    pub async fn flush_memory_to_disk(&self) -> Result<(), CacheError> {
        for (key, value, expires_at_ms, is_final) in self.memory.snapshot_live_entries().await {
            self.disk.set_with_expiry(&key, value, is_final, expires_at_ms).await?;
        }
        Ok(())
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy
    }

    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.memory
    }

    pub fn disk(&self) -> &Arc<DiskTier> {
        &self.disk
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "memory": self.memory.stats(),
            "disk": self.disk.stats(),
        })
    }

    /// Spawns the memory (5 min) and disk (10 min) expiry sweeps as
    /// background tasks, returning their join handles so the caller can
    /// cancel them on shutdown.
    pub fn spawn_sweepers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let memory = self.memory.clone();
        let memory_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                memory.sweep_expired().await;
            }
        });

        let disk = self.disk.clone();
        let disk_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                if let Err(err) = disk.sweep_expired().await {
                    tracing::warn!(error = %err, "disk tier expiry sweep failed");
                }
            }
        });

        info!("two-level cache expiry sweepers started");
        vec![memory_handle, disk_handle]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn build_cache(strategy: WriteStrategy) -> (TwoLevelCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskTier::new(dir.path(), 2, 3600, 100, u64::MAX).await.unwrap());
        let memory = Arc::new(MemoryTier::new(2, 3600, 100, u64::MAX, Some(disk.clone())));
        (TwoLevelCache::new(memory, disk, strategy), dir)
    }

    #[tokio::test]
    async fn get_promotes_disk_hit_into_memory() {
        let (cache, _dir) = build_cache(WriteStrategy::Immediate).await;
        cache.disk().set("k1", b"v1".to_vec(), true).await.unwrap();

        assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        // Now served from memory without touching disk again.
        let disk_hits_before = cache.disk().stats()["hits"].clone();
        cache.get("k1").await.unwrap();
        assert_eq!(cache.disk().stats()["hits"], disk_hits_before);
    }

    #[tokio::test]
    async fn get_preserves_disk_expiry_when_promoting_into_memory() {
        let (cache, _dir) = build_cache(WriteStrategy::Immediate).await;
        let target_expiry = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
            + 3_600_000;
        cache
            .disk()
            .set_with_expiry("k1", b"v1".to_vec(), true, target_expiry)
            .await
            .unwrap();

        cache.get("k1").await.unwrap();
        let live = cache.memory().snapshot_live_entries().await;
        let (_, _, expires_at_ms, _) = live.into_iter().find(|(k, ..)| k == "k1").unwrap();
        assert_eq!(expires_at_ms, target_expiry);
    }

    #[tokio::test]
    async fn immediate_strategy_writes_disk_synchronously() {
        let (cache, _dir) = build_cache(WriteStrategy::Immediate).await;
        cache.set_with_final_flag("k1", b"v1".to_vec(), true).await.unwrap();
        assert_eq!(cache.disk().get("k1").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn non_final_write_stays_memory_only_regardless_of_strategy() {
        let (cache, _dir) = build_cache(WriteStrategy::Immediate).await;
        cache.set_with_final_flag("k1", b"v1".to_vec(), false).await.unwrap();
        assert_eq!(cache.disk().get("k1").await.unwrap(), None);
        assert_eq!(cache.memory().get("k1").await, Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn hybrid_strategy_still_writes_both_tiers_for_a_final_write() {
        let (cache, _dir) = build_cache(WriteStrategy::Hybrid).await;
        cache.set_with_final_flag("k1", b"v1".to_vec(), true).await.unwrap();
        assert_eq!(cache.disk().get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(cache.memory().get("k1").await, Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn flush_memory_to_disk_writes_every_live_entry_with_its_own_ttl() {
        let (cache, _dir) = build_cache(WriteStrategy::Hybrid).await;
        cache.set_memory_only("k1", b"v1".to_vec(), false).await;
        cache.set_memory_only("k2", b"v2".to_vec(), false).await;

        cache.flush_memory_to_disk().await.unwrap();

        assert_eq!(cache.disk().get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(cache.disk().get("k2").await.unwrap(), Some(b"v2".to_vec()));
    }
}
