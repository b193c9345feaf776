//! C3: sharded on-disk cache tier. Each shard is a directory; an entry's
//! value lives at `<shard_dir>/<blake3-hex>.bin` with metadata (timestamps,
//! size, the finality flag) in a `.meta` sidecar. The tier tolerates a
//! shard directory being deleted out from under it — `Set` just recreates
//! the directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::fnv::shard_index;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn content_hash(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskMeta {
    key: String,
    created_at_ms: u64,
    expires_at_ms: u64,
    last_used_ms: u64,
    size: usize,
    is_final: bool,
}

#[derive(Debug, Default)]
pub struct DiskTierStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

struct ShardIndex {
    /// In-memory mirror of each entry's `.meta`, kept so LRU eviction and
    /// expiry sweeps don't need to re-read every sidecar file from disk.
    entries: RwLock<HashMap<String, DiskMeta>>,
    /// Running sum of `entries[*].size`, kept alongside the map so
    /// `shardMaxBytes` eviction doesn't need to walk every entry per write.
    bytes: AtomicU64,
    dir: PathBuf,
}

pub struct DiskTier {
    shards: Vec<ShardIndex>,
    shard_count: u32,
    ttl_secs: u64,
    max_entries_per_shard: u32,
    max_bytes_per_shard: u64,
    stats: DiskTierStats,
}

impl DiskTier {
    pub async fn new(
        root: impl AsRef<Path>,
        shard_count: u32,
        ttl_secs: u64,
        max_entries_per_shard: u32,
        max_bytes_per_shard: u64,
    ) -> Result<Self, CacheError> {
        let shard_count = shard_count.max(1).next_power_of_two();
        let root = root.as_ref();
        let mut shards = Vec::with_capacity(shard_count as usize);
        for i in 0..shard_count {
            let dir = root.join(format!("shard_{i}"));
            fs::create_dir_all(&dir).await?;
            let entries = Self::load_shard_index(&dir).await?;
            let bytes = entries.values().map(|m| m.size as u64).sum();
            shards.push(ShardIndex {
                entries: RwLock::new(entries),
                bytes: AtomicU64::new(bytes),
                dir,
            });
        }
        Ok(Self {
            shards,
            shard_count,
            ttl_secs,
            max_entries_per_shard,
            max_bytes_per_shard,
            stats: DiskTierStats::default(),
        })
    }

    async fn load_shard_index(dir: &Path) -> Result<HashMap<String, DiskMeta>, CacheError> {
        let mut index = HashMap::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(index),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let raw = fs::read(&path).await?;
            if let Ok(meta) = serde_json::from_slice::<DiskMeta>(&raw) {
                index.insert(meta.key.clone(), meta);
            }
        }
        Ok(index)
    }

    fn shard_for(&self, key: &str) -> &ShardIndex {
        &self.shards[shard_index(key, self.shard_count)]
    }

    fn paths(dir: &Path, key: &str) -> (PathBuf, PathBuf) {
        let hash = content_hash(key);
        (dir.join(format!("{hash}.bin")), dir.join(format!("{hash}.meta")))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.get_with_expiry(key).await?.map(|(value, _)| value))
    }

    /// Same as [`Self::get`] but also returns the entry's `expires_at_ms`,
    /// so a caller promoting the value into another tier can preserve the
    /// original expiry instead of minting a fresh one.
    pub async fn get_with_expiry(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>, CacheError> {
        let shard = self.shard_for(key);
        let now = now_ms();

        let meta = {
            let entries = shard.entries.read().await;
            entries.get(key).cloned()
        };
        let Some(meta) = meta else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        if meta.expires_at_ms <= now {
            self.remove(key).await?;
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let (data_path, _) = Self::paths(&shard.dir, key);
        let value = match fs::read(&data_path).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Directory was tampered with externally; treat as a miss
                // rather than a hard failure.
                warn!(key, "disk tier meta present but data file missing");
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        self.touch(key, now).await;
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some((value, meta.expires_at_ms)))
    }

    async fn touch(&self, key: &str, now: u64) {
        let shard = self.shard_for(key);
        let mut entries = shard.entries.write().await;
        if let Some(meta) = entries.get_mut(key) {
            meta.last_used_ms = now;
            let (_, meta_path) = Self::paths(&shard.dir, key);
            if let Ok(raw) = serde_json::to_vec(meta) {
                let _ = fs::write(meta_path, raw).await;
            }
        }
    }

    /// Writes `value` under `key` with a fresh expiry computed from the
    /// tier's configured TTL.
    pub async fn set(&self, key: &str, value: Vec<u8>, is_final: bool) -> Result<(), CacheError> {
        let expires_at_ms = now_ms() + self.ttl_secs * 1000;
        self.set_with_expiry(key, value, is_final, expires_at_ms).await
    }

    /// Writes `value` under `key` with an explicit `expires_at_ms`, used
    /// when a caller (eviction backup, shutdown flush, tier promotion) must
    /// preserve an entry's remaining TTL rather than restart it.
    pub async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        is_final: bool,
        expires_at_ms: u64,
    ) -> Result<(), CacheError> {
        let shard = self.shard_for(key);
        // Tolerate the shard directory having been deleted externally.
        fs::create_dir_all(&shard.dir).await?;

        let now = now_ms();
        let value_len = value.len() as u64;
        let meta = DiskMeta {
            key: key.to_string(),
            created_at_ms: now,
            expires_at_ms,
            last_used_ms: now,
            size: value.len(),
            is_final,
        };

        let evicted: Vec<String> = {
            let mut entries = shard.entries.write().await;
            let existing_size = entries.get(key).map(|m| m.size as u64).unwrap_or(0);
            let mut bytes = shard.bytes.load(Ordering::Relaxed).saturating_sub(existing_size);
            let mut evicted = Vec::new();

            while (entries.len() as u32 >= self.max_entries_per_shard && !entries.contains_key(key))
                || bytes + value_len > self.max_bytes_per_shard
            {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, m)| m.last_used_ms)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(v) if v != key => {
                        if let Some(m) = entries.remove(&v) {
                            bytes = bytes.saturating_sub(m.size as u64);
                            evicted.push(v);
                        }
                    }
                    _ => break,
                }
            }

            entries.insert(key.to_string(), meta.clone());
            shard.bytes.store(bytes + value_len, Ordering::Relaxed);
            evicted
        };

        let (data_path, meta_path) = Self::paths(&shard.dir, key);
        fs::write(&data_path, &value).await?;
        fs::write(&meta_path, serde_json::to_vec(&meta).map_err(|e| CacheError::Serialization(e.to_string()))?).await?;

        for victim in evicted {
            let (victim_data, victim_meta) = Self::paths(&shard.dir, &victim);
            let _ = fs::remove_file(victim_data).await;
            let _ = fs::remove_file(victim_meta).await;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, "disk tier evicted LRU entry");
        }

        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let shard = self.shard_for(key);
        let removed = shard.entries.write().await.remove(key);
        if let Some(meta) = removed {
            shard.bytes.fetch_sub(meta.size as u64, Ordering::Relaxed);
            let (data_path, meta_path) = Self::paths(&shard.dir, key);
            let _ = fs::remove_file(data_path).await;
            let _ = fs::remove_file(meta_path).await;
        }
        Ok(())
    }

    pub async fn sweep_expired(&self) -> Result<u64, CacheError> {
        let now = now_ms();
        let mut removed = 0u64;
        for shard in &self.shards {
            let expired: Vec<String> = {
                let entries = shard.entries.read().await;
                entries
                    .iter()
                    .filter(|(_, m)| m.expires_at_ms <= now)
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            for key in expired {
                self.remove(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.stats.expirations.fetch_add(removed, Ordering::Relaxed);
            info!(removed, "disk tier expiry sweep");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "hits": self.stats.hits.load(Ordering::Relaxed),
            "misses": self.stats.misses.load(Ordering::Relaxed),
            "evictions": self.stats.evictions.load(Ordering::Relaxed),
            "expirations": self.stats.expirations.load(Ordering::Relaxed),
            "shard_count": self.shard_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path(), 2, 3600, 100, u64::MAX).await.unwrap();
        tier.set("k1", b"hello".to_vec(), true).await.unwrap();
        assert_eq!(tier.get("k1").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn survives_externally_deleted_shard_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path(), 1, 3600, 100, u64::MAX).await.unwrap();
        tier.set("k1", b"v".to_vec(), false).await.unwrap();

        let shard_dir = dir.path().join("shard_0");
        tokio::fs::remove_dir_all(&shard_dir).await.unwrap();

        tier.set("k2", b"v2".to_vec(), false).await.unwrap();
        assert_eq!(tier.get("k2").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path(), 1, 0, 100, u64::MAX).await.unwrap();
        tier.set("k1", b"v".to_vec(), false).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(tier.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn evicts_lru_when_shard_full() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path(), 1, 3600, 1, u64::MAX).await.unwrap();
        tier.set("a", b"1".to_vec(), false).await.unwrap();
        tier.set("b", b"2".to_vec(), false).await.unwrap();
        assert_eq!(tier.get("a").await.unwrap(), None);
        assert_eq!(tier.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn evicts_lru_when_shard_over_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path(), 1, 3600, 100, 10).await.unwrap();
        tier.set("a", b"12345".to_vec(), false).await.unwrap();
        tier.set("b", b"67890".to_vec(), false).await.unwrap();
        // Both entries fit (10 bytes total); adding a third must evict "a".
        tier.set("c", b"abcde".to_vec(), false).await.unwrap();
        assert_eq!(tier.get("a").await.unwrap(), None);
        assert_eq!(tier.get("c").await.unwrap(), Some(b"abcde".to_vec()));
    }

    #[tokio::test]
    async fn set_with_expiry_preserves_a_supplied_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path(), 1, 3600, 100, u64::MAX).await.unwrap();
        let target_expiry = now_ms() + 50;
        tier.set_with_expiry("k1", b"v".to_vec(), false, target_expiry).await.unwrap();
        let (_, expires_at_ms) = tier.get_with_expiry("k1").await.unwrap().unwrap();
        assert_eq!(expires_at_ms, target_expiry);
    }
}
