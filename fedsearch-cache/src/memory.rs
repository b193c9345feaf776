//! C2: sharded in-memory cache tier. Keys route to shards by FNV-1a, each
//! shard guards its own `HashMap` behind a `tokio::sync::RwLock`, and
//! eviction is LRU by `last_used`. An evicted entry is handed to the disk
//! tier (if one was wired in) so a hot key that falls out of memory isn't
//! simply lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::disk::DiskTier;
use crate::fnv::shard_index;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug)]
pub struct MemoryEntry {
    pub value: Vec<u8>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    /// Updated on every read without taking the shard's write lock.
    pub last_used_ms: AtomicU64,
    pub is_final: bool,
}

impl Clone for MemoryEntry {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            created_at_ms: self.created_at_ms,
            expires_at_ms: self.expires_at_ms,
            last_used_ms: AtomicU64::new(self.last_used_ms.load(Ordering::Relaxed)),
            is_final: self.is_final,
        }
    }
}

impl MemoryEntry {
    fn size(&self) -> usize {
        self.value.len()
    }
}

#[derive(Debug, Default)]
pub struct MemoryTierStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

struct Shard {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    /// Running sum of `entries[*].size`, kept so `shardMaxBytes` eviction
    /// doesn't need to walk every entry per write.
    bytes: AtomicU64,
}

pub struct MemoryTier {
    shards: Vec<Shard>,
    shard_count: u32,
    ttl_secs: u64,
    max_entries_per_shard: u32,
    max_bytes_per_shard: u64,
    disk: Option<Arc<DiskTier>>,
    stats: MemoryTierStats,
}

impl MemoryTier {
    pub fn new(
        shard_count: u32,
        ttl_secs: u64,
        max_entries_per_shard: u32,
        max_bytes_per_shard: u64,
        disk: Option<Arc<DiskTier>>,
    ) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| Shard {
                entries: RwLock::new(HashMap::new()),
                bytes: AtomicU64::new(0),
            })
            .collect();
        Self {
            shards,
            shard_count,
            ttl_secs,
            max_entries_per_shard,
            max_bytes_per_shard,
            disk,
            stats: MemoryTierStats::default(),
        }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        &self.shards[shard_index(key, self.shard_count)]
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let shard = self.shard_for(key);
        let now = now_ms();
        {
            let entries = shard.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if entry.expires_at_ms <= now {
                    // Expired; fall through to remove below rather than
                    // serve stale data.
                } else {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    entry.last_used_ms.store(now, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
        }
        // Either absent or expired.
        let mut entries = shard.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.expires_at_ms <= now {
                if let Some(removed) = entries.remove(key) {
                    shard.bytes.fetch_sub(removed.size() as u64, Ordering::Relaxed);
                }
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Inserts `value` under `key` with a fresh expiry computed from the
    /// tier's configured TTL. If the shard is over its entry-count or
    /// byte-budget cap, the least recently used entries are evicted (and,
    /// if a disk tier is configured and the victim's expiry is still in the
    /// future, backed up there asynchronously) before the new entry lands.
    pub async fn set(&self, key: &str, value: Vec<u8>, is_final: bool) {
        let expires_at_ms = now_ms() + self.ttl_secs * 1000;
        self.set_with_expiry(key, value, is_final, expires_at_ms).await;
    }

    /// Same as [`Self::set`] but with an explicit `expires_at_ms`, used when
    /// a caller (disk-to-memory promotion) must preserve an entry's
    /// original expiry rather than restart the TTL.
    pub async fn set_with_expiry(&self, key: &str, value: Vec<u8>, is_final: bool, expires_at_ms: u64) {
        let now = now_ms();
        let value_len = value.len() as u64;
        let entry = MemoryEntry {
            value,
            created_at_ms: now,
            expires_at_ms,
            last_used_ms: AtomicU64::new(now),
            is_final,
        };

        let shard = self.shard_for(key);
        let evicted: Vec<(String, MemoryEntry)> = {
            let mut entries = shard.entries.write().await;
            let existing_size = entries.get(key).map(|e| e.size() as u64).unwrap_or(0);
            let mut bytes = shard.bytes.load(Ordering::Relaxed).saturating_sub(existing_size);
            let mut evicted = Vec::new();

            while (entries.len() as u32 >= self.max_entries_per_shard && !entries.contains_key(key))
                || bytes + value_len > self.max_bytes_per_shard
            {
                let victim = Self::evict_lru(&mut entries);
                match victim {
                    Some((victim_key, victim_entry)) => {
                        bytes = bytes.saturating_sub(victim_entry.size() as u64);
                        evicted.push((victim_key, victim_entry));
                    }
                    None => break,
                }
            }

            entries.insert(key.to_string(), entry);
            shard.bytes.store(bytes + value_len, Ordering::Relaxed);
            evicted
        };

        for (evicted_key, evicted_entry) in evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %evicted_key, "memory tier evicted LRU entry");
            if evicted_entry.expires_at_ms > now {
                if let Some(disk) = self.disk.clone() {
                    let expires_at_ms = evicted_entry.expires_at_ms;
                    let is_final = evicted_entry.is_final;
                    let value = evicted_entry.value;
                    // Backing up an evicted entry must never block the
                    // caller holding the lock that triggered the eviction.
                    tokio::spawn(async move {
                        if let Err(err) = disk.set_with_expiry(&evicted_key, value, is_final, expires_at_ms).await {
                            tracing::warn!(key = %evicted_key, error = %err, "failed to back up evicted entry to disk tier");
                        }
                    });
                }
            }
        }
    }

    fn evict_lru(entries: &mut HashMap<String, MemoryEntry>) -> Option<(String, MemoryEntry)> {
        let victim = entries
            .iter()
            .min_by_key(|(_, e)| e.last_used_ms.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone())?;
        entries.remove(&victim).map(|e| (victim, e))
    }

    pub async fn remove(&self, key: &str) {
        let shard = self.shard_for(key);
        if let Some(removed) = shard.entries.write().await.remove(key) {
            shard.bytes.fetch_sub(removed.size() as u64, Ordering::Relaxed);
        }
    }

    /// Sweeps every shard removing expired entries. Intended to be driven
    /// by a background `tokio::spawn` loop every few minutes.
    pub async fn sweep_expired(&self) -> u64 {
        let now = now_ms();
        let mut removed = 0u64;
        for shard in &self.shards {
            let mut entries = shard.entries.write().await;
            let before = entries.len();
            let mut freed = 0u64;
            entries.retain(|_, e| {
                let keep = e.expires_at_ms > now;
                if !keep {
                    freed += e.size() as u64;
                }
                keep
            });
            shard.bytes.fetch_sub(freed, Ordering::Relaxed);
            removed += (before - entries.len()) as u64;
        }
        if removed > 0 {
            self.stats.expirations.fetch_add(removed, Ordering::Relaxed);
            info!(removed, "memory tier expiry sweep");
        }
        removed
    }

    /// Snapshots every live (non-expired) entry across every shard, used by
    /// the two-level cache's shutdown flush to write each one to disk with
    /// its individually remaining TTL preserved.
    pub async fn snapshot_live_entries(&self) -> Vec<(String, Vec<u8>, u64, bool)> {
        let now = now_ms();
        let mut out = Vec::new();
        for shard in &self.shards {
            let entries = shard.entries.read().await;
            for (key, entry) in entries.iter() {
                if entry.expires_at_ms > now {
                    out.push((key.clone(), entry.value.clone(), entry.expires_at_ms, entry.is_final));
                }
            }
        }
        out
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
        let tier = MemoryTier::new(4, 60, 100, u64::MAX, None);
        tier.set("k1", b"v1".to_vec(), false).await;
        assert_eq!(tier.get("k1").await, Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let tier = MemoryTier::new(4, 60, 100, u64::MAX, None);
        assert_eq!(tier.get("missing").await, None);
    }

    #[tokio::test]
    async fn expired_entry_is_not_served() {
        let tier = MemoryTier::new(1, 0, 100, u64::MAX, None);
        tier.set("k1", b"v1".to_vec(), false).await;
        // ttl_secs = 0 means expires_at_ms == created_at_ms <= now on next check.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(tier.get("k1").await, None);
    }

    #[tokio::test]
    async fn evicts_lru_when_shard_full() {
        let tier = MemoryTier::new(1, 60, 2, u64::MAX, None);
        tier.set("a", b"1".to_vec(), false).await;
        tier.set("b", b"2".to_vec(), false).await;
        // touch "a" so "b" becomes the LRU victim.
        tier.get("a").await;
        tier.set("c", b"3".to_vec(), false).await;

        assert_eq!(tier.get("a").await, Some(b"1".to_vec()));
        assert_eq!(tier.get("b").await, None);
        assert_eq!(tier.get("c").await, Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn evicts_lru_when_shard_over_byte_budget() {
        let tier = MemoryTier::new(1, 60, 100, 2, None);
        tier.set("a", b"1".to_vec(), false).await;
        tier.set("b", b"2".to_vec(), false).await;
        // Both fit (2 bytes total); adding a third must evict "a".
        tier.set("c", b"3".to_vec(), false).await;

        assert_eq!(tier.get("a").await, None);
        assert_eq!(tier.get("c").await, Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_entries() {
        let tier = MemoryTier::new(2, 0, 100, u64::MAX, None);
        tier.set("a", b"1".to_vec(), false).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = tier.sweep_expired().await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn snapshot_live_entries_excludes_expired() {
        let tier = MemoryTier::new(1, 3600, 100, u64::MAX, None);
        tier.set("a", b"1".to_vec(), false).await;
        tier.set_with_expiry("b", b"2".to_vec(), false, now_ms()).await;
        let live = tier.snapshot_live_entries().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, "a");
    }
}
