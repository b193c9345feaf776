//! C5: operation coalescer. Multiple writes to the same key queued ahead of
//! a batch flush collapse into the single latest operation — last write
//! wins, and the number of writes a given key absorbed is tracked so the
//! batch writer's auto-tuning (C7) can see how much coalescing is
//! happening under load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct CacheOperation {
    pub key: String,
    pub value: Vec<u8>,
    pub is_final: bool,
    pub timestamp_ms: u64,
    /// Lower is higher priority, mirrors `Provider::priority`. Used by the
    /// batch writer's priority-ratio flush trigger.
    pub priority: u8,
}

#[derive(Default)]
pub struct OperationCoalescer {
    pending: DashMap<String, CacheOperation>,
    merge_count: AtomicU64,
}

impl OperationCoalescer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces any pending operation for `op.key` with `op`. Returns
    /// `true` if an existing operation was merged away.
    pub fn add_operation(&self, op: CacheOperation) -> bool {
        let merged = self.pending.insert(op.key.clone(), op).is_some();
        if merged {
            self.merge_count.fetch_add(1, Ordering::Relaxed);
        }
        merged
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn merge_count(&self) -> u64 {
        self.merge_count.load(Ordering::Relaxed)
    }

    /// Drains every pending operation, handing ownership to the caller
    /// (the batch writer assembling a flush).
    pub fn drain(&self) -> Vec<CacheOperation> {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|(_, v)| v))
            .collect()
    }
}
