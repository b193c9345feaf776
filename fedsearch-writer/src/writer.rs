//! C7: the delayed batch writer. Cache writes chosen for deferred disk
//! persistence are admitted over a bounded channel, grouped into buffers by
//! the buffer manager (C6), and flushed to the two-level cache's disk tier
//! once a buffer trips one of six triggers:
//!
//! - T1 count — buffer operation count reaches `max_batch_size`
//! - T2 bytes — buffer byte total reaches `max_batch_bytes`
//! - T3 interval — buffer age reaches `max_batch_interval_ms`
//! - T4 priority-ratio — enough high-priority writes accumulate
//! - T5 idle — a non-empty buffer goes quiet past the idle deadline
//! - T6 force — an emergency flush triggered by admission backpressure
//!
//! `max_batch_interval_ms`/`max_batch_size` are auto-tuned periodically
//! from observed load so the writer drifts toward larger batches when the
//! system is quiet and smaller ones when the queue is backing up.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fedsearch_cache::{CacheOperation, TwoLevelCache};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, BufferManager};
use crate::error::WriterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Uninitialized,
    Running,
    Stopped,
}

pub struct AdmissionRequest {
    pub plugin: Option<String>,
    pub keyword: Option<String>,
    pub operation: CacheOperation,
}

pub struct WriterTuning {
    pub max_batch_interval_ms: AtomicU64,
    pub max_batch_size: AtomicUsize,
    floor_interval_ms: u64,
    ceiling_interval_ms: u64,
    floor_size: usize,
    ceiling_size: usize,
}

pub struct DelayedBatchWriter {
    state: RwLock<WriterState>,
    cache: Arc<TwoLevelCache>,
    buffers: Arc<BufferManager>,
    sender: mpsc::Sender<AdmissionRequest>,
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<AdmissionRequest>>>,
    failed_writes: AtomicU64,
    flushed_batches: AtomicU64,
    queue_depth: AtomicUsize,
    channel_capacity: usize,
    idle_flush_ms: u64,
    tuning: WriterTuning,
}

impl DelayedBatchWriter {
    pub fn new(
        cache: Arc<TwoLevelCache>,
        buffers: Arc<BufferManager>,
        channel_capacity: usize,
        max_batch_interval_ms: u64,
        max_batch_size: usize,
        idle_flush_ms: u64,
        interval_bounds: (u64, u64),
        size_bounds: (usize, usize),
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(channel_capacity);
        Arc::new(Self {
            state: RwLock::new(WriterState::Uninitialized),
            cache,
            buffers,
            sender,
            receiver: tokio::sync::Mutex::new(Some(receiver)),
            failed_writes: AtomicU64::new(0),
            flushed_batches: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            channel_capacity,
            idle_flush_ms,
            tuning: WriterTuning {
                max_batch_interval_ms: AtomicU64::new(max_batch_interval_ms),
                max_batch_size: AtomicUsize::new(max_batch_size),
                floor_interval_ms: interval_bounds.0,
                ceiling_interval_ms: interval_bounds.1,
                floor_size: size_bounds.0,
                ceiling_size: size_bounds.1,
            },
        })
    }

    pub async fn state(&self) -> WriterState {
        *self.state.read().await
    }

    /// Transitions `Uninitialized -> Running` and spawns the three
    /// cooperating background tasks: the admission drainer, the T1 interval
    /// ticker (re-reads the live auto-tuned interval each pass rather than a
    /// fixed cadence), and the T5 buffer sweeper (cadence fixed at
    /// `buffer_sweep_interval`, triggers on idleness via `idle_flush_ms`).
    /// The auto-tune ticker runs alongside them on `autotune_interval`.
    /// Returns `WriterError::AlreadyRunning` if called twice.
    pub async fn initialize(self: &Arc<Self>, autotune_interval: Duration, buffer_sweep_interval: Duration) -> Result<(), WriterError> {
        {
            let mut state = self.state.write().await;
            if *state != WriterState::Uninitialized {
                return Err(WriterError::AlreadyRunning);
            }
            *state = WriterState::Running;
        }

        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .expect("receiver taken exactly once during initialize");

        let writer = self.clone();
        tokio::spawn(async move {
            info!("batch writer admission loop started");
            while let Some(request) = receiver.recv().await {
                writer.queue_depth.fetch_sub(1, Ordering::Relaxed);
                writer.admit(request).await;
            }
            debug!("batch writer admission loop exiting");
        });

        let writer = self.clone();
        tokio::spawn(async move {
            info!("batch writer interval ticker started");
            loop {
                let wait = writer.tuning.max_batch_interval_ms.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(wait)).await;
                if writer.state().await != WriterState::Running {
                    break;
                }
                for buffer in writer.buffers.collect_flushable().await {
                    writer.flush_buffer(buffer).await;
                }
            }
            debug!("batch writer interval ticker exiting");
        });

        let writer = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(buffer_sweep_interval);
            info!("batch writer buffer sweeper started");
            loop {
                interval.tick().await;
                if writer.state().await != WriterState::Running {
                    break;
                }
                writer.flush_idle(writer.idle_flush_ms).await;
            }
            debug!("batch writer buffer sweeper exiting");
        });

        let writer = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(autotune_interval);
            loop {
                interval.tick().await;
                if writer.state().await != WriterState::Running {
                    break;
                }
                writer.autotune();
            }
        });

        info!("batch writer initialized");
        Ok(())
    }

    async fn admit(&self, request: AdmissionRequest) {
        let should_flush = self
            .buffers
            .add_operation(request.plugin.as_deref(), request.keyword.as_deref(), request.operation)
            .await;
        if should_flush {
            let id = self.buffers.buffer_id(request.plugin.as_deref(), request.keyword.as_deref());
            if let Some(buffer) = self.buffers.take_buffer(&id).await {
                self.flush_buffer(buffer).await;
            }
        }
    }

    /// Admission path for a write the caller wants deferred to disk.
    /// Applies emergency-flush backpressure (T6) if the channel is full.
    pub async fn handle_cache_write(
        &self,
        plugin: Option<String>,
        keyword: Option<String>,
        operation: CacheOperation,
    ) -> Result<(), WriterError> {
        if self.state().await != WriterState::Running {
            return Err(WriterError::NotRunning);
        }

        let request = AdmissionRequest { plugin, keyword, operation };
        match self.sender.try_send(request) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!("admission channel full, forcing emergency flush");
                self.emergency_flush().await;
                self.sender
                    .send(request)
                    .await
                    .map_err(|_| WriterError::ChannelFull)?;
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WriterError::ChannelFull),
        }
    }

    /// T6: drains and flushes every currently buffered operation
    /// regardless of trigger state, used when admission is backed up.
    async fn emergency_flush(&self) {
        for buffer in self.buffers.collect_flushable().await {
            self.flush_buffer(buffer).await;
        }
    }

    /// T5: flushes any non-empty buffer idle past `idle_ms` even if no
    /// other trigger fired. Driven by the buffer sweeper task spawned in
    /// `initialize`, on a cadence independent of the buffer manager's own
    /// idle-GC cleanup task.
    pub async fn flush_idle(&self, idle_ms: u64) {
        for buffer in self.buffers.collect_idle(idle_ms).await {
            self.flush_buffer(buffer).await;
        }
    }

    async fn flush_buffer(&self, buffer: Buffer) {
        if buffer.is_empty() {
            return;
        }
        let batch_len = buffer.operations.len();
        for op in buffer.operations {
            if let Err(err) = self.cache.disk().set(&op.key, op.value, op.is_final).await {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                error!(key = %op.key, error = %err, "batch write to disk tier failed");
            }
        }
        self.flushed_batches.fetch_add(1, Ordering::Relaxed);
        debug!(batch_len, buffer_id = %buffer.id, "flushed batch to disk tier");
    }

    /// Adjusts `max_batch_interval_ms`/`max_batch_size` from the observed
    /// queue depth in ±20% steps: the interval reacts to load ratio
    /// (queue depth over channel capacity) against 0.8/0.3 thresholds, the
    /// size reacts to the raw queue depth against 200/50 thresholds. Both
    /// shrink under load (flush sooner, smaller) and grow when idle
    /// (coalesce more before flushing), always within the configured
    /// floor/ceiling.
    fn autotune(&self) {
        let depth = self.queue_depth.load(Ordering::Relaxed);
        let load_ratio = depth as f64 / self.channel_capacity.max(1) as f64;

        let interval = self.tuning.max_batch_interval_ms.load(Ordering::Relaxed);
        let new_interval = if load_ratio > 0.8 {
            (interval as f64 * 0.8) as u64
        } else if load_ratio < 0.3 {
            (interval as f64 * 1.2) as u64
        } else {
            interval
        };

        let size = self.tuning.max_batch_size.load(Ordering::Relaxed);
        let new_size = if depth > 200 {
            (size as f64 * 0.8) as usize
        } else if depth < 50 {
            (size as f64 * 1.2) as usize
        } else {
            size
        };

        let new_interval = new_interval.clamp(self.tuning.floor_interval_ms, self.tuning.ceiling_interval_ms);
        let new_size = new_size.clamp(self.tuning.floor_size, self.tuning.ceiling_size);

        self.tuning.max_batch_interval_ms.store(new_interval, Ordering::Relaxed);
        self.tuning.max_batch_size.store(new_size, Ordering::Relaxed);

        debug!(load_ratio, depth, new_interval, new_size, "batch writer auto-tune pass");
    }

    /// Transitions `Running -> Stopped`, flushing every remaining buffer
    /// within `timeout_duration`. Returns `WriterError::ShutdownTimeout` if
    /// the flush doesn't complete in time.
    pub async fn shutdown(self: &Arc<Self>, timeout_duration: Duration) -> Result<(), WriterError> {
        {
            let mut state = self.state.write().await;
            if *state != WriterState::Running {
                return Err(WriterError::NotRunning);
            }
            *state = WriterState::Stopped;
        }

        let writer = self.clone();
        let drain = async move {
            writer.emergency_flush().await;
        };

        match timeout(timeout_duration, drain).await {
            Ok(()) => {
                info!("batch writer shut down cleanly");
                Ok(())
            }
            Err(_) => {
                error!("batch writer shutdown exceeded timeout");
                Err(WriterError::ShutdownTimeout)
            }
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "failed_writes": self.failed_writes.load(Ordering::Relaxed),
            "flushed_batches": self.flushed_batches.load(Ordering::Relaxed),
            "queue_depth": self.queue_depth.load(Ordering::Relaxed),
            "max_batch_interval_ms": self.tuning.max_batch_interval_ms.load(Ordering::Relaxed),
            "max_batch_size": self.tuning.max_batch_size.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsearch_cache::{DiskTier, MemoryTier, TwoLevelCache};
    use fedsearch_core::config::WriteStrategy;

    fn op(key: &str) -> CacheOperation {
        CacheOperation {
            key: key.to_string(),
            value: b"v".to_vec(),
            is_final: true,
            timestamp_ms: 0,
            priority: 4,
        }
    }

    async fn build() -> (Arc<DelayedBatchWriter>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskTier::new(dir.path(), 2, 3600, 100, u64::MAX).await.unwrap());
        let memory = Arc::new(MemoryTier::new(2, 3600, 100, u64::MAX, Some(disk.clone())));
        let cache = Arc::new(TwoLevelCache::new(memory, disk, WriteStrategy::Hybrid));
        let buffers = crate::buffer::BufferManager::new(crate::buffer::BufferManagerConfig {
            strategy: fedsearch_core::config::BufferStrategy::ByPlugin,
            max_batch_size: 2,
            max_batch_bytes: 1_000_000,
            max_batch_interval_ms: 1_000_000,
            priority_ratio: 2.0,
            global_max_bytes: 1_000_000,
        });
        let writer = DelayedBatchWriter::new(cache, buffers, 8, 1_000_000, 2, 1_000_000, (100, 10_000), (1, 100));
        (writer, dir)
    }

    #[tokio::test]
    async fn starts_uninitialized_and_transitions_to_running() {
        let (writer, _dir) = build().await;
        assert_eq!(writer.state().await, WriterState::Uninitialized);
        writer
            .initialize(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(writer.state().await, WriterState::Running);
    }

    #[tokio::test]
    async fn double_initialize_is_rejected() {
        let (writer, _dir) = build().await;
        writer
            .initialize(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();
        let err = writer
            .initialize(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, WriterError::AlreadyRunning));
    }

    #[tokio::test]
    async fn write_before_initialize_is_rejected() {
        let (writer, _dir) = build().await;
        let err = writer
            .handle_cache_write(Some("p".into()), None, op("k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WriterError::NotRunning));
    }

    #[tokio::test]
    async fn count_trigger_flushes_batch_to_disk() {
        let (writer, _dir) = build().await;
        writer
            .initialize(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();
        writer.handle_cache_write(Some("p".into()), None, op("k1")).await.unwrap();
        writer.handle_cache_write(Some("p".into()), None, op("k2")).await.unwrap();

        // Give the admission loop a tick to process both writes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer.stats()["flushed_batches"], 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_buffers() {
        let (writer, _dir) = build().await;
        writer
            .initialize(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();
        writer.handle_cache_write(Some("p".into()), None, op("k1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        writer.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(writer.state().await, WriterState::Stopped);
    }
}
