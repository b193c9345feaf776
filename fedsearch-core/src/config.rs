//! Typed configuration, populated from environment variables over computed
//! defaults. There is no file/CLI loading surface here — that's explicitly
//! out of scope; callers that want a config file can deserialize one into
//! this struct themselves, which is why it still derives `Serialize,
//! Deserialize`.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

fn env_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn clamp_u32(value: u32, lo: u32, hi: u32) -> u32 {
    value.clamp(lo, hi)
}

/// Smallest power of two greater than or equal to `n`.
fn next_power_of_two(n: u32) -> u32 {
    n.max(1).next_power_of_two()
}

/// How the two-level cache writes a fresh entry: `Immediate` updates both
/// tiers synchronously, `Hybrid` updates memory synchronously and defers
/// the disk write through the batch writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    Immediate,
    Hybrid,
}

impl FromStr for WriteStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(WriteStrategy::Immediate),
            "hybrid" => Ok(WriteStrategy::Hybrid),
            _ => Err(()),
        }
    }
}

/// How buffers are keyed before being handed to the batch writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferStrategy {
    ByPlugin,
    ByKeyword,
    Hybrid,
}

impl FromStr for BufferStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "by-plugin" => Ok(BufferStrategy::ByPlugin),
            "by-keyword" => Ok(BufferStrategy::ByKeyword),
            "hybrid" => Ok(BufferStrategy::Hybrid),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // C2 - sharded memory tier
    pub memory_shard_count: u32,
    pub memory_ttl_secs: u64,
    pub memory_max_entries_per_shard: u32,
    pub memory_shard_max_bytes: u64,

    // C3 - sharded disk tier
    pub disk_shard_count: u32,
    pub disk_ttl_secs: u64,
    pub disk_root: String,
    pub disk_shard_max_bytes: u64,

    // C4 - two-level cache
    pub write_strategy: WriteStrategy,

    // C6 - global buffer manager
    pub buffer_strategy: BufferStrategy,
    pub buffer_window_secs: u64,
    pub buffer_max_bytes: usize,
    pub buffer_cleanup_interval_secs: u64,
    pub buffer_sweep_interval_secs: u64,

    // C7 - delayed batch writer
    pub batch_max_interval_ms: u64,
    pub batch_max_size: usize,
    pub batch_max_bytes: usize,
    pub batch_priority_ratio: f64,
    pub batch_idle_flush_ms: u64,
    pub batch_channel_capacity: usize,
    pub batch_autotune_interval_secs: u64,
    pub batch_max_interval_floor_ms: u64,
    pub batch_max_interval_ceiling_ms: u64,
    pub batch_max_size_floor: usize,
    pub batch_max_size_ceiling: usize,

    // C1/C8 - worker pool & search core
    pub search_concurrency: usize,
    pub provider_timeout_ms: u64,
}

impl Config {
    /// Reads every field from its environment variable, falling back to a
    /// computed default when unset or unparsable. Out-of-range values are
    /// clamped rather than rejected: bad input degrades to a safe bound,
    /// it never panics at startup.
    pub fn from_env() -> Self {
        let logical_cpus = num_cpus::get() as u32;

        let memory_shard_count = clamp_u32(
            env_var("FEDSEARCH_MEMORY_SHARD_COUNT", next_power_of_two(logical_cpus * 2)),
            4,
            64,
        );
        let disk_shard_count = clamp_u32(
            env_var("FEDSEARCH_DISK_SHARD_COUNT", next_power_of_two(logical_cpus)),
            4,
            32,
        );

        Self {
            memory_shard_count,
            memory_ttl_secs: env_var("FEDSEARCH_MEMORY_TTL_SECS", 300),
            memory_max_entries_per_shard: env_var("FEDSEARCH_MEMORY_MAX_ENTRIES_PER_SHARD", 4096),
            memory_shard_max_bytes: env_var("FEDSEARCH_MEMORY_SHARD_MAX_BYTES", 64 * 1024 * 1024),

            disk_shard_count,
            disk_ttl_secs: env_var("FEDSEARCH_DISK_TTL_SECS", 86_400),
            disk_root: env_var("FEDSEARCH_DISK_ROOT", "./data/cache".to_string()),
            disk_shard_max_bytes: env_var("FEDSEARCH_DISK_SHARD_MAX_BYTES", 512 * 1024 * 1024),

            write_strategy: env::var("FEDSEARCH_WRITE_STRATEGY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(WriteStrategy::Hybrid),

            buffer_strategy: env::var("FEDSEARCH_BUFFER_STRATEGY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(BufferStrategy::Hybrid),
            buffer_window_secs: env_var("FEDSEARCH_BUFFER_WINDOW_SECS", 300),
            buffer_max_bytes: env_var("FEDSEARCH_BUFFER_MAX_BYTES", 4 * 1024 * 1024),
            buffer_cleanup_interval_secs: env_var("FEDSEARCH_BUFFER_CLEANUP_INTERVAL_SECS", 300),
            buffer_sweep_interval_secs: env_var("FEDSEARCH_BUFFER_SWEEP_INTERVAL_SECS", 120),

            batch_max_interval_ms: env_var("FEDSEARCH_BATCH_MAX_INTERVAL_MS", 2_000),
            batch_max_size: env_var("FEDSEARCH_BATCH_MAX_SIZE", 200),
            batch_max_bytes: env_var("FEDSEARCH_BATCH_MAX_BYTES", 1024 * 1024),
            batch_priority_ratio: env_var("FEDSEARCH_BATCH_PRIORITY_RATIO", 0.25),
            batch_idle_flush_ms: env_var("FEDSEARCH_BATCH_IDLE_FLUSH_MS", 5_000),
            batch_channel_capacity: env_var("FEDSEARCH_BATCH_CHANNEL_CAPACITY", 1024),
            batch_autotune_interval_secs: env_var("FEDSEARCH_BATCH_AUTOTUNE_INTERVAL_SECS", 300),
            batch_max_interval_floor_ms: env_var("FEDSEARCH_BATCH_MAX_INTERVAL_FLOOR_MS", 200),
            batch_max_interval_ceiling_ms: env_var("FEDSEARCH_BATCH_MAX_INTERVAL_CEILING_MS", 10_000),
            batch_max_size_floor: env_var("FEDSEARCH_BATCH_MAX_SIZE_FLOOR", 20),
            batch_max_size_ceiling: env_var("FEDSEARCH_BATCH_MAX_SIZE_CEILING", 2_000),

            search_concurrency: env_var(
                "FEDSEARCH_SEARCH_CONCURRENCY",
                (logical_cpus as usize).max(4) * 4,
            ),
            provider_timeout_ms: env_var("FEDSEARCH_PROVIDER_TIMEOUT_MS", 4_000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // Avoid reading the environment in tests/defaults; mirrors
        // `from_env()` with logical_cpus treated as 4.
        Self {
            memory_shard_count: 8,
            memory_ttl_secs: 300,
            memory_max_entries_per_shard: 4096,
            memory_shard_max_bytes: 64 * 1024 * 1024,
            disk_shard_count: 4,
            disk_ttl_secs: 86_400,
            disk_root: "./data/cache".to_string(),
            disk_shard_max_bytes: 512 * 1024 * 1024,
            write_strategy: WriteStrategy::Hybrid,
            buffer_strategy: BufferStrategy::Hybrid,
            buffer_window_secs: 300,
            buffer_max_bytes: 4 * 1024 * 1024,
            buffer_cleanup_interval_secs: 300,
            buffer_sweep_interval_secs: 120,
            batch_max_interval_ms: 2_000,
            batch_max_size: 200,
            batch_max_bytes: 1024 * 1024,
            batch_priority_ratio: 0.25,
            batch_idle_flush_ms: 5_000,
            batch_channel_capacity: 1024,
            batch_autotune_interval_secs: 300,
            batch_max_interval_floor_ms: 200,
            batch_max_interval_ceiling_ms: 10_000,
            batch_max_size_floor: 20,
            batch_max_size_ceiling: 2_000,
            search_concurrency: 16,
            provider_timeout_ms: 4_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_power_of_two_rounds_up() {
        assert_eq!(next_power_of_two(5), 8);
        assert_eq!(next_power_of_two(8), 8);
        assert_eq!(next_power_of_two(0), 1);
    }

    #[test]
    fn clamp_keeps_values_in_range() {
        assert_eq!(clamp_u32(2, 4, 64), 4);
        assert_eq!(clamp_u32(128, 4, 64), 64);
        assert_eq!(clamp_u32(16, 4, 64), 16);
    }

    #[test]
    fn write_strategy_parses_case_insensitively() {
        assert_eq!("HYBRID".parse::<WriteStrategy>().unwrap(), WriteStrategy::Hybrid);
        assert_eq!("immediate".parse::<WriteStrategy>().unwrap(), WriteStrategy::Immediate);
    }
}
