//! Configuration structures for NimbusDB.

use crate::error::{NimbusError, Result};
use crate::types::Priority;
use serde::{Deserialize, Serialize};

/// Message scheduler configuration for one runtime.
///
/// Priorities are small signed integers; `ordered_priority` is the lane
/// shared by all ordered messages and must lie inside
/// `[min_priority, max_priority]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Lowest priority level.
    pub min_priority: Priority,
    /// Highest priority level.
    pub max_priority: Priority,
    /// Effective priority assigned to ordered messages.
    pub ordered_priority: Priority,
    /// Upper bound on messages dispatched per lane-scan pass at the top
    /// priority.
    pub granularity: usize,
    /// Debug-only delivery-order fuzzing for unordered messages.
    ///
    /// Ignored in release builds.
    pub reloop_fuzzing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_priority: -2,
            max_priority: 2,
            ordered_priority: 0,
            granularity: 64,
            reloop_fuzzing: false,
        }
    }
}

impl SchedulerConfig {
    /// Number of priority lanes.
    pub fn num_priorities(&self) -> usize {
        (self.max_priority as isize - self.min_priority as isize + 1) as usize
    }

    /// Validates the priority range and granularity.
    pub fn validate(&self) -> Result<()> {
        if self.min_priority > self.max_priority {
            return Err(NimbusError::Config(format!(
                "min_priority {} exceeds max_priority {}",
                self.min_priority, self.max_priority
            )));
        }
        if self.ordered_priority < self.min_priority || self.ordered_priority > self.max_priority {
            return Err(NimbusError::Config(format!(
                "ordered_priority {} outside [{}, {}]",
                self.ordered_priority, self.min_priority, self.max_priority
            )));
        }
        if self.granularity == 0 {
            return Err(NimbusError::Config(
                "granularity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runtime configuration: worker threads plus scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Message scheduler configuration, shared by all hubs.
    pub scheduler: SchedulerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Validates worker count and scheduler settings.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(NimbusError::Config(
                "workers must be at least 1".to_string(),
            ));
        }
        self.scheduler.validate()
    }
}

/// Dynamic cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Target resident memory for canonical pages, in bytes.
    pub target_memory_bytes: usize,
    /// Interval between time-triggered write-back cycles, in milliseconds.
    pub flush_interval_ms: u64,
    /// Dirty-block count that triggers an early write-back cycle.
    pub flush_dirty_threshold: usize,
    /// Divisor bounding the accumulated patch log per block: once a
    /// block's patches exceed `block_size / max_patches_size_ratio` bytes,
    /// the block is flushed in full instead of as patches.
    pub max_patches_size_ratio: u32,
    /// Candidates sampled per eviction round.
    pub eviction_sample_size: usize,
    /// Serializer write attempts per block before the affected commits are
    /// failed.
    pub max_flush_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            target_memory_bytes: 256 * 1024 * 1024,
            flush_interval_ms: 1_000,
            flush_dirty_threshold: 512,
            max_patches_size_ratio: 2,
            eviction_sample_size: 8,
            max_flush_attempts: 4,
        }
    }
}

impl CacheConfig {
    /// Creates a cache config with the memory target sized to 25% of
    /// available system RAM.
    ///
    /// Minimum 16 MB so the cache stays useful on low-memory systems.
    pub fn auto_sized() -> Self {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target = (available_bytes / 4).max(16 * 1024 * 1024);

        Self {
            target_memory_bytes: target,
            ..Default::default()
        }
    }

    /// Validates the cache knobs.
    pub fn validate(&self) -> Result<()> {
        if self.eviction_sample_size == 0 {
            return Err(NimbusError::Config(
                "eviction_sample_size must be at least 1".to_string(),
            ));
        }
        if self.max_flush_attempts == 0 {
            return Err(NimbusError::Config(
                "max_flush_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
