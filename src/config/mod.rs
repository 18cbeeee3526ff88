use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Physical layout of a store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// One `catalog.json` plus fixed-size append segments.
    #[default]
    Catalog,
    /// Self-describing chunk files, each with its own table.
    Chunk,
}

/// How `read` hands payloads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    #[default]
    Raw,
    Json,
}

/// Configuration for a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub layout: Layout,

    pub read_mode: ReadMode,

    /// Capacity of one catalog-layout segment file (default: 2MB)
    pub log_size: u64,

    /// Allocation granularity for pooled buffers (default: 4KB)
    pub block_size: u64,

    /// Catalog layout never compacts below this many written bytes (default: 6MB)
    pub compact_min_bytes: u64,

    /// Catalog layout compacts once written bytes exceed live bytes times
    /// this factor (default: 1.5)
    pub compact_multiplier: f64,

    /// Chunk layout flushes a chunk once it stages this much (default: 2MB)
    pub max_chunk_size: usize,

    /// Values at least this large go to the large-value chunk stream (default: 64KB)
    pub large_value_threshold: usize,

    /// Chunk layout compacts when live / total drops below this (default: 0.6)
    pub compact_ratio: f64,

    /// Chunk files read concurrently (default: 8)
    pub read_concurrency: usize,

    /// Evaluate the compaction trigger after every write batch (default: true)
    pub auto_compact: bool,

    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            layout: Layout::Catalog,
            read_mode: ReadMode::Raw,
            log_size: 2 * 1024 * 1024, // 2MB
            block_size: 4 * 1024, // 4KB
            compact_min_bytes: 6 * 1024 * 1024, // 6MB
            compact_multiplier: 1.5,
            max_chunk_size: 2 * 1024 * 1024, // 2MB
            large_value_threshold: 64 * 1024, // 64KB
            compact_ratio: 0.6,
            read_concurrency: 8,
            auto_compact: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            ..Default::default()
        }
    }

    pub fn read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn log_size(mut self, size: u64) -> Self {
        self.log_size = size;
        self
    }

    pub fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    pub fn compact_min_bytes(mut self, bytes: u64) -> Self {
        self.compact_min_bytes = bytes;
        self
    }

    pub fn compact_multiplier(mut self, multiplier: f64) -> Self {
        self.compact_multiplier = multiplier;
        self
    }

    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn large_value_threshold(mut self, size: usize) -> Self {
        self.large_value_threshold = size;
        self
    }

    pub fn compact_ratio(mut self, ratio: f64) -> Self {
        self.compact_ratio = ratio;
        self
    }

    pub fn read_concurrency(mut self, n: usize) -> Self {
        self.read_concurrency = n;
        self
    }

    pub fn auto_compact(mut self, enabled: bool) -> Self {
        self.auto_compact = enabled;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.log_size > 0, "logSize must be positive");
        ensure!(self.block_size > 0, "blockSize must be positive");
        ensure!(self.max_chunk_size > 0, "maxChunkSize must be positive");
        ensure!(self.read_concurrency > 0, "readConcurrency must be positive");
        ensure!(
            self.compact_ratio > 0.0 && self.compact_ratio <= 1.0,
            "compactRatio must be in (0, 1]"
        );
        ensure!(
            self.compact_multiplier >= 1.0,
            "compactMultiplier must be at least 1"
        );
        Ok(())
    }
}
