//! Sharded experience store
//!
//! Capacity is split evenly over `table_count` tables at start-up and never resized;
//! producers pick a shard with a [`ShardRouter`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_common::{StoreError, TrainingRecord, DEFAULT_TABLE_PREFIX};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::rate_limiter::RateLimiterConfig;
use crate::selector::Selector;
use crate::table::{SampledItem, Table, TableConfig, TableInfo};

/// Which rate limiter every table gets
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// Sampling waits for `min_size_to_sample` items
    #[default]
    MinSize,
    SampleToInsertRatio {
        samples_per_insert: f64,
        error_buffer: f64,
    },
}

/// How producers pick a shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    #[default]
    RoundRobin,
    ByKey,
}

/// Experience store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Tables are named `{table_prefix}_{i}`
    pub table_prefix: String,
    pub table_count: usize,
    /// Total capacity across all tables
    pub capacity: usize,
    /// Training batch size; also the floor for total capacity
    pub batch_size: usize,
    pub sampler: Selector,
    pub remover: Selector,
    pub limiter: LimiterKind,
    pub max_times_sampled: Option<u32>,
    pub router: RouterKind,
    pub seed: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            table_count: 1,
            capacity: 4096,
            batch_size: 256,
            sampler: Selector::Uniform,
            remover: Selector::Fifo,
            limiter: LimiterKind::MinSize,
            max_times_sampled: None,
            router: RouterKind::RoundRobin,
            seed: None,
        }
    }
}

impl StoreConfig {
    pub fn table_names(&self) -> Vec<String> {
        (0..self.table_count)
            .map(|i| format!("{}_{}", self.table_prefix, i))
            .collect()
    }

    /// Capacity of each table
    pub fn table_max_size(&self) -> usize {
        self.capacity.max(self.batch_size) / self.table_count.max(1)
    }

    /// Items a table must hold before sampling is allowed
    pub fn min_size_to_sample(&self) -> u64 {
        (self.batch_size / self.table_count.max(1)).max(1) as u64
    }

    fn table_config(&self, index: usize, name: String) -> TableConfig {
        let min_size = self.min_size_to_sample();
        let rate_limiter = match self.limiter {
            LimiterKind::MinSize => RateLimiterConfig::MinSize { min_size },
            LimiterKind::SampleToInsertRatio {
                samples_per_insert,
                error_buffer,
            } => RateLimiterConfig::SampleToInsertRatio {
                samples_per_insert,
                min_size_to_sample: min_size,
                error_buffer,
            },
        };
        TableConfig {
            name,
            max_size: self.table_max_size(),
            sampler: self.sampler,
            remover: self.remover,
            max_times_sampled: self.max_times_sampled,
            rate_limiter,
            seed: self.seed.map(|s| s.wrapping_add(index as u64)),
        }
    }
}

/// Picks the destination table for a write
#[derive(Debug)]
pub struct ShardRouter {
    kind: RouterKind,
    tables: Vec<String>,
    next: AtomicUsize,
}

impl ShardRouter {
    pub fn new(kind: RouterKind, tables: Vec<String>) -> Self {
        Self {
            kind,
            tables,
            next: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.router, config.table_names())
    }

    /// Table for the next write; `key` is only used by `ByKey` routing
    pub fn route(&self, key: Option<&str>) -> &str {
        let n = self.tables.len().max(1);
        let idx = match (self.kind, key) {
            (RouterKind::ByKey, Some(key)) => Self::shard_for_key(key, n),
            _ => self.next.fetch_add(1, Ordering::Relaxed) % n,
        };
        self.tables.get(idx).map(String::as_str).unwrap_or("")
    }

    /// Stable shard index for `key`
    pub fn shard_for_key(key: &str, shards: usize) -> usize {
        let hash = blake3::hash(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(head) % shards.max(1) as u64) as usize
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

/// In-process collection of named tables
pub struct ExperienceStore {
    tables: DashMap<String, Arc<Table>>,
    config: StoreConfig,
}

impl ExperienceStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        if config.table_count == 0 {
            return Err(StoreError::InvalidConfig("table_count must be > 0".into()));
        }
        if config.table_max_size() == 0 {
            return Err(StoreError::InvalidConfig(format!(
                "capacity {} too small for {} tables",
                config.capacity.max(config.batch_size),
                config.table_count
            )));
        }

        let tables = DashMap::new();
        for (i, name) in config.table_names().into_iter().enumerate() {
            let table = Table::new(config.table_config(i, name.clone()))?;
            tables.insert(name, Arc::new(table));
        }

        info!(
            tables = config.table_count,
            table_max_size = config.table_max_size(),
            min_size_to_sample = config.min_size_to_sample(),
            "Experience store initialized"
        );
        Ok(Self { tables, config })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn table(&self, name: &str) -> Result<Arc<Table>, StoreError> {
        self.tables
            .get(name)
            .map(|t| t.value().clone())
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    /// Table names in index order
    pub fn table_names(&self) -> Vec<String> {
        self.config.table_names()
    }

    /// Write records to one table.
    ///
    /// With a prioritized sampler every record needs its own priority; otherwise missing
    /// priorities default to 1.0. A failure after some records went in is reported as
    /// [`StoreError::PartialWrite`] carrying the count.
    #[instrument(skip(self, records, priorities), fields(count = records.len()))]
    pub async fn write(
        &self,
        table: &str,
        records: Vec<TrainingRecord>,
        priorities: &[f64],
        timeout: Option<Duration>,
    ) -> Result<usize, StoreError> {
        let target = self.table(table)?;
        if target.sampler().is_prioritized() && priorities.len() != records.len() {
            return Err(StoreError::PriorityMismatch {
                records: records.len(),
                priorities: priorities.len(),
            });
        }

        let total = records.len();
        let mut written = 0;
        for (i, record) in records.into_iter().enumerate() {
            let priority = priorities.get(i).copied().unwrap_or(1.0);
            match target.insert(record, priority, timeout).await {
                Ok(_) => written += 1,
                Err(e) if written == 0 => return Err(e),
                Err(e) => {
                    return Err(StoreError::PartialWrite {
                        table: table.to_string(),
                        written,
                        total,
                        reason: e.to_string(),
                    })
                }
            }
        }
        debug!(table, written, "Records written");
        Ok(written)
    }

    pub async fn sample(
        &self,
        table: &str,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>, StoreError> {
        self.table(table)?.sample_batch(batch_size, timeout).await
    }

    /// Info for one table, or all tables when `table` is `None`
    pub fn server_info(&self, table: Option<&str>) -> Result<Vec<TableInfo>, StoreError> {
        match table {
            Some(name) => Ok(vec![self.table(name)?.info()]),
            None => self
                .table_names()
                .iter()
                .map(|name| self.table(name).map(|t| t.info()))
                .collect(),
        }
    }

    pub fn reset(&self, table: &str) -> Result<(), StoreError> {
        self.table(table)?.reset();
        Ok(())
    }

    /// Reset every table, e.g. on a training restart
    pub fn clear(&self) {
        for entry in self.tables.iter() {
            entry.value().reset();
        }
    }

    /// Items held across all tables
    pub fn total_size(&self) -> usize {
        self.tables.iter().map(|t| t.value().size()).sum()
    }

    /// Completed inserts across all tables
    pub fn insert_stats(&self) -> u64 {
        self.tables.iter().map(|t| t.value().stats().inserts).sum()
    }
}
