//! Rate-limited, capacity-bounded item table
//!
//! A table owns its items behind a mutex and wakes blocked callers through two
//! [`Notify`] handles: inserts wake samplers, samples and resets wake inserters.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use relay_common::{StoreError, TrainingRecord, DEFAULT_TABLE_PREFIX};
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::selector::{ItemSet, Selector};

/// Stored item
#[derive(Debug, Clone)]
pub struct Item {
    /// Insertion sequence number, unique within the table
    pub key: u64,
    pub priority: f64,
    pub times_sampled: u32,
    /// Unix millis
    pub inserted_at: i64,
    pub payload: Arc<TrainingRecord>,
}

impl Item {
    pub fn new(key: u64, priority: f64, payload: Arc<TrainingRecord>) -> Self {
        Self {
            key,
            priority,
            times_sampled: 0,
            inserted_at: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }
}

/// Item returned by a sample call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampledItem {
    pub key: u64,
    pub priority: f64,
    /// Times sampled, this call included
    pub times_sampled: u32,
    /// Table size when the item was drawn
    pub table_size: u64,
    pub payload: Arc<TrainingRecord>,
}

/// Table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: String,
    pub max_size: usize,
    pub sampler: Selector,
    pub remover: Selector,
    /// Remove an item once it has been sampled this many times
    pub max_times_sampled: Option<u32>,
    pub rate_limiter: RateLimiterConfig,
    /// Fixed RNG seed for reproducible sampling
    pub seed: Option<u64>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: format!("{DEFAULT_TABLE_PREFIX}_0"),
            max_size: 4096,
            sampler: Selector::Uniform,
            remover: Selector::Fifo,
            max_times_sampled: None,
            rate_limiter: RateLimiterConfig::default(),
            seed: None,
        }
    }
}

/// Per-table counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Completed inserts
    pub inserts: u64,
    /// Completed samples
    pub samples: u64,
    /// Insert calls that had to wait on the rate limiter
    pub blocked_inserts: u64,
    /// Sample calls that had to wait on the rate limiter
    pub blocked_samples: u64,
    /// Items evicted by the remover to make room
    pub evictions: u64,
    /// Items removed after reaching `max_times_sampled`
    pub exhausted: u64,
}

/// Snapshot returned by `server_info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub max_size: usize,
    pub current_size: usize,
    pub sampler: Selector,
    pub remover: Selector,
    pub rate_limiter: RateLimiterConfig,
    pub stats: TableStats,
}

/// One sample taken under the lock, with what is needed to take it back
struct Draw {
    sampled: SampledItem,
    index: usize,
    removed: Option<Item>,
}

struct TableState {
    items: ItemSet,
    limiter: RateLimiter,
    next_key: u64,
    stats: TableStats,
    rng: StdRng,
}

/// Experience table
pub struct Table {
    config: TableConfig,
    state: Mutex<TableState>,
    insert_ready: Notify,
    sample_ready: Notify,
}

impl Table {
    pub fn new(config: TableConfig) -> Result<Self, StoreError> {
        if config.max_size == 0 {
            return Err(StoreError::InvalidConfig(format!(
                "table {} must have max_size > 0",
                config.name
            )));
        }
        if !config.remover.can_remove() {
            return Err(StoreError::InvalidConfig(format!(
                "{:?} cannot be used as a remover",
                config.remover
            )));
        }
        let limiter = RateLimiter::new(config.rate_limiter)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        debug!(table = %config.name, max_size = config.max_size, "Created table");

        Ok(Self {
            state: Mutex::new(TableState {
                items: ItemSet::with_capacity(config.max_size.min(64 * 1024)),
                limiter,
                next_key: 0,
                stats: TableStats::default(),
                rng,
            }),
            config,
            insert_ready: Notify::new(),
            sample_ready: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn sampler(&self) -> Selector {
        self.config.sampler
    }

    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn stats(&self) -> TableStats {
        self.state.lock().stats.clone()
    }

    pub fn info(&self) -> TableInfo {
        let state = self.state.lock();
        TableInfo {
            name: self.config.name.clone(),
            max_size: self.config.max_size,
            current_size: state.items.len(),
            sampler: self.config.sampler,
            remover: self.config.remover,
            rate_limiter: self.config.rate_limiter,
            stats: state.stats.clone(),
        }
    }

    /// Insert if the rate limiter allows it right now
    pub fn try_insert(&self, record: TrainingRecord, priority: f64) -> Result<u64, StoreError> {
        self.admit_insert(&Arc::new(record), priority)
            .ok_or_else(|| self.rate_limited("insert"))
    }

    /// Insert, waiting for the rate limiter up to `timeout` (forever when `None`)
    pub async fn insert(
        &self,
        record: TrainingRecord,
        priority: f64,
        timeout: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let payload = Arc::new(record);
        let started = Instant::now();
        let mut blocked = false;

        loop {
            let notified = self.insert_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(key) = self.admit_insert(&payload, priority) {
                return Ok(key);
            }
            if !blocked {
                blocked = true;
                self.state.lock().stats.blocked_inserts += 1;
            }
            self.wait(notified, started, timeout, "insert").await?;
        }
    }

    /// Sample if the rate limiter allows it right now
    pub fn try_sample(&self) -> Result<SampledItem, StoreError> {
        self.admit_sample().ok_or_else(|| self.rate_limited("sample"))
    }

    /// Sample, waiting for the rate limiter up to `timeout` (forever when `None`)
    pub async fn sample(&self, timeout: Option<Duration>) -> Result<SampledItem, StoreError> {
        let started = Instant::now();
        let mut blocked = false;

        loop {
            let notified = self.sample_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.admit_sample() {
                return Ok(item);
            }
            if !blocked {
                blocked = true;
                self.state.lock().stats.blocked_samples += 1;
            }
            self.wait(notified, started, timeout, "sample").await?;
        }
    }

    /// Draw `batch_size` items as one unit within `timeout`. Either the whole batch is
    /// drawn or nothing is: a timeout leaves items, counters and the limiter untouched.
    pub async fn sample_batch(
        &self,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>, StoreError> {
        let burst = self.state.lock().limiter.max_sample_burst();
        if batch_size as f64 > burst {
            return Err(StoreError::InvalidConfig(format!(
                "batch of {batch_size} exceeds the {burst} samples table {} admits between inserts",
                self.config.name
            )));
        }

        let started = Instant::now();
        let mut blocked = false;
        loop {
            let notified = self.sample_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(batch) = self.admit_sample_batch(batch_size) {
                return Ok(batch);
            }
            if !blocked {
                blocked = true;
                self.state.lock().stats.blocked_samples += 1;
            }
            self.wait(notified, started, timeout, "sample").await?;
        }
    }

    /// Drop every item and restart the rate limiter
    pub fn reset(&self) {
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.items.len();
            state.items.clear();
            state.limiter.reset();
            state.stats = TableStats::default();
            dropped
        };
        self.insert_ready.notify_waiters();
        self.sample_ready.notify_waiters();
        info!(table = %self.config.name, dropped, "Table reset");
    }

    fn admit_insert(&self, payload: &Arc<TrainingRecord>, priority: f64) -> Option<u64> {
        let key = {
            let mut guard = self.state.lock();
            let TableState {
                items,
                limiter,
                next_key,
                stats,
                rng,
            } = &mut *guard;

            if !limiter.can_insert(items.len() as u64) {
                return None;
            }

            if items.len() >= self.config.max_size {
                if let Some(victim) = self.config.remover.select(items, rng) {
                    items.remove(victim);
                    stats.evictions += 1;
                }
            }

            let key = *next_key;
            *next_key += 1;
            items.push_back(Item::new(key, priority, payload.clone()));
            limiter.on_insert();
            stats.inserts += 1;
            key
        };

        self.sample_ready.notify_waiters();
        Some(key)
    }

    fn admit_sample(&self) -> Option<SampledItem> {
        let sampled = self.draw(&mut self.state.lock())?.sampled;
        self.insert_ready.notify_waiters();
        Some(sampled)
    }

    /// Draw `n` items under one lock, or none at all
    fn admit_sample_batch(&self, n: usize) -> Option<Vec<SampledItem>> {
        let batch = {
            let mut state = self.state.lock();
            let limiter = state.limiter.clone();
            let stats = state.stats.clone();

            let mut draws: Vec<Draw> = Vec::with_capacity(n);
            while draws.len() < n {
                match self.draw(&mut state) {
                    Some(draw) => draws.push(draw),
                    None => {
                        // undo newest first so indices line up again
                        for draw in draws.into_iter().rev() {
                            match draw.removed {
                                Some(mut item) => {
                                    item.times_sampled -= 1;
                                    state.items.insert(draw.index, item);
                                }
                                None => {
                                    if let Some(count) = state.items.times_sampled_mut(draw.index) {
                                        *count -= 1;
                                    }
                                }
                            }
                        }
                        state.limiter = limiter;
                        state.stats = stats;
                        return None;
                    }
                }
            }
            draws.into_iter().map(|d| d.sampled).collect()
        };

        self.insert_ready.notify_waiters();
        Some(batch)
    }

    fn draw(&self, state: &mut TableState) -> Option<Draw> {
        let TableState {
            items,
            limiter,
            stats,
            rng,
            ..
        } = state;

        let size = items.len() as u64;
        if !limiter.can_sample(size) {
            return None;
        }
        let index = self.config.sampler.select(items, rng)?;

        let times_sampled = items.times_sampled_mut(index)?;
        *times_sampled += 1;
        let item = items.get(index)?;
        let sampled = SampledItem {
            key: item.key,
            priority: item.priority,
            times_sampled: item.times_sampled,
            table_size: size,
            payload: item.payload.clone(),
        };

        let mut removed = None;
        if let Some(max) = self.config.max_times_sampled {
            if sampled.times_sampled >= max {
                removed = items.remove(index);
                stats.exhausted += 1;
            }
        }
        limiter.on_sample();
        stats.samples += 1;
        Some(Draw {
            sampled,
            index,
            removed,
        })
    }

    async fn wait(
        &self,
        notified: Pin<&mut Notified<'_>>,
        started: Instant,
        timeout: Option<Duration>,
        op: &'static str,
    ) -> Result<(), StoreError> {
        match timeout {
            None => {
                notified.await;
                Ok(())
            }
            Some(limit) => {
                let remaining = limit.saturating_sub(started.elapsed());
                tokio::time::timeout(remaining, notified)
                    .await
                    .map_err(|_| StoreError::Timeout {
                        table: self.config.name.clone(),
                        op,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
            }
        }
    }

    fn rate_limited(&self, op: &'static str) -> StoreError {
        StoreError::RateLimited {
            table: self.config.name.clone(),
            op,
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.config.name)
            .field("max_size", &self.config.max_size)
            .field("size", &self.size())
            .finish()
    }
}
