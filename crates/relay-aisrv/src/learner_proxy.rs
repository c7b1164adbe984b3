//! Learner proxy - drains a bounded queue of training records into the experience store
//!
//! Producers call [`LearnerProxy::submit`], which never blocks: a full queue drops the
//! batch. A background task pulls batches, strips scratch row ids and writes them through
//! an [`ExperienceWriter`]. Write failures are counted and logged; they never stop the loop.
//! Records that went in before a write failed still count as sent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_common::{QueueError, TrainingRecord};
use relay_store::{ExperienceWriter, ShardRouter};
use relay_transport::{proxy_queue, OverflowPolicy, QueueConfig, QueueReceiver, QueueSender};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub queue: QueueConfig,
    /// Loop iterations between idle sleeps
    pub idle_every: u64,
    pub idle_sleep_ms: u64,
    /// Seconds between stats log lines; 0 disables them
    pub stats_interval_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            idle_every: 1000,
            idle_sleep_ms: 1,
            stats_interval_secs: 60,
        }
    }
}

/// Records produced for one agent, queued as a unit
#[derive(Debug, Clone)]
pub struct ExperienceBatch {
    pub agent_id: String,
    /// Routing key for `ByKey` sharding, usually the policy id
    pub route_key: Option<String>,
    pub records: Vec<TrainingRecord>,
    pub priorities: Vec<f64>,
}

impl ExperienceBatch {
    pub fn new(agent_id: impl Into<String>, records: Vec<TrainingRecord>, priorities: Vec<f64>) -> Self {
        Self {
            agent_id: agent_id.into(),
            route_key: None,
            records,
            priorities,
        }
    }

    pub fn with_route_key(mut self, key: impl Into<String>) -> Self {
        self.route_key = Some(key.into());
        self
    }

    fn route_key(&self) -> &str {
        self.route_key.as_deref().unwrap_or(&self.agent_id)
    }
}

/// Per-proxy counters
#[derive(Debug, Default)]
pub struct ProxyStats {
    sent: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    max_sample_bytes: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatsSnapshot {
    /// Records written successfully
    pub sent: u64,
    /// Failed writes
    pub errors: u64,
    /// Batches refused because the queue was full
    pub dropped: u64,
    pub max_sample_bytes: u64,
}

impl ProxyStats {
    pub fn record_sent(&self, records: u64, max_bytes: u64) {
        self.sent.fetch_add(records, Ordering::Relaxed);
        self.max_sample_bytes.fetch_max(max_bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            max_sample_bytes: self.max_sample_bytes.load(Ordering::Relaxed),
        }
    }

    /// Read and zero every counter
    pub fn snapshot_and_reset(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            sent: self.sent.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            max_sample_bytes: self.max_sample_bytes.swap(0, Ordering::Relaxed),
        }
    }
}

/// Drain loop behind a [`LearnerProxy`]
pub struct ProxyWorker {
    id: usize,
    config: ProxyConfig,
    receiver: QueueReceiver<ExperienceBatch>,
    writer: Arc<dyn ExperienceWriter>,
    router: Arc<ShardRouter>,
    stats: Arc<ProxyStats>,
    exit: Arc<AtomicBool>,
}

impl ProxyWorker {
    /// Run until the exit flag is raised or every producer is gone
    pub async fn run(mut self) {
        info!(
            proxy = self.id,
            endpoint = %self.writer.endpoint(),
            tables = ?self.router.tables(),
            "Learner proxy started"
        );

        let idle_every = self.config.idle_every.max(1);
        let idle_sleep = Duration::from_millis(self.config.idle_sleep_ms);
        let stats_interval = Duration::from_secs(self.config.stats_interval_secs);
        let mut last_stats = Instant::now();
        let mut iterations: u64 = 0;

        while !self.exit.load(Ordering::Acquire) {
            iterations = iterations.wrapping_add(1);
            if iterations % idle_every == 0 {
                tokio::time::sleep(idle_sleep).await;
            }

            match self.receiver.get().await {
                Ok(batch) => self.forward(batch).await,
                Err(QueueError::Empty { .. }) => {}
                Err(QueueError::Closed) => {
                    debug!(proxy = self.id, "All producers gone");
                    break;
                }
                Err(e) => warn!(proxy = self.id, error = %e, "Queue read failed"),
            }

            if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
                let stats = self.stats.snapshot();
                info!(
                    proxy = self.id,
                    sent = stats.sent,
                    errors = stats.errors,
                    dropped = stats.dropped,
                    max_sample_bytes = stats.max_sample_bytes,
                    "Learner proxy stats"
                );
                last_stats = Instant::now();
            }
        }

        info!(proxy = self.id, stats = ?self.stats.snapshot(), "Learner proxy stopped");
    }

    async fn forward(&self, batch: ExperienceBatch) {
        let table = self.router.route(Some(batch.route_key())).to_string();
        let ExperienceBatch {
            agent_id,
            mut records,
            priorities,
            ..
        } = batch;

        let mut max_bytes = 0;
        for record in &mut records {
            record.take_row_ids();
            max_bytes = max_bytes.max(record.nbytes() as u64);
        }
        let count = records.len();

        match self.writer.write(&table, records, &priorities).await {
            Ok(written) => {
                debug!(proxy = self.id, %agent_id, %table, written, "Batch written");
                self.stats.record_sent(written as u64, max_bytes);
            }
            Err(e) => {
                let written = e.written();
                error!(proxy = self.id, %agent_id, %table, count, written, error = %e, "Experience write failed");
                if written > 0 {
                    self.stats.record_sent(written as u64, max_bytes);
                }
                self.stats.record_error();
            }
        }
    }
}

/// Producer-facing handle of a running proxy
pub struct LearnerProxy {
    id: usize,
    sender: QueueSender<ExperienceBatch>,
    stats: Arc<ProxyStats>,
    exit: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LearnerProxy {
    /// Build the proxy and its worker without starting the loop
    pub fn new(
        id: usize,
        config: ProxyConfig,
        writer: Arc<dyn ExperienceWriter>,
        router: Arc<ShardRouter>,
    ) -> (Self, ProxyWorker) {
        let (sender, receiver) = proxy_queue(config.queue.clone());
        let stats = Arc::new(ProxyStats::default());
        let exit = Arc::new(AtomicBool::new(false));

        let worker = ProxyWorker {
            id,
            config,
            receiver,
            writer,
            router,
            stats: stats.clone(),
            exit: exit.clone(),
        };
        let proxy = Self {
            id,
            sender,
            stats,
            exit,
            task: Mutex::new(None),
        };
        (proxy, worker)
    }

    /// Build the proxy and spawn its drain loop
    pub fn spawn(
        id: usize,
        config: ProxyConfig,
        writer: Arc<dyn ExperienceWriter>,
        router: Arc<ShardRouter>,
    ) -> Self {
        let (proxy, worker) = Self::new(id, config, writer, router);
        *proxy.task.lock() = Some(tokio::spawn(worker.run()));
        proxy
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue records without waiting; `false` means the batch was dropped
    pub fn submit(&self, agent_id: &str, records: Vec<TrainingRecord>, priorities: Vec<f64>) -> bool {
        self.submit_batch(ExperienceBatch::new(agent_id, records, priorities))
    }

    pub fn submit_batch(&self, batch: ExperienceBatch) -> bool {
        let accepted = self.sender.submit(batch);
        if !accepted {
            self.stats.record_dropped();
        }
        accepted
    }

    /// Queue records following `policy`; a refused batch counts as dropped
    pub async fn enqueue(&self, batch: ExperienceBatch, policy: OverflowPolicy) -> Result<(), QueueError> {
        let result = self.sender.put(batch, policy).await;
        if result.is_err() {
            self.stats.record_dropped();
        }
        result
    }

    /// Batches waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Raise the exit flag and wait for the loop to notice it
    pub async fn stop(&self) {
        self.exit.store(true, Ordering::Release);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(proxy = self.id, error = %e, "Learner proxy task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::fields;
    use async_trait::async_trait;
    use relay_common::{StoreError, Tensor};
    use relay_store::{ExperienceStore, LocalWriter, RouterKind, StoreConfig};

    fn record(step: f32) -> TrainingRecord {
        TrainingRecord::new()
            .with_field(fields::ADVANTAGE, Tensor::vector(vec![1.0]))
            .with_row_ids(vec![step as u64])
    }

    fn fast_config(capacity: usize) -> ProxyConfig {
        ProxyConfig {
            queue: QueueConfig {
                capacity,
                retry_times: 5,
                poll_interval_ms: 2,
            },
            ..Default::default()
        }
    }

    fn local_store(tables: usize) -> Arc<ExperienceStore> {
        Arc::new(
            ExperienceStore::new(StoreConfig {
                table_count: tables,
                capacity: 64,
                batch_size: 1,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    struct FailingWriter;

    #[async_trait]
    impl ExperienceWriter for FailingWriter {
        async fn write(&self, table: &str, _: Vec<TrainingRecord>, _: &[f64]) -> Result<usize, StoreError> {
            Err(StoreError::UnknownTable(table.to_string()))
        }

        fn endpoint(&self) -> String {
            "failing".into()
        }
    }

    /// Accepts the first record of every batch, then times out
    struct HalfWriter;

    #[async_trait]
    impl ExperienceWriter for HalfWriter {
        async fn write(&self, table: &str, records: Vec<TrainingRecord>, _: &[f64]) -> Result<usize, StoreError> {
            Err(StoreError::PartialWrite {
                table: table.to_string(),
                written: 1,
                total: records.len(),
                reason: "timed out".into(),
            })
        }

        fn endpoint(&self) -> String {
            "half".into()
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_submit_on_full_queue_drops_immediately() {
        let store = local_store(1);
        let router = Arc::new(ShardRouter::from_config(store.config()));
        let (proxy, _worker) = LearnerProxy::new(0, fast_config(2), Arc::new(LocalWriter::new(store, None)), router);

        assert!(proxy.submit("a", vec![record(0.0)], vec![]));
        assert!(proxy.submit("a", vec![record(1.0)], vec![]));
        assert!(!proxy.submit("a", vec![record(2.0)], vec![]));
        assert_eq!(proxy.queue_len(), 2);
        assert_eq!(proxy.stats().snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn test_records_written_without_scratch_fields() {
        let store = local_store(2);
        let router = Arc::new(ShardRouter::from_config(store.config()));
        let writer = Arc::new(LocalWriter::new(store.clone(), Some(Duration::from_millis(100))));
        let proxy = LearnerProxy::spawn(0, fast_config(8), writer, router);

        assert!(proxy.submit("agent-0", vec![record(0.0), record(1.0)], vec![]));
        assert!(proxy.submit("agent-1", vec![record(2.0)], vec![]));
        wait_for(|| store.total_size() == 3).await;

        let items = store.sample("reverb_table_0", 1, Some(Duration::from_secs(1))).await.unwrap();
        assert!(items[0].payload.row_ids().is_empty());
        assert!(items[0].payload.contains(fields::ADVANTAGE));

        proxy.stop().await;
        assert!(!proxy.is_running());
        let stats = proxy.stats().snapshot_and_reset();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.errors, 0);
        assert!(stats.max_sample_bytes > 0);
        assert_eq!(proxy.stats().snapshot(), ProxyStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_write_failures_are_counted_not_fatal() {
        let router = Arc::new(ShardRouter::new(RouterKind::RoundRobin, vec!["t".into()]));
        let proxy = LearnerProxy::spawn(3, fast_config(8), Arc::new(FailingWriter), router);

        for i in 0..3 {
            assert!(proxy.submit("a", vec![record(i as f32)], vec![]));
        }
        let stats = proxy.stats().clone();
        wait_for(|| stats.snapshot().errors == 3).await;
        assert!(proxy.is_running());

        proxy.stop().await;
        assert_eq!(stats.snapshot().sent, 0);
    }

    #[tokio::test]
    async fn test_partial_write_counts_written_records() {
        let router = Arc::new(ShardRouter::new(RouterKind::RoundRobin, vec!["t".into()]));
        let proxy = LearnerProxy::spawn(0, fast_config(8), Arc::new(HalfWriter), router);

        assert!(proxy.submit("a", vec![record(0.0), record(1.0), record(2.0)], vec![]));
        let stats = proxy.stats().clone();
        wait_for(|| stats.snapshot().errors == 1).await;
        proxy.stop().await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.errors, 1);
    }

    #[tokio::test]
    async fn test_stop_returns_while_idle() {
        let router = Arc::new(ShardRouter::new(RouterKind::RoundRobin, vec!["t".into()]));
        let proxy = LearnerProxy::spawn(0, fast_config(1), Arc::new(FailingWriter), router);
        tokio::time::timeout(Duration::from_secs(2), proxy.stop())
            .await
            .expect("stop should not hang");
        assert!(!proxy.is_running());
    }

    #[test]
    fn test_route_key_defaults_to_agent() {
        let batch = ExperienceBatch::new("slot0-agent1", vec![], vec![]);
        assert_eq!(batch.route_key(), "slot0-agent1");
        assert_eq!(batch.with_route_key("policy-a").route_key(), "policy-a");
    }
}
