//! Sample server - turns game events into training records and feeds the learner proxies
//!
//! Each `(slot, agent)` pair owns a [`SampleAggregator`]. Records are flushed every
//! `send_sample_size` steps and when the game ends, then queued on the proxy chosen by
//! `slot mod proxies`. Games that go quiet without a `GameOver` (a client that
//! disconnected mid-episode) are evicted after `game_idle_timeout_ms`.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_common::{QueueError, RelayError, Result, TrainingRecord};
use relay_transport::{OverflowPolicy, QueueConfig, QueueReceiver};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregatorConfig, SampleAggregator, TrajectoryStep};
use crate::learner_proxy::{ExperienceBatch, LearnerProxy};

/// Game events delivered by the game-client server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEvent {
    PolicyAssigned { slot: u32, agent: u32, policy: String },
    Step { slot: u32, agent: u32, step: TrajectoryStep },
    GameOver { slot: u32 },
}

impl SampleEvent {
    pub fn slot(&self) -> u32 {
        match self {
            SampleEvent::PolicyAssigned { slot, .. }
            | SampleEvent::Step { slot, .. }
            | SampleEvent::GameOver { slot } => *slot,
        }
    }
}

/// Sample server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleServerConfig {
    pub aggregator: AggregatorConfig,
    /// Agents running one of these policies are not trained on (self-play opponents)
    pub skip_policies: Vec<String>,
    /// How long to wait for room on a proxy queue
    pub enqueue_timeout_ms: u64,
    /// Inbound event queue fed by the game server
    pub events: QueueConfig,
    /// Games without events for this long are dropped, 0 keeps them forever
    pub game_idle_timeout_ms: u64,
}

impl Default for SampleServerConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            skip_policies: Vec::new(),
            enqueue_timeout_ms: 100,
            events: QueueConfig::default(),
            game_idle_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug)]
struct AgentSlot {
    policy: Option<String>,
    aggregator: SampleAggregator,
}

#[derive(Debug)]
struct Game {
    agents: BTreeMap<u32, AgentSlot>,
    last_event: Instant,
}

impl Default for Game {
    fn default() -> Self {
        Self {
            agents: BTreeMap::new(),
            last_event: Instant::now(),
        }
    }
}

/// Running totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleServerStats {
    pub games_finished: u64,
    pub records_forwarded: u64,
    pub records_skipped: u64,
    pub batches_dropped: u64,
    /// Games dropped for inactivity
    pub games_evicted: u64,
}

pub struct SampleServer {
    config: SampleServerConfig,
    proxies: Vec<Arc<LearnerProxy>>,
    games: HashMap<u32, Game>,
    stats: SampleServerStats,
    last_sweep: Instant,
}

impl SampleServer {
    pub fn new(config: SampleServerConfig, proxies: Vec<Arc<LearnerProxy>>) -> Result<Self> {
        config.aggregator.validate()?;
        if proxies.is_empty() {
            return Err(RelayError::Config("sample server needs at least one learner proxy".into()));
        }
        Ok(Self {
            config,
            proxies,
            games: HashMap::new(),
            stats: SampleServerStats::default(),
            last_sweep: Instant::now(),
        })
    }

    pub fn stats(&self) -> SampleServerStats {
        self.stats
    }

    /// Games with buffered state
    pub fn active_games(&self) -> usize {
        self.games.len()
    }

    fn agent(&mut self, slot: u32, agent: u32) -> Result<&mut AgentSlot> {
        let game = self.games.entry(slot).or_default();
        game.last_event = Instant::now();
        let state = match game.agents.entry(agent) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(AgentSlot {
                policy: None,
                aggregator: SampleAggregator::new(self.config.aggregator.clone())?,
            }),
        };
        Ok(state)
    }

    /// Apply one event
    pub async fn handle(&mut self, event: SampleEvent) -> Result<()> {
        match event {
            SampleEvent::PolicyAssigned { slot, agent, policy } => {
                debug!(slot, agent, %policy, "Policy assigned");
                self.agent(slot, agent)?.policy = Some(policy);
            }
            SampleEvent::Step { slot, agent, step } => {
                let state = self.agent(slot, agent)?;
                state.aggregator.push(step)?;
                if state.aggregator.should_flush() {
                    let records = state.aggregator.flush()?;
                    let policy = state.policy.clone();
                    self.forward(slot, agent, policy, records).await;
                }
            }
            SampleEvent::GameOver { slot } => {
                let Some(game) = self.games.remove(&slot) else {
                    debug!(slot, "Game over for unknown slot");
                    return Ok(());
                };
                for (agent, mut state) in game.agents {
                    let reward = state.aggregator.episode_reward();
                    let records = state.aggregator.finish()?;
                    info!(
                        slot,
                        agent,
                        reward,
                        records = records.len(),
                        dropped_steps = state.aggregator.dropped_steps(),
                        "Episode finished"
                    );
                    self.forward(slot, agent, state.policy, records).await;
                }
                self.stats.games_finished += 1;
            }
        }
        Ok(())
    }

    /// Drop games idle for longer than `game_idle_timeout_ms`, returning how many went.
    /// Their buffered steps never saw an episode end and are discarded.
    pub fn evict_idle(&mut self) -> usize {
        self.last_sweep = Instant::now();
        if self.config.game_idle_timeout_ms == 0 {
            return 0;
        }
        let idle = Duration::from_millis(self.config.game_idle_timeout_ms);
        let before = self.games.len();
        self.games.retain(|slot, game| {
            let keep = game.last_event.elapsed() < idle;
            if !keep {
                let steps: usize = game.agents.values().map(|a| a.aggregator.pending_len()).sum();
                warn!(slot, agents = game.agents.len(), steps, "Evicting idle game");
            }
            keep
        });
        let evicted = before - self.games.len();
        self.stats.games_evicted += evicted as u64;
        evicted
    }

    fn sweep_due(&self) -> bool {
        // check a few times per timeout window
        self.config.game_idle_timeout_ms > 0
            && self.last_sweep.elapsed() >= Duration::from_millis(self.config.game_idle_timeout_ms / 4)
    }

    async fn forward(&mut self, slot: u32, agent: u32, policy: Option<String>, records: Vec<TrainingRecord>) {
        if records.is_empty() {
            return;
        }
        let count = records.len() as u64;
        if policy.as_ref().is_some_and(|p| self.config.skip_policies.contains(p)) {
            debug!(slot, agent, ?policy, count, "Skipping records of excluded policy");
            self.stats.records_skipped += count;
            return;
        }

        let proxy = &self.proxies[slot as usize % self.proxies.len()];
        let priorities = vec![1.0; records.len()];
        let mut batch = ExperienceBatch::new(format!("{slot}-{agent}"), records, priorities);
        if let Some(policy) = policy {
            batch = batch.with_route_key(policy);
        }

        let policy = OverflowPolicy::BlockWithTimeout(Duration::from_millis(self.config.enqueue_timeout_ms));
        match proxy.enqueue(batch, policy).await {
            Ok(()) => self.stats.records_forwarded += count,
            Err(e) => {
                warn!(slot, agent, proxy = proxy.id(), error = %e, "Dropping records");
                self.stats.batches_dropped += 1;
            }
        }
    }

    /// Consume events until the exit flag is raised or the event queue closes
    pub async fn run(mut self, mut events: QueueReceiver<SampleEvent>, exit: Arc<AtomicBool>) -> SampleServerStats {
        info!(proxies = self.proxies.len(), "Sample server started");
        while !exit.load(Ordering::Acquire) {
            match events.get().await {
                Ok(event) => {
                    let slot = event.slot();
                    if let Err(e) = self.handle(event).await {
                        warn!(slot, error = %e, "Event rejected");
                    }
                }
                Err(QueueError::Empty { .. }) => {}
                Err(QueueError::Closed) => break,
                Err(e) => warn!(error = %e, "Event queue read failed"),
            }
            if self.sweep_due() {
                self.evict_idle();
            }
        }
        info!(stats = ?self.stats, "Sample server stopped");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner_proxy::{ProxyConfig, ProxyWorker};
    use relay_store::{ExperienceStore, LocalWriter, ShardRouter, StoreConfig};

    fn step(index: u64, done: bool) -> TrajectoryStep {
        TrajectoryStep {
            step_index: index,
            observation: vec![0.0; 3],
            action: vec![1.0],
            reward: vec![1.0],
            value: vec![0.0],
            action_log_prob: -0.5,
            done,
            recurrent_state: None,
            model_step: 0,
        }
    }

    /// Proxies whose workers are not running, so queued batches stay countable
    fn idle_proxies(n: usize) -> (Vec<Arc<LearnerProxy>>, Vec<ProxyWorker>) {
        let mut workers = Vec::new();
        let mut proxies = Vec::new();
        for i in 0..n {
            let store = Arc::new(
                ExperienceStore::new(StoreConfig {
                    capacity: 64,
                    batch_size: 1,
                    ..Default::default()
                })
                .unwrap(),
            );
            let router = Arc::new(ShardRouter::from_config(store.config()));
            let writer = Arc::new(LocalWriter::new(store.clone(), None));
            let (proxy, worker) = LearnerProxy::new(i, ProxyConfig::default(), writer, router);
            workers.push(worker);
            proxies.push(Arc::new(proxy));
        }
        (proxies, workers)
    }

    fn config(send_sample_size: usize) -> SampleServerConfig {
        SampleServerConfig {
            aggregator: AggregatorConfig {
                send_sample_size,
                ..Default::default()
            },
            skip_policies: vec!["opponent".into()],
            enqueue_timeout_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_flush_every_send_sample_size() {
        let (proxies, _workers) = idle_proxies(1);
        let mut server = SampleServer::new(config(3), proxies.clone()).unwrap();

        for i in 0..3 {
            server
                .handle(SampleEvent::Step { slot: 0, agent: 0, step: step(i, false) })
                .await
                .unwrap();
        }
        // two records out, newest step held back
        assert_eq!(proxies[0].queue_len(), 1);
        assert_eq!(server.stats().records_forwarded, 2);

        server
            .handle(SampleEvent::Step { slot: 0, agent: 0, step: step(3, true) })
            .await
            .unwrap();
        server.handle(SampleEvent::GameOver { slot: 0 }).await.unwrap();
        assert_eq!(server.stats().records_forwarded, 4);
        assert_eq!(server.stats().games_finished, 1);
        assert_eq!(server.active_games(), 0);
    }

    #[tokio::test]
    async fn test_routes_by_slot_and_skips_opponents() {
        let (proxies, _workers) = idle_proxies(2);
        let mut server = SampleServer::new(config(128), proxies.clone()).unwrap();

        for slot in 0..2u32 {
            for agent in 0..2u32 {
                let policy = if agent == 0 { "learner" } else { "opponent" };
                server
                    .handle(SampleEvent::PolicyAssigned { slot, agent, policy: policy.into() })
                    .await
                    .unwrap();
                server
                    .handle(SampleEvent::Step { slot, agent, step: step(0, true) })
                    .await
                    .unwrap();
            }
        }
        server.handle(SampleEvent::GameOver { slot: 1 }).await.unwrap();
        assert_eq!(proxies[0].queue_len(), 0);
        assert_eq!(proxies[1].queue_len(), 1);

        server.handle(SampleEvent::GameOver { slot: 0 }).await.unwrap();
        assert_eq!(proxies[0].queue_len(), 1);
        assert_eq!(server.stats().records_skipped, 2);
        assert_eq!(server.stats().records_forwarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_game_evicted_after_idle_timeout() {
        let (proxies, _workers) = idle_proxies(1);
        let mut server = SampleServer::new(
            SampleServerConfig {
                game_idle_timeout_ms: 1_000,
                ..config(128)
            },
            proxies.clone(),
        )
        .unwrap();

        for slot in 0..2 {
            server
                .handle(SampleEvent::Step { slot, agent: 0, step: step(0, false) })
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_millis(600)).await;
        // slot 1 keeps playing, slot 0's client is gone
        server
            .handle(SampleEvent::Step { slot: 1, agent: 0, step: step(1, false) })
            .await
            .unwrap();
        assert_eq!(server.evict_idle(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(server.evict_idle(), 1);
        assert_eq!(server.active_games(), 1);
        assert_eq!(server.stats().games_evicted, 1);
        assert_eq!(server.stats().records_forwarded, 0);
        assert_eq!(proxies[0].queue_len(), 0);

        // a late GameOver for the evicted slot is harmless
        server.handle(SampleEvent::GameOver { slot: 0 }).await.unwrap();
        assert_eq!(server.stats().games_finished, 0);
        assert_eq!(server.active_games(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_idle_timeout_keeps_games() {
        let (proxies, _workers) = idle_proxies(1);
        let mut server = SampleServer::new(
            SampleServerConfig {
                game_idle_timeout_ms: 0,
                ..config(128)
            },
            proxies,
        )
        .unwrap();
        server
            .handle(SampleEvent::Step { slot: 3, agent: 0, step: step(0, false) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(server.evict_idle(), 0);
        assert_eq!(server.active_games(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_step_is_rejected() {
        let (proxies, _workers) = idle_proxies(1);
        let mut server = SampleServer::new(config(128), proxies).unwrap();
        server
            .handle(SampleEvent::Step { slot: 0, agent: 0, step: step(4, false) })
            .await
            .unwrap();
        let err = server
            .handle(SampleEvent::Step { slot: 0, agent: 0, step: step(2, false) })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Aggregator(_)));
    }

    #[tokio::test]
    async fn test_full_proxy_queue_drops_batch() {
        let store = Arc::new(ExperienceStore::new(StoreConfig::default()).unwrap());
        let router = Arc::new(ShardRouter::from_config(store.config()));
        let (proxy, worker) = LearnerProxy::new(
            0,
            ProxyConfig {
                queue: QueueConfig {
                    capacity: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            Arc::new(LocalWriter::new(store, None)),
            router,
        );
        let proxy = Arc::new(proxy);
        let mut server = SampleServer::new(config(128), vec![proxy.clone()]).unwrap();

        for slot in 0..2 {
            server
                .handle(SampleEvent::Step { slot, agent: 0, step: step(0, true) })
                .await
                .unwrap();
            server.handle(SampleEvent::GameOver { slot }).await.unwrap();
        }
        assert_eq!(server.stats().batches_dropped, 1);
        assert_eq!(proxy.stats().snapshot().dropped, 1);
        drop(worker);
    }

    #[tokio::test]
    async fn test_run_drains_events_into_store() {
        let store = Arc::new(
            ExperienceStore::new(StoreConfig {
                capacity: 16,
                batch_size: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let router = Arc::new(ShardRouter::from_config(store.config()));
        let proxy = Arc::new(LearnerProxy::spawn(
            0,
            ProxyConfig::default(),
            Arc::new(LocalWriter::new(store.clone(), None)),
            router,
        ));
        let server = SampleServer::new(config(128), vec![proxy.clone()]).unwrap();
        let (events, rx) = relay_transport::proxy_queue(QueueConfig::default());
        let exit = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(server.run(rx, exit.clone()));

        for i in 0..3 {
            assert!(events.submit(SampleEvent::Step { slot: 7, agent: 1, step: step(i, i == 2) }));
        }
        assert!(events.submit(SampleEvent::GameOver { slot: 7 }));

        for _ in 0..200 {
            if store.total_size() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.total_size(), 3);

        exit.store(true, Ordering::Release);
        let stats = task.await.unwrap();
        assert_eq!(stats.games_finished, 1);
        proxy.stop().await;

        let items = store.sample("reverb_table_0", 3, None).await.unwrap();
        assert!(items.iter().all(|i| i.payload.row_ids().is_empty()));
    }
}
