//! End-to-end: game client frames through the aisrv tier into a TCP experience store

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_aisrv::aggregator::fields;
use relay_aisrv::{
    AggregatorConfig, GameClient, GameServer, GameServerConfig, LearnerProxy, ProxyConfig, SampleEvent,
    SampleServer, SampleServerConfig, TrajectoryStep,
};
use relay_store::{
    ExperienceStore, ExperienceWriter, ShardRouter, StoreClient, StoreClientConfig, StoreConfig, StoreServer,
    StoreServerConfig,
};
use relay_transport::{proxy_queue, ConnectionConfig, QueueConfig};

fn step(index: u64, done: bool) -> TrajectoryStep {
    TrajectoryStep {
        step_index: index,
        observation: vec![index as f32; 4],
        action: vec![0.0, 1.0],
        reward: vec![1.0, 0.5],
        value: vec![0.0, 0.0],
        action_log_prob: -0.7,
        done,
        recurrent_state: None,
        model_step: 0,
    }
}

fn store_config() -> StoreConfig {
    StoreConfig {
        table_count: 2,
        capacity: 64,
        batch_size: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_game_frames_reach_experience_store() {
    // learner side
    let store = Arc::new(ExperienceStore::new(store_config()).unwrap());
    let store_server = StoreServer::new(
        store.clone(),
        StoreServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..Default::default()
        },
    )
    .start()
    .await
    .unwrap();
    let store_addr = store_server.local_addr().to_string();

    // aisrv side
    let router = Arc::new(ShardRouter::from_config(&store_config()));
    let proxies: Vec<Arc<LearnerProxy>> = (0..2)
        .map(|id| {
            let writer: Arc<dyn ExperienceWriter> = Arc::new(StoreClient::new(StoreClientConfig {
                addr: store_addr.clone(),
                ..Default::default()
            }));
            Arc::new(LearnerProxy::spawn(
                id,
                ProxyConfig {
                    queue: QueueConfig {
                        capacity: 8,
                        retry_times: 10,
                        poll_interval_ms: 5,
                    },
                    ..Default::default()
                },
                writer,
                router.clone(),
            ))
        })
        .collect();

    let sample_config = SampleServerConfig {
        aggregator: AggregatorConfig {
            send_sample_size: 4,
            ..Default::default()
        },
        skip_policies: vec!["frozen".into()],
        ..Default::default()
    };
    let (events, events_rx) = proxy_queue(sample_config.events.clone());
    let sample_server = SampleServer::new(sample_config, proxies.clone()).unwrap();
    let exit = Arc::new(AtomicBool::new(false));
    let sample_task = tokio::spawn(sample_server.run(events_rx, exit.clone()));

    let game_server = GameServer::new(
        GameServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..Default::default()
        },
        events,
    )
    .start()
    .await
    .unwrap();

    // two slots, one trained agent and one frozen opponent each
    let mut client = GameClient::connect(&game_server.local_addr().to_string(), ConnectionConfig::default())
        .await
        .unwrap();
    for slot in 0..2u32 {
        let reply = client
            .send(vec![
                SampleEvent::PolicyAssigned { slot, agent: 0, policy: "main".into() },
                SampleEvent::PolicyAssigned { slot, agent: 1, policy: "frozen".into() },
            ])
            .await
            .unwrap();
        assert_eq!(reply.accepted, 2);
    }
    for i in 0..6u64 {
        let done = i == 5;
        let batch = (0..2u32)
            .flat_map(|slot| {
                (0..2u32).map(move |agent| SampleEvent::Step { slot, agent, step: step(i, done) })
            })
            .collect();
        assert_eq!(client.send(batch).await.unwrap().accepted, 4);
    }
    let reply = client
        .send(vec![SampleEvent::GameOver { slot: 0 }, SampleEvent::GameOver { slot: 1 }])
        .await
        .unwrap();
    assert_eq!(reply.accepted, 2);

    // 6 steps per trained agent, 2 trained agents
    let expected = 12;
    let mut total = 0;
    for _ in 0..400 {
        total = store.total_size();
        if total == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(total, expected);

    // read back over the wire, as a trainer would
    let reader = StoreClient::new(StoreClientConfig {
        addr: store_addr.clone(),
        ..Default::default()
    });
    let info = reader.server_info(None).await.unwrap();
    assert_eq!(info.iter().map(|t| t.current_size).sum::<usize>(), expected);

    let table = info.iter().find(|t| t.current_size >= 2).unwrap().name.clone();
    let items = reader.sample(&table, 2, Some(Duration::from_secs(1))).await.unwrap();
    for item in &items {
        assert!(item.payload.row_ids().is_empty());
        assert_eq!(item.payload.get(fields::OBSERVATION).unwrap().shape, vec![1, 4]);
        assert_eq!(item.payload.get(fields::RETURN).unwrap().shape, vec![1, 2]);
    }

    // shutdown
    game_server.stop().await;
    exit.store(true, Ordering::Release);
    let stats = sample_task.await.unwrap();
    assert_eq!(stats.games_finished, 2);
    assert_eq!(stats.records_forwarded, expected as u64);
    assert_eq!(stats.records_skipped, expected as u64);

    let mut sent = 0;
    for proxy in &proxies {
        proxy.stop().await;
        let snapshot = proxy.stats().snapshot_and_reset();
        assert_eq!(snapshot.errors, 0);
        sent += snapshot.sent;
    }
    assert_eq!(sent, expected as u64);
    store_server.stop().await;
}
