#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pops_core::{BatchApplier, GroupId, ManualClock, PopError, PopMessage, PopRequest, PopResult};
use pops_ingest::{spawn_ingest, IngestOptions};
use pops_persist::MemLogStore;
use pops_store::{ShardOptions, ShardPool};
use uuid::Uuid;

/// Fails chosen players a fixed number of times with a chosen error and
/// records every delivery.
#[derive(Default)]
struct Flaky {
    failures: Mutex<HashMap<String, (u32, PopError)>>,
    deliveries: Mutex<Vec<Vec<Uuid>>>,
}

impl Flaky {
    fn fail(&self, player: &str, times: u32, err: PopError) {
        self.failures.lock().unwrap().insert(player.to_string(), (times, err));
    }

    fn delivery_counts(&self) -> HashMap<Uuid, usize> {
        let mut m = HashMap::new();
        for batch in self.deliveries.lock().unwrap().iter() {
            for id in batch {
                *m.entry(*id).or_default() += 1;
            }
        }
        m
    }
}

#[async_trait]
impl BatchApplier for Flaky {
    async fn apply_batch(&self, batch: &[PopMessage]) -> Vec<PopResult<()>> {
        self.deliveries.lock().unwrap().push(batch.iter().map(|m| m.id).collect());
        let mut failures = self.failures.lock().unwrap();
        batch
            .iter()
            .map(|m| match failures.get_mut(m.player.as_str()) {
                Some((left, err)) if *left > 0 => {
                    *left -= 1;
                    Err(err.clone())
                }
                _ => Ok(()),
            })
            .collect()
    }
}

fn opts() -> IngestOptions {
    IngestOptions {
        groups: vec![GroupId(1), GroupId(3), GroupId(4)],
        queue_cap: 64,
        max_batch: 5,
        flush: Duration::from_millis(20),
        max_attempts: 3,
        max_amount: 1_000,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_failed_subset_is_redelivered() {
    let applier = Arc::new(Flaky::default());
    applier.fail("6500000002", 1, PopError::Storage("busy".into()));
    applier.fail("6500000004", 1, PopError::ShardUnreachable(GroupId(3)));
    let log = Arc::new(MemLogStore::new());
    let (q, task) = spawn_ingest(opts(), applier.clone(), log.clone(), Arc::new(ManualClock::new(0)));

    let mut tickets = Vec::new();
    for i in 1..=5 {
        let req = PopRequest::new(format!("650000000{}", i), i, [1, 3, 4][i as usize % 3]);
        tickets.push(q.submit(req).await.unwrap());
    }
    let ids: Vec<Uuid> = tickets.iter().map(|t| t.id()).collect();
    for t in tickets {
        t.wait().await.unwrap();
    }

    let counts = applier.delivery_counts();
    let twice: HashSet<Uuid> = counts.iter().filter(|(_, n)| **n == 2).map(|(id, _)| *id).collect();
    assert_eq!(twice, [ids[1], ids[3]].into_iter().collect());
    assert_eq!(counts.values().filter(|n| **n == 1).count(), 3);
    let stats = q.stats();
    assert_eq!((stats.accepted, stats.acked, stats.retried, stats.dead_lettered), (5, 5, 2, 0));
    assert!(log.dead_letters().is_empty());

    q.close();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_and_fatal_messages_are_dead_lettered() {
    let applier = Arc::new(Flaky::default());
    applier.fail("6500000007", 10, PopError::Storage("disk full".into()));
    applier.fail("6500000008", 10, PopError::Internal("bad row".into()));
    let log = Arc::new(MemLogStore::new());
    let (q, task) = spawn_ingest(opts(), applier.clone(), log.clone(), Arc::new(ManualClock::new(77)));

    let retried = q.submit(PopRequest::new("6500000007", 1, 1)).await.unwrap();
    let fatal = q.submit(PopRequest::new("6500000008", 1, 1)).await.unwrap();
    let ok = q.submit(PopRequest::new("6500000009", 1, 1)).await.unwrap();
    let (retried_id, fatal_id) = (retried.id(), fatal.id());

    assert!(matches!(retried.wait().await, Err(PopError::DeadLettered { attempts: 3, .. })));
    assert!(matches!(fatal.wait().await, Err(PopError::DeadLettered { attempts: 1, .. })));
    ok.wait().await.unwrap();

    let counts = applier.delivery_counts();
    assert_eq!(counts[&retried_id], 3);
    assert_eq!(counts[&fatal_id], 1);
    let dead = log.dead_letters();
    assert_eq!(dead.len(), 2);
    assert!(dead.iter().all(|d| d.at_ms == 77));
    assert_eq!(q.stats().dead_lettered, 2);

    q.close();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_drains_everything_into_the_shards() {
    let log = Arc::new(MemLogStore::new());
    let groups = [GroupId(1), GroupId(3), GroupId(4)];
    let pool = Arc::new(
        ShardPool::open(&groups, log.clone(), Arc::new(ManualClock::new(10)), ShardOptions::default())
            .await
            .unwrap(),
    );
    let (q, task) = spawn_ingest(opts(), pool.clone(), log.clone(), Arc::new(ManualClock::new(10)));

    let mut expected = 0u64;
    for i in 0..37i64 {
        let amount = i % 7 + 1;
        expected += amount as u64;
        // Tickets dropped on purpose: acknowledgement is not awaited.
        q.submit(PopRequest::new(format!("65000000{:02}", i % 13), amount, [1, 3, 4][(i % 3) as usize]))
            .await
            .unwrap();
    }
    q.close();
    task.await.unwrap();

    let total: u64 = groups.iter().map(|g| pool.handle(*g).unwrap().total_score().unwrap()).sum();
    assert_eq!(total, expected);
    assert_eq!(log.len(), 37);
    assert_eq!(q.stats().acked, 37);
    pool.shutdown().await;
}
