#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pops_core::{BatchApplier, GroupId, ManualClock, PlayerId, PopMessage};
use pops_persist::{LogStore, SqliteLogStore};
use pops_store::{Coordinator, ShardOptions, ShardPool};

fn temp_db() -> String {
    let f = format!("pops-store-test-{}.db", uuid::Uuid::new_v4());
    std::env::temp_dir().join(f).to_string_lossy().to_string()
}

fn p(n: u32) -> PlayerId { PlayerId::parse(&format!("65{:08}", n)).unwrap() }

fn batch(round: u32) -> Vec<PopMessage> {
    (0..30u32)
        .map(|i| {
            let g = [1u16, 3, 4][(i % 3) as usize];
            PopMessage::new(p((i * 7 + round) % 11), (i + round) as u64 % 9 + 1, GroupId(g))
        })
        .collect()
}

async fn leaderboards(pool: &ShardPool) -> Vec<(GroupId, u64, Vec<(String, u64)>)> {
    pool.groups()
        .into_iter()
        .map(|g| {
            let h = pool.handle(g).unwrap();
            let top = h.top_ten().unwrap().iter().map(|e| (e.player.to_string(), e.score)).collect();
            (g, h.total_score().unwrap(), top)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warm_restart_equals_cold_rebuild() {
    let path = temp_db();
    let groups = [GroupId(1), GroupId(3), GroupId(4)];
    let clock = Arc::new(ManualClock::new(1_000));
    let opts = ShardOptions { warm_start: true, checkpoint_every: 25, channel_cap: 16 };

    let log: Arc<dyn LogStore> = Arc::new(SqliteLogStore::open(&path).unwrap());
    let pool = ShardPool::open(&groups, log.clone(), clock.clone(), opts).await.unwrap();
    for round in 0..4 {
        let out = pool.apply_batch(&batch(round)).await;
        assert!(out.iter().all(|r| r.is_ok()));
        clock.advance(100);
    }
    let before = leaderboards(&pool).await;
    pool.shutdown().await;
    drop(pool);

    let warm = ShardPool::open(&groups, log.clone(), clock.clone(), opts).await.unwrap();
    let cold = ShardPool::open(&groups, log.clone(), clock.clone(), ShardOptions { warm_start: false, ..opts })
        .await
        .unwrap();
    assert_eq!(leaderboards(&warm).await, before);
    assert_eq!(leaderboards(&cold).await, before);

    let expected: u64 = (0..4).flat_map(batch).map(|m| m.amount).sum();
    let coord = Coordinator::new(warm.readers(), Duration::from_millis(200));
    let totals = coord.get_pop_by_groups().await;
    assert!(totals.is_complete());
    assert_eq!(totals.sum(), expected);

    warm.shutdown().await;
    cold.shutdown().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redelivered_batch_is_absorbed() {
    let path = temp_db();
    let log: Arc<dyn LogStore> = Arc::new(SqliteLogStore::open(&path).unwrap());
    let pool = ShardPool::open(&[GroupId(1), GroupId(3), GroupId(4)], log, Arc::new(ManualClock::new(0)), ShardOptions::default())
        .await
        .unwrap();
    let b = batch(1);
    let total: u64 = b.iter().map(|m| m.amount).sum();
    pool.apply_batch(&b).await;
    let again = pool.apply_batch(&b).await;
    assert!(again.iter().all(|r| r.is_ok()));

    let coord = Coordinator::new(pool.readers(), Duration::from_millis(200));
    assert_eq!(coord.get_pop_by_groups().await.sum(), total);

    pool.shutdown().await;
    let totals = coord.get_pop_by_groups().await;
    assert!(totals.totals.is_empty());
    assert_eq!(totals.unreachable, vec![GroupId(1), GroupId(3), GroupId(4)]);
    let _ = std::fs::remove_file(&path);
}
