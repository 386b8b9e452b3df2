//! The fixed set of group shards, and batch routing across them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use pops_core::{BatchApplier, Clock, GroupId, PopError, PopMessage, PopResult};
use pops_persist::LogStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coordinator::ShardReader;
use crate::shard::{spawn_shard, GroupShard, ShardHandle, ShardOptions};

pub struct ShardPool {
    shards: BTreeMap<GroupId, ShardHandle>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardPool {
    /// Open every group's shard in parallel and start its worker.
    pub async fn open(
        groups: &[GroupId],
        log: Arc<dyn LogStore>,
        clock: Arc<dyn Clock>,
        opts: ShardOptions,
    ) -> PopResult<Self> {
        let t0 = Instant::now();
        let opens = groups.iter().map(|g| {
            let g = *g;
            let log = Arc::clone(&log);
            async move { (g, tokio::task::spawn_blocking(move || GroupShard::open(g, log, opts)).await) }
        });
        let mut shards = BTreeMap::new();
        let mut workers = Vec::with_capacity(groups.len());
        for (g, res) in join_all(opens).await {
            let shard = match res {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(PopError::Storage(format!("opening shard {}: {:#}", g, e))),
                Err(e) => return Err(PopError::Internal(format!("opening shard {}: {}", g, e))),
            };
            let (handle, task) = spawn_shard(shard, Arc::clone(&clock), opts.channel_cap);
            shards.insert(g, handle);
            workers.push(task);
        }
        info!(groups = shards.len(), took_ms = %t0.elapsed().as_millis(), "shard pool: ready");
        Ok(Self { shards, workers: Mutex::new(workers) })
    }

    pub fn groups(&self) -> Vec<GroupId> { self.shards.keys().copied().collect() }

    pub fn handle(&self, group: GroupId) -> PopResult<&ShardHandle> {
        self.shards
            .get(&group)
            .ok_or_else(|| PopError::Validation(format!("unknown group {}", group)))
    }

    pub fn readers(&self) -> Vec<Arc<dyn ShardReader>> {
        self.shards.values().map(|h| Arc::new(h.clone()) as Arc<dyn ShardReader>).collect()
    }

    pub async fn checkpoint_all(&self) -> Vec<(GroupId, PopResult<()>)> {
        join_all(self.shards.iter().map(|(g, h)| async move { (*g, h.checkpoint().await) })).await
    }

    /// Checkpoint and stop every worker, then wait for them to exit.
    pub async fn shutdown(&self) {
        for (g, res) in join_all(self.shards.iter().map(|(g, h)| async move { (*g, h.shutdown().await) })).await {
            if let Err(e) = res {
                warn!(group = %g, error = %e, "shard pool: shutdown checkpoint failed");
            }
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for w in workers {
            if let Err(e) = w.await {
                warn!(error = %e, "shard pool: worker ended abnormally");
            }
        }
        info!("shard pool stopped");
    }
}

#[async_trait]
impl BatchApplier for ShardPool {
    /// Split a mixed batch per group, apply the sub-batches concurrently and map
    /// the outcomes back to the input positions.
    async fn apply_batch(&self, batch: &[PopMessage]) -> Vec<PopResult<()>> {
        let mut out: Vec<PopResult<()>> = (0..batch.len()).map(|_| Ok(())).collect();
        let mut per_group: BTreeMap<GroupId, (Vec<usize>, Vec<PopMessage>)> = BTreeMap::new();
        for (i, m) in batch.iter().enumerate() {
            if self.shards.contains_key(&m.group) {
                let e = per_group.entry(m.group).or_default();
                e.0.push(i);
                e.1.push(*m);
            } else {
                out[i] = Err(PopError::Validation(format!("unknown group {}", m.group)));
            }
        }
        let subs = per_group.into_iter().filter_map(|(g, (pos, msgs))| {
            let h = self.shards.get(&g)?.clone();
            Some(async move { (pos, h.apply(msgs).await) })
        });
        for (pos, results) in join_all(subs).await {
            for (i, r) in pos.into_iter().zip(results) {
                out[i] = r;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pops_core::{ManualClock, PlayerId};
    use pops_persist::MemLogStore;

    fn p(s: &str) -> PlayerId { PlayerId::parse(s).unwrap() }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mixed_batch_routes_by_group() {
        let log = Arc::new(MemLogStore::new());
        let pool = ShardPool::open(
            &[GroupId(1), GroupId(3)],
            log.clone(),
            Arc::new(ManualClock::new(5)),
            ShardOptions { warm_start: false, checkpoint_every: 0, channel_cap: 4 },
        )
        .await
        .unwrap();
        let batch = [
            PopMessage::new(p("6500000001"), 2, GroupId(1)),
            PopMessage::new(p("6500000002"), 4, GroupId(3)),
            PopMessage::new(p("6500000003"), 1, GroupId(9)),
            PopMessage::new(p("6500000001"), 5, GroupId(1)),
        ];
        let out = pool.apply_batch(&batch).await;
        assert!(out[0].is_ok() && out[1].is_ok() && out[3].is_ok());
        assert!(matches!(out[2], Err(PopError::Validation(_))));
        assert_eq!(pool.handle(GroupId(1)).unwrap().total_score().unwrap(), 7);
        assert_eq!(pool.handle(GroupId(3)).unwrap().total_score().unwrap(), 4);
        assert!(pool.handle(GroupId(9)).is_err());
        assert_eq!(log.len(), 3);

        pool.shutdown().await;
        assert!(log.load_checkpoint(GroupId(3)).unwrap().is_some());
    }
}
