//! Global reads across all shards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use pops_core::{GroupId, PopError, PopResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::shard::ShardHandle;

/// Read side of a shard as the coordinator sees it.
#[async_trait]
pub trait ShardReader: Send + Sync {
    fn group(&self) -> GroupId;
    async fn fetch_total(&self) -> PopResult<u64>;
}

#[async_trait]
impl ShardReader for ShardHandle {
    fn group(&self) -> GroupId { ShardHandle::group(self) }
    async fn fetch_total(&self) -> PopResult<u64> { self.total_score() }
}

/// Per-group totals. Shards that failed or timed out are listed in
/// `unreachable` and have no entry in `totals`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTotals {
    pub totals: BTreeMap<GroupId, u64>,
    pub unreachable: Vec<GroupId>,
}

impl GroupTotals {
    pub fn is_complete(&self) -> bool { self.unreachable.is_empty() }
    pub fn sum(&self) -> u64 { self.totals.values().sum() }
}

pub struct Coordinator {
    shards: Vec<Arc<dyn ShardReader>>,
    timeout: Duration,
}

impl Coordinator {
    pub fn new(shards: Vec<Arc<dyn ShardReader>>, timeout: Duration) -> Self { Self { shards, timeout } }

    pub fn groups(&self) -> Vec<GroupId> { self.shards.iter().map(|s| s.group()).collect() }

    pub async fn get_pop_by_groups(&self) -> GroupTotals {
        let t0 = Instant::now();
        let timeout = self.timeout;
        let fetches = self.shards.iter().map(|s| async move {
            let res = match tokio::time::timeout(timeout, s.fetch_total()).await {
                Ok(r) => r,
                Err(_) => Err(PopError::ShardUnreachable(s.group())),
            };
            (s.group(), res)
        });
        let mut out = GroupTotals::default();
        for (g, res) in join_all(fetches).await {
            match res {
                Ok(total) => {
                    out.totals.insert(g, total);
                }
                Err(e) => {
                    warn!(group = %g, error = %e, "coordinator: shard unreachable");
                    out.unreachable.push(g);
                }
            }
        }
        out.unreachable.sort_unstable();
        debug!(shards = self.shards.len(), unreachable = out.unreachable.len(), took_ms = %t0.elapsed().as_millis(), "coordinator: totals");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(GroupId, u64);
    struct Slow(GroupId);
    struct Broken(GroupId);

    #[async_trait]
    impl ShardReader for Fixed {
        fn group(&self) -> GroupId { self.0 }
        async fn fetch_total(&self) -> PopResult<u64> { Ok(self.1) }
    }

    #[async_trait]
    impl ShardReader for Slow {
        fn group(&self) -> GroupId { self.0 }
        async fn fetch_total(&self) -> PopResult<u64> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }
    }

    #[async_trait]
    impl ShardReader for Broken {
        fn group(&self) -> GroupId { self.0 }
        async fn fetch_total(&self) -> PopResult<u64> { Err(PopError::ShardUnreachable(self.0)) }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_shards_are_reported_not_zeroed() {
        let c = Coordinator::new(
            vec![
                Arc::new(Fixed(GroupId(1), 10)),
                Arc::new(Slow(GroupId(3))),
                Arc::new(Fixed(GroupId(4), 0)),
                Arc::new(Broken(GroupId(5))),
            ],
            Duration::from_millis(50),
        );
        let t = c.get_pop_by_groups().await;
        assert_eq!(t.totals.get(&GroupId(1)), Some(&10));
        assert_eq!(t.totals.get(&GroupId(4)), Some(&0));
        assert!(!t.totals.contains_key(&GroupId(3)));
        assert!(!t.totals.contains_key(&GroupId(5)));
        assert_eq!(t.unreachable, vec![GroupId(3), GroupId(5)]);
        assert!(!t.is_complete());
        assert_eq!(t.sum(), 10);
    }
}
