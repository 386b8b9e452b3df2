//! Pops public API façade (in-process).
//!
//! Frontends depend on the `PopApi` trait. `InProcApi` serves it from a running
//! `Engine`; `MockApi` serves canned data for frontend tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

mod engine;

pub use engine::{Engine, EngineParts};
pub use pops_core::{GroupId, LeaderboardEntry, PlayerId, PopError, PopRequest, PopResult, PopsConfig};
pub use pops_ingest::{IngestStats, Ticket};
pub use pops_reconcile::{RunOutcome, RunReport};
pub use pops_store::GroupTotals;

/// Runtime state exposed to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub groups: Vec<GroupId>,
    pub accepted: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub rejected: u64,
    pub watermark: i64,
    pub snapshot_epoch: u64,
}

#[async_trait::async_trait]
pub trait PopApi: Send + Sync {
    /// Validate and enqueue a pop; the ticket resolves when it is applied.
    async fn submit_pop(&self, req: PopRequest) -> PopResult<Ticket>;

    /// Live running total of one group.
    async fn get_total_score(&self, group: GroupId) -> PopResult<u64>;

    /// Ten highest scores of one group, ties by player id.
    async fn get_top_ten(&self, group: GroupId) -> PopResult<Vec<LeaderboardEntry>>;

    async fn get_player_score(&self, group: GroupId, player: PlayerId) -> PopResult<u64>;

    /// Live totals of every group; unreachable groups are listed, not zeroed.
    async fn get_pop_by_groups(&self) -> PopResult<GroupTotals>;

    /// Player total across groups, from the last reconciled snapshot.
    async fn get_global_player_total(&self, player: PlayerId) -> PopResult<u64>;

    /// Per-group totals from the last reconciled snapshot.
    async fn get_group_totals_snapshot(&self) -> PopResult<BTreeMap<GroupId, u64>>;

    async fn stats(&self) -> PopResult<EngineStats>;
}

// ----------------- In-process implementation -----------------

pub struct InProcApi {
    engine: Arc<Engine>,
}

impl InProcApi {
    pub fn new(engine: Arc<Engine>) -> Self { Self { engine } }

    pub fn engine(&self) -> &Arc<Engine> { &self.engine }
}

#[async_trait::async_trait]
impl PopApi for InProcApi {
    async fn submit_pop(&self, req: PopRequest) -> PopResult<Ticket> {
        let t0 = Instant::now();
        let ticket = self.engine.queue().submit(req).await?;
        info!(id = %ticket.id(), took_ms = %t0.elapsed().as_millis(), "api: submit_pop ok");
        Ok(ticket)
    }

    async fn get_total_score(&self, group: GroupId) -> PopResult<u64> {
        let total = self.engine.pool().handle(group)?.total_score()?;
        info!(group = %group, total, "api: total_score");
        Ok(total)
    }

    async fn get_top_ten(&self, group: GroupId) -> PopResult<Vec<LeaderboardEntry>> {
        let t0 = Instant::now();
        let top = self.engine.pool().handle(group)?.top_ten()?.into_vec();
        info!(group = %group, rows = top.len(), took_ms = %t0.elapsed().as_millis(), "api: top_ten");
        Ok(top)
    }

    async fn get_player_score(&self, group: GroupId, player: PlayerId) -> PopResult<u64> {
        self.engine.pool().handle(group)?.player_score(&player)
    }

    async fn get_pop_by_groups(&self) -> PopResult<GroupTotals> {
        let t0 = Instant::now();
        let totals = self.engine.coordinator().get_pop_by_groups().await;
        info!(
            groups = totals.totals.len(),
            unreachable = totals.unreachable.len(),
            took_ms = %t0.elapsed().as_millis(),
            "api: pop_by_groups"
        );
        Ok(totals)
    }

    async fn get_global_player_total(&self, player: PlayerId) -> PopResult<u64> {
        Ok(self.engine.reconciler().global_player_total(&player))
    }

    async fn get_group_totals_snapshot(&self) -> PopResult<BTreeMap<GroupId, u64>> {
        Ok(self.engine.reconciler().group_totals())
    }

    async fn stats(&self) -> PopResult<EngineStats> {
        let q = self.engine.queue().stats();
        let snap = self.engine.reconciler().snapshot();
        Ok(EngineStats {
            groups: self.engine.groups(),
            accepted: q.accepted,
            acked: q.acked,
            retried: q.retried,
            dead_lettered: q.dead_lettered,
            rejected: q.rejected,
            watermark: snap.watermark,
            snapshot_epoch: snap.epoch,
        })
    }
}

// ----------------- Mock implementation -----------------

/// Canned responses for frontend tests. Submissions are recorded and acked.
#[derive(Default)]
pub struct MockApi {
    pub totals: BTreeMap<GroupId, u64>,
    pub unreachable: Vec<GroupId>,
    pub top: BTreeMap<GroupId, Vec<LeaderboardEntry>>,
    pub scores: BTreeMap<(GroupId, PlayerId), u64>,
    pub global: BTreeMap<PlayerId, u64>,
    pub snapshot_groups: BTreeMap<GroupId, u64>,
    pub stats: EngineStats,
    pub submitted: Mutex<Vec<PopRequest>>,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    fn known(&self, group: GroupId) -> PopResult<()> {
        if self.unreachable.contains(&group) {
            Err(PopError::ShardUnreachable(group))
        } else if self.totals.contains_key(&group) {
            Ok(())
        } else {
            Err(PopError::Validation(format!("unknown group {}", group)))
        }
    }
}

#[async_trait::async_trait]
impl PopApi for MockApi {
    async fn submit_pop(&self, req: PopRequest) -> PopResult<Ticket> {
        self.known(GroupId::new(req.group)?)?;
        self.submitted.lock().unwrap_or_else(|e| e.into_inner()).push(req);
        Ok(Ticket::ready(uuid::Uuid::new_v4(), Ok(())))
    }

    async fn get_total_score(&self, group: GroupId) -> PopResult<u64> {
        self.known(group)?;
        Ok(self.totals.get(&group).copied().unwrap_or(0))
    }

    async fn get_top_ten(&self, group: GroupId) -> PopResult<Vec<LeaderboardEntry>> {
        self.known(group)?;
        Ok(self.top.get(&group).map(|v| v.iter().take(10).copied().collect()).unwrap_or_default())
    }

    async fn get_player_score(&self, group: GroupId, player: PlayerId) -> PopResult<u64> {
        self.known(group)?;
        Ok(self.scores.get(&(group, player)).copied().unwrap_or(0))
    }

    async fn get_pop_by_groups(&self) -> PopResult<GroupTotals> {
        let totals = self.totals.iter().filter(|(g, _)| !self.unreachable.contains(g)).map(|(g, t)| (*g, *t)).collect();
        Ok(GroupTotals { totals, unreachable: self.unreachable.clone() })
    }

    async fn get_global_player_total(&self, player: PlayerId) -> PopResult<u64> {
        Ok(self.global.get(&player).copied().unwrap_or(0))
    }

    async fn get_group_totals_snapshot(&self) -> PopResult<BTreeMap<GroupId, u64>> { Ok(self.snapshot_groups.clone()) }

    async fn stats(&self) -> PopResult<EngineStats> { Ok(self.stats.clone()) }
}
