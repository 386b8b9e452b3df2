//! Pops snapshot reconciler.
//!
//! Each run folds the log rows of a settled window into the stored global
//! snapshot: one record of per-group totals and a fixed set of per-player
//! chunks. Every record remembers the upper bound (`through`) it already
//! includes, and the watermark is written last, so a run that fails halfway
//! is retried without counting anything twice.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::join_all;
use metrics::{counter, histogram};
use pops_core::{ChunkPlanner, Clock, GroupId, PlayerId, PopError, PopResult, PopsConfig};
use pops_persist::{get_json, put_json, GroupDelta, KvStore, LogStore};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const GROUP_TOTALS_KEY: &str = "group-totals";
pub const WATERMARK_KEY: &str = "watermark";

pub fn chunk_key(chunk: u16) -> String { format!("player-chunk-{}", chunk) }

/// Stored per-group totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Upper bound (inclusive) of the log window already folded in.
    pub through: i64,
    pub totals: BTreeMap<GroupId, u64>,
    /// Chunk count of the planner layout the stored chunks may use; every id
    /// below it is read back. 0 before the first run.
    #[serde(default)]
    pub chunks: u16,
}

/// Stored per-player totals of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub through: i64,
    pub totals: BTreeMap<PlayerId, u64>,
}

impl Default for GroupRecord {
    fn default() -> Self { Self { through: i64::MIN, totals: BTreeMap::new(), chunks: 0 } }
}

impl Default for ChunkRecord {
    fn default() -> Self { Self { through: i64::MIN, totals: BTreeMap::new() } }
}

/// Last published state of the snapshot store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalSnapshot {
    pub epoch: u64,
    pub watermark: i64,
    pub groups: GroupRecord,
    pub chunks: BTreeMap<u16, ChunkRecord>,
}

impl GlobalSnapshot {
    pub fn group_totals(&self) -> &BTreeMap<GroupId, u64> { &self.groups.totals }

    /// 0 if unknown. A player moving between chunks may briefly be stored
    /// twice; the copy with the newest `through` is current.
    pub fn player_total(&self, player: &PlayerId) -> u64 {
        self.chunks
            .values()
            .filter_map(|c| c.totals.get(player).map(|s| (c.through, *s)))
            .max_by_key(|(through, _)| *through)
            .map_or(0, |(_, s)| s)
    }

    pub fn total_players(&self) -> usize {
        self.chunks.values().flat_map(|c| c.totals.keys()).collect::<BTreeSet<_>>().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub from: i64,
    pub upper: i64,
    pub events: u64,
    pub chunks_written: usize,
    pub groups_written: bool,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Applied(RunReport),
    /// Nothing settled since the last run; nothing was written.
    NoChange,
    /// Another run holds the lock.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub groups: Vec<GroupId>,
    pub settle_ms: i64,
    pub watermark_start: i64,
}

impl ReconcileOptions {
    pub fn from_config(cfg: &PopsConfig) -> Self {
        Self { groups: cfg.groups.clone(), settle_ms: cfg.settle_ms, watermark_start: cfg.watermark_start }
    }
}

async fn blocking<T, F>(f: F) -> PopResult<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(r) => r.map_err(PopError::storage),
        Err(e) => Err(PopError::Internal(format!("blocking task failed: {}", e))),
    }
}

pub struct SnapshotReconciler {
    log: Arc<dyn LogStore>,
    kv: Arc<dyn KvStore>,
    planner: Arc<dyn ChunkPlanner>,
    clock: Arc<dyn Clock>,
    opts: ReconcileOptions,
    run_lock: Mutex<()>,
    snap: ArcSwap<GlobalSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl SnapshotReconciler {
    pub fn new(
        log: Arc<dyn LogStore>,
        kv: Arc<dyn KvStore>,
        planner: Arc<dyn ChunkPlanner>,
        clock: Arc<dyn Clock>,
        opts: ReconcileOptions,
    ) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let snap = GlobalSnapshot { watermark: opts.watermark_start, ..GlobalSnapshot::default() };
        Self { log, kv, planner, clock, opts, run_lock: Mutex::new(()), snap: ArcSwap::from_pointee(snap), epoch_tx }
    }

    pub fn snapshot(&self) -> Arc<GlobalSnapshot> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn global_player_total(&self, player: &PlayerId) -> u64 { self.snap.load().player_total(player) }

    pub fn group_totals(&self) -> BTreeMap<GroupId, u64> { self.snap.load().groups.totals.clone() }

    fn publish(&self, mut next: GlobalSnapshot) -> Arc<GlobalSnapshot> {
        next.epoch = self.snap.load().epoch.saturating_add(1);
        let next = Arc::new(next);
        self.snap.store(Arc::clone(&next));
        self.epoch_tx.send_replace(next.epoch);
        next
    }

    async fn read_stored(&self) -> PopResult<(i64, GroupRecord, BTreeMap<u16, ChunkRecord>)> {
        let kv = Arc::clone(&self.kv);
        let planned = self.planner.chunk_count();
        let start = self.opts.watermark_start;
        blocking(move || {
            let watermark = get_json::<i64>(kv.as_ref(), WATERMARK_KEY)?.unwrap_or(start);
            let groups = get_json::<GroupRecord>(kv.as_ref(), GROUP_TOTALS_KEY)?.unwrap_or_default();
            // Chunks written under an earlier, wider layout are read too.
            let chunk_count = planned.max(groups.chunks);
            let mut chunks = BTreeMap::new();
            for c in 0..chunk_count {
                if let Some(rec) = get_json::<ChunkRecord>(kv.as_ref(), &chunk_key(c))? {
                    chunks.insert(c, rec);
                }
            }
            Ok((watermark, groups, chunks))
        })
        .await
    }

    /// Publish whatever the snapshot store currently holds.
    pub async fn load(&self) -> PopResult<Arc<GlobalSnapshot>> {
        let (watermark, groups, chunks) = self.read_stored().await?;
        let snap = self.publish(GlobalSnapshot { epoch: 0, watermark, groups, chunks });
        info!(watermark, players = snap.total_players(), "reconcile: snapshot loaded");
        Ok(snap)
    }

    /// One reconciliation pass.
    pub async fn run(&self) -> PopResult<RunOutcome> { self.run_with_settle(self.opts.settle_ms).await }

    /// A pass with its own settle delay. Zero is only safe once no shard can
    /// still append, e.g. after the engine has stopped.
    pub async fn run_with_settle(&self, settle_ms: i64) -> PopResult<RunOutcome> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            debug!("reconcile: run already in progress; skipping");
            counter!("pops_reconcile_skipped_total", 1u64);
            return Ok(RunOutcome::Skipped);
        };
        let t0 = Instant::now();
        let res = self.run_locked(t0, settle_ms.max(0)).await;
        histogram!("pops_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(RunOutcome::Applied(r)) => info!(
                from = r.from,
                upper = r.upper,
                events = r.events,
                chunks_written = r.chunks_written,
                took_ms = r.took_ms,
                "reconcile: applied"
            ),
            Ok(_) => debug!("reconcile: no settled events"),
            Err(e) => {
                counter!("pops_reconcile_failed_total", 1u64);
                error!(error = %e, "reconcile: run failed; watermark not advanced");
            }
        }
        res
    }

    async fn run_locked(&self, t0: Instant, settle_ms: i64) -> PopResult<RunOutcome> {
        let upper = self.clock.now_ms().saturating_sub(settle_ms);
        let (w, group_rec, chunk_recs) = self.read_stored().await?;
        if upper <= w {
            return Ok(RunOutcome::NoChange);
        }

        let group_base = group_rec.through.max(w);
        let layout = self.planner.chunk_count();
        let chunk_base = |c: u16| chunk_recs.get(&c).map_or(w, |r| r.through.max(w));
        let mut chunk_ids: BTreeSet<u16> = (0..layout).collect();
        chunk_ids.extend(chunk_recs.keys().copied());
        let mut bases: BTreeSet<i64> = chunk_ids.iter().map(|c| chunk_base(*c)).collect();
        bases.insert(group_base);
        bases.retain(|b| *b < upper);

        let windows = self.fetch_windows(&bases, upper).await?;
        let events: u64 = windows.values().flat_map(|ds| ds.iter().map(|(_, d)| d.events)).sum();
        if events == 0 {
            return Ok(RunOutcome::NoChange);
        }
        let per_player: FxHashMap<i64, FxHashMap<PlayerId, u64>> = windows
            .iter()
            .map(|(base, ds)| {
                let mut m: FxHashMap<PlayerId, u64> = FxHashMap::default();
                for (_, d) in ds {
                    for (p, s) in &d.by_player {
                        *m.entry(*p).or_default() += *s;
                    }
                }
                (*base, m)
            })
            .collect();
        let added = |base: i64, p: &PlayerId| per_player.get(&base).and_then(|m| m.get(p)).copied().unwrap_or(0);

        // Group record.
        let mut next_groups = group_rec.clone();
        if let Some(ds) = windows.get(&group_base) {
            for (g, d) in ds {
                if d.total > 0 {
                    *next_groups.totals.entry(*g).or_default() += d.total;
                }
            }
        }
        next_groups.chunks = layout;
        let groups_changed = next_groups != group_rec;

        // Stored players: the copy with the newest `through` wins and takes
        // that chunk's base.
        let mut current: BTreeMap<PlayerId, (i64, u16, u64)> = BTreeMap::new();
        for (c, rec) in &chunk_recs {
            for (p, s) in &rec.totals {
                if current.get(p).map_or(true, |(through, _, _)| rec.through > *through) {
                    current.insert(*p, (rec.through, *c, *s));
                }
            }
        }

        // `settled` is the final partition. `staged` also keeps every mover in
        // the chunk it leaves, so the mover is stored somewhere at each step.
        let mut settled: BTreeMap<u16, BTreeMap<PlayerId, u64>> = BTreeMap::new();
        let mut staged: BTreeMap<u16, BTreeMap<PlayerId, u64>> = BTreeMap::new();
        for (p, (_, source, s)) in &current {
            let score = s + added(chunk_base(*source), p);
            let target = self.planner.chunk_of(p);
            settled.entry(target).or_default().insert(*p, score);
            staged.entry(target).or_default().insert(*p, score);
            if *source != target {
                staged.entry(*source).or_default().insert(*p, score);
            }
        }
        // New players take the base of the chunk they land in.
        for (base, m) in &per_player {
            for (p, s) in m {
                if current.contains_key(p) { continue; }
                let target = self.planner.chunk_of(p);
                if chunk_base(target) == *base {
                    settled.entry(target).or_default().insert(*p, *s);
                    staged.entry(target).or_default().insert(*p, *s);
                }
            }
        }

        // Order: widened layout, staged chunks, settled chunks, group record,
        // watermark.
        let mut writes: Vec<(String, String)> = Vec::new();
        if layout > group_rec.chunks {
            let widened = GroupRecord { chunks: layout, ..group_rec.clone() };
            writes.push((GROUP_TOTALS_KEY.to_string(), encode(&widened)?));
        }
        let mut settles: Vec<(String, String)> = Vec::new();
        let mut chunks_written = 0;
        for c in chunk_ids {
            let first = staged.remove(&c).unwrap_or_default();
            let last = settled.remove(&c).unwrap_or_default();
            let prev = chunk_recs.get(&c).map(|r| &r.totals);
            let stage = !prev.map_or(first.is_empty(), |p| *p == first);
            let settle = last != first;
            if stage {
                writes.push((chunk_key(c), encode(&ChunkRecord { through: upper, totals: first })?));
            }
            if settle {
                settles.push((chunk_key(c), encode(&ChunkRecord { through: upper, totals: last })?));
            }
            if stage || settle {
                chunks_written += 1;
            }
        }
        writes.append(&mut settles);
        if groups_changed {
            next_groups.through = upper;
            writes.push((GROUP_TOTALS_KEY.to_string(), encode(&next_groups)?));
        }
        writes.push((WATERMARK_KEY.to_string(), encode(&upper)?));

        let kv = Arc::clone(&self.kv);
        blocking(move || {
            for (key, value) in &writes {
                kv.put(key, value)?;
            }
            Ok(())
        })
        .await?;

        // Re-read what was committed so the published view matches storage.
        let (watermark, groups, chunks) = self.read_stored().await?;
        self.publish(GlobalSnapshot { epoch: 0, watermark, groups, chunks });
        counter!("pops_reconcile_events_total", events);
        Ok(RunOutcome::Applied(RunReport {
            from: w,
            upper,
            events,
            chunks_written,
            groups_written: groups_changed,
            took_ms: t0.elapsed().as_millis() as u64,
        }))
    }

    /// Per base: every group's aggregate over `(base, upper]`, queried in parallel.
    async fn fetch_windows(
        &self,
        bases: &BTreeSet<i64>,
        upper: i64,
    ) -> PopResult<BTreeMap<i64, Vec<(GroupId, GroupDelta)>>> {
        let queries = bases.iter().flat_map(|base| {
            self.opts.groups.iter().map(move |g| {
                let log = Arc::clone(&self.log);
                let (base, g) = (*base, *g);
                async move { (base, g, blocking(move || log.group_delta(g, base, upper)).await) }
            })
        });
        let mut out: BTreeMap<i64, Vec<(GroupId, GroupDelta)>> = BTreeMap::new();
        for (base, g, res) in join_all(queries).await {
            let d = res?;
            out.entry(base).or_default().push((g, d));
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(v: &T) -> PopResult<String> {
    serde_json::to_string(v).map_err(|e| PopError::Internal(format!("encoding snapshot record: {}", e)))
}

/// Periodic trigger for `run`. Missed ticks are skipped rather than bunched.
pub struct Schedule {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Schedule {
    /// Stop after the current run, if any, completes.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "reconcile schedule ended abnormally");
        }
    }
}

pub fn spawn_schedule(reconciler: Arc<SnapshotReconciler>, every: Duration) -> Schedule {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let every = every.max(Duration::from_millis(1));
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors are logged inside `run`; the next tick retries.
                    let _ = reconciler.run().await;
                }
                _ = stop_rx.changed() => break,
            }
        }
        info!("reconcile schedule stopped");
    });
    Schedule { stop_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pops_core::{CheckDigitPlanner, ManualClock, PopEvent};
    use pops_persist::{MemKvStore, MemLogStore};
    use uuid::Uuid;

    fn setup() -> (Arc<MemLogStore>, Arc<MemKvStore>, Arc<ManualClock>, SnapshotReconciler) {
        let log = Arc::new(MemLogStore::new());
        let kv = Arc::new(MemKvStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let opts = ReconcileOptions { groups: vec![GroupId(1), GroupId(3)], settle_ms: 1_000, watermark_start: 0 };
        let r = SnapshotReconciler::new(log.clone(), kv.clone(), Arc::new(CheckDigitPlanner), clock.clone(), opts);
        (log, kv, clock, r)
    }

    fn pop(log: &MemLogStore, player: &str, amount: u64, group: u16, ts: i64) {
        let ev = PopEvent { id: Uuid::new_v4(), timestamp: ts, player: PlayerId::parse(player).unwrap(), amount, group: GroupId(group) };
        log.append(&ev).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_run_is_skipped() {
        let (log, _kv, _clock, r) = setup();
        pop(&log, "6500000011", 4, 1, 100);
        let guard = r.run_lock.try_lock().unwrap();
        assert_eq!(r.run().await.unwrap(), RunOutcome::Skipped);
        drop(guard);
        assert!(matches!(r.run().await.unwrap(), RunOutcome::Applied(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsettled_rows_wait_for_a_later_run() {
        let (log, _kv, clock, r) = setup();
        pop(&log, "6500000011", 4, 1, 8_500);
        pop(&log, "6500000011", 6, 1, 9_500);
        let RunOutcome::Applied(rep) = r.run().await.unwrap() else { panic!("expected a run") };
        assert_eq!((rep.from, rep.upper, rep.events), (0, 9_000, 1));
        assert_eq!(r.group_totals().get(&GroupId(1)), Some(&4));

        clock.advance(1_000);
        r.run().await.unwrap();
        assert_eq!(r.global_player_total(&PlayerId::parse("6500000011").unwrap()), 10);
        assert_eq!(r.snapshot().watermark, 10_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_settle_folds_the_newest_rows() {
        let (log, _kv, clock, r) = setup();
        pop(&log, "6500000011", 4, 1, 9_900);
        pop(&log, "6500000011", 3, 3, 10_000);
        assert_eq!(r.run().await.unwrap(), RunOutcome::NoChange);
        let RunOutcome::Applied(rep) = r.run_with_settle(0).await.unwrap() else { panic!("expected a run") };
        assert_eq!((rep.upper, rep.events), (clock.now_ms(), 2));
        assert_eq!(r.global_player_total(&PlayerId::parse("6500000011").unwrap()), 7);
    }

    #[test]
    fn newest_copy_of_a_moving_player_wins() {
        let p = PlayerId::parse("6500000071").unwrap();
        let mut snap = GlobalSnapshot::default();
        snap.chunks.insert(0, ChunkRecord { through: 100, totals: BTreeMap::from([(p, 7)]) });
        snap.chunks.insert(7, ChunkRecord { through: 200, totals: BTreeMap::from([(p, 9)]) });
        assert_eq!(snap.player_total(&p), 9);
        assert_eq!(snap.total_players(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_player_has_zero_total() {
        let (_log, _kv, _clock, r) = setup();
        assert_eq!(r.global_player_total(&PlayerId::parse("6500000011").unwrap()), 0);
        assert_eq!(r.run().await.unwrap(), RunOutcome::NoChange);
    }
}
