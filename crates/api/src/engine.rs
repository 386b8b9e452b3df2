//! Wires shards, ingestion and reconciliation into one running engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pops_core::{Clock, DeadLetterSink, GroupId, PopError, PopResult, PopsConfig, SystemClock};
use pops_ingest::{spawn_ingest, IngestOptions, IngestQueue};
use pops_persist::{KvStore, LogStore, SqliteKvStore, SqliteLogStore};
use pops_reconcile::{spawn_schedule, ReconcileOptions, RunOutcome, Schedule, SnapshotReconciler};
use pops_store::{Coordinator, ShardOptions, ShardPool};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Storage and clock the engine runs on.
pub struct EngineParts {
    pub log: Arc<dyn LogStore>,
    pub kv: Arc<dyn KvStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub clock: Arc<dyn Clock>,
}

impl EngineParts {
    /// Log, snapshot store and dead letters in the SQLite file at `path`.
    pub fn sqlite(path: &str) -> PopResult<Self> {
        let log = Arc::new(SqliteLogStore::open(path).map_err(PopError::storage)?);
        let kv = Arc::new(SqliteKvStore::open(path).map_err(PopError::storage)?);
        Ok(Self { log: log.clone(), kv, dead_letters: log, clock: Arc::new(SystemClock) })
    }
}

pub struct Engine {
    cfg: PopsConfig,
    pool: Arc<ShardPool>,
    coordinator: Coordinator,
    queue: IngestQueue,
    reconciler: Arc<SnapshotReconciler>,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
    schedule: Mutex<Option<Schedule>>,
    stopped: AtomicBool,
}

impl Engine {
    /// Open every shard, load the published snapshot and start the ingest
    /// consumer; the reconciliation schedule only when asked for.
    pub async fn start(cfg: PopsConfig, parts: EngineParts, with_scheduler: bool) -> PopResult<Arc<Self>> {
        let pool = Arc::new(
            ShardPool::open(&cfg.groups, Arc::clone(&parts.log), Arc::clone(&parts.clock), ShardOptions::from_config(&cfg))
                .await?,
        );
        let coordinator = Coordinator::new(pool.readers(), cfg.shard_timeout());
        let reconciler = Arc::new(SnapshotReconciler::new(
            Arc::clone(&parts.log),
            Arc::clone(&parts.kv),
            cfg.chunks.planner(),
            Arc::clone(&parts.clock),
            ReconcileOptions::from_config(&cfg),
        ));
        if let Err(e) = reconciler.load().await {
            warn!(error = %e, "engine: snapshot store unreadable; serving empty snapshot until the next run");
        }
        let (queue, ingest_task) = spawn_ingest(
            IngestOptions::from_config(&cfg),
            pool.clone(),
            Arc::clone(&parts.dead_letters),
            Arc::clone(&parts.clock),
        );
        let schedule = with_scheduler.then(|| spawn_schedule(Arc::clone(&reconciler), cfg.reconcile_interval()));
        info!(groups = cfg.groups.len(), scheduler = with_scheduler, db = %cfg.db_path, "engine: started");
        Ok(Arc::new(Self {
            cfg,
            pool,
            coordinator,
            queue,
            reconciler,
            ingest_task: Mutex::new(Some(ingest_task)),
            schedule: Mutex::new(schedule),
            stopped: AtomicBool::new(false),
        }))
    }

    pub async fn open_sqlite(cfg: PopsConfig, with_scheduler: bool) -> PopResult<Arc<Self>> {
        let parts = EngineParts::sqlite(&cfg.db_path)?;
        Self::start(cfg, parts, with_scheduler).await
    }

    pub fn config(&self) -> &PopsConfig { &self.cfg }
    pub fn groups(&self) -> Vec<GroupId> { self.pool.groups() }
    pub fn pool(&self) -> &ShardPool { &self.pool }
    pub fn coordinator(&self) -> &Coordinator { &self.coordinator }
    pub fn queue(&self) -> &IngestQueue { &self.queue }
    pub fn reconciler(&self) -> &SnapshotReconciler { &self.reconciler }

    pub async fn reconcile_now(&self) -> PopResult<RunOutcome> { self.reconciler.run().await }

    /// Fold everything logged so far, without the settle delay. Refused
    /// while the engine runs; shards could still append behind the window.
    pub async fn reconcile_drained(&self) -> PopResult<RunOutcome> {
        if !self.stopped.load(Ordering::Acquire) {
            return Err(PopError::Validation("engine is still running; use reconcile_now".into()));
        }
        self.reconciler.run_with_settle(0).await
    }

    pub async fn checkpoint(&self) -> Vec<(GroupId, PopResult<()>)> { self.pool.checkpoint_all().await }

    /// Stop the schedule, drain the ingest queue, then checkpoint and stop
    /// every shard. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(s) = self.schedule.lock().await.take() {
            s.stop().await;
        }
        self.queue.close();
        if let Some(task) = self.ingest_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "engine: ingest consumer ended abnormally");
            }
        }
        self.pool.shutdown().await;
        info!(stats = ?self.queue.stats(), "engine: stopped");
    }
}
