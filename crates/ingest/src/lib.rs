//! Pops ingestion: validated submissions are buffered on a bounded channel and
//! delivered to a `BatchApplier` in batches. Failed messages are retried
//! individually up to a bound, then handed to a dead-letter sink.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use pops_core::{
    BatchApplier, Clock, DeadLetter, DeadLetterSink, GroupId, PlayerId, PopError, PopMessage, PopRequest, PopResult,
    PopsConfig,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub groups: Vec<GroupId>,
    pub queue_cap: usize,
    pub max_batch: usize,
    pub flush: Duration,
    pub max_attempts: u32,
    pub max_amount: u64,
}

impl IngestOptions {
    pub fn from_config(cfg: &PopsConfig) -> Self {
        Self {
            groups: cfg.groups.clone(),
            queue_cap: cfg.queue_cap,
            max_batch: cfg.max_batch,
            flush: cfg.flush_interval(),
            max_attempts: cfg.max_attempts,
            max_amount: cfg.max_amount,
        }
    }
}

impl Default for IngestOptions {
    fn default() -> Self { Self::from_config(&PopsConfig::default()) }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub rejected: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Resolves once the pop is acknowledged or dead-lettered.
#[derive(Debug)]
pub struct Ticket {
    id: Uuid,
    rx: oneshot::Receiver<PopResult<()>>,
}

impl Ticket {
    /// A ticket that is already resolved, for callers that decide without a queue.
    pub fn ready(id: Uuid, res: PopResult<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(res);
        Self { id, rx }
    }

    pub fn id(&self) -> Uuid { self.id }

    pub async fn wait(self) -> PopResult<()> {
        self.rx.await.unwrap_or(Err(PopError::QueueClosed))
    }
}

struct Pending {
    msg: PopMessage,
    attempts: u32,
    reply: Option<oneshot::Sender<PopResult<()>>>,
}

impl Pending {
    fn resolve(&mut self, res: PopResult<()>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(res);
        }
    }
}

/// Producer side. Cloning is cheap; `close` affects every clone.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<Pending>,
    groups: Arc<BTreeSet<GroupId>>,
    max_amount: u64,
    closed: Arc<AtomicBool>,
    close_tx: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl IngestQueue {
    /// Validate a raw request into a queue message.
    pub fn validate(&self, req: &PopRequest) -> PopResult<PopMessage> {
        let player = PlayerId::parse(&req.player)?;
        if req.amount <= 0 {
            return Err(PopError::Validation(format!("amount must be positive, got {}", req.amount)));
        }
        let amount = req.amount as u64;
        if amount > self.max_amount {
            return Err(PopError::Validation(format!("amount {} exceeds limit {}", amount, self.max_amount)));
        }
        let group = GroupId::new(req.group)?;
        if !self.groups.contains(&group) {
            return Err(PopError::Validation(format!("unknown group {}", group)));
        }
        Ok(PopMessage::new(player, amount, group))
    }

    /// Validate and enqueue. Waits for channel capacity when the queue is full.
    pub async fn submit(&self, req: PopRequest) -> PopResult<Ticket> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PopError::QueueClosed);
        }
        let msg = match self.validate(&req) {
            Ok(m) => m,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("pops_ingest_rejected_total", 1u64);
                return Err(e);
            }
        };
        let (reply, rx) = oneshot::channel();
        let id = msg.id;
        self.tx
            .send(Pending { msg, attempts: 0, reply: Some(reply) })
            .await
            .map_err(|_| PopError::QueueClosed)?;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        counter!("pops_ingest_accepted_total", 1u64);
        Ok(Ticket { id, rx })
    }

    pub fn stats(&self) -> IngestStats { self.counters.snapshot() }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Stop accepting submissions. The consumer delivers everything already
    /// queued, including pending retries, and then exits.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.close_tx.send(true);
        }
    }
}

/// Start the consumer task.
pub fn spawn_ingest(
    opts: IngestOptions,
    applier: Arc<dyn BatchApplier>,
    sink: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
) -> (IngestQueue, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Pending>(opts.queue_cap.max(1));
    let (close_tx, close_rx) = watch::channel(false);
    let counters = Arc::new(Counters::default());
    let queue = IngestQueue {
        tx,
        groups: Arc::new(opts.groups.iter().copied().collect()),
        max_amount: opts.max_amount,
        closed: Arc::new(AtomicBool::new(false)),
        close_tx: Arc::new(close_tx),
        counters: Arc::clone(&counters),
    };
    let consumer = Consumer { opts, applier, sink, clock, counters };
    let task = tokio::spawn(consumer.run(rx, close_rx));
    (queue, task)
}

struct Consumer {
    opts: IngestOptions,
    applier: Arc<dyn BatchApplier>,
    sink: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl Consumer {
    async fn run(self, mut rx: mpsc::Receiver<Pending>, mut close_rx: watch::Receiver<bool>) {
        let max_batch = self.opts.max_batch.max(1);
        let mut pending: VecDeque<Pending> = VecDeque::new();
        let flush = self.opts.flush.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + flush, flush);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut closing = false;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(p) => {
                            pending.push_back(p);
                            if pending.len() >= max_batch {
                                self.flush(&mut pending, max_batch).await;
                            }
                        }
                        None => {
                            debug!(pending = pending.len(), "ingest channel closed; draining");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending, max_batch).await;
                    }
                }
                _ = close_rx.changed(), if !closing => {
                    closing = true;
                    rx.close();
                }
            }
        }
        // Retries are bounded by max_attempts, so this terminates.
        while !pending.is_empty() {
            self.flush(&mut pending, max_batch).await;
            if !pending.is_empty() {
                tokio::time::sleep(flush).await;
            }
        }
        info!(stats = ?self.counters.snapshot(), "ingest consumer stopped");
    }

    /// Deliver one batch from the front of `pending`. Retried messages go to
    /// the back so they are redelivered on a later flush.
    async fn flush(&self, pending: &mut VecDeque<Pending>, max_batch: usize) {
        let n = pending.len().min(max_batch);
        let mut batch: Vec<Pending> = pending.drain(..n).collect();
        let msgs: Vec<PopMessage> = batch.iter().map(|p| p.msg).collect();

        let t0 = Instant::now();
        let mut results = self.applier.apply_batch(&msgs).await;
        histogram!("pops_ingest_batch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if results.len() != batch.len() {
            error!(expected = batch.len(), got = results.len(), "ingest: applier returned wrong outcome count");
            results.resize_with(batch.len(), || Err(PopError::Internal("missing outcome".into())));
        }

        let (mut acked, mut retried, mut dead) = (0u64, 0u64, 0u64);
        let mut retry = Vec::new();
        for (mut p, res) in batch.drain(..).zip(results) {
            match res {
                Ok(()) => {
                    acked += 1;
                    p.resolve(Ok(()));
                }
                Err(e) => {
                    p.attempts += 1;
                    if e.is_retryable() && p.attempts < self.opts.max_attempts {
                        debug!(id = %p.msg.id, group = %p.msg.group, attempts = p.attempts, error = %e, "ingest: retrying");
                        retried += 1;
                        retry.push(p);
                    } else {
                        dead += 1;
                        self.dead_letter(p, e).await;
                    }
                }
            }
        }
        pending.extend(retry);

        self.counters.acked.fetch_add(acked, Ordering::Relaxed);
        self.counters.retried.fetch_add(retried, Ordering::Relaxed);
        self.counters.dead_lettered.fetch_add(dead, Ordering::Relaxed);
        counter!("pops_ingest_acked_total", acked);
        counter!("pops_ingest_retried_total", retried);
        counter!("pops_ingest_dead_lettered_total", dead);
        debug!(size = n, acked, retried, dead, "ingest: flushed batch");
    }

    async fn dead_letter(&self, mut p: Pending, cause: PopError) {
        let reason = cause.to_string();
        warn!(id = %p.msg.id, group = %p.msg.group, player = %p.msg.player, attempts = p.attempts, reason = %reason, "ingest: dead-lettering pop");
        let letter = DeadLetter { message: p.msg, attempts: p.attempts, reason: reason.clone(), at_ms: self.clock.now_ms() };
        let sink = Arc::clone(&self.sink);
        match tokio::task::spawn_blocking(move || sink.record(&letter)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let e = format!("{:#}", e);
                error!(id = %p.msg.id, error = %e, "ingest: dead-letter sink failed");
            }
            Err(e) => error!(id = %p.msg.id, error = %e, "ingest: dead-letter task failed"),
        }
        p.resolve(Err(PopError::DeadLettered { attempts: p.attempts, reason }));
    }
}
