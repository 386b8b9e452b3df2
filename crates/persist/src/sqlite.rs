//! SQLite-backed log and KV stores. One database file, WAL mode; each store
//! holds its own connection behind a mutex.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use pops_core::{DeadLetter, DeadLetterSink, GroupId, PlayerId, PopEvent};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{AppendOutcome, GroupDelta, KvStore, LogStore, LoggedPop, ShardCheckpoint};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pops (
    seq      INTEGER PRIMARY KEY AUTOINCREMENT,
    id       BLOB NOT NULL UNIQUE,
    ts       INTEGER NOT NULL,
    player   TEXT NOT NULL,
    amount   INTEGER NOT NULL CHECK (amount > 0),
    group_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pops_group_ts ON pops(group_id, ts);
CREATE TABLE IF NOT EXISTS shard_checkpoints (
    group_id    INTEGER PRIMARY KEY,
    total       INTEGER NOT NULL,
    through_seq INTEGER NOT NULL,
    last_ts     INTEGER NOT NULL,
    scores      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dead_letters (
    id       BLOB NOT NULL,
    player   TEXT NOT NULL,
    amount   INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    reason   TEXT NOT NULL,
    at_ms    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_ms INTEGER NOT NULL
);
";

fn open_conn(path: &str) -> Result<Connection> {
    let started = Instant::now();
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating directory for {}", path))?;
    }
    let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
    db.pragma_update(None, "journal_mode", &"WAL").ok();
    db.pragma_update(None, "synchronous", &"NORMAL").ok();
    db.busy_timeout(Duration::from_secs(5)).context("setting busy timeout")?;
    db.execute_batch(SCHEMA).context("creating pops schema")?;
    let took_ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!("persist_open_ms", took_ms);
    info!(path = %path, took_ms = took_ms as u64, "persist: sqlite opened");
    Ok(db)
}

fn lock(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
}

fn conversion(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn logged_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoggedPop> {
    let seq: i64 = row.get(0)?;
    let id: Vec<u8> = row.get(1)?;
    let timestamp: i64 = row.get(2)?;
    let player: String = row.get(3)?;
    let amount: i64 = row.get(4)?;
    let group: i64 = row.get(5)?;
    let id = Uuid::from_slice(&id).map_err(|e| conversion(1, e))?;
    let player = PlayerId::parse(&player).map_err(|e| conversion(3, e))?;
    Ok(LoggedPop {
        seq: seq as u64,
        event: PopEvent { id, timestamp, player, amount: amount as u64, group: GroupId(group as u16) },
    })
}

/// SQLite pop log. Appends for a batch share one transaction.
pub struct SqliteLogStore {
    db: Mutex<Connection>,
}

impl SqliteLogStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self { db: Mutex::new(open_conn(path)?) })
    }

    /// Number of dead letters recorded so far.
    pub fn dead_letter_count(&self) -> Result<u64> {
        let db = lock(&self.db)?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

impl LogStore for SqliteLogStore {
    fn append_batch(&self, events: &[PopEvent]) -> Vec<Result<AppendOutcome>> {
        let started = Instant::now();
        let fail_all = |why: String| -> Vec<Result<AppendOutcome>> {
            warn!(rows = events.len(), error = %why, "persist: append batch failed");
            counter!("persist_append_failed_total", events.len() as u64);
            events.iter().map(|_| Err(anyhow!("{}", why))).collect()
        };
        let mut db = match lock(&self.db) {
            Ok(db) => db,
            Err(e) => return fail_all(e.to_string()),
        };
        let tx = match db.transaction() {
            Ok(tx) => tx,
            Err(e) => return fail_all(format!("begin transaction: {}", e)),
        };
        let mut out = Vec::with_capacity(events.len());
        {
            let mut stmt = match tx.prepare_cached(
                "INSERT INTO pops(id, ts, player, amount, group_id) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO NOTHING",
            ) {
                Ok(stmt) => stmt,
                Err(e) => return fail_all(format!("prepare insert: {}", e)),
            };
            for ev in events {
                let amount = match i64::try_from(ev.amount) {
                    Ok(a) => a,
                    Err(_) => {
                        out.push(Err(anyhow!("amount {} out of range", ev.amount)));
                        continue;
                    }
                };
                let res = stmt.execute(params![
                    &ev.id.as_bytes()[..],
                    ev.timestamp,
                    ev.player.as_str(),
                    amount,
                    ev.group.0 as i64,
                ]);
                out.push(match res {
                    Ok(0) => Ok(AppendOutcome::Duplicate),
                    Ok(_) => Ok(AppendOutcome::Inserted(tx.last_insert_rowid() as u64)),
                    Err(e) => Err(anyhow::Error::new(e).context(format!("inserting pop {}", ev.id))),
                });
            }
        }
        if let Err(e) = tx.commit() {
            return fail_all(format!("commit: {}", e));
        }
        histogram!("persist_append_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_append_rows_total", events.len() as u64);
        out
    }

    fn events_since(&self, group: GroupId, since_ts: i64) -> Result<Vec<PopEvent>> {
        let db = lock(&self.db)?;
        let mut stmt = db.prepare_cached(
            "SELECT seq, id, ts, player, amount, group_id FROM pops
             WHERE group_id = ?1 AND ts > ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![group.0 as i64, since_ts], logged_from_row)?
            .map(|r| r.map(|l| l.event))
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("reading group {} since {}", group, since_ts))?;
        Ok(rows)
    }

    fn events_after_seq(&self, group: GroupId, after_seq: u64) -> Result<Vec<LoggedPop>> {
        let started = Instant::now();
        let db = lock(&self.db)?;
        let mut stmt = db.prepare_cached(
            "SELECT seq, id, ts, player, amount, group_id FROM pops
             WHERE group_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![group.0 as i64, after_seq as i64], logged_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("replaying group {} after seq {}", group, after_seq))?;
        histogram!("persist_replay_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(rows)
    }

    fn group_delta(&self, group: GroupId, since_exclusive: i64, until_inclusive: i64) -> Result<GroupDelta> {
        let started = Instant::now();
        let db = lock(&self.db)?;
        let (total, events, max_timestamp): (i64, i64, Option<i64>) = db
            .prepare_cached(
                "SELECT COALESCE(SUM(amount), 0), COUNT(*), MAX(ts) FROM pops
                 WHERE group_id = ?1 AND ts > ?2 AND ts <= ?3",
            )?
            .query_row(params![group.0 as i64, since_exclusive, until_inclusive], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .with_context(|| format!("summing group {}", group))?;
        let mut by_player = Vec::new();
        if events > 0 {
            let mut stmt = db.prepare_cached(
                "SELECT player, SUM(amount) FROM pops
                 WHERE group_id = ?1 AND ts > ?2 AND ts <= ?3
                 GROUP BY player ORDER BY player",
            )?;
            let mut rows = stmt.query(params![group.0 as i64, since_exclusive, until_inclusive])?;
            while let Some(row) = rows.next()? {
                let player: String = row.get(0)?;
                let sum: i64 = row.get(1)?;
                let player = PlayerId::parse(&player).with_context(|| format!("bad player id in log: {}", player))?;
                by_player.push((player, sum as u64));
            }
        }
        histogram!("persist_delta_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(GroupDelta { total: total as u64, events: events as u64, max_timestamp, by_player })
    }

    fn load_checkpoint(&self, group: GroupId) -> Result<Option<ShardCheckpoint>> {
        let db = lock(&self.db)?;
        let row: Option<(i64, i64, i64, String)> = db
            .query_row(
                "SELECT total, through_seq, last_ts, scores FROM shard_checkpoints WHERE group_id = ?1",
                [group.0 as i64],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((total, through_seq, last_ts, scores)) = row else { return Ok(None) };
        let scores = serde_json::from_str(&scores).with_context(|| format!("decoding checkpoint scores for group {}", group))?;
        Ok(Some(ShardCheckpoint { group, total: total as u64, through_seq: through_seq as u64, last_ts, scores }))
    }

    fn save_checkpoint(&self, cp: &ShardCheckpoint) -> Result<()> {
        let started = Instant::now();
        let scores = serde_json::to_string(&cp.scores)?;
        let db = lock(&self.db)?;
        db.execute(
            "INSERT INTO shard_checkpoints(group_id, total, through_seq, last_ts, scores)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(group_id) DO UPDATE SET
                total = excluded.total,
                through_seq = excluded.through_seq,
                last_ts = excluded.last_ts,
                scores = excluded.scores",
            params![cp.group.0 as i64, cp.total as i64, cp.through_seq as i64, cp.last_ts, scores],
        )
        .with_context(|| format!("saving checkpoint for group {}", cp.group))?;
        histogram!("persist_checkpoint_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }
}

impl DeadLetterSink for SqliteLogStore {
    fn record(&self, letter: &DeadLetter) -> Result<()> {
        let m = &letter.message;
        let db = lock(&self.db)?;
        db.execute(
            "INSERT INTO dead_letters(id, player, amount, group_id, attempts, reason, at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &m.id.as_bytes()[..],
                m.player.as_str(),
                m.amount as i64,
                m.group.0 as i64,
                letter.attempts as i64,
                letter.reason,
                letter.at_ms,
            ],
        )
        .context("recording dead letter")?;
        counter!("persist_dead_letters_total", 1u64);
        Ok(())
    }
}

/// SQLite KV table holding the snapshot records.
pub struct SqliteKvStore {
    db: Mutex<Connection>,
}

impl SqliteKvStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self { db: Mutex::new(open_conn(path)?) })
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let db = lock(&self.db)?;
        let v = db
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| r.get(0))
            .optional()
            .with_context(|| format!("kv get {}", key))?;
        Ok(v)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let started = Instant::now();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let db = lock(&self.db)?;
        db.execute(
            "INSERT INTO kv(key, value, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms",
            params![key, value, now],
        )
        .with_context(|| format!("kv put {}", key))?;
        histogram!("persist_kv_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_kv_put_total", 1u64);
        Ok(())
    }
}
