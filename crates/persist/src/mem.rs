//! In-memory stores with failure injection, for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use pops_core::{DeadLetter, DeadLetterSink, GroupId, PopEvent};
use uuid::Uuid;

use crate::{sum_by_player, AppendOutcome, GroupDelta, KvStore, LogStore, LoggedPop, ShardCheckpoint};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct MemLog {
    rows: Vec<LoggedPop>,
    ids: HashSet<Uuid>,
    checkpoints: HashMap<GroupId, ShardCheckpoint>,
    dead: Vec<DeadLetter>,
    /// Remaining forced failures per message id.
    fail_ids: HashMap<Uuid, u32>,
    fail_appends: bool,
    fail_reads: bool,
    append_calls: u64,
}

/// Vector-backed log. Sequence numbers start at 1.
#[derive(Default)]
pub struct MemLogStore {
    inner: Mutex<MemLog>,
}

impl MemLogStore {
    pub fn new() -> Self { Self::default() }

    /// Fail the next `times` appends of the row with this id.
    pub fn fail_id(&self, id: Uuid, times: u32) {
        guard(&self.inner).fail_ids.insert(id, times);
    }

    /// Fail every append while set.
    pub fn set_fail_appends(&self, on: bool) { guard(&self.inner).fail_appends = on; }

    /// Fail every read (replay, window and delta queries) while set.
    pub fn set_fail_reads(&self, on: bool) { guard(&self.inner).fail_reads = on; }

    pub fn append_calls(&self) -> u64 { guard(&self.inner).append_calls }

    pub fn len(&self) -> usize { guard(&self.inner).rows.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn all_events(&self) -> Vec<PopEvent> {
        guard(&self.inner).rows.iter().map(|r| r.event).collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> { guard(&self.inner).dead.clone() }

    fn check_reads(log: &MemLog) -> Result<()> {
        if log.fail_reads { Err(anyhow!("injected read failure")) } else { Ok(()) }
    }
}

impl LogStore for MemLogStore {
    fn append_batch(&self, events: &[PopEvent]) -> Vec<Result<AppendOutcome>> {
        let mut log = guard(&self.inner);
        log.append_calls += 1;
        let mut out = Vec::with_capacity(events.len());
        for ev in events {
            if log.fail_appends {
                out.push(Err(anyhow!("injected append failure")));
                continue;
            }
            if let Some(left) = log.fail_ids.get_mut(&ev.id) {
                if *left > 0 {
                    *left -= 1;
                    out.push(Err(anyhow!("injected append failure for {}", ev.id)));
                    continue;
                }
            }
            if !log.ids.insert(ev.id) {
                out.push(Ok(AppendOutcome::Duplicate));
                continue;
            }
            let seq = log.rows.len() as u64 + 1;
            log.rows.push(LoggedPop { seq, event: *ev });
            out.push(Ok(AppendOutcome::Inserted(seq)));
        }
        out
    }

    fn events_since(&self, group: GroupId, since_ts: i64) -> Result<Vec<PopEvent>> {
        let log = guard(&self.inner);
        Self::check_reads(&log)?;
        Ok(log
            .rows
            .iter()
            .filter(|r| r.event.group == group && r.event.timestamp > since_ts)
            .map(|r| r.event)
            .collect())
    }

    fn events_after_seq(&self, group: GroupId, after_seq: u64) -> Result<Vec<LoggedPop>> {
        let log = guard(&self.inner);
        Self::check_reads(&log)?;
        Ok(log.rows.iter().filter(|r| r.event.group == group && r.seq > after_seq).copied().collect())
    }

    fn group_delta(&self, group: GroupId, since_exclusive: i64, until_inclusive: i64) -> Result<GroupDelta> {
        let log = guard(&self.inner);
        Self::check_reads(&log)?;
        Ok(sum_by_player(log.rows.iter().map(|r| &r.event).filter(|e| {
            e.group == group && e.timestamp > since_exclusive && e.timestamp <= until_inclusive
        })))
    }

    fn load_checkpoint(&self, group: GroupId) -> Result<Option<ShardCheckpoint>> {
        let log = guard(&self.inner);
        Self::check_reads(&log)?;
        Ok(log.checkpoints.get(&group).cloned())
    }

    fn save_checkpoint(&self, checkpoint: &ShardCheckpoint) -> Result<()> {
        let mut log = guard(&self.inner);
        if log.fail_appends { return Err(anyhow!("injected checkpoint failure")); }
        log.checkpoints.insert(checkpoint.group, checkpoint.clone());
        Ok(())
    }
}

impl DeadLetterSink for MemLogStore {
    fn record(&self, letter: &DeadLetter) -> Result<()> {
        guard(&self.inner).dead.push(letter.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MemKv {
    map: HashMap<String, String>,
    fail_keys: HashSet<String>,
    puts: Vec<String>,
}

/// HashMap-backed KV store; puts to keys marked failing return an error.
#[derive(Default)]
pub struct MemKvStore {
    inner: Mutex<MemKv>,
}

impl MemKvStore {
    pub fn new() -> Self { Self::default() }

    pub fn fail_puts_to(&self, key: &str) { guard(&self.inner).fail_keys.insert(key.to_string()); }

    pub fn clear_failures(&self) { guard(&self.inner).fail_keys.clear(); }

    /// Keys written so far, in order.
    pub fn put_log(&self) -> Vec<String> { guard(&self.inner).puts.clone() }

    pub fn dump(&self) -> HashMap<String, String> { guard(&self.inner).map.clone() }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(guard(&self.inner).map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut kv = guard(&self.inner);
        if kv.fail_keys.contains(key) {
            return Err(anyhow!("injected put failure for {}", key));
        }
        kv.map.insert(key.to_string(), value.to_string());
        kv.puts.push(key.to_string());
        Ok(())
    }
}
