//! Pops persistence: the append-only pop log and the chunked snapshot KV store.
//! Both are narrow synchronous traits; callers on the async side wrap them in
//! `spawn_blocking`.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use pops_core::{GroupId, PlayerId, PopEvent};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod mem;
mod sqlite;

pub use mem::{MemKvStore, MemLogStore};
pub use sqlite::{SqliteKvStore, SqliteLogStore};

/// Result of appending one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New row with its store-assigned sequence number.
    Inserted(u64),
    /// A row with the same id is already logged; nothing was written.
    Duplicate,
}

/// A log row together with its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedPop {
    pub seq: u64,
    pub event: PopEvent,
}

/// Server-side aggregate of one group's rows in a timestamp window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDelta {
    pub total: u64,
    pub events: u64,
    pub max_timestamp: Option<i64>,
    pub by_player: Vec<(PlayerId, u64)>,
}

impl GroupDelta {
    pub fn is_empty(&self) -> bool { self.events == 0 }
}

/// Persisted running state of a shard, used for warm starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCheckpoint {
    pub group: GroupId,
    pub total: u64,
    /// Highest log sequence folded into `scores`.
    pub through_seq: u64,
    pub last_ts: i64,
    pub scores: Vec<(PlayerId, u64)>,
}

/// Durable, append-only event log partitioned by group.
pub trait LogStore: Send + Sync {
    /// Append rows in one transaction; one outcome per input row, in order.
    fn append_batch(&self, events: &[PopEvent]) -> Vec<Result<AppendOutcome>>;

    fn append(&self, event: &PopEvent) -> Result<AppendOutcome> {
        self.append_batch(std::slice::from_ref(event))
            .pop()
            .unwrap_or_else(|| Err(anyhow::anyhow!("append produced no outcome")))
    }

    /// Rows of `group` with `timestamp > since_ts`, in log order.
    fn events_since(&self, group: GroupId, since_ts: i64) -> Result<Vec<PopEvent>>;

    /// Rows of `group` with `seq > after_seq`, in log order.
    fn events_after_seq(&self, group: GroupId, after_seq: u64) -> Result<Vec<LoggedPop>>;

    /// Sum by group and by player over `since_exclusive < timestamp <= until_inclusive`.
    fn group_delta(&self, group: GroupId, since_exclusive: i64, until_inclusive: i64) -> Result<GroupDelta>;

    fn load_checkpoint(&self, group: GroupId) -> Result<Option<ShardCheckpoint>>;
    fn save_checkpoint(&self, checkpoint: &ShardCheckpoint) -> Result<()>;
}

/// Key-value store holding JSON documents.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

pub fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key)? {
        Some(text) => {
            let v = serde_json::from_str(&text).with_context(|| format!("decoding kv value at {}", key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn put_json<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value).with_context(|| format!("encoding kv value for {}", key))?;
    kv.put(key, &text)
}

/// Fold `rows` into per-player sums, sorted by player for stable output.
pub(crate) fn sum_by_player<'a>(rows: impl Iterator<Item = &'a PopEvent>) -> GroupDelta {
    let mut per: rustc_hash::FxHashMap<PlayerId, u64> = rustc_hash::FxHashMap::default();
    let mut d = GroupDelta::default();
    for ev in rows {
        *per.entry(ev.player).or_default() += ev.amount;
        d.total += ev.amount;
        d.events += 1;
        d.max_timestamp = Some(d.max_timestamp.map_or(ev.timestamp, |m| m.max(ev.timestamp)));
    }
    d.by_player = per.into_iter().collect();
    d.by_player.sort_unstable();
    d
}
