//! Runtime configuration. Every knob is a `POPS_*` environment variable with a default.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CheckDigitPlanner, ChunkPlanner, GroupId, ModuloPlanner};

/// How player totals are partitioned into snapshot chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkScheme {
    CheckDigit,
    Fnv(u16),
}

impl ChunkScheme {
    /// `check-digit` or `fnv:N`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("check-digit") { return Some(ChunkScheme::CheckDigit); }
        let n = s.strip_prefix("fnv:")?.parse::<u16>().ok()?;
        if n == 0 { None } else { Some(ChunkScheme::Fnv(n)) }
    }

    pub fn planner(&self) -> Arc<dyn ChunkPlanner> {
        match self {
            ChunkScheme::CheckDigit => Arc::new(CheckDigitPlanner),
            ChunkScheme::Fnv(n) => Arc::new(ModuloPlanner::new(*n as usize)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopsConfig {
    pub groups: Vec<GroupId>,
    pub db_path: String,
    pub queue_cap: usize,
    pub max_batch: usize,
    pub flush_ms: u64,
    pub max_attempts: u32,
    pub max_amount: u64,
    pub reconcile_secs: u64,
    pub settle_ms: i64,
    pub watermark_start: i64,
    pub chunks: ChunkScheme,
    pub shard_timeout_ms: u64,
    pub warm_start: bool,
    pub checkpoint_every: u64,
}

pub const DEFAULT_GROUPS: [u16; 6] = [1, 3, 4, 5, 6, 7];

impl Default for PopsConfig {
    fn default() -> Self {
        Self {
            groups: DEFAULT_GROUPS.iter().map(|g| GroupId(*g)).collect(),
            db_path: default_db_path(),
            queue_cap: 4096,
            max_batch: 100,
            flush_ms: 50,
            max_attempts: 3,
            max_amount: 1_000_000,
            reconcile_secs: 60,
            settle_ms: 2_000,
            watermark_start: 0,
            chunks: ChunkScheme::CheckDigit,
            shard_timeout_ms: 500,
            warm_start: true,
            checkpoint_every: 10_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl PopsConfig {
    /// Defaults overridden by any `POPS_*` variables that parse.
    pub fn from_env() -> Self {
        let d = Self::default();
        let groups = std::env::var("POPS_GROUPS")
            .ok()
            .and_then(|s| parse_groups(&s))
            .unwrap_or(d.groups);
        let chunks = match std::env::var("POPS_CHUNKS") {
            Ok(s) => ChunkScheme::parse(&s).unwrap_or_else(|| {
                tracing::warn!(value = %s, "invalid POPS_CHUNKS; expected check-digit or fnv:N");
                d.chunks
            }),
            Err(_) => d.chunks,
        };
        Self {
            groups,
            db_path: std::env::var("POPS_DB_PATH").unwrap_or(d.db_path),
            queue_cap: env_parse("POPS_QUEUE_CAP").unwrap_or(d.queue_cap).max(1),
            max_batch: env_parse("POPS_MAX_BATCH").unwrap_or(d.max_batch).max(1),
            flush_ms: env_parse("POPS_FLUSH_MS").unwrap_or(d.flush_ms).max(1),
            max_attempts: env_parse("POPS_MAX_ATTEMPTS").unwrap_or(d.max_attempts).max(1),
            max_amount: env_parse("POPS_MAX_AMOUNT").unwrap_or(d.max_amount).max(1),
            reconcile_secs: env_parse("POPS_RECONCILE_SECS").unwrap_or(d.reconcile_secs).max(1),
            settle_ms: env_parse("POPS_SETTLE_MS").unwrap_or(d.settle_ms).max(0),
            watermark_start: env_parse("POPS_WATERMARK_START").unwrap_or(d.watermark_start),
            chunks,
            shard_timeout_ms: env_parse("POPS_SHARD_TIMEOUT_MS").unwrap_or(d.shard_timeout_ms),
            warm_start: env_parse("POPS_WARM_START").unwrap_or(d.warm_start),
            checkpoint_every: env_parse("POPS_CHECKPOINT_EVERY").unwrap_or(d.checkpoint_every),
        }
    }

    pub fn flush_interval(&self) -> Duration { Duration::from_millis(self.flush_ms) }
    pub fn reconcile_interval(&self) -> Duration { Duration::from_secs(self.reconcile_secs) }
    pub fn shard_timeout(&self) -> Duration { Duration::from_millis(self.shard_timeout_ms) }
}

/// Comma separated group ids; `None` if any entry is invalid or the list is empty.
pub fn parse_groups(s: &str) -> Option<Vec<GroupId>> {
    let mut out = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        out.push(part.parse::<GroupId>().ok()?);
    }
    out.sort_unstable();
    out.dedup();
    if out.is_empty() { None } else { Some(out) }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".pops");
        p.push("pops.db");
        return p.to_string_lossy().to_string();
    }
    "pops.db".to_string()
}
