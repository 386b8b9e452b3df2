//! Pops core types: identifiers, events, errors and the seams shared by the
//! shard, ingest and reconcile crates.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

mod config;
mod error;

pub use config::{ChunkScheme, PopsConfig};
pub use error::{PopError, PopResult};

/// Player identifiers are exactly this many ASCII digits.
pub const PLAYER_ID_LEN: usize = 10;

/// Fixed-format player identifier, kept inline as raw ASCII digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId([u8; PLAYER_ID_LEN]);

impl PlayerId {
    pub fn parse(s: &str) -> PopResult<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != PLAYER_ID_LEN || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(PopError::Validation(format!(
                "player id must be {} ascii digits, got {:?}",
                PLAYER_ID_LEN, s
            )));
        }
        let mut raw = [0u8; PLAYER_ID_LEN];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        // Only ever constructed from ASCII digits.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] { &self.0 }

    /// Numeric value of the digit at `pos`.
    pub fn digit(&self, pos: usize) -> Option<u8> {
        self.0.get(pos).map(|b| b - b'0')
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "PlayerId({})", self.as_str()) }
}

impl FromStr for PlayerId {
    type Err = PopError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl Serialize for PlayerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PlayerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = PlayerId;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a {}-digit player id", PLAYER_ID_LEN)
            }
            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<PlayerId, E> {
                PlayerId::parse(v).map_err(E::custom)
            }
        }
        deserializer.deserialize_str(V)
    }
}

/// Group (shard) identifier; a small positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u16);

impl GroupId {
    pub fn new(n: i64) -> PopResult<Self> {
        if n < 1 || n > u16::MAX as i64 {
            return Err(PopError::Validation(format!("group must be in 1..={}, got {}", u16::MAX, n)));
        }
        Ok(Self(n as u16))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl FromStr for GroupId {
    type Err = PopError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: i64 = s
            .trim()
            .parse()
            .map_err(|_| PopError::Validation(format!("group is not a number: {:?}", s)))?;
        Self::new(n)
    }
}

/// Unvalidated submission as it arrives from a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopRequest {
    pub player: String,
    pub amount: i64,
    pub group: i64,
}

impl PopRequest {
    pub fn new(player: impl Into<String>, amount: i64, group: i64) -> Self {
        Self { player: player.into(), amount, group }
    }

    /// Parse raw text fields; non-numeric amount or group is a validation error.
    pub fn parse(player: &str, amount: &str, group: &str) -> PopResult<Self> {
        let amount = amount
            .trim()
            .parse::<i64>()
            .map_err(|_| PopError::Validation(format!("amount is not a number: {:?}", amount)))?;
        let group = group
            .trim()
            .parse::<i64>()
            .map_err(|_| PopError::Validation(format!("group is not a number: {:?}", group)))?;
        Ok(Self { player: player.to_string(), amount, group })
    }
}

/// Validated queue payload. `id` is the idempotency key of the log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopMessage {
    pub id: Uuid,
    pub player: PlayerId,
    pub amount: u64,
    pub group: GroupId,
}

impl PopMessage {
    pub fn new(player: PlayerId, amount: u64, group: GroupId) -> Self {
        Self { id: Uuid::new_v4(), player, amount, group }
    }
}

/// One immutable row of a group's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopEvent {
    pub id: Uuid,
    /// Milliseconds since the epoch; non-decreasing within a group.
    pub timestamp: i64,
    pub player: PlayerId,
    pub amount: u64,
    pub group: GroupId,
}

/// Leaderboard row returned by ranked queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub player: PlayerId,
    pub score: u64,
}

// ---- seams ----

/// Millisecond wall clock. Injected so tests control timestamps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 { chrono::Utc::now().timestamp_millis() }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock { now: AtomicI64 }

impl ManualClock {
    pub fn new(start_ms: i64) -> Self { Self { now: AtomicI64::new(start_ms) } }
    pub fn set(&self, ms: i64) { self.now.store(ms, Ordering::SeqCst); }
    pub fn advance(&self, ms: i64) -> i64 { self.now.fetch_add(ms, Ordering::SeqCst) + ms }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 { self.now.load(Ordering::SeqCst) }
}

/// Maps a player onto one of a fixed number of snapshot chunks.
pub trait ChunkPlanner: Send + Sync {
    fn chunk_of(&self, player: &PlayerId) -> u16;
    fn chunk_count(&self) -> u16;
}

/// Chunk by the check digit (position 8) of the player id: ten chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckDigitPlanner;

pub const CHECK_DIGIT_POS: usize = 8;

impl ChunkPlanner for CheckDigitPlanner {
    fn chunk_of(&self, player: &PlayerId) -> u16 {
        player.digit(CHECK_DIGIT_POS).unwrap_or(0) as u16
    }
    fn chunk_count(&self) -> u16 { 10 }
}

/// Modulo bucketing over a 64-bit FNV-1a hash of the id.
#[derive(Debug, Clone, Copy)]
pub struct ModuloPlanner { buckets: u16 }

impl ModuloPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.clamp(1, u16::MAX as usize) as u16 }
    }
}

impl ChunkPlanner for ModuloPlanner {
    fn chunk_of(&self, player: &PlayerId) -> u16 {
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        for b in player.as_bytes() { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
        if self.buckets <= 1 { 0 } else { (h % self.buckets as u64) as u16 }
    }
    fn chunk_count(&self) -> u16 { self.buckets }
}

/// Consumer side of the ingest queue: applies a batch, one outcome per message
/// in the same order.
#[async_trait::async_trait]
pub trait BatchApplier: Send + Sync {
    async fn apply_batch(&self, batch: &[PopMessage]) -> Vec<PopResult<()>>;
}

/// A message the queue gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: PopMessage,
    pub attempts: u32,
    pub reason: String,
    pub at_ms: i64,
}

/// Destination for messages that exhausted their retries.
pub trait DeadLetterSink: Send + Sync {
    fn record(&self, letter: &DeadLetter) -> anyhow::Result<()>;
}

/// Fallback sink: log and acknowledge destructively.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDeadLetters;

impl DeadLetterSink for TracingDeadLetters {
    fn record(&self, letter: &DeadLetter) -> anyhow::Result<()> {
        tracing::error!(
            id = %letter.message.id,
            player = %letter.message.player,
            group = %letter.message.group,
            amount = letter.message.amount,
            attempts = letter.attempts,
            reason = %letter.reason,
            "pop dropped after retries"
        );
        Ok(())
    }
}

pub mod prelude {
    pub use super::{
        BatchApplier, ChunkPlanner, Clock, GroupId, LeaderboardEntry, PlayerId, PopError, PopEvent,
        PopMessage, PopRequest, PopResult, PopsConfig,
    };
}
