//! Pops store: the ranked index, per-group shard workers, the shard pool that
//! routes ingest batches, and the coordinator for cross-group reads.

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod index;
pub mod pool;
pub mod shard;

pub use coordinator::{Coordinator, GroupTotals, ShardReader};
pub use index::RankedIndex;
pub use pool::ShardPool;
pub use shard::{spawn_shard, GroupShard, ShardHandle, ShardOptions, TOP_TEN};
