//! Shard bookkeeping on top of the hash ring.
//!
//! A shard is the ring segment ending at one virtual node. The shard table is
//! never stored: it is derived from the ring on demand, so it always reflects
//! the ownership changes applied so far. [`ShardManager`] adds load metrics,
//! placement decisions and the move/split/merge operation lifecycle.

mod manager;

pub use manager::{
    ShardInfo, ShardManager, ShardOperation, ShardOperationStatus, ShardOperationType,
};
