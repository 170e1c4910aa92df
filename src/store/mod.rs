//! Window storage backends.
//!
//! A window is a sorted set of entries scored by their grant timestamp.
//! Backends execute a [`Batch`] of sorted-set operations atomically against
//! one key and report one [`Outcome`] per operation.

mod memory;
mod redis_store;

pub use self::memory::MemoryWindowStore;
pub use self::redis_store::RedisWindowStore;

use async_trait::async_trait;

use crate::error::StoreError;

/// A single sorted-set operation against the batch's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOp {
    /// Insert every member with the same score (`ZADD`)
    Add { score: i64, members: Vec<String> },
    /// Set the key expiry in milliseconds (`PEXPIRE`)
    Expire { ttl_ms: u64 },
    /// Count members with `min <= score <= max` (`ZCOUNT`)
    Count { min: i64, max: i64 },
    /// Remove members with `score < bound` (`ZREMRANGEBYSCORE -inf (bound`)
    RemoveBelow { bound: i64 },
    /// Remove specific members (`ZREM`)
    Remove { members: Vec<String> },
    /// Members ranked by descending score, with scores (`ZREVRANGE .. WITHSCORES`)
    RevRangeWithScores { start: usize, stop: usize },
}

/// An ordered list of operations executed atomically on one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<WindowOp>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, score: i64, members: &[String]) -> &mut Self {
        self.ops.push(WindowOp::Add {
            score,
            members: members.to_vec(),
        });
        self
    }

    pub fn expire(&mut self, ttl_ms: u64) -> &mut Self {
        self.ops.push(WindowOp::Expire { ttl_ms });
        self
    }

    pub fn count(&mut self, min: i64, max: i64) -> &mut Self {
        self.ops.push(WindowOp::Count { min, max });
        self
    }

    pub fn remove_below(&mut self, bound: i64) -> &mut Self {
        self.ops.push(WindowOp::RemoveBelow { bound });
        self
    }

    pub fn remove(&mut self, members: &[String]) -> &mut Self {
        self.ops.push(WindowOp::Remove {
            members: members.to_vec(),
        });
        self
    }

    pub fn rev_range_with_scores(&mut self, start: usize, stop: usize) -> &mut Self {
        self.ops.push(WindowOp::RevRangeWithScores { start, stop });
        self
    }

    /// The queued operations, in execution order.
    pub fn ops(&self) -> &[WindowOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One recorded grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Unique token disambiguating entries that share a timestamp
    pub member: String,
    /// Grant timestamp in epoch milliseconds
    pub score: i64,
}

/// The successful result of one [`WindowOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Integer replies: counts, removed/added members, expiry flags
    Int(i64),
    /// Ranked entries
    Entries(Vec<Entry>),
}

impl Reply {
    /// Interpret the reply as a non-negative count.
    pub fn as_count(&self) -> Result<u64, StoreError> {
        match self {
            Reply::Int(n) => u64::try_from(*n)
                .map_err(|_| StoreError::UnexpectedReply(format!("negative count {}", n))),
            Reply::Entries(_) => Err(StoreError::UnexpectedReply(
                "expected an integer, got entries".to_string(),
            )),
        }
    }

    /// Interpret the reply as ranked entries.
    pub fn into_entries(self) -> Result<Vec<Entry>, StoreError> {
        match self {
            Reply::Entries(entries) => Ok(entries),
            Reply::Int(n) => Err(StoreError::UnexpectedReply(format!(
                "expected entries, got integer {}",
                n
            ))),
        }
    }
}

/// The per-operation result of a batch.
pub type Outcome = Result<Reply, StoreError>;

/// Trait for window storage backends.
///
/// Implementations must not interleave another batch on the same key while a
/// batch executes. They must also run every queued operation even if an
/// earlier one fails; callers inspect every outcome.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Execute `batch` atomically against `key`.
    ///
    /// The outer error reports a failure of the batch as a whole (for example
    /// a lost connection); per-operation failures are reported in the outcomes.
    async fn execute(&self, key: &str, batch: &Batch) -> Result<Vec<Outcome>, StoreError>;
}

/// Unwrap batch outcomes, propagating the first error found.
pub fn settle(outcomes: Vec<Outcome>) -> Result<Vec<Reply>, StoreError> {
    outcomes.into_iter().collect()
}
