//! In-process window store.
//!
//! Mirrors the Redis sorted-set semantics the limiter relies on, including key
//! expiry and removal of empty keys. Each batch holds the key's map shard for
//! its whole duration, which serialises batches on the same key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Batch, Entry, Outcome, Reply, WindowOp, WindowStore};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryWindow {
    members: HashMap<String, i64>,
    expires_at: Option<i64>,
}

impl MemoryWindow {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn apply(&mut self, op: &WindowOp, now: i64) -> Reply {
        match op {
            WindowOp::Add { score, members } => {
                let mut added = 0;
                for member in members {
                    if self.members.insert(member.clone(), *score).is_none() {
                        added += 1;
                    }
                }
                Reply::Int(added)
            }
            WindowOp::Expire { ttl_ms } => {
                if self.members.is_empty() {
                    return Reply::Int(0);
                }
                let ttl = i64::try_from(*ttl_ms).unwrap_or(i64::MAX);
                self.expires_at = Some(now.saturating_add(ttl));
                Reply::Int(1)
            }
            WindowOp::Count { min, max } => Reply::Int(
                self.members
                    .values()
                    .filter(|score| (*min..=*max).contains(*score))
                    .count() as i64,
            ),
            WindowOp::RemoveBelow { bound } => {
                let before = self.members.len();
                self.members.retain(|_, score| *score >= *bound);
                Reply::Int((before - self.members.len()) as i64)
            }
            WindowOp::Remove { members } => Reply::Int(
                members
                    .iter()
                    .filter(|member| self.members.remove(*member).is_some())
                    .count() as i64,
            ),
            WindowOp::RevRangeWithScores { start, stop } => {
                let mut ranked: Vec<Entry> = self
                    .members
                    .iter()
                    .map(|(member, score)| Entry {
                        member: member.clone(),
                        score: *score,
                    })
                    .collect();
                ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| b.member.cmp(&a.member)));

                Reply::Entries(
                    ranked
                        .into_iter()
                        .skip(*start)
                        .take((stop + 1).saturating_sub(*start))
                        .collect(),
                )
            }
        }
    }
}

/// A [`WindowStore`] kept in process memory.
///
/// Useful for tests and single-process deployments; state is not shared
/// across processes.
pub struct MemoryWindowStore {
    windows: DashMap<String, MemoryWindow>,
    clock: Arc<dyn Clock>,
}

impl MemoryWindowStore {
    /// Create an empty store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Number of entries stored under `key` (`ZCARD`).
    pub fn cardinality(&self, key: &str) -> usize {
        let now = self.clock.now_ms();
        self.windows
            .get(key)
            .filter(|window| !window.is_expired(now))
            .map(|window| window.members.len())
            .unwrap_or(0)
    }

    /// Remaining time to live of `key` in milliseconds (`PTTL`).
    ///
    /// `None` when the key does not exist or has no expiry.
    pub fn pttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_ms();
        let window = self.windows.get(key)?;
        if window.is_expired(now) {
            return None;
        }
        window.expires_at.map(|at| at - now)
    }

    /// Delete `key` and all of its entries (`DEL`).
    pub fn remove(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.windows
            .iter()
            .filter(|window| !window.is_expired(now))
            .count()
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWindowStore")
            .field("keys", &self.windows.len())
            .finish()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn execute(&self, key: &str, batch: &Batch) -> Result<Vec<Outcome>, StoreError> {
        let now = self.clock.now_ms();

        let mut window = self.windows.entry(key.to_string()).or_default();
        if window.is_expired(now) {
            *window = MemoryWindow::default();
        }

        let outcomes: Vec<Outcome> = batch
            .ops()
            .iter()
            .map(|op| Ok(window.apply(op, now)))
            .collect();

        let empty = window.members.is_empty();
        drop(window);

        if empty {
            self.windows.remove_if(key, |_, window| window.members.is_empty());
        }

        Ok(outcomes)
    }
}
