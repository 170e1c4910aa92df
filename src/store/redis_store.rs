//! Redis-backed window store.
//!
//! Every batch is sent as a single `MULTI`/`EXEC` pipeline, so no other client's
//! commands interleave with it. Redis keeps running the remaining commands of a
//! transaction when one of them fails, which matches the [`WindowStore`] contract.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, Value};
use tracing::debug;

use super::{Batch, Entry, Outcome, Reply, WindowOp, WindowStore};
use crate::error::StoreError;

/// A [`WindowStore`] over Redis sorted sets.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore").finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self { connection_manager }
    }

    /// Open a connection manager for `url` and check it with a `PING`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection_manager = ConnectionManager::new(client).await?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!(url = %url, "Connected to Redis window store");

        Ok(Self::new(connection_manager))
    }

    /// Translate one operation into its Redis command.
    fn command(key: &str, op: &WindowOp) -> Cmd {
        match op {
            WindowOp::Add { score, members } => {
                let mut cmd = redis::cmd("ZADD");
                cmd.arg(key);
                for member in members {
                    cmd.arg(*score).arg(member);
                }
                cmd
            }
            WindowOp::Expire { ttl_ms } => {
                let mut cmd = redis::cmd("PEXPIRE");
                cmd.arg(key).arg(*ttl_ms);
                cmd
            }
            WindowOp::Count { min, max } => {
                let mut cmd = redis::cmd("ZCOUNT");
                cmd.arg(key).arg(*min).arg(*max);
                cmd
            }
            WindowOp::RemoveBelow { bound } => {
                let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
                cmd.arg(key).arg("-inf").arg(format!("({}", bound));
                cmd
            }
            WindowOp::Remove { members } => {
                let mut cmd = redis::cmd("ZREM");
                cmd.arg(key).arg(members);
                cmd
            }
            WindowOp::RevRangeWithScores { start, stop } => {
                let mut cmd = redis::cmd("ZREVRANGE");
                cmd.arg(key).arg(*start).arg(*stop).arg("WITHSCORES");
                cmd
            }
        }
    }

    /// Decode one transaction reply according to the operation that produced it.
    fn decode(op: &WindowOp, value: &Value) -> Outcome {
        match op {
            WindowOp::RevRangeWithScores { .. } => {
                let pairs: Vec<(String, f64)> = redis::from_redis_value(value)?;
                Ok(Reply::Entries(
                    pairs
                        .into_iter()
                        .map(|(member, score)| Entry {
                            member,
                            score: score as i64,
                        })
                        .collect(),
                ))
            }
            _ => Ok(Reply::Int(redis::from_redis_value(value)?)),
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn execute(&self, key: &str, batch: &Batch) -> Result<Vec<Outcome>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            pipe.add_command(Self::command(key, op));
        }

        let mut conn = self.connection_manager.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;

        if values.len() != batch.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                batch.len(),
                values.len()
            )));
        }

        Ok(batch
            .ops()
            .iter()
            .zip(values.iter())
            .map(|(op, value)| Self::decode(op, value))
            .collect())
    }
}
