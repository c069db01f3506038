//! Redis-backed store.
//!
//! Batches go through a [`ConnectionManager`] as `MULTI`/`EXEC` pipelines.
//! `WATCH` is connection state, so watched transactions run on a separate
//! dedicated connection that is never shared with the multiplexed manager.

use std::collections::HashMap;

use ::redis::aio::{Connection, ConnectionManager};
use ::redis::{AsyncCommands, Pipeline, Value};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{BuildOps, Committed, Op, Read, Store};
use crate::error::StoreError;

/// [`Store`] over a Redis server.
pub struct RedisStore {
    client: ::redis::Client,
    /// Multiplexed connection, reconnects automatically.
    redis: ConnectionManager,
    /// Dedicated connection for WATCH transactions, opened lazily and dropped
    /// after any error so the next call starts clean.
    watch_conn: Mutex<Option<Connection>>,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            watch_conn: Mutex::new(None),
        })
    }

    async fn run_watched(
        &self,
        conn: &mut Connection,
        watch: &[String],
        read: &Read,
        build: &BuildOps<'_>,
    ) -> Result<Committed, StoreError> {
        loop {
            ::redis::cmd("WATCH")
                .arg(watch)
                .query_async::<_, ()>(conn)
                .await?;

            let observed = read_with(conn, read).await?;
            let ops = build(&observed);

            if ops.is_empty() {
                ::redis::cmd("UNWATCH").query_async::<_, ()>(conn).await?;
                return Ok(Committed {
                    observed,
                    replies: Vec::new(),
                });
            }

            let mut pipe = ::redis::pipe();
            pipe.atomic();
            for op in &ops {
                append_op(&mut pipe, op);
            }

            // EXEC replies nil when a watched key changed after WATCH.
            let replies: Option<Vec<Value>> = pipe.query_async(conn).await?;
            match replies {
                Some(values) => {
                    return Ok(Committed {
                        observed,
                        replies: values.iter().map(reply_to_int).collect(),
                    });
                }
                None => {
                    debug!(keys = ?watch, "Watched keys changed, retrying transaction");
                }
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn exec(&self, ops: Vec<Op>) -> Result<Vec<i64>, StoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in &ops {
            append_op(&mut pipe, op);
        }

        let mut conn = self.redis.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        Ok(values.iter().map(reply_to_int).collect())
    }

    async fn watch_exec(
        &self,
        watch: &[String],
        read: &Read,
        build: &BuildOps<'_>,
    ) -> Result<Committed, StoreError> {
        let mut slot = self.watch_conn.lock().await;

        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self
                .client
                .get_async_connection()
                .await
                .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?,
        };

        let outcome = self.run_watched(&mut conn, watch, read, build).await;
        if outcome.is_ok() {
            *slot = Some(conn);
        }
        outcome
    }

    async fn read(&self, read: &Read) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        read_with(&mut conn, read).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.zrange_withscores(key, 0, -1).await?)
    }
}

async fn read_with<C>(conn: &mut C, read: &Read) -> Result<Vec<String>, StoreError>
where
    C: ::redis::aio::ConnectionLike + Send,
{
    let values: Vec<String> = match read {
        Read::LRange { key, start, stop } => {
            conn.lrange(key, *start as isize, *stop as isize).await?
        }
        Read::SMembers { key } => conn.smembers(key).await?,
        Read::SIsMember { key, member } => {
            let present: bool = conn.sismember(key, member).await?;
            if present {
                vec![member.clone()]
            } else {
                Vec::new()
            }
        }
        Read::ZRangeByScore { key, min, max } => {
            conn.zrangebyscore(key, score_arg(*min), score_arg(*max))
                .await?
        }
        Read::HGet { key, field } => {
            let value: Option<String> = conn.hget(key, field).await?;
            value.into_iter().collect()
        }
        Read::HMGet { key, fields } => {
            let values: Vec<Option<String>> = ::redis::cmd("HMGET")
                .arg(key)
                .arg(fields.as_slice())
                .query_async(conn)
                .await?;
            if values.iter().all(Option::is_none) {
                Vec::new()
            } else {
                values.into_iter().map(Option::unwrap_or_default).collect()
            }
        }
    };
    Ok(values)
}

fn append_op(pipe: &mut Pipeline, op: &Op) {
    match op {
        Op::HSet { key, fields } => {
            pipe.hset_multiple(key, fields.as_slice());
        }
        Op::HDel { key, fields } => {
            pipe.hdel(key, fields);
        }
        Op::Del { key } => {
            pipe.del(key);
        }
        Op::LPush { key, value } => {
            pipe.lpush(key, value);
        }
        Op::RPopLPush { src, dst } => {
            pipe.rpoplpush(src, dst);
        }
        Op::LRem { key, count, value } => {
            pipe.lrem(key, *count as isize, value);
        }
        Op::SAdd { key, member } => {
            pipe.sadd(key, member);
        }
        Op::SRem { key, member } => {
            pipe.srem(key, member);
        }
        Op::ZAdd { key, member, score } => {
            pipe.zadd(key, member, *score);
        }
        Op::ZRemRangeByScore { key, min, max } => {
            pipe.zrembyscore(key, score_arg(*min), score_arg(*max));
        }
        Op::ZIncrBy { key, member, delta } => {
            pipe.zincr(key, member, *delta);
        }
    }
}

/// Redis spells unbounded scores as `-inf` / `+inf`.
fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

fn reply_to_int(value: &Value) -> i64 {
    match value {
        Value::Int(n) => *n,
        Value::Nil => 0,
        Value::Data(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|f| f as i64)
            .unwrap_or(1),
        Value::Bulk(items) => items.len() as i64,
        Value::Status(_) | Value::Okay => 1,
    }
}
