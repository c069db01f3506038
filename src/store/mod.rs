//! Coordination store abstraction.
//!
//! The queue engine never talks to Redis directly. It describes its writes as
//! a list of [`Op`]s and hands them to a [`Store`], which applies them as one
//! atomic unit. Operations that depend on current state use
//! [`Store::watch_exec`]: the store watches some keys, performs a [`Read`],
//! lets the caller build the mutation from what it saw, and commits only if
//! nothing watched changed in between, retrying otherwise.
//!
//! # Implementations
//!
//! - [`RedisStore`]: `MULTI`/`EXEC` pipelines and `WATCH` on a dedicated connection
//! - [`MemoryStore`]: a single mutex, for tests and single-process embedding

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Set hash fields.
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Remove hash fields.
    HDel { key: String, fields: Vec<String> },
    /// Delete a key of any type.
    Del { key: String },
    /// Push onto the head of a list.
    LPush { key: String, value: String },
    /// Pop the tail of `src` and push it onto the head of `dst`.
    RPopLPush { src: String, dst: String },
    /// Remove up to `count` occurrences of `value` from a list.
    LRem {
        key: String,
        count: i64,
        value: String,
    },
    SAdd { key: String, member: String },
    /// Remove a set member. Replies with the number actually removed.
    SRem { key: String, member: String },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Remove every sorted-set member with `min <= score <= max`.
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
}

/// A read performed under watch, or on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum Read {
    /// List elements from `start` to `stop` inclusive; negative indexes count
    /// from the tail.
    LRange { key: String, start: i64, stop: i64 },
    SMembers { key: String },
    /// Yields `[member]` when present, nothing otherwise.
    SIsMember { key: String, member: String },
    /// Members with `min <= score <= max`, lowest score first.
    ZRangeByScore { key: String, min: f64, max: f64 },
    /// Yields the field value, or nothing when absent.
    HGet { key: String, field: String },
    /// Yields one value per field, empty for absent fields. Yields nothing
    /// when the hash itself is absent.
    HMGet { key: String, fields: Vec<String> },
}

/// Outcome of a committed [`Store::watch_exec`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Committed {
    /// What the read returned on the attempt that committed.
    pub observed: Vec<String>,
    /// One integer reply per op, in order. Empty when the builder chose not
    /// to write anything.
    pub replies: Vec<i64>,
}

/// Builds the writes for a watched transaction from what the read observed.
/// Returning an empty list commits nothing.
pub type BuildOps<'a> = dyn Fn(&[String]) -> Vec<Op> + Send + Sync + 'a;

/// A key/value store with lists, sets, sorted sets, and hashes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Applies `ops` atomically. Returns one integer reply per op: counts for
    /// counting commands, 1/0 for `RPopLPush` depending on whether anything
    /// moved.
    async fn exec(&self, ops: Vec<Op>) -> Result<Vec<i64>, StoreError>;

    /// Optimistic transaction: watch `watch`, perform `read`, build writes
    /// with `build`, commit unless a watched key changed, and retry on
    /// conflict.
    async fn watch_exec(
        &self,
        watch: &[String],
        read: &Read,
        build: &BuildOps<'_>,
    ) -> Result<Committed, StoreError>;

    /// Performs a single read outside any transaction.
    async fn read(&self, read: &Read) -> Result<Vec<String>, StoreError>;

    /// Returns every field of a hash; empty when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Returns every member of a sorted set with its score, lowest first.
    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;
}
