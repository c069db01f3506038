//! In-process store with Redis list/set/sorted-set/hash semantics.
//!
//! All state sits behind one mutex, so every batch and every watched
//! transaction is trivially atomic and never conflicts. Intended for tests and
//! for running a queue inside a single process.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{BuildOps, Committed, Op, Read, Store};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    /// Kept sorted by (score, member), the same tie-break Redis uses.
    zsets: HashMap<String, Vec<(f64, String)>>,
}

impl State {
    fn apply(&mut self, op: Op) -> i64 {
        match op {
            Op::HSet { key, fields } => {
                let hash = self.hashes.entry(key).or_default();
                let mut added = 0;
                for (name, value) in fields {
                    if hash.insert(name, value).is_none() {
                        added += 1;
                    }
                }
                added
            }
            Op::HDel { key, fields } => {
                let Some(hash) = self.hashes.get_mut(&key) else {
                    return 0;
                };
                let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
                if hash.is_empty() {
                    self.hashes.remove(&key);
                }
                removed as i64
            }
            Op::Del { key } => {
                let existed = self.hashes.remove(&key).is_some()
                    | self.lists.remove(&key).is_some()
                    | self.sets.remove(&key).is_some()
                    | self.zsets.remove(&key).is_some();
                i64::from(existed)
            }
            Op::LPush { key, value } => {
                let list = self.lists.entry(key).or_default();
                list.push_front(value);
                list.len() as i64
            }
            Op::RPopLPush { src, dst } => {
                let Some(value) = self.lists.get_mut(&src).and_then(VecDeque::pop_back) else {
                    return 0;
                };
                self.drop_empty_list(&src);
                self.lists.entry(dst).or_default().push_front(value);
                1
            }
            Op::LRem { key, count, value } => {
                let Some(list) = self.lists.get_mut(&key) else {
                    return 0;
                };
                let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
                let mut removed = 0;
                if count >= 0 {
                    while removed < limit {
                        match list.iter().position(|v| *v == value) {
                            Some(idx) => {
                                list.remove(idx);
                                removed += 1;
                            }
                            None => break,
                        }
                    }
                } else {
                    while removed < limit {
                        match list.iter().rposition(|v| *v == value) {
                            Some(idx) => {
                                list.remove(idx);
                                removed += 1;
                            }
                            None => break,
                        }
                    }
                }
                self.drop_empty_list(&key);
                removed as i64
            }
            Op::SAdd { key, member } => i64::from(self.sets.entry(key).or_default().insert(member)),
            Op::SRem { key, member } => {
                let Some(set) = self.sets.get_mut(&key) else {
                    return 0;
                };
                let removed = set.remove(&member);
                if set.is_empty() {
                    self.sets.remove(&key);
                }
                i64::from(removed)
            }
            Op::ZAdd { key, member, score } => {
                let zset = self.zsets.entry(key).or_default();
                let existed = remove_member(zset, &member).is_some();
                insert_sorted(zset, score, member);
                i64::from(!existed)
            }
            Op::ZRemRangeByScore { key, min, max } => {
                let Some(zset) = self.zsets.get_mut(&key) else {
                    return 0;
                };
                let before = zset.len();
                zset.retain(|(score, _)| *score < min || *score > max);
                let removed = before - zset.len();
                if zset.is_empty() {
                    self.zsets.remove(&key);
                }
                removed as i64
            }
            Op::ZIncrBy { key, member, delta } => {
                let zset = self.zsets.entry(key).or_default();
                let score = remove_member(zset, &member).unwrap_or(0.0) + delta;
                insert_sorted(zset, score, member);
                score as i64
            }
        }
    }

    fn read(&self, read: &Read) -> Vec<String> {
        match read {
            Read::LRange { key, start, stop } => {
                let Some(list) = self.lists.get(key) else {
                    return Vec::new();
                };
                let len = list.len() as i64;
                let start = if *start < 0 { (len + start).max(0) } else { *start };
                let stop = if *stop < 0 { len + stop } else { (*stop).min(len - 1) };
                if start > stop || start >= len {
                    return Vec::new();
                }
                list.iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect()
            }
            Read::SMembers { key } => self
                .sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
            Read::SIsMember { key, member } => self
                .sets
                .get(key)
                .filter(|s| s.contains(member))
                .map(|_| vec![member.clone()])
                .unwrap_or_default(),
            Read::ZRangeByScore { key, min, max } => self
                .zsets
                .get(key)
                .map(|z| {
                    z.iter()
                        .filter(|(score, _)| score >= min && score <= max)
                        .map(|(_, member)| member.clone())
                        .collect()
                })
                .unwrap_or_default(),
            Read::HGet { key, field } => self
                .hashes
                .get(key)
                .and_then(|h| h.get(field))
                .map(|v| vec![v.clone()])
                .unwrap_or_default(),
            Read::HMGet { key, fields } => self
                .hashes
                .get(key)
                .map(|h| {
                    fields
                        .iter()
                        .map(|f| h.get(f).cloned().unwrap_or_default())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn drop_empty_list(&mut self, key: &str) {
        if self.lists.get(key).is_some_and(VecDeque::is_empty) {
            self.lists.remove(key);
        }
    }
}

fn remove_member(zset: &mut Vec<(f64, String)>, member: &str) -> Option<f64> {
    let idx = zset.iter().position(|(_, m)| m == member)?;
    Some(zset.remove(idx).0)
}

fn insert_sorted(zset: &mut Vec<(f64, String)>, score: f64, member: String) {
    let idx = zset.partition_point(|(s, m)| (*s, m.as_str()) < (score, member.as_str()));
    zset.insert(idx, (score, member));
}

/// Mutex-backed [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exec(&self, ops: Vec<Op>) -> Result<Vec<i64>, StoreError> {
        let mut state = self.lock();
        Ok(ops.into_iter().map(|op| state.apply(op)).collect())
    }

    async fn watch_exec(
        &self,
        _watch: &[String],
        read: &Read,
        build: &BuildOps<'_>,
    ) -> Result<Committed, StoreError> {
        let mut state = self.lock();
        let observed = state.read(read);
        let replies = build(&observed)
            .into_iter()
            .map(|op| state.apply(op))
            .collect();
        Ok(Committed { observed, replies })
    }

    async fn read(&self, read: &Read) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().read(read))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        Ok(self
            .lock()
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(s, m)| (m.clone(), *s)).collect())
            .unwrap_or_default())
    }
}
