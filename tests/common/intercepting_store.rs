//! Store wrapper that lets a test step in between a caller's reads and its
//! commit.
//!
//! Every call is forwarded to an `InMemoryStore`. Two hooks change that:
//! watched commits can be made to always lose, and a one-shot transaction
//! can be slipped in right after a range read of a given key, the way a
//! concurrent writer would.

#![allow(dead_code)]

use async_trait::async_trait;
use kvrefresh::store::ScoredMember;
use kvrefresh::{CommitOutcome, InMemoryStore, KeyValueStore, Result, Transaction, WatchSet};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct InterceptingStore {
    inner: InMemoryStore,
    conflict_watched: bool,
    after_zrange: Mutex<Option<(String, Transaction)>>,
    aborted: AtomicUsize,
}

impl InterceptingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every commit with a non-empty watch set aborts.
    pub fn always_conflicting() -> Self {
        Self {
            conflict_watched: true,
            ..Self::default()
        }
    }

    /// Applies `tx` once, right after the next `zrange` on `key` returns.
    pub fn after_zrange(&self, key: &str, tx: Transaction) {
        *self.after_zrange.lock().unwrap() = Some((key.to_string(), tx));
    }

    /// Commits that came back `Aborted`.
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for InterceptingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value).await
    }
    async fn delete(&self, keys: &[&str]) -> Result<u64> {
        self.inner.delete(keys).await
    }
    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to).await
    }
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.inner.hash_get(key, field).await
    }
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.inner.hash_set(key, field, value).await
    }
    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<u64> {
        self.inner.hash_delete(key, fields).await
    }
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.inner.hash_get_all(key).await
    }
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.inner.zadd(key, member, score).await
    }
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.inner.zscore(key, member).await
    }
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        self.inner.zincrby(key, member, delta).await
    }
    async fn zrem(&self, key: &str, members: &[&str]) -> Result<u64> {
        self.inner.zrem(key, members).await
    }
    async fn zcard(&self, key: &str) -> Result<usize> {
        self.inner.zcard(key).await
    }
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>> {
        self.inner.zrank(key, member).await
    }
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ScoredMember>> {
        let range = self.inner.zrange(key, start, stop).await?;
        let injected = {
            let mut slot = self.after_zrange.lock().unwrap();
            match slot.as_ref() {
                Some((target, _)) if target == key => slot.take().map(|(_, tx)| tx),
                _ => None,
            }
        };
        if let Some(tx) = injected {
            self.inner.commit(WatchSet::empty(), tx).await?;
        }
        Ok(range)
    }
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        self.inner.zrange_by_score(key, min, max, limit).await
    }
    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<u64> {
        self.inner.zrem_range_by_rank(key, start, stop).await
    }
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        self.inner.zrem_range_by_score(key, min, max).await
    }
    async fn zscale(&self, key: &str, factor: f64) -> Result<()> {
        self.inner.zscale(key, factor).await
    }
    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        self.inner.lpush(key, value).await
    }
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.inner.ltrim(key, start, stop).await
    }
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.inner.lrange(key, start, stop).await
    }
    async fn watch(&self, keys: &[&str]) -> Result<WatchSet> {
        self.inner.watch(keys).await
    }
    async fn commit(&self, watch: WatchSet, tx: Transaction) -> Result<CommitOutcome> {
        let outcome = match watch.versions().first() {
            Some((key, _)) if self.conflict_watched => CommitOutcome::Aborted { key: key.clone() },
            _ => self.inner.commit(watch, tx).await?,
        };
        if !outcome.is_committed() {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}
