// ============================================================================
// Key-Value Store Contract
// ============================================================================
//
// The engine never talks to a concrete backend; it consumes this trait.
// Single-key operations are atomic on their own. Anything that reads and
// then conditionally writes more than one key goes through watch/commit.
//
// ============================================================================

pub mod command;
pub mod memory;
pub mod transaction;
pub mod zset;

pub use command::{Command, Reply};
pub use memory::InMemoryStore;
pub use transaction::{CommitOutcome, Transaction, TransactionId, WatchSet};
pub use zset::SortedSet;

use crate::core::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Member of an ordered set together with its score.
pub type ScoredMember = (String, f64);

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    // ---- strings and keys -------------------------------------------------
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Deletes every listed key, returning how many existed.
    async fn delete(&self, keys: &[&str]) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Fails with `EngineError::NoSuchKey` when `from` is absent.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // ---- hashes -----------------------------------------------------------
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<u64>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    // ---- ordered sets -----------------------------------------------------
    /// Returns `true` when the member is new.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64>;
    async fn zrem(&self, key: &str, members: &[&str]) -> Result<u64>;
    async fn zcard(&self, key: &str) -> Result<usize>;
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>>;
    /// Inclusive rank range, lowest score first; negative indices count from the end.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ScoredMember>>;
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>>;
    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<u64>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    /// Multiplies every score in the set by `factor`.
    async fn zscale(&self, key: &str, factor: f64) -> Result<()>;

    // ---- lists ------------------------------------------------------------
    async fn lpush(&self, key: &str, value: &str) -> Result<usize>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    // ---- optimistic transactions -----------------------------------------
    async fn watch(&self, keys: &[&str]) -> Result<WatchSet>;
    /// Applies `tx` atomically unless a key in `watch` changed since it was captured.
    async fn commit(&self, watch: WatchSet, tx: Transaction) -> Result<CommitOutcome>;
    async fn discard(&self, watch: WatchSet) -> Result<()> {
        drop(watch);
        Ok(())
    }
}
