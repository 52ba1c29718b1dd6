use crate::core::{EngineError, Result};
use crate::retry::{Attempt, RetryPolicy, retry_on_conflict};
use crate::store::{CommitOutcome, KeyValueStore, Reply, Transaction, WatchSet};
use crate::worker::ShutdownSignal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// Which per-entity key namespaces are deleted along with an evicted entry.
///
/// An entry `abc` with prefixes `["viewed:", "cart:"]` owns `viewed:abc`
/// and `cart:abc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadePolicy {
    pub dependent_prefixes: Vec<String>,
}

impl CascadePolicy {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependent_prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Cascade nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn dependent_keys(&self, entry: &str) -> Vec<String> {
        self.dependent_prefixes
            .iter()
            .map(|prefix| format!("{prefix}{entry}"))
            .collect()
    }
}

/// A capped ordered set and what to clean up when entries leave it.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionTarget {
    pub set_key: String,
    pub limit: usize,
    pub batch_size: usize,
    pub cascade: CascadePolicy,
    /// Hash whose fields are the set's members (e.g. token -> user)
    pub lookup_hash: Option<String>,
}

impl EvictionTarget {
    pub fn new(set_key: impl Into<String>, limit: usize) -> Self {
        Self {
            set_key: set_key.into(),
            limit,
            batch_size: 100,
            cascade: CascadePolicy::none(),
            lookup_hash: None,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn lookup_hash(mut self, key: impl Into<String>) -> Self {
        self.lookup_hash = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    /// Keys removed by the cascade
    pub dependents_deleted: u64,
    pub cardinality_before: usize,
    /// Optimistic attempts the batch took
    pub attempts: usize,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }
}

/// Trim-below-rank then scale, for counters that should fade over time.
#[derive(Debug, Clone, PartialEq)]
pub struct DecayPolicy {
    pub key: String,
    /// Highest-scored members that survive the trim
    pub keep_top: usize,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecayReport {
    pub trimmed: u64,
}

/// Keeps ordered sets under a hard size cap, lowest scores out first.
///
/// Each call removes at most one batch so writers of the same set are never
/// stalled behind one large sweep; callers re-poll to converge.
pub struct BoundedSetEvictor {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
}

impl BoundedSetEvictor {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Set how long a contended batch keeps re-selecting its entries
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn enforce_limit(&self, target: &EvictionTarget) -> Result<EvictionReport> {
        self.enforce_limit_with(
            &target.set_key,
            target.limit,
            target.batch_size,
            target.lookup_hash.as_deref(),
            |entry| target.cascade.dependent_keys(entry),
        )
        .await
    }

    /// Evicts up to `batch_size` lowest-scored entries above `limit`.
    ///
    /// For every evicted entry the keys produced by `dependent_keys` are
    /// deleted, then the entry leaves `lookup_hash` and the set, all in one
    /// atomic pipeline. The set is watched from the cardinality read to the
    /// commit; an entry re-scored in between aborts the batch, which is
    /// re-selected under the evictor's retry policy.
    pub async fn enforce_limit_with<F>(
        &self,
        set_key: &str,
        limit: usize,
        batch_size: usize,
        lookup_hash: Option<&str>,
        dependent_keys: F,
    ) -> Result<EvictionReport>
    where
        F: Fn(&str) -> Vec<String> + Send + Sync,
    {
        let dependent_keys = &dependent_keys;
        let outcome = retry_on_conflict(&self.retry, set_key, |_| async move {
            let watch = self.store.watch(&[set_key]).await?;
            let cardinality = self.store.zcard(set_key).await?;
            if cardinality <= limit {
                self.store.discard(watch).await?;
                return Ok::<_, EngineError>(Attempt::Done(EvictionReport {
                    cardinality_before: cardinality,
                    ..EvictionReport::default()
                }));
            }

            let overflow = (cardinality - limit).min(batch_size.max(1));
            let evicted: Vec<String> = self
                .store
                .zrange(set_key, 0, overflow as isize - 1)
                .await?
                .into_iter()
                .map(|(member, _)| member)
                .collect();

            let dependents: Vec<String> = evicted
                .iter()
                .flat_map(|entry| dependent_keys(entry.as_str()))
                .collect();

            let mut tx = Transaction::new();
            if !dependents.is_empty() {
                tx.delete(&dependents);
            }
            if let Some(hash) = lookup_hash {
                tx.hash_delete(hash, &evicted);
            }
            tx.zrem(set_key, &evicted);

            let replies = match self.store.commit(watch, tx).await? {
                CommitOutcome::Committed(replies) => replies,
                CommitOutcome::Aborted { .. } => return Ok(Attempt::Conflict),
            };
            let dependents_deleted = match replies.first() {
                Some(Reply::Integer(n)) if !dependents.is_empty() => *n as u64,
                _ => 0,
            };
            Ok(Attempt::Done(EvictionReport {
                evicted,
                dependents_deleted,
                cardinality_before: cardinality,
                attempts: 0,
            }))
        })
        .await?;

        let report = EvictionReport {
            attempts: outcome.attempts,
            ..outcome.value
        };
        if !report.is_empty() {
            event!(
                Level::INFO,
                set_key,
                evicted = report.evicted.len(),
                dependents_deleted = report.dependents_deleted,
                attempts = report.attempts,
                "bounded set trimmed"
            );
        }
        Ok(report)
    }

    /// Repeats `enforce_limit` until the set is within its limit.
    pub async fn drain_to_limit(&self, target: &EvictionTarget) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        loop {
            let report = self.enforce_limit(target).await?;
            if report.is_empty() {
                return Ok(evicted);
            }
            evicted.extend(report.evicted);
        }
    }

    /// Drops everything below the top `keep_top` and scales what is left.
    pub async fn decay(&self, policy: &DecayPolicy) -> Result<DecayReport> {
        let mut tx = Transaction::new();
        tx.zrem_range_by_rank(&policy.key, 0, -(policy.keep_top as isize) - 1)
            .zscale(&policy.key, policy.factor);

        let trimmed = match self.store.commit(WatchSet::empty(), tx).await? {
            CommitOutcome::Committed(replies) => match replies.first() {
                Some(Reply::Integer(n)) => *n as u64,
                _ => 0,
            },
            CommitOutcome::Aborted { key } => {
                return Err(EngineError::Store(format!("unwatched pipeline aborted on '{key}'")));
            }
        };
        event!(Level::DEBUG, key = %policy.key, trimmed, "popularity decayed");
        Ok(DecayReport { trimmed })
    }

    /// Checks every target each cycle; sleeps `idle` only when nothing was evicted.
    pub async fn run_capacity_loop(
        self: Arc<Self>,
        targets: Vec<EvictionTarget>,
        idle: Duration,
        mut shutdown: ShutdownSignal,
    ) {
        let span = info_span!("capacity_evictor", targets = targets.len());
        async move {
            while !shutdown.is_triggered() {
                let mut evicted_any = false;
                for target in &targets {
                    match self.enforce_limit(target).await {
                        Ok(report) => evicted_any |= !report.is_empty(),
                        Err(err) => {
                            event!(Level::WARN, set_key = %target.set_key, error = %err, "eviction cycle failed");
                        }
                    }
                }
                if !evicted_any && shutdown.sleep(idle).await {
                    break;
                }
            }
            event!(Level::INFO, "capacity evictor stopped");
        }
        .instrument(span)
        .await
    }

    /// Decays `policy.key` once per `period` until shutdown.
    pub async fn run_decay_loop(
        self: Arc<Self>,
        policy: DecayPolicy,
        period: Duration,
        mut shutdown: ShutdownSignal,
    ) {
        let span = info_span!("decay", key = %policy.key);
        async move {
            while !shutdown.is_triggered() {
                if let Err(err) = self.decay(&policy).await {
                    event!(Level::WARN, error = %err, "decay cycle failed");
                }
                if shutdown.sleep(period).await {
                    break;
                }
            }
            event!(Level::INFO, "decay loop stopped");
        }
        .instrument(span)
        .await
    }
}
