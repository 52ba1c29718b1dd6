// ============================================================================
// Hourly Windowed Aggregation
// ============================================================================
//
// Per (subject, severity) three keys make up a window:
//
//   common:<subject>:<severity>          ordered set message -> frequency
//   common:<subject>:<severity>:start    hour the window began (unix seconds)
//   ...:last / ...:pstart                the archived previous window
//
// The first increment of a new hour renames the current pair into the
// archive slot and restarts the marker. That check-then-write spans several
// keys, so it runs inside a watch on the marker and is retried on conflict.
//
// ============================================================================

use crate::config::KeyLayout;
use crate::core::{Clock, EngineError, Result, hour_start};
use crate::retry::{Attempt, RetryPolicy, retry_on_conflict};
use crate::store::{CommitOutcome, KeyValueStore, ScoredMember, Transaction, WatchSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown severity '{0}'")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|severity| severity.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSeverity(s.to_string()))
    }
}

impl From<tracing::Level> for Severity {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::WARN => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// A window's start marker and its message frequencies, most frequent first.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationWindow {
    pub window_start: DateTime<Utc>,
    pub counts: Vec<ScoredMember>,
}

impl AggregationWindow {
    pub fn count(&self, message: &str) -> f64 {
        self.counts
            .iter()
            .find(|(member, _)| member == message)
            .map_or(0.0, |(_, score)| *score)
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().map(|(_, score)| score).sum()
    }
}

/// Diagnostics of a successful increment.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementReport {
    pub rolled_over: bool,
    pub attempts: usize,
    pub elapsed: Duration,
}

struct WindowKeys {
    counts: String,
    start: String,
    last: String,
    pstart: String,
}

impl WindowKeys {
    fn new(keys: &KeyLayout, subject: &str, severity: Severity) -> Self {
        let counts = keys.counts_key(subject, severity.as_str());
        Self {
            start: format!("{counts}:start"),
            last: format!("{counts}:last"),
            pstart: format!("{counts}:pstart"),
            counts,
        }
    }
}

pub struct WindowedAggregator {
    store: Arc<dyn KeyValueStore>,
    keys: KeyLayout,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    recent_log_limit: usize,
}

impl WindowedAggregator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: KeyLayout,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        recent_log_limit: usize,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            retry,
            recent_log_limit,
        }
    }

    /// `increment` with the configured retry deadline.
    pub async fn increment_counter(
        &self,
        subject: &str,
        severity: Severity,
        message: &str,
    ) -> Result<IncrementReport> {
        self.increment(subject, severity, message, self.retry.deadline())
            .await
    }

    /// Counts one occurrence of `message`, rolling the window over first if
    /// the hour has changed since it started.
    ///
    /// Fails with `EngineError::Contention` when concurrent incrementers keep
    /// invalidating the watch for longer than `timeout`.
    pub async fn increment(
        &self,
        subject: &str,
        severity: Severity,
        message: &str,
        timeout: Duration,
    ) -> Result<IncrementReport> {
        let window = WindowKeys::new(&self.keys, subject, severity);
        let policy = self.retry.clone().with_deadline(timeout);
        let window = &window;

        let outcome = retry_on_conflict(&policy, &window.counts, |_| async move {
            let now = self.clock.now();
            let current_start = hour_start(now).timestamp();

            let watch = self.store.watch(&[window.start.as_str()]).await?;
            let marker = match self.store.get(&window.start).await? {
                Some(raw) => Some(parse_marker(&window.start, &raw)?),
                None => None,
            };

            let mut tx = Transaction::new();
            let rolled_over = match marker {
                Some(started) if started < current_start => {
                    tx.rename(&window.counts, &window.last)
                        .rename(&window.start, &window.pstart)
                        .set(&window.start, current_start.to_string());
                    true
                }
                Some(_) => false,
                None => {
                    tx.set(&window.start, current_start.to_string());
                    false
                }
            };
            tx.zincrby(&window.counts, message, 1.0);
            self.stage_recent(&mut tx, subject, severity, message, now);

            let attempt = match self.store.commit(watch, tx).await? {
                CommitOutcome::Committed(_) => Attempt::Done(rolled_over),
                CommitOutcome::Aborted { .. } => Attempt::Conflict,
            };
            Ok::<_, EngineError>(attempt)
        })
        .await?;

        if outcome.value {
            event!(
                Level::INFO,
                subject,
                severity = %severity,
                attempts = outcome.attempts,
                "aggregation window rolled over"
            );
        }

        Ok(IncrementReport {
            rolled_over: outcome.value,
            attempts: outcome.attempts,
            elapsed: outcome.elapsed,
        })
    }

    /// Appends `message` to the bounded recent log of (subject, severity).
    pub async fn log_recent(&self, subject: &str, severity: Severity, message: &str) -> Result<()> {
        let mut tx = Transaction::new();
        self.stage_recent(&mut tx, subject, severity, message, self.clock.now());
        if !tx.is_empty() {
            self.store.commit(WatchSet::empty(), tx).await?;
        }
        Ok(())
    }

    /// Recent messages, newest first.
    pub async fn recent_messages(&self, subject: &str, severity: Severity) -> Result<Vec<String>> {
        let key = self.keys.recent_log_key(subject, severity.as_str());
        self.store.lrange(&key, 0, -1).await
    }

    pub async fn current_window(
        &self,
        subject: &str,
        severity: Severity,
    ) -> Result<Option<AggregationWindow>> {
        let window = WindowKeys::new(&self.keys, subject, severity);
        self.read_window(&window.start, &window.counts).await
    }

    pub async fn archived_window(
        &self,
        subject: &str,
        severity: Severity,
    ) -> Result<Option<AggregationWindow>> {
        let window = WindowKeys::new(&self.keys, subject, severity);
        self.read_window(&window.pstart, &window.last).await
    }

    /// Reads marker and counts under a watch so both come from one window.
    async fn read_window(
        &self,
        marker_key: &str,
        counts_key: &str,
    ) -> Result<Option<AggregationWindow>> {
        let outcome = retry_on_conflict(&self.retry, counts_key, |_| async move {
            let watch = self.store.watch(&[marker_key]).await?;
            let marker = self.store.get(marker_key).await?;
            let counts = self.store.zrange(counts_key, 0, -1).await?;
            let attempt = match self.store.commit(watch, Transaction::new()).await? {
                CommitOutcome::Committed(_) => Attempt::Done((marker, counts)),
                CommitOutcome::Aborted { .. } => Attempt::Conflict,
            };
            Ok::<_, EngineError>(attempt)
        })
        .await?;

        let (marker, mut counts) = outcome.value;
        let Some(raw) = marker else {
            return Ok(None);
        };
        let started = parse_marker(marker_key, &raw)?;
        counts.reverse();
        Ok(Some(AggregationWindow {
            window_start: DateTime::from_timestamp(started, 0).unwrap_or_default(),
            counts,
        }))
    }

    fn stage_recent(
        &self,
        tx: &mut Transaction,
        subject: &str,
        severity: Severity,
        message: &str,
        at: DateTime<Utc>,
    ) {
        if self.recent_log_limit == 0 {
            return;
        }
        let key = self.keys.recent_log_key(subject, severity.as_str());
        let stop = self.recent_log_limit as isize - 1;
        tx.lpush(&key, format!("{} {}", at.to_rfc3339(), message))
            .ltrim(&key, 0, stop);
    }
}

fn parse_marker(key: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>().map_err(|err| {
        EngineError::Serialization(format!("window marker '{key}' holds '{raw}': {err}"))
    })
}
