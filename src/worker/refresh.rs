use super::ShutdownSignal;
use crate::config::{KeyLayout, PollConfig};
use crate::core::{Clock, EngineError, Result};
use crate::retry::{Attempt, RetryPolicy, retry_on_conflict};
use crate::scheduler::PriorityScheduler;
use crate::store::{CommitOutcome, KeyValueStore, Transaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Produces the payload cached for a task.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, task_id: &str) -> anyhow::Result<JsonValue>;
}

/// Snapshot stored under the task's payload key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPayload {
    pub task_id: String,
    pub cached_at: DateTime<Utc>,
    pub data: JsonValue,
}

/// What one poll cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Nothing due yet.
    Idle,
    Refreshed { task_id: String, next_run_at: f64 },
    /// The task's interval was non-positive; it is gone for good.
    Evicted { task_id: String },
}

/// Pops due tasks, regenerates their payloads and puts them back in line.
///
/// The payload and the next due time are written in one transaction that
/// watches the interval set. A cancel landing while the data source is
/// still fetching aborts that write, and the retry evicts the task instead.
pub struct CacheRefreshWorker {
    id: Uuid,
    store: Arc<dyn KeyValueStore>,
    scheduler: Arc<PriorityScheduler>,
    source: Arc<dyn DataSource>,
    keys: KeyLayout,
    poll: PollConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl CacheRefreshWorker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        scheduler: Arc<PriorityScheduler>,
        source: Arc<dyn DataSource>,
        keys: KeyLayout,
        poll: PollConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            scheduler,
            source,
            keys,
            poll,
            retry,
            clock,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Runs one Idle -> CheckDue -> {Idle | Refresh} step.
    ///
    /// Due tasks are tried earliest first until one is refreshed or evicted.
    /// A task whose data source fails keeps its due time and the cycle moves
    /// on to the next one; only when every due task failed is the first
    /// failure returned as `EngineError::DataSource`.
    pub async fn poll_once(&self) -> Result<RefreshOutcome> {
        let now = self.clock.now();
        let due = self.scheduler.due(now, self.poll.due_scan).await?;

        let mut first_failure = None;
        for task in due {
            match self.refresh(&task.task_id, now).await {
                Ok(RefreshOutcome::Idle) => continue,
                Ok(outcome) => return Ok(outcome),
                Err(err @ EngineError::DataSource { .. }) => {
                    event!(Level::DEBUG, task_id = %task.task_id, error = %err, "fetch failed, trying next due task");
                    first_failure.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(RefreshOutcome::Idle),
        }
    }

    async fn refresh(&self, task_id: &str, now: DateTime<Utc>) -> Result<RefreshOutcome> {
        let interval = self.scheduler.interval(task_id).await?.unwrap_or(0.0);
        if interval <= 0.0 {
            return self.commit_refresh(task_id, now, None).await;
        }

        let data = self
            .source
            .fetch(task_id)
            .await
            .map_err(|err| EngineError::DataSource {
                task_id: task_id.to_string(),
                message: format!("{err:#}"),
            })?;
        self.commit_refresh(task_id, now, Some(data)).await
    }

    /// Writes the payload and next due time, or evicts, against the interval
    /// read under the same watch.
    async fn commit_refresh(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
        data: Option<JsonValue>,
    ) -> Result<RefreshOutcome> {
        let payload_key = self.keys.payload_key(task_id);
        let payload_key = payload_key.as_str();
        let data = data.as_ref();

        let outcome = retry_on_conflict(&self.retry, task_id, |_| async move {
            let watch = self.store.watch(&[self.scheduler.interval_key()]).await?;
            let interval = self.scheduler.interval(task_id).await?.unwrap_or(0.0);

            let mut tx = Transaction::new();
            let outcome = match data {
                Some(data) if interval > 0.0 => {
                    let next_run_at = self.scheduler.stage_reschedule(&mut tx, task_id, now, interval);
                    let payload = CachedPayload {
                        task_id: task_id.to_string(),
                        cached_at: now,
                        data: data.clone(),
                    };
                    tx.set(payload_key, serde_json::to_string(&payload)?);
                    RefreshOutcome::Refreshed {
                        task_id: task_id.to_string(),
                        next_run_at,
                    }
                }
                // rescheduled between the first interval read and the watch
                None if interval > 0.0 => {
                    self.store.discard(watch).await?;
                    return Ok::<_, EngineError>(Attempt::Done(RefreshOutcome::Idle));
                }
                _ => {
                    self.scheduler.stage_remove(&mut tx, task_id);
                    tx.delete(&[payload_key]);
                    RefreshOutcome::Evicted {
                        task_id: task_id.to_string(),
                    }
                }
            };

            let attempt = match self.store.commit(watch, tx).await? {
                CommitOutcome::Committed(_) => Attempt::Done(outcome),
                CommitOutcome::Aborted { .. } => Attempt::Conflict,
            };
            Ok::<_, EngineError>(attempt)
        })
        .await?;

        match &outcome.value {
            RefreshOutcome::Evicted { task_id } => {
                event!(Level::INFO, task_id = %task_id, attempts = outcome.attempts, "task evicted");
            }
            RefreshOutcome::Refreshed {
                task_id,
                next_run_at,
            } => {
                event!(Level::DEBUG, task_id = %task_id, next_run_at, attempts = outcome.attempts, "payload refreshed");
            }
            RefreshOutcome::Idle => {}
        }
        Ok(outcome.value)
    }

    /// Current cached payload of `task_id`, if any.
    pub async fn cached(&self, task_id: &str) -> Result<Option<CachedPayload>> {
        read_payload(self.store.as_ref(), &self.keys, task_id).await
    }

    /// Polls until `shutdown` fires.
    ///
    /// The store has no "wait for next due time" primitive, so an idle loop
    /// sleeps one poll interval (plus jitter) and checks again.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let span = info_span!("refresh_worker", worker_id = %self.id);
        async move {
            event!(Level::INFO, "refresh worker started");
            while !shutdown.is_triggered() {
                let pause = match self.poll_once().await {
                    Ok(RefreshOutcome::Idle) => true,
                    Ok(_) => false,
                    Err(err) => {
                        event!(Level::WARN, error = %err, "refresh cycle failed");
                        true
                    }
                };
                if pause && shutdown.sleep(self.poll.next_delay()).await {
                    break;
                }
            }
            event!(Level::INFO, "refresh worker stopped");
        }
        .instrument(span)
        .await
    }
}

pub(crate) async fn read_payload(
    store: &dyn KeyValueStore,
    keys: &KeyLayout,
    task_id: &str,
) -> Result<Option<CachedPayload>> {
    match store.get(&keys.payload_key(task_id)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}
