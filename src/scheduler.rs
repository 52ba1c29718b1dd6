use crate::config::KeyLayout;
use crate::core::clock::seconds_delta;
use crate::core::{Clock, Result, unix_seconds};
use crate::store::{KeyValueStore, Transaction, WatchSet};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{Level, event};

/// A task whose due time has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct DueTask {
    pub task_id: String,
    /// Unix seconds the task was due at
    pub due_at: f64,
}

/// Due-time ordered set plus its companion interval set.
///
/// Both live in the store; the scheduler itself holds no state, so any
/// number of schedulers and workers may share one store.
pub struct PriorityScheduler {
    store: Arc<dyn KeyValueStore>,
    keys: KeyLayout,
    clock: Arc<dyn Clock>,
}

impl PriorityScheduler {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeyLayout, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    /// Schedules `task_id` to run now and then every `interval` seconds.
    pub async fn schedule(&self, task_id: &str, interval: f64) -> Result<()> {
        self.schedule_at(task_id, self.clock.now(), interval).await
    }

    /// Inserts or overwrites both scores of `task_id`. Last write wins.
    ///
    /// The interval is written first so a worker that sees the due entry
    /// always finds a matching interval.
    pub async fn schedule_at(&self, task_id: &str, run_at: DateTime<Utc>, interval: f64) -> Result<()> {
        self.store.zadd(&self.keys.delay, task_id, interval).await?;
        self.store
            .zadd(&self.keys.schedule, task_id, unix_seconds(run_at))
            .await?;
        event!(Level::DEBUG, task_id, interval, run_at = %run_at, "task scheduled");
        Ok(())
    }

    /// Marks `task_id` for eviction on the next poll.
    ///
    /// Returns `false` and does nothing when the task was never scheduled.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        if self.interval(task_id).await?.is_none() {
            return Ok(false);
        }
        self.schedule(task_id, -1.0).await?;
        Ok(true)
    }

    /// Lowest-scored entry if it is due at `now`. Never blocks.
    pub async fn peek_due(&self, now: DateTime<Utc>) -> Result<Option<DueTask>> {
        Ok(self.due(now, 1).await?.into_iter().next())
    }

    /// Up to `limit` tasks due at `now`, earliest first.
    pub async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DueTask>> {
        let due = self
            .store
            .zrange_by_score(
                &self.keys.schedule,
                f64::NEG_INFINITY,
                unix_seconds(now),
                Some(limit),
            )
            .await?;
        Ok(due
            .into_iter()
            .map(|(task_id, due_at)| DueTask { task_id, due_at })
            .collect())
    }

    /// Lowest-scored entry regardless of whether it is due yet.
    pub async fn next_due(&self) -> Result<Option<DueTask>> {
        let head = self.store.zrange(&self.keys.schedule, 0, 0).await?;
        Ok(head.into_iter().next().map(|(task_id, due_at)| DueTask { task_id, due_at }))
    }

    pub async fn interval(&self, task_id: &str) -> Result<Option<f64>> {
        self.store.zscore(&self.keys.delay, task_id).await
    }

    /// Moves the next run of `task_id` to `after` seconds past `now`.
    pub async fn reschedule(&self, task_id: &str, now: DateTime<Utc>, after: f64) -> Result<f64> {
        let mut tx = Transaction::new();
        let next = self.stage_reschedule(&mut tx, task_id, now, after);
        self.store.commit(WatchSet::empty(), tx).await?;
        Ok(next)
    }

    /// Drops `task_id` from both sets in one pipeline.
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        let mut tx = Transaction::new();
        self.stage_remove(&mut tx, task_id);
        self.store.commit(WatchSet::empty(), tx).await?;
        Ok(())
    }

    /// Stages the due-time write of `reschedule` and returns the new due time.
    pub fn stage_reschedule(
        &self,
        tx: &mut Transaction,
        task_id: &str,
        now: DateTime<Utc>,
        after: f64,
    ) -> f64 {
        let next = unix_seconds(now + seconds_delta(after));
        tx.zadd(&self.keys.schedule, task_id, next);
        next
    }

    pub fn stage_remove(&self, tx: &mut Transaction, task_id: &str) {
        tx.zrem(&self.keys.schedule, &[task_id])
            .zrem(&self.keys.delay, &[task_id]);
    }

    /// Key whose version changes whenever any interval is written.
    pub fn interval_key(&self) -> &str {
        &self.keys.delay
    }

    /// Number of tasks in the due-time set.
    pub async fn pending(&self) -> Result<usize> {
        self.store.zcard(&self.keys.schedule).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;
    use std::time::Duration;

    fn scheduler() -> (PriorityScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new());
        (
            PriorityScheduler::new(store, KeyLayout::default(), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_peek_due_only_returns_due_tasks() {
        let (scheduler, clock) = scheduler();
        let later = clock.now() + chrono::TimeDelta::seconds(10);
        scheduler.schedule_at("later", later, 5.0).await.unwrap();

        assert_eq!(scheduler.peek_due(clock.now()).await.unwrap(), None);

        clock.advance(Duration::from_secs(10));
        let due = scheduler.peek_due(clock.now()).await.unwrap().unwrap();
        assert_eq!(due.task_id, "later");
    }

    #[tokio::test]
    async fn test_reschedule_overwrites_both_scores() {
        let (scheduler, clock) = scheduler();
        scheduler.schedule("item", 5.0).await.unwrap();
        scheduler.schedule("item", 30.0).await.unwrap();

        assert_eq!(scheduler.interval("item").await.unwrap(), Some(30.0));
        assert_eq!(scheduler.pending().await.unwrap(), 1);

        let next = scheduler.reschedule("item", clock.now(), 30.0).await.unwrap();
        assert_eq!(next, unix_seconds(clock.now()) + 30.0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_noop() {
        let (scheduler, _) = scheduler();
        assert!(!scheduler.cancel("ghost").await.unwrap());
        assert_eq!(scheduler.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_lazy() {
        let (scheduler, _) = scheduler();
        scheduler.schedule("item", 5.0).await.unwrap();
        assert!(scheduler.cancel("item").await.unwrap());

        // still queued until a worker observes the non-positive interval
        assert_eq!(scheduler.pending().await.unwrap(), 1);
        assert_eq!(scheduler.interval("item").await.unwrap(), Some(-1.0));
    }

    #[tokio::test]
    async fn test_due_lists_every_due_task_in_order() {
        let (scheduler, clock) = scheduler();
        let now = clock.now();
        scheduler.schedule_at("second", now - chrono::TimeDelta::seconds(1), 5.0).await.unwrap();
        scheduler.schedule_at("first", now - chrono::TimeDelta::seconds(2), 5.0).await.unwrap();
        scheduler.schedule_at("future", now + chrono::TimeDelta::seconds(9), 5.0).await.unwrap();

        let due: Vec<String> = scheduler
            .due(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|task| task.task_id)
            .collect();
        assert_eq!(due, vec!["first", "second"]);
        assert_eq!(scheduler.due(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_clears_both_sets() {
        let (scheduler, _) = scheduler();
        scheduler.schedule("item", 5.0).await.unwrap();
        scheduler.remove("item").await.unwrap();

        assert_eq!(scheduler.pending().await.unwrap(), 0);
        assert_eq!(scheduler.interval("item").await.unwrap(), None);
    }
}
