// ============================================================================
// Engine Facade
// ============================================================================
//
// Wires one store, one configuration and one clock into the scheduler,
// aggregator, evictor and session tracker, and owns the background loops.
//
// ============================================================================

use crate::aggregator::{IncrementReport, Severity, WindowedAggregator};
use crate::config::EngineConfig;
use crate::core::{Clock, EngineError, Result, SystemClock};
use crate::evictor::{BoundedSetEvictor, DecayPolicy, EvictionReport, EvictionTarget};
use crate::scheduler::PriorityScheduler;
use crate::session::SessionTracker;
use crate::store::KeyValueStore;
use crate::worker::refresh::read_payload;
use crate::worker::{CacheRefreshWorker, CachedPayload, DataSource, ShutdownTrigger, shutdown_channel};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// Cache refresh and bookkeeping engine bound to one store.
///
/// # Examples
///
/// ```
/// use kvrefresh::{DataSource, Engine, EngineConfig, InMemoryStore, Severity};
/// use serde_json::{Value, json};
/// use std::sync::Arc;
///
/// struct Inventory;
///
/// #[async_trait::async_trait]
/// impl DataSource for Inventory {
///     async fn fetch(&self, task_id: &str) -> anyhow::Result<Value> {
///         Ok(json!({ "sku": task_id }))
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let engine = Engine::new(
///     Arc::new(InMemoryStore::new()),
///     Arc::new(Inventory),
///     EngineConfig::default(),
/// )?;
///
/// engine.schedule("itemX", 5.0).await?;
/// engine.increment_counter("web", Severity::Error, "disk full").await?;
/// # Ok::<(), kvrefresh::EngineError>(())
/// # }).unwrap();
/// ```
pub struct Engine {
    store: Arc<dyn KeyValueStore>,
    source: Arc<dyn DataSource>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<PriorityScheduler>,
    aggregator: WindowedAggregator,
    evictor: Arc<BoundedSetEvictor>,
    sessions: SessionTracker,
}

impl Engine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn DataSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_clock(store, source, config, Arc::new(SystemClock))
    }

    /// Same as `new` but reads time from `clock`.
    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn DataSource>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(PriorityScheduler::new(
            store.clone(),
            config.keys.clone(),
            clock.clone(),
        ));
        let aggregator = WindowedAggregator::new(
            store.clone(),
            config.keys.clone(),
            clock.clone(),
            config.retry.clone(),
            config.recent_log_limit,
        );
        let evictor =
            Arc::new(BoundedSetEvictor::new(store.clone()).with_retry(config.retry.clone()));
        let sessions = SessionTracker::new(
            store.clone(),
            config.keys.clone(),
            clock.clone(),
            config.sessions.clone(),
        );

        Ok(Self {
            store,
            source,
            config,
            clock,
            scheduler,
            aggregator,
            evictor,
            sessions,
        })
    }

    // ------------------------------------------------------------------------
    // Caller-facing operations
    // ------------------------------------------------------------------------

    /// Schedules `task_id` to refresh now and then every `interval` seconds.
    pub async fn schedule(&self, task_id: &str, interval: f64) -> Result<()> {
        self.scheduler.schedule(task_id, interval).await
    }

    /// Marks `task_id` for eviction on the next refresh poll.
    ///
    /// Returns `false` when the task was never scheduled.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        self.scheduler.cancel(task_id).await
    }

    pub async fn increment_counter(
        &self,
        subject: &str,
        severity: Severity,
        message: &str,
    ) -> Result<IncrementReport> {
        self.aggregator
            .increment_counter(subject, severity, message)
            .await
    }

    /// One eviction batch on `set_key` using the configured batch size.
    ///
    /// Only the session set cascades to per-session keys and the login
    /// lookup; any other set just loses its lowest-scored members.
    pub async fn enforce_limit(&self, set_key: &str, limit: usize) -> Result<EvictionReport> {
        let target = if set_key == self.config.keys.recent_sessions {
            EvictionTarget {
                limit,
                ..self.sessions.eviction_target()
            }
        } else {
            EvictionTarget::new(set_key, limit).batch_size(self.config.sessions.batch_size)
        };
        self.evictor.enforce_limit(&target).await
    }

    pub async fn cached(&self, task_id: &str) -> Result<Option<CachedPayload>> {
        read_payload(self.store.as_ref(), &self.config.keys, task_id).await
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    pub fn aggregator(&self) -> &WindowedAggregator {
        &self.aggregator
    }

    pub fn evictor(&self) -> &BoundedSetEvictor {
        &self.evictor
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    // ------------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------------

    /// Spawns the refresh workers, the session capacity loop and, when
    /// enabled, the popularity decay loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> EngineHandle {
        let (trigger, signal) = shutdown_channel();
        let mut handles = Vec::new();

        for _ in 0..self.config.refresh_workers {
            let worker = CacheRefreshWorker::new(
                self.store.clone(),
                self.scheduler.clone(),
                self.source.clone(),
                self.config.keys.clone(),
                self.config.poll.clone(),
                self.config.retry.clone(),
                self.clock.clone(),
            );
            handles.push(tokio::spawn(worker.run(signal.clone())));
        }

        let idle = Duration::from_millis(self.config.sessions.check_interval_ms);
        handles.push(tokio::spawn(self.evictor.clone().run_capacity_loop(
            vec![self.sessions.eviction_target()],
            idle,
            signal.clone(),
        )));

        if self.config.decay.enabled {
            let policy = DecayPolicy {
                key: self.config.keys.popular.clone(),
                keep_top: self.config.decay.keep_top,
                factor: self.config.decay.factor,
            };
            let period = Duration::from_millis(self.config.decay.period_ms);
            handles.push(tokio::spawn(
                self.evictor.clone().run_decay_loop(policy, period, signal),
            ));
        }

        event!(Level::INFO, loops = handles.len(), "engine started");
        EngineHandle { trigger, handles }
    }
}

/// Running background loops of an `Engine`.
pub struct EngineHandle {
    trigger: ShutdownTrigger,
    handles: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn loops(&self) -> usize {
        self.handles.len()
    }

    /// Signals every loop to stop and waits for all of them.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger.trigger();
        let results = futures::future::join_all(self.handles).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err().map(|err| err.to_string()))
            .collect();

        event!(Level::INFO, failed = failures.len(), "engine stopped");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Worker(failures.join("; ")))
        }
    }
}
