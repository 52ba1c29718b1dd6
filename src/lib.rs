// ============================================================================
// kvrefresh Library
// ============================================================================
//
// Background cache refresh, hourly windowed counters and capped recency sets
// on top of any store that implements `KeyValueStore`.
//
// ============================================================================

pub mod aggregator;
pub mod config;
pub mod core;
pub mod engine;
pub mod evictor;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod worker;

// Re-export main types for convenience
pub use aggregator::{AggregationWindow, IncrementReport, Severity, WindowedAggregator};
pub use config::{DecayConfig, EngineConfig, KeyLayout, PollConfig, SessionConfig};
pub use core::{Clock, EngineError, ManualClock, Result, SystemClock};
pub use engine::{Engine, EngineHandle};
pub use evictor::{BoundedSetEvictor, CascadePolicy, DecayPolicy, EvictionReport, EvictionTarget};
pub use retry::{Attempt, RetryOutcome, RetryPolicy, retry_on_conflict};
pub use scheduler::{DueTask, PriorityScheduler};
pub use session::SessionTracker;
pub use store::{CommitOutcome, InMemoryStore, KeyValueStore, Transaction, WatchSet};
pub use worker::{
    CacheRefreshWorker, CachedPayload, DataSource, RefreshOutcome, ShutdownSignal,
    ShutdownTrigger, shutdown_channel,
};
