use crate::core::{EngineError, Result};
use crate::evictor::CascadePolicy;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Names of every key the engine reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLayout {
    /// Due-time ordered set: task id -> next run (unix seconds)
    pub schedule: String,
    /// Parameter ordered set: task id -> interval (seconds)
    pub delay: String,
    /// Prefix of cached payload keys
    pub payload_prefix: String,
    /// Prefix of aggregation window keys
    pub counts_prefix: String,
    /// Prefix of recent-message lists
    pub recent_log_prefix: String,
    /// Hash: session token -> user
    pub login: String,
    /// Ordered set: session token -> last seen
    pub recent_sessions: String,
    /// Prefix of per-session view history sets
    pub viewed_prefix: String,
    /// Prefix of per-session cart hashes
    pub cart_prefix: String,
    /// Ordered set: item -> view count
    pub popular: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            schedule: "schedule:".to_string(),
            delay: "delay:".to_string(),
            payload_prefix: "inv:".to_string(),
            counts_prefix: "common:".to_string(),
            recent_log_prefix: "recent:".to_string(),
            login: "login:".to_string(),
            recent_sessions: "recent:".to_string(),
            viewed_prefix: "viewed:".to_string(),
            cart_prefix: "cart:".to_string(),
            popular: "popular:".to_string(),
        }
    }
}

impl KeyLayout {
    pub fn payload_key(&self, task_id: &str) -> String {
        format!("{}{}", self.payload_prefix, task_id)
    }

    pub fn counts_key(&self, subject: &str, severity: &str) -> String {
        format!("{}{}:{}", self.counts_prefix, subject, severity)
    }

    pub fn recent_log_key(&self, subject: &str, severity: &str) -> String {
        format!("{}{}:{}", self.recent_log_prefix, subject, severity)
    }

    pub fn viewed_key(&self, token: &str) -> String {
        format!("{}{}", self.viewed_prefix, token)
    }

    pub fn cart_key(&self, token: &str) -> String {
        format!("{}{}", self.cart_prefix, token)
    }

    /// Per-session namespaces an evicted session takes with it.
    pub fn session_cascade(&self) -> CascadePolicy {
        CascadePolicy::new([self.viewed_prefix.clone(), self.cart_prefix.clone()])
    }
}

/// Pacing of the busy-poll loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// Upper bound of the random extra delay added to each idle sleep.
    pub jitter_ms: u64,
    /// Due tasks examined per cycle; a failing task only blocks those behind
    /// it when this many fail in a row.
    pub due_scan: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 50,
            jitter_ms: 0,
            due_scan: 32,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Idle sleep for one cycle: the interval plus a random share of the jitter.
    pub fn next_delay(&self) -> Duration {
        let jitter = match self.jitter_ms {
            0 => 0,
            span => {
                let (random, _) = uuid::Uuid::new_v4().as_u64_pair();
                random % (span + 1)
            }
        };
        Duration::from_millis(self.interval_ms + jitter)
    }
}

/// Bounds of the recent-session set and its cleanup cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub limit: usize,
    pub batch_size: usize,
    pub check_interval_ms: u64,
    pub viewed_history_limit: usize,
    /// Overrides the cascade derived from the key layout's session prefixes.
    pub cascade: Option<CascadePolicy>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            limit: 10_000_000,
            batch_size: 100,
            check_interval_ms: 1_000,
            viewed_history_limit: 25,
            cascade: None,
        }
    }
}

/// Periodic trim-and-halve of the item popularity set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub enabled: bool,
    pub keep_top: usize,
    pub factor: f64,
    pub period_ms: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_top: 20_000,
            factor: 0.5,
            period_ms: 300_000,
        }
    }
}

/// Per-instance engine configuration.
///
/// Nothing here is process-global: two engines in one process can run with
/// entirely different layouts and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub keys: KeyLayout,
    pub poll: PollConfig,
    pub retry: RetryPolicy,
    /// Number of refresh loops sharing the schedule
    pub refresh_workers: usize,
    pub sessions: SessionConfig,
    pub decay: DecayConfig,
    /// Messages kept per (subject, severity); 0 disables the recent log
    pub recent_log_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keys: KeyLayout::default(),
            poll: PollConfig::default(),
            retry: RetryPolicy::default(),
            refresh_workers: 1,
            sessions: SessionConfig::default(),
            decay: DecayConfig::default(),
            recent_log_limit: 100,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval_ms = duration_ms(interval);
        self
    }

    /// Set poll jitter
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll.jitter_ms = duration_ms(jitter);
        self
    }

    /// Set optimistic retry deadline
    pub fn retry_deadline(mut self, deadline: Duration) -> Self {
        self.retry = self.retry.with_deadline(deadline);
        self
    }

    pub fn refresh_workers(mut self, workers: usize) -> Self {
        self.refresh_workers = workers;
        self
    }

    /// Set session capacity and eviction batch size
    pub fn session_limit(mut self, limit: usize, batch_size: usize) -> Self {
        self.sessions.limit = limit;
        self.sessions.batch_size = batch_size;
        self
    }

    pub fn session_check_interval(mut self, interval: Duration) -> Self {
        self.sessions.check_interval_ms = duration_ms(interval);
        self
    }

    pub fn cascade(mut self, cascade: CascadePolicy) -> Self {
        self.sessions.cascade = Some(cascade);
        self
    }

    pub fn decay(mut self, decay: DecayConfig) -> Self {
        self.decay = decay;
        self
    }

    pub fn recent_log_limit(mut self, limit: usize) -> Self {
        self.recent_log_limit = limit;
        self
    }

    pub fn keys(mut self, keys: KeyLayout) -> Self {
        self.keys = keys;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!("Failed to read config '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_ms == 0 {
            return Err(EngineError::Config("poll.interval_ms must be positive".into()));
        }
        if self.poll.due_scan == 0 {
            return Err(EngineError::Config("poll.due_scan must be at least 1".into()));
        }
        if self.refresh_workers == 0 {
            return Err(EngineError::Config("refresh_workers must be at least 1".into()));
        }
        if self.sessions.batch_size == 0 {
            return Err(EngineError::Config("sessions.batch_size must be positive".into()));
        }
        if !(self.decay.factor > 0.0 && self.decay.factor <= 1.0) {
            return Err(EngineError::Config(format!(
                "decay.factor must be in (0, 1], got {}",
                self.decay.factor
            )));
        }
        if self.decay.enabled && self.decay.period_ms == 0 {
            return Err(EngineError::Config("decay.period_ms must be positive".into()));
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
