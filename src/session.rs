use crate::config::{KeyLayout, SessionConfig};
use crate::core::{Clock, EngineError, Result, unix_seconds};
use crate::evictor::EvictionTarget;
use crate::store::{KeyValueStore, Transaction, WatchSet};
use std::collections::HashMap;
use std::sync::Arc;

/// Writes the per-session state that the capacity evictor later trims:
/// token logins, session recency, view history and carts.
pub struct SessionTracker {
    store: Arc<dyn KeyValueStore>,
    keys: KeyLayout,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: KeyLayout,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            config,
        }
    }

    /// User that owns `token`, if the session is still known.
    pub async fn check_token(&self, token: &str) -> Result<Option<String>> {
        self.store.hash_get(&self.keys.login, token).await
    }

    /// Records activity for `token`, optionally a view of `item`.
    pub async fn update_token(&self, token: &str, user: &str, item: Option<&str>) -> Result<()> {
        let now = unix_seconds(self.clock.now());
        let mut tx = Transaction::new();
        tx.hash_set(&self.keys.login, token, user)
            .zadd(&self.keys.recent_sessions, token, now);

        if let Some(item) = item {
            let viewed = self.keys.viewed_key(token);
            let keep = self.config.viewed_history_limit as isize;
            tx.zadd(&viewed, item, now)
                .zrem_range_by_rank(&viewed, 0, -keep - 1)
                .zincrby(&self.keys.popular, item, 1.0);
        }

        self.store.commit(WatchSet::empty(), tx).await?;
        Ok(())
    }

    /// Sets the quantity of `item` in the cart; a non-positive count removes it.
    pub async fn add_to_cart(&self, token: &str, item: &str, count: i64) -> Result<()> {
        let cart = self.keys.cart_key(token);
        if count <= 0 {
            self.store.hash_delete(&cart, &[item]).await?;
        } else {
            self.store.hash_set(&cart, item, &count.to_string()).await?;
        }
        Ok(())
    }

    pub async fn cart(&self, token: &str) -> Result<HashMap<String, i64>> {
        let cart = self.keys.cart_key(token);
        self.store
            .hash_get_all(&cart)
            .await?
            .into_iter()
            .map(|(item, raw)| {
                raw.parse::<i64>().map(|count| (item, count)).map_err(|err| {
                    EngineError::Serialization(format!("cart '{cart}' holds '{raw}': {err}"))
                })
            })
            .collect()
    }

    /// Items viewed in this session, most recent first.
    pub async fn viewed(&self, token: &str) -> Result<Vec<String>> {
        let mut items: Vec<String> = self
            .store
            .zrange(&self.keys.viewed_key(token), 0, -1)
            .await?
            .into_iter()
            .map(|(item, _)| item)
            .collect();
        items.reverse();
        Ok(items)
    }

    pub async fn active_sessions(&self) -> Result<usize> {
        self.store.zcard(&self.keys.recent_sessions).await
    }

    /// Capacity target for the recent-session set under this tracker's config.
    pub fn eviction_target(&self) -> EvictionTarget {
        EvictionTarget::new(self.keys.recent_sessions.clone(), self.config.limit)
            .batch_size(self.config.batch_size)
            .cascade(
                self.config
                    .cascade
                    .clone()
                    .unwrap_or_else(|| self.keys.session_cascade()),
            )
            .lookup_hash(self.keys.login.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn tracker(history: usize) -> (SessionTracker, Arc<InMemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap(),
        ));
        let config = SessionConfig {
            viewed_history_limit: history,
            ..SessionConfig::default()
        };
        let tracker = SessionTracker::new(store.clone(), KeyLayout::default(), clock.clone(), config);
        (tracker, store, clock)
    }

    #[tokio::test]
    async fn test_update_token_records_login_and_views() {
        let (tracker, store, clock) = tracker(2);
        for item in ["a", "b", "c"] {
            tracker.update_token("tok", "alice", Some(item)).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        assert_eq!(tracker.check_token("tok").await.unwrap(), Some("alice".to_string()));
        assert_eq!(tracker.viewed("tok").await.unwrap(), vec!["c", "b"]);
        assert_eq!(store.zscore("popular:", "a").await.unwrap(), Some(1.0));
        assert_eq!(tracker.active_sessions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cart_add_and_remove() {
        let (tracker, store, _) = tracker(25);
        tracker.add_to_cart("tok", "book", 2).await.unwrap();
        tracker.add_to_cart("tok", "pen", 1).await.unwrap();
        tracker.add_to_cart("tok", "pen", 0).await.unwrap();

        let cart = tracker.cart("tok").await.unwrap();
        assert_eq!(cart.get("book"), Some(&2));
        assert!(!cart.contains_key("pen"));

        tracker.add_to_cart("tok", "book", -1).await.unwrap();
        assert!(!store.exists("cart:tok").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (tracker, _, _) = tracker(25);
        assert_eq!(tracker.check_token("nobody").await.unwrap(), None);
        assert!(tracker.cart("nobody").await.unwrap().is_empty());
    }

    #[test]
    fn test_cascade_follows_key_layout() {
        let keys = KeyLayout {
            viewed_prefix: "v:".to_string(),
            cart_prefix: "basket:".to_string(),
            ..KeyLayout::default()
        };
        let tracker = SessionTracker::new(
            Arc::new(InMemoryStore::new()),
            keys,
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap())),
            SessionConfig::default(),
        );

        let target = tracker.eviction_target();
        assert_eq!(target.cascade.dependent_keys("tok"), vec!["v:tok", "basket:tok"]);
        assert_eq!(target.lookup_hash.as_deref(), Some("login:"));
    }

    #[tokio::test]
    async fn test_renamed_prefixes_are_evicted_with_the_session() {
        let store = Arc::new(InMemoryStore::new());
        let keys = KeyLayout {
            viewed_prefix: "v:".to_string(),
            ..KeyLayout::default()
        };
        let tracker = SessionTracker::new(
            store.clone(),
            keys,
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap())),
            SessionConfig::default(),
        );
        tracker.update_token("tok", "alice", Some("book")).await.unwrap();
        tracker.add_to_cart("tok", "book", 1).await.unwrap();
        assert!(store.exists("v:tok").await.unwrap());

        let evictor = crate::evictor::BoundedSetEvictor::new(store.clone());
        let target = EvictionTarget {
            limit: 0,
            ..tracker.eviction_target()
        };
        evictor.enforce_limit(&target).await.unwrap();

        assert!(!store.exists("v:tok").await.unwrap());
        assert!(!store.exists("cart:tok").await.unwrap());
        assert_eq!(tracker.check_token("tok").await.unwrap(), None);
    }
}
