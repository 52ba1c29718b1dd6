use super::command::{Command, Reply};
use super::transaction::{CommitOutcome, Transaction, WatchSet};
use super::zset::{SortedSet, normalize_range};
use super::{KeyValueStore, ScoredMember};
use crate::core::{EngineError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    SortedSet(SortedSet),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(map) => map.is_empty(),
            Value::SortedSet(set) => set.is_empty(),
            Value::List(list) => list.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Keys, values and the per-key version counters used by WATCH.
///
/// Versions outlive their keys so that a delete after `watch` is still
/// detected at commit time.
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    next_version: u64,
}

macro_rules! typed_ref {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        fn $name(&self, key: &str) -> Result<Option<&$ty>> {
            match self.live(key) {
                None => Ok(None),
                Some(Value::$variant(inner)) => Ok(Some(inner)),
                Some(_) => Err(EngineError::WrongType {
                    key: key.to_string(),
                    expected: $label,
                }),
            }
        }
    };
}

macro_rules! typed_mut {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        fn $name(&mut self, key: &str) -> Result<&mut $ty> {
            let entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::$variant(Default::default())));
            match &mut entry.value {
                Value::$variant(inner) => Ok(inner),
                _ => Err(EngineError::WrongType {
                    key: key.to_string(),
                    expected: $label,
                }),
            }
        }
    };
}

impl Keyspace {
    fn live(&self, key: &str) -> Option<&Value> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| &entry.value)
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        self.next_version += 1;
        self.versions.insert(key.to_string(), self.next_version);
    }

    fn purge_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(Instant::now()));
        if expired {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|entry| entry.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    typed_ref!(hash, Hash, HashMap<String, String>, "hash");
    typed_ref!(zset, SortedSet, SortedSet, "sorted set");
    typed_ref!(list, List, VecDeque<String>, "list");
    typed_mut!(hash_mut, Hash, HashMap<String, String>, "hash");
    typed_mut!(zset_mut, SortedSet, SortedSet, "sorted set");
    typed_mut!(list_mut, List, VecDeque<String>, "list");

    /// Applies one write. The only mutation path of the store.
    fn apply(&mut self, command: Command) -> Result<Reply> {
        for key in command.keys() {
            self.purge_expired(key);
        }
        let touched: Vec<String> = command.keys().into_iter().map(str::to_string).collect();

        let reply = match command {
            Command::Set { key, value } => {
                self.entries.insert(key, Entry::new(Value::Str(value)));
                Reply::Ok
            }
            Command::Delete { keys } => {
                let removed = keys
                    .iter()
                    .filter(|key| self.entries.remove(key.as_str()).is_some())
                    .count();
                Reply::Integer(removed as i64)
            }
            Command::Rename { from, to } => {
                let entry = self
                    .entries
                    .remove(&from)
                    .ok_or_else(|| EngineError::NoSuchKey(from.clone()))?;
                self.entries.insert(to, entry);
                Reply::Ok
            }
            Command::Expire { key, ttl } => match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    Reply::Bool(true)
                }
                None => return Ok(Reply::Bool(false)),
            },
            Command::HashSet { key, field, value } => {
                self.hash_mut(&key)?.insert(field, value);
                Reply::Ok
            }
            Command::HashDelete { key, fields } => {
                if self.hash(&key)?.is_none() {
                    return Ok(Reply::Integer(0));
                }
                let map = self.hash_mut(&key)?;
                let removed = fields.iter().filter(|f| map.remove(f.as_str()).is_some()).count();
                self.drop_if_empty(&key);
                Reply::Integer(removed as i64)
            }
            Command::ZAdd { key, member, score } => {
                Reply::Bool(self.zset_mut(&key)?.insert(&member, score))
            }
            Command::ZIncrBy { key, member, delta } => {
                Reply::Score(self.zset_mut(&key)?.increment(&member, delta))
            }
            Command::ZRem { key, members } => {
                if self.zset(&key)?.is_none() {
                    return Ok(Reply::Integer(0));
                }
                let set = self.zset_mut(&key)?;
                let removed = members.iter().filter(|m| set.remove(m)).count();
                self.drop_if_empty(&key);
                Reply::Integer(removed as i64)
            }
            Command::ZRemRangeByRank { key, start, stop } => {
                if self.zset(&key)?.is_none() {
                    return Ok(Reply::Integer(0));
                }
                let removed = self.zset_mut(&key)?.remove_range_by_rank(start, stop);
                self.drop_if_empty(&key);
                Reply::Integer(removed as i64)
            }
            Command::ZScale { key, factor } => {
                if self.zset(&key)?.is_none() {
                    return Ok(Reply::Ok);
                }
                self.zset_mut(&key)?.scale(factor);
                Reply::Ok
            }
            Command::LPush { key, value } => {
                let list = self.list_mut(&key)?;
                list.push_front(value);
                Reply::Integer(list.len() as i64)
            }
            Command::LTrim { key, start, stop } => {
                if self.list(&key)?.is_none() {
                    return Ok(Reply::Ok);
                }
                let list = self.list_mut(&key)?;
                match normalize_range(start, stop, list.len()) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => list.clear(),
                }
                self.drop_if_empty(&key);
                Reply::Ok
            }
        };

        for key in &touched {
            self.touch(key);
        }
        Ok(reply)
    }
}

/// In-process implementation of [`KeyValueStore`].
///
/// One `RwLock` guards the whole keyspace, so every call and every committed
/// transaction is linearizable. An optional artificial latency simulates the
/// network round-trip of a remote store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    keyspace: RwLock<Keyspace>,
    latency: Option<Duration>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `latency` before every operation.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            keyspace: RwLock::new(Keyspace::default()),
            latency: Some(latency),
        }
    }

    /// Live keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let keyspace = self.keyspace.read().await;
        let now = Instant::now();
        let mut keys: Vec<String> = keyspace
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    async fn round_trip(&self) {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
    }

    async fn execute(&self, command: Command) -> Result<Reply> {
        self.round_trip().await;
        let mut keyspace = self.keyspace.write().await;
        keyspace.apply(command)
    }

    async fn read<T>(&self, f: impl FnOnce(&Keyspace) -> Result<T>) -> Result<T> {
        self.round_trip().await;
        let keyspace = self.keyspace.read().await;
        f(&keyspace)
    }
}

fn integer(reply: Reply) -> u64 {
    match reply {
        Reply::Integer(n) => n.max(0) as u64,
        _ => 0,
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read(|ks| match ks.live(key) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(EngineError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.execute(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.iter().map(|k| k.to_string()).collect();
        self.execute(Command::Delete { keys }).await.map(integer)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.read(|ks| Ok(ks.live(key).is_some())).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.execute(Command::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let reply = self
            .execute(Command::Expire {
                key: key.to_string(),
                ttl,
            })
            .await?;
        Ok(reply == Reply::Bool(true))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.read(|ks| Ok(ks.hash(key)?.and_then(|map| map.get(field).cloned())))
            .await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.execute(Command::HashSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<u64> {
        let fields = fields.iter().map(|f| f.to_string()).collect();
        self.execute(Command::HashDelete {
            key: key.to_string(),
            fields,
        })
        .await
        .map(integer)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.read(|ks| Ok(ks.hash(key)?.cloned().unwrap_or_default()))
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let reply = self
            .execute(Command::ZAdd {
                key: key.to_string(),
                member: member.to_string(),
                score,
            })
            .await?;
        Ok(reply == Reply::Bool(true))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.read(|ks| Ok(ks.zset(key)?.and_then(|set| set.score(member))))
            .await
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let reply = self
            .execute(Command::ZIncrBy {
                key: key.to_string(),
                member: member.to_string(),
                delta,
            })
            .await?;
        match reply {
            Reply::Score(score) => Ok(score),
            other => Err(EngineError::Store(format!("unexpected ZINCRBY reply {other:?}"))),
        }
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> Result<u64> {
        let members = members.iter().map(|m| m.to_string()).collect();
        self.execute(Command::ZRem {
            key: key.to_string(),
            members,
        })
        .await
        .map(integer)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.read(|ks| Ok(ks.zset(key)?.map_or(0, SortedSet::len)))
            .await
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>> {
        self.read(|ks| Ok(ks.zset(key)?.and_then(|set| set.rank(member))))
            .await
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ScoredMember>> {
        self.read(|ks| Ok(ks.zset(key)?.map(|set| set.range(start, stop)).unwrap_or_default()))
            .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        self.read(|ks| {
            Ok(ks
                .zset(key)?
                .map(|set| set.range_by_score(min, max, limit))
                .unwrap_or_default())
        })
        .await
    }

    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> Result<u64> {
        self.execute(Command::ZRemRangeByRank {
            key: key.to_string(),
            start,
            stop,
        })
        .await
        .map(integer)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        // Resolved to members under one write lock; there is no staged form of this command.
        self.round_trip().await;
        let mut keyspace = self.keyspace.write().await;
        keyspace.purge_expired(key);
        if keyspace.zset(key)?.is_none() {
            return Ok(0);
        }
        let removed = keyspace.zset_mut(key)?.remove_range_by_score(min, max);
        keyspace.drop_if_empty(key);
        if removed > 0 {
            keyspace.touch(key);
        }
        Ok(removed)
    }

    async fn zscale(&self, key: &str, factor: f64) -> Result<()> {
        self.execute(Command::ZScale {
            key: key.to_string(),
            factor,
        })
        .await
        .map(|_| ())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        self.execute(Command::LPush {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|reply| integer(reply) as usize)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.execute(Command::LTrim {
            key: key.to_string(),
            start,
            stop,
        })
        .await
        .map(|_| ())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.read(|ks| {
            let Some(list) = ks.list(key)? else {
                return Ok(Vec::new());
            };
            Ok(match normalize_range(start, stop, list.len()) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            })
        })
        .await
    }

    async fn watch(&self, keys: &[&str]) -> Result<WatchSet> {
        self.round_trip().await;
        let mut keyspace = self.keyspace.write().await;
        let versions = keys
            .iter()
            .map(|key| {
                keyspace.purge_expired(key);
                (key.to_string(), keyspace.version(key))
            })
            .collect();
        Ok(WatchSet::new(versions))
    }

    async fn commit(&self, watch: WatchSet, tx: Transaction) -> Result<CommitOutcome> {
        self.round_trip().await;
        let mut keyspace = self.keyspace.write().await;

        for (key, version) in watch.versions() {
            keyspace.purge_expired(key);
            if keyspace.version(key) != *version {
                return Ok(CommitOutcome::Aborted { key: key.clone() });
            }
        }

        let replies = tx
            .into_commands()
            .into_iter()
            .map(|command| {
                let name = command.name();
                match keyspace.apply(command) {
                    Ok(reply) => reply,
                    Err(err) => Reply::Error(format!("{name}: {err}")),
                }
            })
            .collect();
        Ok(CommitOutcome::Committed(replies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_aborts_when_watched_key_changes() {
        let store = InMemoryStore::new();
        store.set("marker", "1").await.unwrap();

        let watch = store.watch(&["marker"]).await.unwrap();
        store.set("marker", "2").await.unwrap();

        let mut tx = Transaction::new();
        tx.set("marker", "3");
        let outcome = store.commit(watch, tx).await.unwrap();

        assert_eq!(
            outcome,
            CommitOutcome::Aborted {
                key: "marker".to_string()
            }
        );
        assert_eq!(store.get("marker").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_commit_detects_delete_of_watched_key() {
        let store = InMemoryStore::new();
        store.set("marker", "1").await.unwrap();
        let watch = store.watch(&["marker"]).await.unwrap();
        store.delete(&["marker"]).await.unwrap();

        let outcome = store.commit(watch, Transaction::new()).await.unwrap();
        assert!(!outcome.is_committed());
    }

    #[tokio::test]
    async fn test_failed_command_does_not_stop_transaction() {
        let store = InMemoryStore::new();
        let mut tx = Transaction::new();
        tx.rename("missing", "elsewhere").zincrby("counts", "boot", 1.0);

        let outcome = store.commit(WatchSet::empty(), tx).await.unwrap();
        let CommitOutcome::Committed(replies) = outcome else {
            panic!("expected commit");
        };
        assert!(replies[0].is_error());
        assert_eq!(replies[1], Reply::Score(1.0));
    }

    #[tokio::test]
    async fn test_empty_collections_disappear() {
        let store = InMemoryStore::new();
        store.zadd("set", "a", 1.0).await.unwrap();
        store.hash_set("hash", "f", "v").await.unwrap();

        assert_eq!(store.zrem("set", &["a"]).await.unwrap(), 1);
        assert_eq!(store.hash_delete("hash", &["f"]).await.unwrap(), 1);

        assert!(!store.exists("set").await.unwrap());
        assert!(!store.exists("hash").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let store = InMemoryStore::new();
        store.set("plain", "value").await.unwrap();
        let err = store.zadd("plain", "a", 1.0).await.unwrap_err();
        assert!(matches!(err, EngineError::WrongType { .. }));
    }

    #[tokio::test]
    async fn test_rename_missing_key_fails() {
        let store = InMemoryStore::new();
        let err = store.rename("nope", "other").await.unwrap_err();
        assert!(matches!(err, EngineError::NoSuchKey(_)));
    }

    #[tokio::test]
    async fn test_list_push_and_trim() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.lpush("recent", &format!("m{i}")).await.unwrap();
        }
        store.ltrim("recent", 0, 2).await.unwrap();
        assert_eq!(store.lrange("recent", 0, -1).await.unwrap(), vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn test_expired_keys_read_as_absent() {
        let store = InMemoryStore::new();
        store.set("session", "alive").await.unwrap();
        assert!(store.expire("session", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("session").await.unwrap(), None);
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }
}
