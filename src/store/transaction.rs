// ============================================================================
// Optimistic Transactions
// ============================================================================
//
// watch(keys) captures key versions, the caller stages writes into a
// Transaction, and commit applies them only if no watched key moved:
//
//   watch ──read──> stage ──commit──> Committed
//                             │
//                             └──watched key changed──> Aborted
//
// ============================================================================

use super::command::{Command, Reply};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Key versions captured by `KeyValueStore::watch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    versions: Vec<(String, u64)>,
}

impl WatchSet {
    /// Watch set that never conflicts; committing against it is a plain atomic pipeline.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(versions: Vec<(String, u64)>) -> Self {
        Self { versions }
    }

    pub fn versions(&self) -> &[(String, u64)] {
        &self.versions
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Outcome of `KeyValueStore::commit`.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(Vec<Reply>),
    /// A watched key changed between watch and commit; nothing was applied.
    Aborted { key: String },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }
}

/// Write phase of an optimistic transaction.
///
/// Nothing touches the store until the transaction is handed to
/// `KeyValueStore::commit`.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    commands: Vec<Command>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: TransactionId::new(),
            commands: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.push(Command::Set {
            key: key.to_string(),
            value: value.into(),
        })
    }

    pub fn delete<S: AsRef<str>>(&mut self, keys: &[S]) -> &mut Self {
        self.push(Command::Delete {
            keys: keys.iter().map(|k| k.as_ref().to_string()).collect(),
        })
    }

    pub fn rename(&mut self, from: &str, to: &str) -> &mut Self {
        self.push(Command::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.push(Command::Expire {
            key: key.to_string(),
            ttl,
        })
    }

    pub fn hash_set(&mut self, key: &str, field: &str, value: impl Into<String>) -> &mut Self {
        self.push(Command::HashSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.into(),
        })
    }

    pub fn hash_delete<S: AsRef<str>>(&mut self, key: &str, fields: &[S]) -> &mut Self {
        self.push(Command::HashDelete {
            key: key.to_string(),
            fields: fields.iter().map(|f| f.as_ref().to_string()).collect(),
        })
    }

    pub fn zadd(&mut self, key: &str, member: &str, score: f64) -> &mut Self {
        self.push(Command::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        })
    }

    pub fn zincrby(&mut self, key: &str, member: &str, delta: f64) -> &mut Self {
        self.push(Command::ZIncrBy {
            key: key.to_string(),
            member: member.to_string(),
            delta,
        })
    }

    pub fn zrem<S: AsRef<str>>(&mut self, key: &str, members: &[S]) -> &mut Self {
        self.push(Command::ZRem {
            key: key.to_string(),
            members: members.iter().map(|m| m.as_ref().to_string()).collect(),
        })
    }

    pub fn zrem_range_by_rank(&mut self, key: &str, start: isize, stop: isize) -> &mut Self {
        self.push(Command::ZRemRangeByRank {
            key: key.to_string(),
            start,
            stop,
        })
    }

    pub fn zscale(&mut self, key: &str, factor: f64) -> &mut Self {
        self.push(Command::ZScale {
            key: key.to_string(),
            factor,
        })
    }

    pub fn lpush(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.push(Command::LPush {
            key: key.to_string(),
            value: value.into(),
        })
    }

    pub fn ltrim(&mut self, key: &str, start: isize, stop: isize) -> &mut Self {
        self.push(Command::LTrim {
            key: key.to_string(),
            start,
            stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = Transaction::new();
        let b = Transaction::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_staged_commands_keep_order() {
        let mut tx = Transaction::new();
        tx.rename("counts", "counts:last")
            .set("counts:start", "3600")
            .zincrby("counts", "boot", 1.0);

        let names: Vec<&str> = tx.commands().iter().map(Command::name).collect();
        assert_eq!(names, vec!["RENAME", "SET", "ZINCRBY"]);
        assert_eq!(tx.commands()[0].keys(), vec!["counts", "counts:last"]);
    }
}
