// ============================================================================
// Staged Store Commands
// ============================================================================
//
// A Transaction records writes as Commands; the store applies them in order
// at commit time, or drops them if a watched key changed.
//
// ============================================================================

use std::time::Duration;

/// A single write staged inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { keys: Vec<String> },
    Rename { from: String, to: String },
    Expire { key: String, ttl: Duration },
    HashSet { key: String, field: String, value: String },
    HashDelete { key: String, fields: Vec<String> },
    ZAdd { key: String, member: String, score: f64 },
    ZIncrBy { key: String, member: String, delta: f64 },
    ZRem { key: String, members: Vec<String> },
    ZRemRangeByRank { key: String, start: isize, stop: isize },
    ZScale { key: String, factor: f64 },
    LPush { key: String, value: String },
    LTrim { key: String, start: isize, stop: isize },
}

impl Command {
    /// Keys this command mutates.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Command::Delete { keys } => keys.iter().map(String::as_str).collect(),
            Command::Rename { from, to } => vec![from.as_str(), to.as_str()],
            Command::Set { key, .. }
            | Command::Expire { key, .. }
            | Command::HashSet { key, .. }
            | Command::HashDelete { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZIncrBy { key, .. }
            | Command::ZRem { key, .. }
            | Command::ZRemRangeByRank { key, .. }
            | Command::ZScale { key, .. }
            | Command::LPush { key, .. }
            | Command::LTrim { key, .. } => vec![key.as_str()],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "SET",
            Command::Delete { .. } => "DEL",
            Command::Rename { .. } => "RENAME",
            Command::Expire { .. } => "EXPIRE",
            Command::HashSet { .. } => "HSET",
            Command::HashDelete { .. } => "HDEL",
            Command::ZAdd { .. } => "ZADD",
            Command::ZIncrBy { .. } => "ZINCRBY",
            Command::ZRem { .. } => "ZREM",
            Command::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
            Command::ZScale { .. } => "ZSCALE",
            Command::LPush { .. } => "LPUSH",
            Command::LTrim { .. } => "LTRIM",
        }
    }
}

/// Result of one committed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Integer(i64),
    Score(f64),
    Bool(bool),
    /// The command failed on its own; the rest of the transaction still applied.
    Error(String),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}
