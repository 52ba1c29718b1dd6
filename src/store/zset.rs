use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Score wrapper with a total order so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Members ordered by (score, member), with O(1) score lookup.
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Returns `true` when the member was not present before.
    pub fn insert(&mut self, member: &str, score: f64) -> bool {
        let previous = self.scores.insert(member.to_string(), score);
        if let Some(old) = previous {
            self.ordered.remove(&(Score(old), member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
        previous.is_none()
    }

    pub fn increment(&mut self, member: &str, delta: f64) -> f64 {
        let score = self.score(member).unwrap_or(0.0) + delta;
        self.insert(member, score);
        score
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn rank(&self, member: &str) -> Option<usize> {
        let score = self.score(member)?;
        let key = (Score(score), member.to_string());
        Some(self.ordered.range(..key).count())
    }

    pub fn range(&self, start: isize, stop: isize) -> Vec<(String, f64)> {
        match normalize_range(start, stop, self.len()) {
            Some((from, to)) => self
                .ordered
                .iter()
                .skip(from)
                .take(to - from + 1)
                .map(|(score, member)| (member.clone(), score.0))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn range_by_score(&self, min: f64, max: f64, limit: Option<usize>) -> Vec<(String, f64)> {
        self.ordered
            .iter()
            .filter(|(score, _)| score.0 >= min && score.0 <= max)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    pub fn remove_range_by_rank(&mut self, start: isize, stop: isize) -> u64 {
        let doomed: Vec<String> = self.range(start, stop).into_iter().map(|(m, _)| m).collect();
        doomed.iter().filter(|member| self.remove(member)).count() as u64
    }

    pub fn remove_range_by_score(&mut self, min: f64, max: f64) -> u64 {
        let doomed: Vec<String> = self
            .range_by_score(min, max, None)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        doomed.iter().filter(|member| self.remove(member)).count() as u64
    }

    /// Multiplies every score by `factor`.
    pub fn scale(&mut self, factor: f64) {
        let members: Vec<(String, f64)> = self.scores.drain().collect();
        self.ordered.clear();
        for (member, score) in members {
            self.insert(&member, score * factor);
        }
    }
}

/// Resolves inclusive, possibly negative, indices against `len`.
pub(crate) fn normalize_range(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
