//! Seqno range sets.
//!
//! A [`Sequence`] is a sorted list of disjoint inclusive ranges; an open upper bound
//! is written `null` in the JSON form (`[[1, 5], [9, null]]`). Every operation keeps
//! the list sorted, disjoint and coalesced, so adjacent ranges never coexist.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SyncError;
use crate::error::Result;

/// One inclusive range; `None` means unbounded.
pub type Range = (u64, Option<u64>);

/// Set of seqnos.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Range>", into = "Vec<Range>")]
pub struct Sequence {
    ranges: Vec<Range>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// `[start, ∞)`.
    pub fn from_start(start: u64) -> Self {
        Self {
            ranges: vec![(start, None)],
        }
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Smallest member.
    pub fn first(&self) -> Option<u64> {
        self.ranges.first().map(|r| r.0)
    }

    /// Largest member, or `None` when empty or unbounded.
    pub fn last(&self) -> Option<u64> {
        self.ranges.last().and_then(|r| r.1)
    }

    pub fn is_bounded(&self) -> bool {
        self.ranges.last().map_or(true, |r| r.1.is_some())
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges
            .iter()
            .any(|(start, end)| *start <= value && end.map_or(true, |end| value <= end))
    }

    /// Adds `[start, end]`.
    pub fn include(&mut self, start: u64, end: Option<u64>) {
        if matches!(end, Some(end) if end < start) {
            return;
        }
        let mut ranges = std::mem::take(&mut self.ranges);
        ranges.push((start, end));
        ranges.sort_by_key(|r| r.0);

        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            if let Some(last) = merged.last_mut() {
                let touches = match last.1 {
                    None => true,
                    Some(last_end) => start <= last_end.saturating_add(1),
                };
                if touches {
                    last.1 = match (last.1, end) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        _ => None,
                    };
                    continue;
                }
            }
            merged.push((start, end));
        }
        self.ranges = merged;
    }

    /// Removes `[start, end]`.
    pub fn exclude(&mut self, start: u64, end: Option<u64>) {
        if matches!(end, Some(end) if end < start) {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for (s, e) in self.ranges.drain(..) {
            if s < start {
                let left_end = match e {
                    Some(e) => e.min(start - 1),
                    None => start - 1,
                };
                kept.push((s, Some(left_end)));
            }
            if let Some(end) = end {
                if end == u64::MAX {
                    continue;
                }
                let right_start = s.max(end + 1);
                if e.map_or(true, |e| e >= right_start) {
                    kept.push((right_start, e));
                }
            }
        }
        self.ranges = kept;
    }

    /// Drops everything above `end`.
    pub fn floor(&mut self, end: u64) {
        if end == u64::MAX {
            if let Some(last) = self.ranges.last_mut() {
                if last.1.is_none() {
                    last.1 = Some(u64::MAX);
                }
            }
            return;
        }
        self.exclude(end + 1, None);
    }

    pub fn include_all(&mut self, other: &Sequence) {
        for (start, end) in &other.ranges {
            self.include(*start, *end);
        }
    }

    pub fn exclude_all(&mut self, other: &Sequence) {
        for (start, end) in &other.ranges {
            self.exclude(*start, *end);
        }
    }

    pub fn intersection(&self, other: &Sequence) -> Sequence {
        let mut result = Sequence::new();
        for (a_start, a_end) in &self.ranges {
            for (b_start, b_end) in &other.ranges {
                let start = (*a_start).max(*b_start);
                let end = match (a_end, b_end) {
                    (Some(a), Some(b)) => Some((*a).min(*b)),
                    (Some(a), None) => Some(*a),
                    (None, Some(b)) => Some(*b),
                    (None, None) => None,
                };
                if end.map_or(true, |end| start <= end) {
                    result.include(start, end);
                }
            }
        }
        result
    }

    /// Every seqno from 1 up that is not in the set.
    pub fn complement(&self) -> Sequence {
        let mut result = Sequence::from_start(1);
        result.exclude_all(self);
        result
    }
}

impl From<Vec<Range>> for Sequence {
    fn from(ranges: Vec<Range>) -> Self {
        let mut sequence = Sequence::new();
        for (start, end) in ranges {
            sequence.include(start, end);
        }
        sequence
    }
}

impl From<Sequence> for Vec<Range> {
    fn from(sequence: Sequence) -> Self {
        sequence.ranges
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|(start, end)| match end {
                Some(end) => format!("{}-{}", start, end),
                None => format!("{}-", start),
            })
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// A [`Sequence`] kept in a JSON file.
#[derive(Debug)]
pub struct PersistentSequence {
    path: PathBuf,
    sequence: Sequence,
}

impl PersistentSequence {
    /// Loads the file, or starts from `initial` when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>, initial: Sequence) -> Result<Self> {
        let path = path.into();
        let sequence = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Corrupted(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => initial,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, sequence })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the set durably.
    pub fn commit(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
        tmp.write_all(&serde_json::to_vec(&self.sequence)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| crate::error::Error::Io(e.error))?;
        debug!(path = %self.path.display(), sequence = %self.sequence, "Committed sequence");
        Ok(())
    }
}

impl Deref for PersistentSequence {
    type Target = Sequence;

    fn deref(&self) -> &Sequence {
        &self.sequence
    }
}

impl DerefMut for PersistentSequence {
    fn deref_mut(&mut self) -> &mut Sequence {
        &mut self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn seq(ranges: &[Range]) -> Sequence {
        Sequence::from(ranges.to_vec())
    }

    fn assert_normalized(sequence: &Sequence) {
        for pair in sequence.ranges().windows(2) {
            let (_, end) = pair[0];
            let (next_start, _) = pair[1];
            let end = end.expect("only the last range may be open");
            assert!(end + 1 < next_start, "{} is not coalesced", sequence);
        }
        for (start, end) in sequence.ranges() {
            assert!(end.map_or(true, |end| *start <= end));
        }
    }

    #[test]
    fn test_include_coalesces() {
        let mut s = Sequence::new();
        s.include(1, Some(3));
        s.include(7, Some(9));
        s.include(4, Some(5));
        assert_eq!(s.ranges(), &[(1, Some(5)), (7, Some(9))]);
        s.include(6, Some(6));
        assert_eq!(s.ranges(), &[(1, Some(9))]);
        s.include(20, None);
        s.include(15, Some(25));
        assert_eq!(s.ranges(), &[(1, Some(9)), (15, None)]);
        assert_normalized(&s);
    }

    #[test]
    fn test_exclude_splits() {
        let mut s = Sequence::from_start(1);
        s.exclude(3, Some(5));
        assert_eq!(s.ranges(), &[(1, Some(2)), (6, None)]);
        s.exclude(1, Some(1));
        assert_eq!(s.ranges(), &[(2, Some(2)), (6, None)]);
        s.exclude(10, None);
        assert_eq!(s.ranges(), &[(2, Some(2)), (6, Some(9))]);
        s.exclude(1, Some(100));
        assert!(s.is_empty());
    }

    #[test]
    fn test_include_then_exclude_restores() {
        let original = seq(&[(1, Some(3)), (10, Some(12))]);
        let mut s = original.clone();
        s.include(5, Some(7));
        s.exclude(5, Some(7));
        assert_eq!(s, original);

        let mut s = original.clone();
        s.include(20, None);
        s.exclude(20, None);
        assert_eq!(s, original);
    }

    #[test]
    fn test_random_operations_stay_normalized() {
        let mut s = Sequence::new();
        let mut state = 7u64;
        for _ in 0..500 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let start = (state >> 33) % 60 + 1;
            let len = (state >> 20) % 8;
            let end = if (state >> 10) % 10 == 0 {
                None
            } else {
                Some(start + len)
            };
            if (state >> 5) % 2 == 0 {
                s.include(start, end);
            } else {
                s.exclude(start, end);
            }
            assert_normalized(&s);
        }
    }

    #[test]
    fn test_floor_contains_bounds() {
        let mut s = seq(&[(1, Some(4)), (8, None)]);
        assert!(s.contains(3));
        assert!(!s.contains(5));
        assert!(s.contains(1_000));
        assert_eq!(s.first(), Some(1));
        assert_eq!(s.last(), None);
        s.floor(9);
        assert_eq!(s.ranges(), &[(1, Some(4)), (8, Some(9))]);
        assert_eq!(s.last(), Some(9));
        s.floor(2);
        assert_eq!(s.ranges(), &[(1, Some(2))]);
    }

    #[test]
    fn test_intersection_and_complement() {
        let a = seq(&[(1, Some(10)), (20, None)]);
        let b = seq(&[(5, Some(25))]);
        assert_eq!(a.intersection(&b).ranges(), &[(5, Some(10)), (20, Some(25))]);
        assert_eq!(
            seq(&[(2, Some(3)), (6, None)]).complement().ranges(),
            &[(1, Some(1)), (4, Some(5))]
        );
    }

    #[test]
    fn test_json_form() {
        let s = seq(&[(1, Some(2)), (5, None)]);
        assert_eq!(serde_json::to_value(&s).unwrap(), json!([[1, 2], [5, null]]));
        let parsed: Sequence = serde_json::from_value(json!([[4, null], [1, 2], [3, 3]])).unwrap();
        assert_eq!(parsed.ranges(), &[(1, None)]);
    }

    #[test]
    fn test_persistent_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("var/push/sequence");

        let mut pushed = PersistentSequence::open(&path, Sequence::from_start(1)).unwrap();
        assert_eq!(pushed.ranges(), &[(1, None)]);
        pushed.exclude(1, Some(10));
        pushed.commit().unwrap();

        let reopened = PersistentSequence::open(&path, Sequence::new()).unwrap();
        assert_eq!(reopened.ranges(), &[(11, None)]);
    }
}
