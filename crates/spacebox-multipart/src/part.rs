//! Half-open byte ranges and the uploaded-part list.
//!
//! The uploaded list is kept sorted, pairwise disjoint and coalesced: after
//! every merge no two entries touch.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Byte range `[start, end)` of the target object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Part {
    pub start: u64,
    pub end: u64,
}

impl Part {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// `other` lies entirely within `self`.
    pub fn contains(&self, other: &Part) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The two ranges share at least one byte.
    pub fn intersects(&self, other: &Part) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Relation of a candidate range to an uploaded-part list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// No byte of the candidate is uploaded yet.
    Disjoint,
    /// Every byte is already inside one uploaded part.
    Contained,
    /// Some but not all bytes are uploaded; carries the first offender.
    Partial(Part),
}

/// Classify `candidate` against a sorted, coalesced list.
pub fn classify(parts: &[Part], candidate: Part) -> Coverage {
    for part in parts {
        if part.contains(&candidate) {
            return Coverage::Contained;
        }
        if part.intersects(&candidate) {
            return Coverage::Partial(*part);
        }
    }
    Coverage::Disjoint
}

/// Insert `part` and coalesce neighbours that overlap or touch.
pub fn merge(parts: &mut Vec<Part>, part: Part) {
    let idx = parts.partition_point(|p| p.start < part.start);
    parts.insert(idx, part);

    let mut merged: Vec<Part> = Vec::with_capacity(parts.len());
    for p in parts.drain(..) {
        match merged.last_mut() {
            Some(last) if p.start <= last.end => last.end = last.end.max(p.end),
            _ => merged.push(p),
        }
    }
    *parts = merged;
}

/// Whether `range` is fully covered by one part of a coalesced list.
pub fn covers(parts: &[Part], range: Part) -> bool {
    parts.iter().any(|p| p.contains(&range))
}

/// Total uploaded bytes.
pub fn total_len(parts: &[Part]) -> u64 {
    parts.iter().map(Part::len).sum()
}
