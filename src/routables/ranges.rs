// Half-open routing-key ranges and normalized range sets.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routables::RoutingKey;

/// A half-open interval `[start, end)` of the routing space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: RoutingKey,
    end: RoutingKey,
}

impl KeyRange {
    /// Invariant: `start < end`. Empty ranges are never constructed.
    pub fn new(start: RoutingKey, end: RoutingKey) -> Self {
        debug_assert!(start < end, "empty or inverted range");
        Self { start, end }
    }

    pub fn start(&self) -> &RoutingKey {
        &self.start
    }

    pub fn end(&self) -> &RoutingKey {
        &self.end
    }

    pub fn contains(&self, key: &RoutingKey) -> bool {
        *key >= self.start && *key < self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.intersects(other) {
            return None;
        }
        let start = self.start.clone().max(other.start.clone());
        let end = self.end.clone().min(other.end.clone());
        Some(KeyRange::new(start, end))
    }

    pub fn fully_contains(&self, other: &KeyRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl PartialOrd for KeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

/// A normalized set of ranges: sorted by start, non-overlapping, with
/// adjacent ranges coalesced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ranges(Vec<KeyRange>);

impl Ranges {
    pub const EMPTY: Ranges = Ranges(Vec::new());

    pub fn new(mut ranges: Vec<KeyRange>) -> Self {
        ranges.sort();
        let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                Some(prev) if *prev.end() >= *r.start() => {
                    if *r.end() > *prev.end() {
                        *prev = KeyRange::new(prev.start().clone(), r.end().clone());
                    }
                }
                _ => out.push(r),
            }
        }
        Ranges(out)
    }

    pub fn single(range: KeyRange) -> Self {
        Ranges(vec![range])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.0.iter()
    }

    pub fn contains(&self, key: &RoutingKey) -> bool {
        // Last range starting at or before `key`.
        let idx = self.0.partition_point(|r| r.start() <= key);
        idx > 0 && self.0[idx - 1].contains(key)
    }

    pub fn intersects(&self, range: &KeyRange) -> bool {
        self.0.iter().any(|r| r.intersects(range))
    }

    pub fn union(&self, other: &Ranges) -> Ranges {
        let mut all = self.0.clone();
        all.extend(other.0.iter().cloned());
        Ranges::new(all)
    }

    /// Set difference: everything in `self` not covered by `other`.
    pub fn without(&self, other: &Ranges) -> Ranges {
        let mut out = Vec::new();
        for r in &self.0 {
            let mut cursor = r.start().clone();
            for cut in other.0.iter().filter(|c| c.intersects(r)) {
                if *cut.start() > cursor {
                    out.push(KeyRange::new(cursor.clone(), cut.start().clone()));
                }
                if *cut.end() > cursor {
                    cursor = cut.end().clone();
                }
                if cursor >= *r.end() {
                    break;
                }
            }
            if cursor < *r.end() {
                out.push(KeyRange::new(cursor, r.end().clone()));
            }
        }
        Ranges(out)
    }

    pub fn intersect(&self, other: &Ranges) -> Ranges {
        let mut out = Vec::new();
        for a in &self.0 {
            for b in other.0.iter().filter(|b| b.intersects(a)) {
                if let Some(r) = a.intersect(b) {
                    out.push(r);
                }
            }
        }
        Ranges::new(out)
    }

    /// The portion of `self` inside one range.
    pub fn slice(&self, range: &KeyRange) -> Ranges {
        Ranges(self.0.iter().filter_map(|r| r.intersect(range)).collect())
    }

    /// Whether `self` covers every point of `other`.
    pub fn covers(&self, other: &Ranges) -> bool {
        other.without(self).is_empty()
    }
}

impl FromIterator<KeyRange> for Ranges {
    fn from_iter<I: IntoIterator<Item = KeyRange>>(iter: I) -> Self {
        Ranges::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", r)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(RoutingKey::from(a), RoutingKey::from(b))
    }

    #[test]
    fn test_new_coalesces_overlap_and_adjacency() {
        let r = Ranges::new(vec![range("a", "c"), range("b", "d"), range("d", "e"), range("x", "z")]);
        assert_eq!(r.len(), 2);
        let parts: Vec<_> = r.iter().cloned().collect();
        assert_eq!(parts[0], range("a", "e"));
        assert_eq!(parts[1], range("x", "z"));
    }

    #[test]
    fn test_contains_respects_half_open_bounds() {
        let r = Ranges::single(range("b", "d"));
        assert!(!r.contains(&RoutingKey::from("a")));
        assert!(r.contains(&RoutingKey::from("b")));
        assert!(r.contains(&RoutingKey::from("c")));
        assert!(!r.contains(&RoutingKey::from("d")));
    }

    #[test]
    fn test_without_splits_around_cut() {
        let r = Ranges::single(range("a", "z"));
        let cut = Ranges::single(range("m", "p"));
        let rest = r.without(&cut);
        assert_eq!(rest.len(), 2);
        assert!(rest.contains(&RoutingKey::from("a")));
        assert!(!rest.contains(&RoutingKey::from("m")));
        assert!(!rest.contains(&RoutingKey::from("o")));
        assert!(rest.contains(&RoutingKey::from("p")));
    }

    #[test]
    fn test_without_multiple_cuts_in_one_range() {
        let r = Ranges::single(range("a", "z"));
        let cuts = Ranges::new(vec![range("c", "e"), range("g", "i")]);
        let rest = r.without(&cuts);
        assert_eq!(rest.len(), 3);
        assert!(rest.contains(&RoutingKey::from("b")));
        assert!(!rest.contains(&RoutingKey::from("d")));
        assert!(rest.contains(&RoutingKey::from("f")));
        assert!(!rest.contains(&RoutingKey::from("h")));
        assert!(rest.contains(&RoutingKey::from("j")));
    }

    #[test]
    fn test_intersect_symmetry() {
        let a = Ranges::new(vec![range("a", "f"), range("m", "q")]);
        let b = Ranges::new(vec![range("d", "n")]);
        let ab = a.intersect(&b);
        let ba = b.intersect(&a);
        assert_eq!(ab, ba);
        assert!(ab.contains(&RoutingKey::from("e")));
        assert!(ab.contains(&RoutingKey::from("m")));
        assert!(!ab.contains(&RoutingKey::from("g")));
    }

    #[test]
    fn test_covers() {
        let whole = Ranges::single(range("a", "z"));
        let parts = Ranges::new(vec![range("b", "c"), range("x", "y")]);
        assert!(whole.covers(&parts));
        assert!(!parts.covers(&whole));
        assert!(whole.covers(&Ranges::EMPTY));
    }
}
