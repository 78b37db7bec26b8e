// Sorted, deduplicated key containers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routables::{Key, KeyRange, Ranges, RoutingKey};

/// An ordered set of user keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keys(Vec<Key>);

impl Keys {
    pub const EMPTY: Keys = Keys(Vec::new());

    pub fn new(mut keys: Vec<Key>) -> Self {
        keys.sort();
        keys.dedup();
        Keys(keys)
    }

    pub fn single(key: Key) -> Self {
        Keys(vec![key])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.0.binary_search(key).is_ok()
    }

    pub fn union(&self, other: &Keys) -> Keys {
        merge_sorted(&self.0, &other.0, Keys)
    }

    pub fn without(&self, other: &Keys) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|k| !other.contains(k))
                .cloned()
                .collect(),
        )
    }

    /// Keys whose routing position falls inside any of `ranges`.
    pub fn intersecting(&self, ranges: &Ranges) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|k| ranges.contains(&k.routing()))
                .cloned()
                .collect(),
        )
    }

    /// Keys inside one half-open range.
    pub fn slice(&self, range: &KeyRange) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|k| range.contains(&k.routing()))
                .cloned()
                .collect(),
        )
    }

    pub fn routing_keys(&self) -> RoutingKeys {
        RoutingKeys::new(self.0.iter().map(|k| k.routing()).collect())
    }
}

impl FromIterator<Key> for Keys {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        Keys::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, k) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", k)?;
        }
        write!(f, "}}")
    }
}

/// An ordered set of routing keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKeys(Vec<RoutingKey>);

impl RoutingKeys {
    pub const EMPTY: RoutingKeys = RoutingKeys(Vec::new());

    pub fn new(mut keys: Vec<RoutingKey>) -> Self {
        keys.sort();
        keys.dedup();
        RoutingKeys(keys)
    }

    pub fn single(key: RoutingKey) -> Self {
        RoutingKeys(vec![key])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingKey> {
        self.0.iter()
    }

    pub fn contains(&self, key: &RoutingKey) -> bool {
        self.0.binary_search(key).is_ok()
    }

    pub fn union(&self, other: &RoutingKeys) -> RoutingKeys {
        merge_sorted(&self.0, &other.0, RoutingKeys)
    }

    pub fn without(&self, other: &RoutingKeys) -> RoutingKeys {
        RoutingKeys(
            self.0
                .iter()
                .filter(|k| !other.contains(k))
                .cloned()
                .collect(),
        )
    }

    pub fn intersecting(&self, ranges: &Ranges) -> RoutingKeys {
        RoutingKeys(
            self.0
                .iter()
                .filter(|k| ranges.contains(k))
                .cloned()
                .collect(),
        )
    }

    pub fn slice(&self, range: &KeyRange) -> RoutingKeys {
        RoutingKeys(
            self.0
                .iter()
                .filter(|k| range.contains(k))
                .cloned()
                .collect(),
        )
    }

    /// The tightest range set covering exactly these keys: one point range
    /// per key, adjacent points coalesced by `Ranges::new`.
    pub fn to_point_ranges(&self) -> Ranges {
        Ranges::new(
            self.0
                .iter()
                .map(|k| KeyRange::new(k.clone(), k.successor()))
                .collect(),
        )
    }
}

impl FromIterator<RoutingKey> for RoutingKeys {
    fn from_iter<I: IntoIterator<Item = RoutingKey>>(iter: I) -> Self {
        RoutingKeys::new(iter.into_iter().collect())
    }
}

fn merge_sorted<T: Ord + Clone, R>(a: &[T], b: &[T], wrap: impl Fn(Vec<T>) -> R) -> R {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out.extend(a[i..].iter().cloned());
    out.extend(b[j..].iter().cloned());
    wrap(out)
}
