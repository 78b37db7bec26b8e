// Routes: the participant address set of one transaction.

use serde::{Deserialize, Serialize};

use crate::routables::{KeyRange, Ranges, RoutingKey, RoutingKeys};
use crate::time::KeyDomain;

/// The participating addresses of a transaction, in its key domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteParts {
    Keys(RoutingKeys),
    Ranges(Ranges),
}

impl RouteParts {
    pub fn domain(&self) -> KeyDomain {
        match self {
            RouteParts::Keys(_) => KeyDomain::Key,
            RouteParts::Ranges(_) => KeyDomain::Range,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RouteParts::Keys(k) => k.is_empty(),
            RouteParts::Ranges(r) => r.is_empty(),
        }
    }

    pub fn contains(&self, key: &RoutingKey) -> bool {
        match self {
            RouteParts::Keys(k) => k.contains(key),
            RouteParts::Ranges(r) => r.contains(key),
        }
    }

    /// Whether any participant falls inside `range`.
    pub fn intersects(&self, range: &KeyRange) -> bool {
        match self {
            RouteParts::Keys(k) => k.iter().any(|key| range.contains(key)),
            RouteParts::Ranges(r) => r.intersects(range),
        }
    }

    /// The participants inside `ranges`.
    pub fn intersecting(&self, ranges: &Ranges) -> RouteParts {
        match self {
            RouteParts::Keys(k) => RouteParts::Keys(k.intersecting(ranges)),
            RouteParts::Ranges(r) => RouteParts::Ranges(r.intersect(ranges)),
        }
    }

    /// Union; both sides must share a domain.
    pub fn union(&self, other: &RouteParts) -> RouteParts {
        match (self, other) {
            (RouteParts::Keys(a), RouteParts::Keys(b)) => RouteParts::Keys(a.union(b)),
            (RouteParts::Ranges(a), RouteParts::Ranges(b)) => RouteParts::Ranges(a.union(b)),
            // Mixed domains cannot arise from a well-formed transaction;
            // prefer the range side, which subsumes point participants.
            (RouteParts::Ranges(a), RouteParts::Keys(b))
            | (RouteParts::Keys(b), RouteParts::Ranges(a)) => {
                RouteParts::Ranges(a.union(&b.to_point_ranges()))
            }
        }
    }

    /// The covered routing space.
    pub fn to_ranges(&self) -> Ranges {
        match self {
            RouteParts::Keys(k) => k.to_point_ranges(),
            RouteParts::Ranges(r) => r.clone(),
        }
    }
}

/// The full set of participating keys or ranges plus the distinguished home
/// key, or one shard's restriction of that set.
///
/// A partial route carries the ranges it is known to cover; `supplement`
/// merges participant knowledge learned from different messages. Once any
/// contributing view was full, the merged route is full.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    home: RoutingKey,
    parts: RouteParts,
    /// `None` for a full route; the covered ranges for a partial one.
    covering: Option<Ranges>,
}

impl Route {
    pub fn full(home: RoutingKey, parts: RouteParts) -> Self {
        Self {
            home,
            parts,
            covering: None,
        }
    }

    pub fn partial(home: RoutingKey, parts: RouteParts, covering: Ranges) -> Self {
        Self {
            home,
            parts,
            covering: Some(covering),
        }
    }

    pub fn home(&self) -> &RoutingKey {
        &self.home
    }

    pub fn parts(&self) -> &RouteParts {
        &self.parts
    }

    pub fn is_full(&self) -> bool {
        self.covering.is_none()
    }

    pub fn domain(&self) -> KeyDomain {
        self.parts.domain()
    }

    /// Ranges this view is known to cover: everything for a full route.
    pub fn covering(&self) -> Ranges {
        match &self.covering {
            None => self.parts.to_ranges(),
            Some(c) => c.clone(),
        }
    }

    pub fn contains(&self, key: &RoutingKey) -> bool {
        self.parts.contains(key)
    }

    /// Restrict to `ranges`, producing the partial view one shard or store
    /// should see. The home key is retained even when outside the slice.
    pub fn slice(&self, ranges: &Ranges) -> Route {
        Route {
            home: self.home.clone(),
            parts: self.parts.intersecting(ranges),
            covering: Some(self.covering().intersect(ranges)),
        }
    }

    /// Merge participant knowledge from another view of the same
    /// transaction.
    pub fn supplement(&self, other: &Route) -> Route {
        if self.is_full() {
            return self.clone();
        }
        if other.is_full() {
            return other.clone();
        }
        Route {
            home: self.home.clone(),
            parts: self.parts.union(&other.parts),
            covering: Some(self.covering().union(&other.covering())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routables::KeyRange;

    fn rk(s: &str) -> RoutingKey {
        RoutingKey::from(s)
    }

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(rk(a), rk(b))
    }

    fn keys_route(home: &str, keys: &[&str]) -> Route {
        Route::full(
            rk(home),
            RouteParts::Keys(RoutingKeys::new(keys.iter().map(|k| rk(k)).collect())),
        )
    }

    #[test]
    fn test_full_route_covers_its_parts() {
        let route = keys_route("a", &["a", "m"]);
        assert!(route.is_full());
        assert!(route.covering().contains(&rk("a")));
        assert!(route.covering().contains(&rk("m")));
    }

    #[test]
    fn test_slice_is_partial_and_keeps_home() {
        let route = keys_route("a", &["a", "m", "x"]);
        let sliced = route.slice(&Ranges::single(range("l", "n")));
        assert!(!sliced.is_full());
        assert_eq!(sliced.home(), &rk("a"));
        assert!(sliced.contains(&rk("m")));
        assert!(!sliced.contains(&rk("a")));
    }

    #[test]
    fn test_supplement_merges_partials() {
        let route = keys_route("a", &["a", "m", "x"]);
        let left = route.slice(&Ranges::single(range("a", "c")));
        let right = route.slice(&Ranges::single(range("l", "z")));
        let merged = left.supplement(&right);
        assert!(merged.contains(&rk("a")));
        assert!(merged.contains(&rk("m")));
        assert!(merged.contains(&rk("x")));
        assert!(!merged.is_full());
    }

    #[test]
    fn test_supplement_with_full_wins() {
        let route = keys_route("a", &["a", "m"]);
        let partial = route.slice(&Ranges::single(range("a", "c")));
        assert!(partial.supplement(&route).is_full());
        assert!(route.supplement(&partial).is_full());
    }

    #[test]
    fn test_range_route_slice() {
        let route = Route::full(rk("a"), RouteParts::Ranges(Ranges::single(range("a", "z"))));
        let sliced = route.slice(&Ranges::single(range("m", "p")));
        assert!(sliced.contains(&rk("n")));
        assert!(!sliced.contains(&rk("b")));
    }
}
