// Latest-known dependencies, merged across recovery replies.
//
// Each reply contributes, per range it owns, how far dependency knowledge
// had progressed (proposed, fixed by a coordinator, committed) together with
// the deps themselves and the ballot they were recorded under. The merge is
// commutative and associative so the recovery outcome does not depend on
// reply order.

use serde::{Deserialize, Serialize};

use crate::deps::Deps;
use crate::routables::{KeyRange, Ranges, RoutingKey};
use crate::time::Ballot;

/// How far dependency knowledge has progressed for a range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DepsKnownLevel {
    /// Nothing witnessed.
    Unknown,
    /// Locally computed at PreAccept, or still open to additions under a
    /// slow-path Accept.
    Proposed,
    /// Fixed by a coordinator proposal (medium-path Accept) under a ballot.
    ProposedFixed,
    /// Committed; the decision is final.
    Committed,
    /// Committed and stable: the execution set is final.
    Known,
}

/// One range's contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestEntry {
    pub level: DepsKnownLevel,
    pub ballot: Ballot,
    /// Deps fixed by a coordinator (level >= ProposedFixed).
    pub coordinated: Option<Deps>,
    /// Locally witnessed deps (level <= Proposed).
    pub local: Option<Deps>,
}

impl LatestEntry {
    pub fn proposed(ballot: Ballot, local: Deps) -> Self {
        Self {
            level: DepsKnownLevel::Proposed,
            ballot,
            coordinated: None,
            local: Some(local),
        }
    }

    pub fn fixed(ballot: Ballot, coordinated: Deps) -> Self {
        Self {
            level: DepsKnownLevel::ProposedFixed,
            ballot,
            coordinated: Some(coordinated),
            local: None,
        }
    }

    pub fn decided(level: DepsKnownLevel, deps: Deps) -> Self {
        debug_assert!(level >= DepsKnownLevel::Committed);
        Self {
            level,
            ballot: Ballot::ZERO,
            coordinated: Some(deps),
            local: None,
        }
    }

    /// The deps this entry stands for.
    pub fn deps(&self) -> Deps {
        match self.level {
            DepsKnownLevel::Unknown | DepsKnownLevel::Proposed => {
                self.local.clone().unwrap_or(Deps::EMPTY)
            }
            _ => self.coordinated.clone().unwrap_or(Deps::EMPTY),
        }
    }

    fn merge(a: &LatestEntry, b: &LatestEntry) -> LatestEntry {
        use DepsKnownLevel::*;
        let level = a.level.max(b.level);
        match level {
            Unknown | Proposed => {
                // Union local knowledge regardless of ballot.
                let local = match (&a.local, &b.local) {
                    (Some(x), Some(y)) => Some(x.with(y)),
                    (Some(x), None) | (None, Some(x)) => Some(x.clone()),
                    (None, None) => None,
                };
                LatestEntry {
                    level,
                    ballot: a.ballot.max(b.ballot),
                    coordinated: None,
                    local,
                }
            }
            ProposedFixed => {
                // The highest (level, ballot) proposal verbatim.
                let winner = if (a.level, a.ballot) >= (b.level, b.ballot) {
                    a
                } else {
                    b
                };
                winner.clone()
            }
            Committed | Known => {
                // Decided; every decided reply agrees, keep the higher level.
                if (a.level, a.ballot) >= (b.level, b.ballot) {
                    a.clone()
                } else {
                    b.clone()
                }
            }
        }
    }
}

/// Interval map from ranges to the latest known dependency state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestDeps {
    /// Sorted, non-overlapping.
    entries: Vec<(KeyRange, LatestEntry)>,
}

impl LatestDeps {
    pub const EMPTY: LatestDeps = LatestDeps {
        entries: Vec::new(),
    };

    pub fn single(range: KeyRange, entry: LatestEntry) -> Self {
        LatestDeps {
            entries: vec![(range, entry)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(KeyRange, LatestEntry)> {
        self.entries.iter()
    }

    pub fn covering(&self) -> Ranges {
        Ranges::new(self.entries.iter().map(|(r, _)| r.clone()).collect())
    }

    pub fn insert(&mut self, range: KeyRange, entry: LatestEntry) {
        let addition = LatestDeps::single(range, entry);
        *self = LatestDeps::merge(self, &addition);
    }

    /// Commutative, associative merge; `EMPTY` is the identity.
    pub fn merge(a: &LatestDeps, b: &LatestDeps) -> LatestDeps {
        if a.is_empty() {
            return b.clone();
        }
        if b.is_empty() {
            return a.clone();
        }

        // Split both maps at every boundary, then merge per elementary
        // interval.
        let mut bounds: Vec<RoutingKey> = Vec::new();
        for (r, _) in a.entries.iter().chain(b.entries.iter()) {
            bounds.push(r.start().clone());
            bounds.push(r.end().clone());
        }
        bounds.sort();
        bounds.dedup();

        let mut out = Vec::new();
        for pair in bounds.windows(2) {
            let piece = KeyRange::new(pair[0].clone(), pair[1].clone());
            let in_a = a.entry_covering(piece.start());
            let in_b = b.entry_covering(piece.start());
            let merged = match (in_a, in_b) {
                (Some(x), Some(y)) => Some(LatestEntry::merge(x, y)),
                (Some(x), None) | (None, Some(x)) => Some(x.clone()),
                (None, None) => None,
            };
            if let Some(entry) = merged {
                out.push((piece, entry));
            }
        }

        // Re-coalesce adjacent pieces with identical entries.
        let mut coalesced: Vec<(KeyRange, LatestEntry)> = Vec::with_capacity(out.len());
        for (range, entry) in out {
            match coalesced.last_mut() {
                Some((prev, prev_entry))
                    if prev.end() == range.start() && *prev_entry == entry =>
                {
                    *prev = KeyRange::new(prev.start().clone(), range.end().clone());
                }
                _ => coalesced.push((range, entry)),
            }
        }
        LatestDeps { entries: coalesced }
    }

    fn entry_covering(&self, key: &RoutingKey) -> Option<&LatestEntry> {
        self.entries
            .iter()
            .find(|(r, _)| r.contains(key))
            .map(|(_, e)| e)
    }

    /// The highest knowledge level anywhere in the map.
    pub fn max_level(&self) -> DepsKnownLevel {
        self.entries
            .iter()
            .map(|(_, e)| e.level)
            .max()
            .unwrap_or(DepsKnownLevel::Unknown)
    }

    /// The lowest knowledge level anywhere in the map.
    pub fn min_level(&self) -> DepsKnownLevel {
        self.entries
            .iter()
            .map(|(_, e)| e.level)
            .min()
            .unwrap_or(DepsKnownLevel::Unknown)
    }

    /// Union of the deps each range stands for: the recovery proposal.
    pub fn merge_proposal(&self) -> Deps {
        let mut out = Deps::EMPTY;
        for (_, entry) in &self.entries {
            out = out.with(&entry.deps());
        }
        out
    }

    /// The highest ballot recorded anywhere.
    pub fn max_ballot(&self) -> Ballot {
        self.entries
            .iter()
            .map(|(_, e)| e.ballot)
            .max()
            .unwrap_or(Ballot::ZERO)
    }
}
