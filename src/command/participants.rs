// How one command store relates to a transaction across epochs.

use serde::{Deserialize, Serialize};

use crate::routables::{Ranges, Route};
use crate::time::TxnId;

/// The four participation sets a replica tracks per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParticipants {
    /// The route, full once known. Grows by supplementation.
    route: Option<Route>,
    /// Ranges this store owns in the transaction's coordination epoch.
    owns: Ranges,
    /// Union of ranges this store has owned in any epoch it witnessed the
    /// transaction in.
    touches: Ranges,
    /// Ranges this store owns in the execution epoch, set once `execute_at`
    /// is decided.
    executes: Option<Ranges>,
}

impl StoreParticipants {
    pub fn empty() -> Self {
        Self {
            route: None,
            owns: Ranges::EMPTY,
            touches: Ranges::EMPTY,
            executes: None,
        }
    }

    /// Build from a route view against the store's owned ranges in the
    /// coordination epoch.
    pub fn from_route(route: &Route, owned_at_txn_epoch: &Ranges) -> Self {
        let parts_ranges = route.parts().to_ranges();
        let owns = parts_ranges.intersect(owned_at_txn_epoch);
        Self {
            route: Some(route.clone()),
            owns: owns.clone(),
            touches: owns,
            executes: None,
        }
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn has_full_route(&self) -> bool {
        self.route.as_ref().map(Route::is_full).unwrap_or(false)
    }

    pub fn owns(&self) -> &Ranges {
        &self.owns
    }

    pub fn touches(&self) -> &Ranges {
        &self.touches
    }

    pub fn executes(&self) -> Option<&Ranges> {
        self.executes.as_ref()
    }

    pub fn set_executes(&mut self, owned_at_execute_epoch: &Ranges) {
        let parts = self
            .route
            .as_ref()
            .map(|r| r.parts().to_ranges())
            .unwrap_or(Ranges::EMPTY);
        let executes = parts.intersect(owned_at_execute_epoch);
        self.touches = self.touches.union(&executes);
        self.executes = Some(executes);
    }

    /// Merge route knowledge from an incoming message. Participation sets
    /// only ever grow.
    pub fn supplement(&mut self, route: &Route, owned_at_txn_epoch: &Ranges) {
        self.route = Some(match &self.route {
            None => route.clone(),
            Some(existing) => existing.supplement(route),
        });
        let parts_ranges = self
            .route
            .as_ref()
            .expect("just set")
            .parts()
            .to_ranges();
        let owns = parts_ranges.intersect(owned_at_txn_epoch);
        self.owns = self.owns.union(&owns);
        self.touches = self.touches.union(&owns);
    }

    /// Whether this store has anything left to execute for the transaction.
    pub fn executes_anything(&self) -> bool {
        self.executes.as_ref().map(|r| !r.is_empty()).unwrap_or(false)
    }

    pub fn owns_anything(&self) -> bool {
        !self.owns.is_empty()
    }

    /// Participation summary used by cleanup: `(txn_id)` relevance requires
    /// either ownership or a full route to reason about.
    pub fn is_vestigial_candidate(&self, _txn_id: TxnId) -> bool {
        !self.owns_anything() && !self.executes_anything()
    }
}
