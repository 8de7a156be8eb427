//! Redirection bookkeeping for active subscriptions.
//!
//! When the route towards the authority of an active request changes, the
//! new legs are subscribed while the old ones keep delivering. The task
//! records the highest delivery index seen through every participating next
//! hop; cutover is safe once each new winning hop has caught up with the
//! last index delivered over the old hops.

use crate::key::BrokerId;
use crate::subscription::{LegPlan, OutgoingLeg, RequestId};
use std::collections::BTreeMap;
use std::time::Instant;

/// Which side of a redirection a delivery arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Through a hop of the route being replaced
    Old,
    /// Through a hop of the route being confirmed
    New,
    /// Through a hop present on both routes
    Both,
    /// Through a hop the task does not know
    Unrelated,
}

/// A pending switch from the current legs of a request to new ones.
#[derive(Debug, Clone)]
pub struct RedirectionTask {
    /// Request being redirected
    pub request: RequestId,
    /// Grouping the new legs were built from
    pub plan: LegPlan,
    /// New legs, subscribed in parallel with the old ones
    pub new_legs: Vec<OutgoingLeg>,
    /// When the task was created
    pub started: Instant,
    old_hops: Vec<BrokerId>,
    old_last: BTreeMap<BrokerId, u64>,
    new_last: BTreeMap<BrokerId, u64>,
}

impl RedirectionTask {
    /// Create a task replacing the legs through `old_hops`.
    ///
    /// `seed` is the last index already delivered over the old route, if any.
    #[must_use]
    pub fn new(
        request: RequestId,
        old_hops: Vec<BrokerId>,
        seed: Option<u64>,
        plan: LegPlan,
        new_legs: Vec<OutgoingLeg>,
        started: Instant,
    ) -> Self {
        let old_last = seed
            .map(|index| old_hops.iter().map(|&hop| (hop, index)).collect())
            .unwrap_or_default();
        Self {
            request,
            plan,
            new_legs,
            started,
            old_hops,
            old_last,
            new_last: BTreeMap::new(),
        }
    }

    /// Hops of the route being replaced.
    #[must_use]
    pub fn old_hops(&self) -> &[BrokerId] {
        &self.old_hops
    }

    /// Whether `hop` carries one of the new legs.
    #[must_use]
    pub fn is_new_hop(&self, hop: BrokerId) -> bool {
        self.new_legs.iter().any(|leg| leg.next_hop == hop)
    }

    /// Record a delivered index seen through `hop`.
    pub fn record_delivery(&mut self, hop: BrokerId, index: u64) -> DeliveryPath {
        let old = self.old_hops.contains(&hop);
        let new = self.is_new_hop(hop);
        if old {
            let last = self.old_last.entry(hop).or_insert(index);
            *last = (*last).max(index);
        }
        if new {
            let last = self.new_last.entry(hop).or_insert(index);
            *last = (*last).max(index);
        }
        match (old, new) {
            (true, true) => DeliveryPath::Both,
            (true, false) => DeliveryPath::Old,
            (false, true) => DeliveryPath::New,
            (false, false) => DeliveryPath::Unrelated,
        }
    }

    /// Highest index delivered over the old route.
    #[must_use]
    pub fn old_high_water(&self) -> Option<u64> {
        self.old_last.values().copied().max()
    }

    /// Whether switching to `new_winners` can neither skip nor repeat data.
    ///
    /// Every old hop that delivered something must be matched by each new
    /// winning hop having delivered an index at least as high.
    #[must_use]
    pub fn is_safe(&self, new_winners: &[BrokerId]) -> bool {
        self.old_hops.iter().all(|old_hop| {
            let Some(&old_index) = self.old_last.get(old_hop) else {
                return true;
            };
            new_winners.iter().all(|new_hop| {
                self.new_last
                    .get(new_hop)
                    .is_some_and(|&new_index| new_index >= old_index)
            })
        })
    }
}
