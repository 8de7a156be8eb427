//! Next-hop selection between brokers.
//!
//! The shortest-path computation itself lives outside this crate; the
//! routing engine only asks which neighbor to forward through.

use crate::key::BrokerId;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Source of next-hop decisions.
pub trait RouteSelector: Send + Sync {
    /// Neighbor on the currently best path towards `target`, or `None` when
    /// `target` is unreachable.
    fn next_hop(&self, target: BrokerId) -> Option<BrokerId>;

    /// Link weight towards a direct neighbor. Only used as routing input.
    fn weight(&self, _peer: BrokerId) -> u16 {
        1
    }
}

#[derive(Debug, Default)]
struct RouteState {
    next_hops: BTreeMap<BrokerId, BrokerId>,
    weights: BTreeMap<BrokerId, u16>,
}

/// A route table filled in by whoever owns link state.
///
/// Updates go through `&self` so that the table can be shared between the
/// link layer and the routing engine.
#[derive(Debug, Default)]
pub struct StaticRouteTable {
    state: RwLock<RouteState>,
}

impl StaticRouteTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table from `(target, next_hop)` pairs.
    #[must_use]
    pub fn with_routes(routes: impl IntoIterator<Item = (BrokerId, BrokerId)>) -> Self {
        let table = Self::new();
        for (target, next_hop) in routes {
            table.set_route(target, next_hop);
        }
        table
    }

    /// Route `target` through `next_hop`.
    ///
    /// Returns `true` if the next hop changed.
    pub fn set_route(&self, target: BrokerId, next_hop: BrokerId) -> bool {
        self.state.write().next_hops.insert(target, next_hop) != Some(next_hop)
    }

    /// Mark `target` unreachable.
    ///
    /// Returns `true` if a route existed.
    pub fn remove_route(&self, target: BrokerId) -> bool {
        self.state.write().next_hops.remove(&target).is_some()
    }

    /// Set the link weight towards a direct neighbor.
    pub fn set_weight(&self, peer: BrokerId, weight: u16) {
        self.state.write().weights.insert(peer, weight);
    }

    /// All reachable targets.
    #[must_use]
    pub fn targets(&self) -> Vec<BrokerId> {
        self.state.read().next_hops.keys().copied().collect()
    }
}

impl RouteSelector for StaticRouteTable {
    fn next_hop(&self, target: BrokerId) -> Option<BrokerId> {
        self.state.read().next_hops.get(&target).copied()
    }

    fn weight(&self, peer: BrokerId) -> u16 {
        self.state.read().weights.get(&peer).copied().unwrap_or(1)
    }
}
