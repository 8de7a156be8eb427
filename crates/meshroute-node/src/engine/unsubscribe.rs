//! Unsubscription and connection teardown.

use super::RoutingEngine;
use meshroute_core::{ApplicationId, DataItemKey, Origin, ReceiptState, RequestKey, Role, Upstream};
use std::time::Instant;

impl RoutingEngine {
    /// A local application drops its subscription. Unknown requests are
    /// ignored.
    pub fn unsubscribe(&mut self, app: ApplicationId, key: DataItemKey, role: Role, now: Instant) {
        self.remove_request(&RequestKey::application(app, key, role), now);
    }

    /// A connection went away: everything it subscribed is dropped.
    ///
    /// For a neighbor, legs through it are forgotten without telegrams and
    /// the requests that used them are routed again. Requests that only
    /// redirected through it drop the redirection and keep their route.
    pub fn connection_closed(&mut self, origin: Origin, now: Instant) {
        let owned = self.registry.find_by_origin(origin);
        tracing::info!(origin = %origin, requests = owned.len(), "Connection closed");

        let mut through = Vec::new();
        let mut redirected = Vec::new();
        if let Origin::Transmitter(neighbor) = origin {
            through = self.registry.find_by_next_hop(neighbor);
            redirected = self
                .redirections
                .values()
                .filter(|task| task.is_new_hop(neighbor) || task.old_hops().contains(&neighbor))
                .map(|task| task.request)
                .filter(|id| !through.contains(id))
                .collect();
            // Nothing can be sent over the closed connection.
            self.legs.retain(|signature, _| signature.hop() != neighbor);
        }

        for id in owned {
            if let Some(ident) = self.registry.get(id).map(|request| request.ident.clone()) {
                self.remove_request(&ident, now);
            }
        }

        let Origin::Transmitter(neighbor) = origin else {
            return;
        };
        let adverts_changed = self.adverts.on_neighbor_closed(neighbor, &mut self.outbox);
        // Only an unconfirmed redirection went through the neighbor: the
        // established legs keep delivering.
        for id in redirected {
            self.cancel_redirection(id);
            self.route_request(id, now);
        }
        for id in through {
            if self.registry.get(id).is_none() {
                continue;
            }
            self.cancel_redirection(id);
            self.release_legs(id);
            if let Some(request) = self.registry.get_mut(id) {
                request.plan.clear();
                request.state = ReceiptState::Pending;
                request.central = None;
            }
            self.route_request(id, now);
        }
        if adverts_changed {
            self.reroute_all(now);
        }
    }

    /// Remove a request and undo what it caused.
    ///
    /// Legs shared with other requests stay subscribed. Participants bound to
    /// a removed central role are routed again.
    pub(super) fn remove_request(&mut self, ident: &RequestKey, now: Instant) {
        let Some(id) = self.registry.lookup(ident) else {
            tracing::debug!(origin = %ident.origin, key = %ident.key, role = %ident.role, "Unsubscribe for unknown request");
            return;
        };
        let dependents = self.registry.find_involved(id);
        self.cancel_redirection(id);
        self.release_legs(id);
        let Some(request) = self.registry.remove_id(id) else {
            return;
        };
        let key = request.key();
        let role = request.role();
        tracing::debug!(request = %id, origin = %request.origin(), key = %key, role = %role, "Request removed");

        if role.is_central() && request.state == ReceiptState::Positive {
            self.adverts.remove_local(&key, now);
            tracing::info!(origin = %request.origin(), key = %key, role = %role, "Central role removed");
            for other in dependents {
                if let Some(dependent) = self.registry.get_mut(other) {
                    if dependent.upstream == Upstream::Local {
                        dependent.upstream = Upstream::Unbound;
                        dependent.state = ReceiptState::Pending;
                        dependent.central = None;
                    }
                }
                self.route_request(other, now);
            }
        }
        self.update_flow(key);

        if self.registry.find_by_key(&key).is_empty() {
            self.cache.evict(&key);
        }
    }
}
