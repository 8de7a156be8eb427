//! Subscription requests: central roles, participants and neighbor requests.

use super::RoutingEngine;
use crate::error::RoutingError;
use crate::outbox::ApplicationEvent;
use meshroute_core::{
    ApplicationId, BrokerId, DataItemKey, LegPlan, Origin, Principal, ReceiptState, RequestId,
    RequestKey, Role, StatusCode, SubscriptionRequest, Upstream, UserId,
};
use meshroute_proto::{Telegram, TransmitterDataSubscription, TransmitterDataSubscriptionReceipt};
use std::collections::BTreeMap;
use std::time::Instant;

impl RoutingEngine {
    /// A local application asks to become Source or Drain for `key`.
    ///
    /// Participants already registered for `key` are re-bound to the new
    /// holder. Denied rights are reported through the application callback.
    ///
    /// # Errors
    ///
    /// Returns error if `role` is not a central role or if another local
    /// connection already holds a central role for `key`.
    pub fn request_central_role(
        &mut self,
        app: ApplicationId,
        user: UserId,
        key: DataItemKey,
        role: Role,
        now: Instant,
    ) -> Result<RequestId, RoutingError> {
        if !role.is_central() {
            return Err(RoutingError::RoleMismatch { role });
        }
        let ident = RequestKey::application(app, key, role);
        if let Some(holder) = self.registry.local_central(&key) {
            if self.registry.lookup(&ident) == Some(holder) {
                return Ok(holder);
            }
            let holder = self
                .registry
                .get(holder)
                .map_or(Origin::Application(app), SubscriptionRequest::origin);
            tracing::debug!(app = %app, key = %key, role = %role, holder = %holder, "Central role already taken");
            return Err(RoutingError::CentralRoleTaken { key, holder });
        }

        let principal = Principal::User(user);
        let (id, _) = self.registry.put(ident, principal);
        if !self.rights.is_allowed(principal, &key, role) {
            tracing::info!(app = %app, key = %key, role = %role, "Central role denied");
            if let Some(request) = self.registry.get_mut(id) {
                request.state = ReceiptState::PositiveNoRight;
                request.central = None;
            }
            self.notify(id);
            return Ok(id);
        }

        if let Some(request) = self.registry.get_mut(id) {
            request.state = ReceiptState::Positive;
            request.central = Some(self.own);
            request.upstream = Upstream::Local;
            request.notified = Some((ReceiptState::Positive, Some(self.own)));
            request.send_enabled = false;
        }
        self.adverts.add_local(&key, now);
        tracing::info!(app = %app, key = %key, role = %role, "Central role installed");

        let participant = role.participant_counterpart();
        for other in self.registry.find_by_key(&key) {
            let bound = other != id
                && self
                    .registry
                    .get(other)
                    .is_some_and(|request| request.role() == participant);
            if bound {
                self.bind_local(other);
            }
        }
        Ok(id)
    }

    /// A local application asks to become Sender or Receiver for `key`.
    ///
    /// A repeated identical request is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if `role` is a central role.
    pub fn request_participant(
        &mut self,
        app: ApplicationId,
        user: UserId,
        key: DataItemKey,
        role: Role,
        now: Instant,
    ) -> Result<RequestId, RoutingError> {
        if role.is_central() {
            return Err(RoutingError::RoleMismatch { role });
        }
        let (id, inserted) = self
            .registry
            .put(RequestKey::application(app, key, role), Principal::User(user));
        if inserted {
            tracing::debug!(request = %id, app = %app, key = %key, role = %role, "Participant request");
            self.route_request(id, now);
        }
        Ok(id)
    }

    pub(super) fn handle_subscription(
        &mut self,
        from: BrokerId,
        subscription: TransmitterDataSubscription,
        now: Instant,
    ) {
        let TransmitterDataSubscription {
            key,
            role,
            candidates,
        } = subscription;
        if role.is_central() || candidates.is_empty() {
            tracing::debug!(from = %from, key = %key, role = %role, "Rejecting subscription without candidates");
            self.outbox.neighbor(
                from,
                Telegram::Receipt(TransmitterDataSubscriptionReceipt {
                    key,
                    role,
                    candidates,
                    state: ReceiptState::Negative,
                    central: None,
                }),
            );
            return;
        }

        let ident = RequestKey::transmitter(from, key, role, candidates);
        let (id, inserted) = self.registry.put(ident, Principal::Transmitter(from));
        if inserted {
            self.route_request(id, now);
            return;
        }
        // Same subscription again: replay a terminal outcome.
        if let Some(request) = self.registry.get_mut(id) {
            if request.state.is_terminal() {
                request.notified = None;
                request.last_delivered = None;
            }
        }
        self.notify(id);
    }

    /// Resolve a participant request against the current local central
    /// roles, routes and advertisements.
    ///
    /// Unchanged routing leaves the request alone. An established route that
    /// changed is redirected instead of replaced.
    pub(super) fn route_request(&mut self, id: RequestId, now: Instant) {
        let Some(request) = self.registry.get(id) else {
            return;
        };
        let key = request.key();
        let role = request.role();
        if role.is_central() {
            return;
        }
        if self.registry.local_central_for(&key, role).is_some() {
            self.bind_local(id);
            return;
        }
        if matches!(request.origin(), Origin::Application(_))
            && !self.rights.is_allowed(request.principal, &key, role)
        {
            self.cancel_redirection(id);
            self.fail(id, ReceiptState::PositiveNoRight);
            if let Some(request) = self.registry.get_mut(id) {
                request.plan.clear();
            }
            return;
        }

        let candidates = self.candidates_for(request);
        let plan = self.plan_for(request, &candidates);
        let current = match &request.upstream {
            Upstream::Local => false,
            Upstream::Legs(_) => plan == request.plan,
            Upstream::Unbound => {
                plan == request.plan
                    && matches!(
                        request.state,
                        ReceiptState::Negative | ReceiptState::MultiplePositive
                    )
            }
        };
        let established = request.state.found_authority() && !request.upstream.legs().is_empty();

        if let Some(task) = self.redirections.get(&id) {
            if task.plan == plan {
                return;
            }
            if current {
                tracing::debug!(request = %id, "Route restored, dropping redirection");
                self.cancel_redirection(id);
                return;
            }
        }
        if current {
            return;
        }
        if let Some(request) = self.registry.get_mut(id) {
            request.candidates = candidates;
        }

        if plan.is_empty() {
            tracing::debug!(request = %id, key = %key, role = %role, "No route to a central broker");
            self.cancel_redirection(id);
            self.fail(id, ReceiptState::Negative);
            if let Some(request) = self.registry.get_mut(id) {
                request.plan.clear();
            }
            return;
        }
        if established {
            self.start_redirection(id, plan, now);
            return;
        }

        self.cancel_redirection(id);
        self.release_legs(id);
        let legs = self.acquire_plan(key, role, &plan);
        if let Some(request) = self.registry.get_mut(id) {
            request.plan = plan;
            request.upstream = Upstream::Legs(legs);
            request.state = ReceiptState::Pending;
            request.central = None;
        }
        self.evaluate(id);
    }

    fn candidates_for(&self, request: &SubscriptionRequest) -> Vec<BrokerId> {
        match request.origin() {
            Origin::Application(_) => self.adverts.potential_central_brokers(&request.key()),
            Origin::Transmitter(_) => request.ident.candidates.clone(),
        }
    }

    /// Group candidates by next hop, skipping this broker and the neighbor
    /// the request came from.
    fn plan_for(&self, request: &SubscriptionRequest, candidates: &[BrokerId]) -> LegPlan {
        let asker = request.origin().neighbor();
        let mut groups: BTreeMap<BrokerId, Vec<BrokerId>> = BTreeMap::new();
        for &candidate in candidates {
            if candidate == self.own || Some(candidate) == asker {
                continue;
            }
            let Some(hop) = self.routes.next_hop(candidate) else {
                continue;
            };
            if hop == self.own || Some(hop) == asker {
                continue;
            }
            groups.entry(hop).or_default().push(candidate);
        }
        groups.into_iter().collect()
    }

    /// Drop whatever served a participant and bind it to the local central
    /// role.
    pub(super) fn bind_local(&mut self, id: RequestId) {
        self.cancel_redirection(id);
        self.release_legs(id);
        let Some(request) = self.registry.get_mut(id) else {
            return;
        };
        request.upstream = Upstream::Local;
        request.plan.clear();
        let key = request.key();
        let role = request.role();
        let allowed = self.rights.is_allowed(request.principal, &key, role);
        request.state = if allowed {
            ReceiptState::Positive
        } else {
            ReceiptState::PositiveNoRight
        };
        request.central = Some(self.own);
        tracing::debug!(request = %id, key = %key, role = %role, allowed, "Bound to local central role");
        self.notify(id);
        self.update_flow(key);
    }

    /// Tell a local Source whether anybody is receiving.
    pub(super) fn update_flow(&mut self, key: DataItemKey) {
        let Some(source) = self.registry.local_central_for(&key, Role::Receiver) else {
            return;
        };
        let receivers = self
            .registry
            .find_by_key(&key)
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .filter(|request| {
                request.role() == Role::Receiver
                    && request.upstream == Upstream::Local
                    && request.state == ReceiptState::Positive
            })
            .count();
        let enabled = receivers > 0;
        let Some(request) = self.registry.get_mut(source) else {
            return;
        };
        if request.send_enabled == enabled {
            return;
        }
        request.send_enabled = enabled;
        if let Origin::Application(app) = request.origin() {
            let reason = if enabled {
                StatusCode::Ok
            } else {
                StatusCode::NoReceivers
            };
            tracing::debug!(app = %app, key = %key, enabled, receivers, "Source flow control");
            self.outbox.application(
                app,
                ApplicationEvent::SetSendEnabled {
                    key,
                    enabled,
                    reason,
                },
            );
        }
    }
}
