//! Subscription routing engine.
//!
//! The engine owns all routing state of one broker: the subscription
//! registry, the advertisement propagator, the shared outgoing legs and the
//! in-flight redirections. Every entry point runs to completion and leaves
//! its effects in the outbox; nothing here blocks or performs I/O.
//!
//! Requests are resolved in one of three ways:
//!
//! 1. bound to a central role held by a local application
//! 2. forwarded as outgoing legs, one per next hop towards the candidate
//!    central brokers, and resolved by the receipts of those legs
//! 3. failed without a route (no candidate reachable, or no rights)
//!
//! Identical legs of different requests are shared and reference counted, so
//! a neighbor sees one subscription per (key, role, candidate set) no matter
//! how many local requests depend on it.

mod data;
mod legs;
mod redirect;
mod subscribe;
mod unsubscribe;

use crate::advertise::{AdvertisementConfig, AdvertisementPropagator};
use crate::config::NodeConfig;
use crate::outbox::{ApplicationEvent, Outbound, Outbox};
use legs::{LegSignature, SharedLeg};
use meshroute_core::{
    Authorizer, BrokerId, DataItemKey, Origin, ReceiptState, RedirectionTask, RequestId,
    RequestKey, Role, RouteSelector, SubscriptionRegistry, SubscriptionRequest, Upstream,
    ValueCache,
};
use meshroute_proto::{
    DataFlow, Telegram, TransmitterDataSubscriptionReceipt, TransmitterDataTelegram,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// The routing state machine of one broker.
pub struct RoutingEngine {
    own: BrokerId,
    registry: SubscriptionRegistry,
    adverts: AdvertisementPropagator,
    redirections: BTreeMap<RequestId, RedirectionTask>,
    legs: BTreeMap<LegSignature, SharedLeg>,
    routes: Arc<dyn RouteSelector>,
    rights: Arc<dyn Authorizer>,
    cache: Box<dyn ValueCache>,
    outbox: Outbox,
}

impl RoutingEngine {
    /// Create an engine for broker `own`.
    #[must_use]
    pub fn new(
        own: BrokerId,
        advertisement: AdvertisementConfig,
        routes: Arc<dyn RouteSelector>,
        rights: Arc<dyn Authorizer>,
        cache: Box<dyn ValueCache>,
    ) -> Self {
        Self {
            own,
            registry: SubscriptionRegistry::new(),
            adverts: AdvertisementPropagator::new(own, advertisement, routes.clone()),
            redirections: BTreeMap::new(),
            legs: BTreeMap::new(),
            routes,
            rights,
            cache,
            outbox: Outbox::new(),
        }
    }

    /// Create an engine from node configuration.
    #[must_use]
    pub fn from_config(
        config: &NodeConfig,
        routes: Arc<dyn RouteSelector>,
        rights: Arc<dyn Authorizer>,
        cache: Box<dyn ValueCache>,
    ) -> Self {
        Self::new(
            config.broker_id,
            config.advertisement.clone(),
            routes,
            rights,
            cache,
        )
    }

    /// Id of this broker.
    #[must_use]
    pub fn own_id(&self) -> BrokerId {
        self.own
    }

    /// A request by id.
    #[must_use]
    pub fn request(&self, id: RequestId) -> Option<&SubscriptionRequest> {
        self.registry.get(id)
    }

    /// Brokers that may host the central role for `key`.
    #[must_use]
    pub fn potential_central_brokers(&self, key: &DataItemKey) -> Vec<BrokerId> {
        self.adverts.potential_central_brokers(key)
    }

    /// Take every effect queued since the last call.
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        self.outbox.take()
    }

    /// Process a telegram received from neighbor `from`.
    pub fn handle_telegram(&mut self, from: BrokerId, telegram: Telegram, now: Instant) {
        tracing::debug!(from = %from, kind = telegram.kind(), "Handling telegram");
        match telegram {
            Telegram::Subscribe(subscription) => {
                self.handle_subscription(from, subscription, now);
            }
            Telegram::Unsubscribe(subscription) => {
                let ident = RequestKey::transmitter(
                    from,
                    subscription.key,
                    subscription.role,
                    subscription.candidates,
                );
                self.remove_request(&ident, now);
            }
            Telegram::Receipt(receipt) => self.handle_receipt(from, receipt),
            Telegram::Data(data) => self.handle_data(from, data),
            Telegram::AdvertisementUpdate(update) => {
                if self.adverts.on_update(from, update, &mut self.outbox) {
                    self.reroute_all(now);
                }
            }
            Telegram::AdvertisementSubscribe(brokers) => {
                self.adverts
                    .on_neighbor_subscribe(from, &brokers.brokers, &mut self.outbox);
            }
            Telegram::AdvertisementUnsubscribe(brokers) => {
                self.adverts.on_neighbor_unsubscribe(from, &brokers.brokers);
            }
            Telegram::AdvertisementWithdraw(brokers) => {
                if self
                    .adverts
                    .on_neighbor_withdraw(from, &brokers.brokers, &mut self.outbox)
                {
                    self.reroute_all(now);
                }
            }
        }
    }

    /// The next hop towards `target` may have changed.
    pub fn on_route_changed(&mut self, target: BrokerId, now: Instant) {
        tracing::debug!(target = %target, next_hop = ?self.routes.next_hop(target), "Route changed");
        self.adverts.on_route_changed(target, &mut self.outbox);
        self.reroute_all(now);
    }

    /// Send local advertisement changes whose delay has passed.
    pub fn flush_advertisements(&mut self, now: Instant) {
        self.adverts.flush_due(now, &mut self.outbox);
    }

    /// When [`flush_advertisements`](Self::flush_advertisements) has work next.
    #[must_use]
    pub fn next_advertisement_deadline(&self) -> Option<Instant> {
        self.adverts.next_deadline()
    }

    /// Re-evaluate every participant request against current routes and
    /// advertisements.
    fn reroute_all(&mut self, now: Instant) {
        for id in self.registry.ids() {
            let participant = self
                .registry
                .get(id)
                .is_some_and(|request| !request.role().is_central());
            if participant {
                self.route_request(id, now);
            }
        }
    }

    /// Report the outcome of a request to its origin, once per outcome.
    fn notify(&mut self, id: RequestId) {
        let Some(request) = self.registry.get_mut(id) else {
            return;
        };
        let outcome = (request.state, request.central);
        let Some(status) = request.state.status_code() else {
            return;
        };
        if request.notified == Some(outcome) {
            return;
        }
        request.notified = Some(outcome);

        let key = request.key();
        let role = request.role();
        let (state, central) = outcome;
        tracing::debug!(
            request = %id,
            origin = %request.origin(),
            key = %key,
            role = %role,
            state = ?state,
            central = ?central,
            "Reporting outcome"
        );

        match request.origin() {
            Origin::Application(app) => {
                let event = match role {
                    Role::Sender | Role::Source => ApplicationEvent::SetSendEnabled {
                        key,
                        enabled: state == ReceiptState::Positive,
                        reason: status,
                    },
                    Role::Receiver | Role::Drain => {
                        let cached = self
                            .cache
                            .current(&key)
                            .filter(|_| state == ReceiptState::Positive && role == Role::Receiver)
                            .filter(|value| {
                                request.last_delivered.map_or(true, |last| value.index > last)
                            });
                        if let Some(value) = &cached {
                            request.last_delivered = Some(value.index);
                        }
                        ApplicationEvent::Deliver {
                            key,
                            index: cached.as_ref().map(|value| value.index),
                            payload: cached.map(|value| value.payload),
                            status,
                        }
                    }
                };
                self.outbox.application(app, event);
            }
            Origin::Transmitter(neighbor) => {
                self.outbox.neighbor(
                    neighbor,
                    Telegram::Receipt(TransmitterDataSubscriptionReceipt {
                        key,
                        role,
                        candidates: request.ident.candidates.clone(),
                        state,
                        central,
                    }),
                );
                if state == ReceiptState::Positive && role == Role::Receiver {
                    if let Some(value) = self.cache.current(&key) {
                        request.last_delivered = Some(value.index);
                        self.outbox.neighbor(
                            neighbor,
                            Telegram::Data(TransmitterDataTelegram {
                                key,
                                index: value.index,
                                payload: value.payload,
                                flow: DataFlow::FromSource,
                            }),
                        );
                    }
                }
            }
        }
    }

    /// A read-only summary of the routing state.
    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            broker: self.own,
            requests: self
                .registry
                .iter()
                .map(|request| RequestSnapshot {
                    id: request.id.0,
                    origin: request.origin(),
                    key: request.key(),
                    role: request.role(),
                    state: request.state,
                    central: request.central,
                    local: request.upstream == Upstream::Local,
                    next_hops: request
                        .upstream
                        .legs()
                        .iter()
                        .map(|leg| leg.next_hop)
                        .collect(),
                })
                .collect(),
            redirections: self
                .redirections
                .values()
                .map(|task| RedirectionSnapshot {
                    request: task.request.0,
                    old_hops: task.old_hops().to_vec(),
                    new_hops: task.new_legs.iter().map(|leg| leg.next_hop).collect(),
                })
                .collect(),
            shared_legs: self.legs.len(),
            known_brokers: self.adverts.known_brokers(),
        }
    }
}

/// Diagnostic view of a [`RoutingEngine`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// This broker
    pub broker: BrokerId,
    /// Every registered request
    pub requests: Vec<RequestSnapshot>,
    /// Redirections in flight
    pub redirections: Vec<RedirectionSnapshot>,
    /// Distinct outgoing legs currently subscribed
    pub shared_legs: usize,
    /// Brokers with an advertisement entry
    pub known_brokers: Vec<BrokerId>,
}

/// Diagnostic view of one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    /// Request id
    pub id: u64,
    /// Connection the request came from
    pub origin: Origin,
    /// Data item
    pub key: DataItemKey,
    /// Role
    pub role: Role,
    /// Resolution state
    pub state: ReceiptState,
    /// Resolved central broker
    pub central: Option<BrokerId>,
    /// Bound to a local central role
    pub local: bool,
    /// Next hops of the outgoing legs
    pub next_hops: Vec<BrokerId>,
}

/// Diagnostic view of one redirection.
#[derive(Debug, Clone, Serialize)]
pub struct RedirectionSnapshot {
    /// Request being redirected
    pub request: u64,
    /// Hops being replaced
    pub old_hops: Vec<BrokerId>,
    /// Hops being confirmed
    pub new_hops: Vec<BrokerId>,
}
