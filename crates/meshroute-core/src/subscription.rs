//! Subscription requests and their outgoing legs.
//!
//! A request is one inbound subscription for a data item. Requests that are
//! not served by a local central role are forwarded as outgoing legs, one per
//! next-hop broker, each carrying the candidate central brokers reachable
//! through that hop.

use crate::key::{ApplicationId, BrokerId, DataItemKey, UserId};
use crate::role::{ReceiptState, Role};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Arena id of a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// The connection a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Origin {
    /// A local application
    Application(ApplicationId),
    /// A neighbor broker
    Transmitter(BrokerId),
}

impl Origin {
    /// The neighbor broker, for requests that came from one.
    #[must_use]
    pub fn neighbor(self) -> Option<BrokerId> {
        match self {
            Origin::Transmitter(broker) => Some(broker),
            Origin::Application(_) => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Application(app) => app.fmt(f),
            Origin::Transmitter(broker) => broker.fmt(f),
        }
    }
}

/// Whom an authorization decision is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Principal {
    /// The user of a local application
    User(UserId),
    /// A neighbor broker asking on behalf of its own subscribers
    Transmitter(BrokerId),
}

/// Registry identity of a request.
///
/// Neighbor requests include their candidate list, so two subscriptions from
/// the same neighbor for different candidate sets are distinct requests.
/// Application requests always carry an empty candidate list here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    /// Connection the request came from
    pub origin: Origin,
    /// Requested data item
    pub key: DataItemKey,
    /// Requested role
    pub role: Role,
    /// Candidate list of a neighbor request, sorted
    pub candidates: Vec<BrokerId>,
}

impl RequestKey {
    /// Identity of an application request.
    #[must_use]
    pub fn application(app: ApplicationId, key: DataItemKey, role: Role) -> Self {
        Self {
            origin: Origin::Application(app),
            key,
            role,
            candidates: Vec::new(),
        }
    }

    /// Identity of a neighbor request; the candidate list is normalized.
    #[must_use]
    pub fn transmitter(
        neighbor: BrokerId,
        key: DataItemKey,
        role: Role,
        mut candidates: Vec<BrokerId>,
    ) -> Self {
        candidates.sort_unstable();
        candidates.dedup();
        Self {
            origin: Origin::Transmitter(neighbor),
            key,
            role,
            candidates,
        }
    }
}

/// One sub-request forwarded to a next-hop broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingLeg {
    /// Neighbor the sub-request was sent to
    pub next_hop: BrokerId,
    /// Candidate central brokers reachable through `next_hop`, sorted
    pub candidates: Vec<BrokerId>,
    /// Receipt state reported by `next_hop`
    pub state: ReceiptState,
    /// Central broker named in a positive receipt
    pub central: Option<BrokerId>,
}

impl OutgoingLeg {
    /// A freshly sent, pending leg.
    #[must_use]
    pub fn new(next_hop: BrokerId, candidates: Vec<BrokerId>) -> Self {
        Self {
            next_hop,
            candidates,
            state: ReceiptState::Pending,
            central: None,
        }
    }
}

/// Next-hop grouping of candidate brokers: `(next_hop, candidates)` sorted by hop.
pub type LegPlan = Vec<(BrokerId, Vec<BrokerId>)>;

/// What currently serves a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Upstream {
    /// Nothing; the request is unresolved or terminally failed
    #[default]
    Unbound,
    /// A central role held by a local application on this broker
    Local,
    /// Sub-requests forwarded to neighbors
    Legs(Vec<OutgoingLeg>),
}

impl Upstream {
    /// Outgoing legs, empty unless forwarded.
    #[must_use]
    pub fn legs(&self) -> &[OutgoingLeg] {
        match self {
            Upstream::Legs(legs) => legs,
            _ => &[],
        }
    }
}

/// One inbound subscription request.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    /// Arena id
    pub id: RequestId,
    /// Registry identity
    pub ident: RequestKey,
    /// Principal used for authorization decisions
    pub principal: Principal,
    /// Candidate central brokers currently considered
    pub candidates: Vec<BrokerId>,
    /// Grouping the current legs were built from
    pub plan: LegPlan,
    /// Resolution state
    pub state: ReceiptState,
    /// Resolved central broker
    pub central: Option<BrokerId>,
    /// What serves this request
    pub upstream: Upstream,
    /// Last outcome reported to the origin
    pub notified: Option<(ReceiptState, Option<BrokerId>)>,
    /// Whether a local source was told to send
    pub send_enabled: bool,
    /// Highest delivery index passed on to the origin
    pub last_delivered: Option<u64>,
}

impl SubscriptionRequest {
    /// Create a pending, unbound request.
    #[must_use]
    pub fn new(id: RequestId, ident: RequestKey, principal: Principal) -> Self {
        let candidates = ident.candidates.clone();
        Self {
            id,
            ident,
            principal,
            candidates,
            plan: Vec::new(),
            state: ReceiptState::Pending,
            central: None,
            upstream: Upstream::Unbound,
            notified: None,
            send_enabled: false,
            last_delivered: None,
        }
    }

    /// Requested data item.
    #[must_use]
    pub fn key(&self) -> DataItemKey {
        self.ident.key
    }

    /// Requested role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.ident.role
    }

    /// Connection the request came from.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.ident.origin
    }

    /// Next hops of legs that resolved to an authority.
    #[must_use]
    pub fn active_hops(&self) -> Vec<BrokerId> {
        self.upstream
            .legs()
            .iter()
            .filter(|leg| leg.state.found_authority())
            .map(|leg| leg.next_hop)
            .collect()
    }
}

/// Aggregate verdict over a set of outgoing legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegVerdict {
    /// At least one leg has not answered yet
    Pending,
    /// Every leg answered and none found an authority
    Negative,
    /// Exactly one leg found an authority; the index of that leg
    Single(usize),
    /// More than one authority is reachable
    Multiple,
}

/// Fold the states of `legs` into one verdict.
///
/// An empty set of legs is `Negative`.
#[must_use]
pub fn leg_verdict(legs: &[OutgoingLeg]) -> LegVerdict {
    if legs.iter().any(|leg| leg.state == ReceiptState::Pending) {
        return LegVerdict::Pending;
    }
    if legs
        .iter()
        .any(|leg| leg.state == ReceiptState::MultiplePositive)
    {
        return LegVerdict::Multiple;
    }
    let mut winners = legs
        .iter()
        .enumerate()
        .filter(|(_, leg)| leg.state.found_authority());
    match (winners.next(), winners.next()) {
        (None, _) => LegVerdict::Negative,
        (Some((index, _)), None) => LegVerdict::Single(index),
        (Some(_), Some(_)) => LegVerdict::Multiple,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(hop: i64, state: ReceiptState) -> OutgoingLeg {
        OutgoingLeg {
            next_hop: BrokerId(hop),
            candidates: vec![BrokerId(hop)],
            state,
            central: None,
        }
    }

    #[test]
    fn verdict_waits_for_every_leg() {
        let legs = vec![
            leg(1, ReceiptState::Positive),
            leg(2, ReceiptState::Pending),
        ];
        assert_eq!(leg_verdict(&legs), LegVerdict::Pending);
    }

    #[test]
    fn verdict_single_positive() {
        let legs = vec![
            leg(1, ReceiptState::Negative),
            leg(2, ReceiptState::Positive),
            leg(3, ReceiptState::Negative),
        ];
        assert_eq!(leg_verdict(&legs), LegVerdict::Single(1));
    }

    #[test]
    fn verdict_no_right_still_counts_as_authority() {
        let legs = vec![
            leg(1, ReceiptState::PositiveNoRight),
            leg(2, ReceiptState::Positive),
        ];
        assert_eq!(leg_verdict(&legs), LegVerdict::Multiple);
    }

    #[test]
    fn verdict_propagates_upstream_conflict() {
        let legs = vec![leg(1, ReceiptState::MultiplePositive)];
        assert_eq!(leg_verdict(&legs), LegVerdict::Multiple);
        assert_eq!(leg_verdict(&[]), LegVerdict::Negative);
    }

    #[test]
    fn transmitter_identity_is_normalized() {
        let key = DataItemKey::new(1, 1, 0);
        let a = RequestKey::transmitter(
            BrokerId(7),
            key,
            Role::Receiver,
            vec![BrokerId(3), BrokerId(2), BrokerId(3)],
        );
        let b = RequestKey::transmitter(
            BrokerId(7),
            key,
            Role::Receiver,
            vec![BrokerId(2), BrokerId(3)],
        );
        assert_eq!(a, b);
    }
}
