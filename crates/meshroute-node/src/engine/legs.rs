//! Shared outgoing legs and receipt evaluation.

use super::RoutingEngine;
use meshroute_core::{
    leg_verdict, BrokerId, DataItemKey, LegPlan, LegVerdict, OutgoingLeg, ReceiptState, RefCount,
    RequestId, Role, Transition, Upstream,
};
use meshroute_proto::{Telegram, TransmitterDataSubscription, TransmitterDataSubscriptionReceipt};

/// What a neighbor sees of an outgoing leg.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LegSignature {
    hop: BrokerId,
    key: DataItemKey,
    role: Role,
    candidates: Vec<BrokerId>,
}

impl LegSignature {
    fn new(key: DataItemKey, role: Role, leg: &OutgoingLeg) -> Self {
        Self {
            hop: leg.next_hop,
            key,
            role,
            candidates: leg.candidates.clone(),
        }
    }

    pub(crate) fn hop(&self) -> BrokerId {
        self.hop
    }

    fn matches(&self, role: Role, leg: &OutgoingLeg) -> bool {
        self.role == role && self.hop == leg.next_hop && self.candidates == leg.candidates
    }
}

/// State of one subscribed leg, shared by every request holding it.
#[derive(Debug, Default)]
pub(crate) struct SharedLeg {
    holders: RefCount,
    state: ReceiptState,
    central: Option<BrokerId>,
}

impl RoutingEngine {
    /// Hold a leg, subscribing it at the neighbor if nobody held it yet.
    ///
    /// A leg that is already held starts out with its known state, so a
    /// terminal resolution is reused without another round trip.
    pub(super) fn acquire_leg(
        &mut self,
        key: DataItemKey,
        role: Role,
        next_hop: BrokerId,
        candidates: Vec<BrokerId>,
    ) -> OutgoingLeg {
        let mut leg = OutgoingLeg::new(next_hop, candidates);
        let shared = self
            .legs
            .entry(LegSignature::new(key, role, &leg))
            .or_default();
        if shared.holders.acquire() == Transition::BecameNonzero {
            tracing::debug!(next_hop = %next_hop, key = %key, role = %role, candidates = ?leg.candidates, "Forwarding subscription");
            self.outbox.neighbor(
                next_hop,
                Telegram::Subscribe(TransmitterDataSubscription::new(
                    key,
                    role,
                    leg.candidates.clone(),
                )),
            );
        } else {
            leg.state = shared.state;
            leg.central = shared.central;
        }
        leg
    }

    pub(super) fn acquire_plan(
        &mut self,
        key: DataItemKey,
        role: Role,
        plan: &LegPlan,
    ) -> Vec<OutgoingLeg> {
        plan.iter()
            .map(|(hop, candidates)| self.acquire_leg(key, role, *hop, candidates.clone()))
            .collect()
    }

    /// Drop one hold on a leg, unsubscribing it when the last one goes.
    pub(super) fn release_leg(&mut self, key: DataItemKey, role: Role, leg: &OutgoingLeg) {
        let signature = LegSignature::new(key, role, leg);
        let Some(shared) = self.legs.get_mut(&signature) else {
            return;
        };
        if shared.holders.release() == Transition::BecameZero {
            self.legs.remove(&signature);
            tracing::debug!(next_hop = %leg.next_hop, key = %key, role = %role, "Cancelling subscription");
            self.outbox.neighbor(
                leg.next_hop,
                Telegram::Unsubscribe(TransmitterDataSubscription::new(
                    key,
                    role,
                    leg.candidates.clone(),
                )),
            );
        }
    }

    /// Release every leg of a request; the request is left unbound.
    pub(super) fn release_legs(&mut self, id: RequestId) {
        let Some(request) = self.registry.get_mut(id) else {
            return;
        };
        let key = request.key();
        let role = request.role();
        let upstream = std::mem::take(&mut request.upstream);
        for leg in upstream.legs() {
            self.release_leg(key, role, leg);
        }
    }

    /// Apply a receipt to every request holding the answered leg.
    pub(super) fn handle_receipt(
        &mut self,
        from: BrokerId,
        receipt: TransmitterDataSubscriptionReceipt,
    ) {
        if !receipt.state.is_terminal() {
            return;
        }
        let mut answered = OutgoingLeg::new(from, receipt.candidates);
        answered.candidates.sort_unstable();
        answered.candidates.dedup();
        let signature = LegSignature::new(receipt.key, receipt.role, &answered);
        let Some(shared) = self.legs.get_mut(&signature) else {
            tracing::debug!(from = %from, key = %receipt.key, role = %receipt.role, "Receipt for a leg nobody holds");
            return;
        };
        shared.state = receipt.state;
        shared.central = receipt.central;
        tracing::debug!(
            from = %from,
            key = %receipt.key,
            role = %receipt.role,
            state = ?receipt.state,
            central = ?receipt.central,
            "Receipt"
        );

        for id in self.registry.find_by_key(&receipt.key) {
            let mut in_upstream = false;
            if let Some(request) = self.registry.get_mut(id) {
                let role = request.role();
                if let Upstream::Legs(legs) = &mut request.upstream {
                    for leg in legs.iter_mut().filter(|leg| signature.matches(role, leg)) {
                        leg.state = receipt.state;
                        leg.central = receipt.central;
                        in_upstream = true;
                    }
                }
            }
            let mut in_task = false;
            if let Some(task) = self.redirections.get_mut(&id) {
                for leg in task
                    .new_legs
                    .iter_mut()
                    .filter(|leg| signature.matches(receipt.role, leg))
                {
                    leg.state = receipt.state;
                    leg.central = receipt.central;
                    in_task = true;
                }
            }
            if in_upstream {
                self.evaluate(id);
            }
            if in_task {
                self.evaluate_redirection(id);
            }
        }
    }

    /// Fold the leg states of a request into its own state.
    ///
    /// With a single authority the winning leg is kept and the others are
    /// released. More than one authority, or none, releases every leg.
    pub(super) fn evaluate(&mut self, id: RequestId) {
        let Some(request) = self.registry.get_mut(id) else {
            return;
        };
        let Upstream::Legs(legs) = &request.upstream else {
            return;
        };
        let key = request.key();
        let role = request.role();
        match leg_verdict(legs) {
            LegVerdict::Pending => {
                request.state = ReceiptState::Pending;
            }
            LegVerdict::Single(winner) => {
                let Upstream::Legs(mut legs) = std::mem::take(&mut request.upstream) else {
                    return;
                };
                let kept = legs.remove(winner);
                request.state = kept.state;
                request.central = kept.central;
                request.upstream = Upstream::Legs(vec![kept]);
                for loser in &legs {
                    self.release_leg(key, role, loser);
                }
                self.notify(id);
            }
            LegVerdict::Multiple => {
                tracing::info!(request = %id, key = %key, role = %role, "More than one central role reachable");
                self.fail(id, ReceiptState::MultiplePositive);
            }
            LegVerdict::Negative => self.fail(id, ReceiptState::Negative),
        }
    }

    /// Release every leg and settle on a terminal state without an authority.
    pub(super) fn fail(&mut self, id: RequestId, state: ReceiptState) {
        self.release_legs(id);
        if let Some(request) = self.registry.get_mut(id) {
            request.state = state;
            request.central = None;
        }
        self.notify(id);
    }
}
