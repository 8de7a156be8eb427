//! Data relay along resolved routes.
//!
//! Source data flows from the central Source towards every Receiver; sender
//! data flows from each Sender towards the central Drain. A broker only
//! accepts source data from the hop that won the resolution of a receiving
//! request. While such a request is being redirected, data arriving on the
//! new hop only feeds the continuity check until cutover.

use super::RoutingEngine;
use crate::outbox::ApplicationEvent;
use meshroute_core::{
    ApplicationId, BrokerId, DataItemKey, DeliveryPath, Origin, ReceiptState, RequestId,
    RequestKey, Role, StatusCode, Upstream,
};
use meshroute_proto::{DataFlow, Telegram, TransmitterDataTelegram};
use std::collections::BTreeSet;

impl RoutingEngine {
    /// A local application publishes a value.
    ///
    /// As Source the value is cached and fanned out to every bound Receiver.
    /// As Sender it travels towards the Drain. Values published without a
    /// granted subscription are dropped.
    pub fn publish(&mut self, app: ApplicationId, key: DataItemKey, index: u64, payload: Vec<u8>) {
        let source = self
            .registry
            .lookup(&RequestKey::application(app, key, Role::Source))
            .filter(|&id| self.is_granted(id));
        if source.is_some() {
            if !self.cache.update(key, index, payload.clone()) {
                tracing::debug!(app = %app, key = %key, index, "Ignoring stale source value");
                return;
            }
            let telegram = TransmitterDataTelegram {
                key,
                index,
                payload,
                flow: DataFlow::FromSource,
            };
            let receivers: Vec<RequestId> = self
                .registry
                .find_by_key(&key)
                .into_iter()
                .filter(|&id| {
                    self.registry.get(id).is_some_and(|request| {
                        request.role() == Role::Receiver
                            && request.upstream == Upstream::Local
                            && request.state == ReceiptState::Positive
                    })
                })
                .collect();
            let mut reached = BTreeSet::new();
            for id in receivers {
                self.forward(id, &telegram, &mut reached);
            }
            return;
        }

        let sender = self
            .registry
            .lookup(&RequestKey::application(app, key, Role::Sender))
            .filter(|&id| self.is_granted(id));
        let Some(sender) = sender else {
            tracing::debug!(app = %app, key = %key, index, "Dropping value without a granted subscription");
            return;
        };
        let telegram = TransmitterDataTelegram {
            key,
            index,
            payload,
            flow: DataFlow::ToDrain,
        };
        if let Some(target) = self.drain_target(sender) {
            self.send_to(target, &telegram);
        }
    }

    pub(super) fn handle_data(&mut self, from: BrokerId, telegram: TransmitterDataTelegram) {
        match telegram.flow {
            DataFlow::FromSource => self.relay_from_source(from, &telegram),
            DataFlow::ToDrain => self.relay_to_drain(from, &telegram),
        }
    }

    fn relay_from_source(&mut self, from: BrokerId, telegram: &TransmitterDataTelegram) {
        let key = telegram.key;
        let mut accepted = false;
        let mut deliver = Vec::new();

        for id in self.registry.find_by_key(&key) {
            let Some(request) = self.registry.get(id) else {
                continue;
            };
            if request.role() != Role::Receiver {
                continue;
            }
            let active = request.active_hops().contains(&from);
            let Some(task) = self.redirections.get_mut(&id) else {
                if active {
                    accepted = true;
                    deliver.push(id);
                }
                continue;
            };
            match task.record_delivery(from, telegram.index) {
                DeliveryPath::Unrelated => {
                    if active {
                        accepted = true;
                        deliver.push(id);
                    }
                }
                DeliveryPath::Old | DeliveryPath::Both => {
                    accepted = true;
                    if active {
                        deliver.push(id);
                    }
                    self.evaluate_redirection(id);
                }
                DeliveryPath::New => {
                    accepted = true;
                    self.evaluate_redirection(id);
                    // The telegram that completes the cutover is passed on if
                    // it is newer than what the old route delivered.
                    let switched = !self.redirections.contains_key(&id)
                        && self
                            .registry
                            .get(id)
                            .is_some_and(|request| request.active_hops().contains(&from));
                    if switched {
                        deliver.push(id);
                    }
                }
            }
        }

        if !accepted {
            tracing::debug!(from = %from, key = %key, index = telegram.index, "Dropping data from a hop that serves no request");
            return;
        }
        self.cache.update(key, telegram.index, telegram.payload.clone());
        let mut reached = BTreeSet::new();
        for id in deliver {
            self.forward(id, telegram, &mut reached);
        }
    }

    fn relay_to_drain(&mut self, from: BrokerId, telegram: &TransmitterDataTelegram) {
        let origin = Origin::Transmitter(from);
        let senders: Vec<RequestId> = self
            .registry
            .find_by_key(&telegram.key)
            .into_iter()
            .filter(|&id| {
                self.registry.get(id).is_some_and(|request| {
                    request.origin() == origin && request.role() == Role::Sender
                })
            })
            .filter(|&id| self.is_granted(id))
            .collect();
        let targets: BTreeSet<Origin> = senders
            .into_iter()
            .filter_map(|id| self.drain_target(id))
            .collect();
        if targets.is_empty() {
            tracing::debug!(from = %from, key = %telegram.key, index = telegram.index, "Dropping sender data without a drain");
        }
        for target in targets {
            self.send_to(target, telegram);
        }
    }

    /// Pass a source value on to the origin of a receiving request, once per
    /// connection and never at or below an index it already got.
    fn forward(
        &mut self,
        id: RequestId,
        telegram: &TransmitterDataTelegram,
        reached: &mut BTreeSet<Origin>,
    ) {
        let Some(request) = self.registry.get_mut(id) else {
            return;
        };
        if request
            .last_delivered
            .is_some_and(|last| telegram.index <= last)
        {
            return;
        }
        request.last_delivered = Some(telegram.index);
        let origin = request.origin();
        if reached.insert(origin) {
            self.send_to(origin, telegram);
        }
    }

    /// Where data of a granted Sender request goes next.
    fn drain_target(&self, id: RequestId) -> Option<Origin> {
        let request = self.registry.get(id)?;
        match &request.upstream {
            Upstream::Local => {
                let drain = self
                    .registry
                    .local_central_for(&request.key(), Role::Sender)?;
                self.registry.get(drain).map(|drain| drain.origin())
            }
            Upstream::Legs(legs) => legs
                .iter()
                .find(|leg| leg.state == ReceiptState::Positive)
                .map(|leg| Origin::Transmitter(leg.next_hop)),
            Upstream::Unbound => None,
        }
    }

    fn send_to(&mut self, target: Origin, telegram: &TransmitterDataTelegram) {
        match target {
            Origin::Application(app) => self.outbox.application(
                app,
                ApplicationEvent::Deliver {
                    key: telegram.key,
                    payload: Some(telegram.payload.clone()),
                    index: Some(telegram.index),
                    status: StatusCode::Ok,
                },
            ),
            Origin::Transmitter(neighbor) => self
                .outbox
                .neighbor(neighbor, Telegram::Data(telegram.clone())),
        }
    }

    fn is_granted(&self, id: RequestId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|request| request.state == ReceiptState::Positive)
    }
}
