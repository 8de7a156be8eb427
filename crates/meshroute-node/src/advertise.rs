//! Advertisement propagation.
//!
//! Every broker keeps, per reachable broker, the object ids and attribute
//! usage ids for which a central role exists behind that broker. The sets
//! travel hop by hop along the selected routes:
//!
//! - a broker subscribes to the next hop towards `B` for `B`'s set; that hop
//!   becomes the entry's *deliverer*
//! - the deliverer replays the full set once and afterwards forwards only
//!   the ids that actually changed
//! - a neighbor that is our deliverer for `B` can never subscribe to us for
//!   `B`; such a request is answered with a withdrawal
//!
//! Local changes are reference counted per id and debounced: additions after
//! a short delay, removals after a longer one.

use crate::outbox::Outbox;
use meshroute_core::{
    AttributeUsageId, BrokerId, DataItemKey, ObjectId, RefCount, RouteSelector, Transition,
};
use meshroute_proto::{
    AdvertisementBrokers, AdvertisementUpdate, Telegram, MAX_OBJECTS_PER_UPDATE,
    MAX_USAGES_PER_UPDATE,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Advertisement batching parameters.
#[derive(Debug, Clone)]
pub struct AdvertisementConfig {
    /// Delay before local additions are sent
    pub addition_delay: Duration,
    /// Delay before local removals are sent
    pub removal_delay: Duration,
    /// Object ids per update telegram
    pub max_objects: usize,
    /// Attribute-usage ids per update telegram
    pub max_usages: usize,
}

impl Default for AdvertisementConfig {
    fn default() -> Self {
        Self {
            addition_delay: Duration::from_millis(100),
            removal_delay: Duration::from_millis(1000),
            max_objects: MAX_OBJECTS_PER_UPDATE,
            max_usages: MAX_USAGES_PER_UPDATE,
        }
    }
}

#[derive(Debug, Default)]
struct AdvertisementEntry {
    objects: BTreeSet<ObjectId>,
    usages: BTreeSet<AttributeUsageId>,
    deliverer: Option<BrokerId>,
    subscribers: BTreeSet<BrokerId>,
}

impl AdvertisementEntry {
    fn has_ids(&self) -> bool {
        !self.objects.is_empty() || !self.usages.is_empty()
    }

    fn full_update(&self, broker: BrokerId) -> AdvertisementUpdate {
        let mut update = AdvertisementUpdate::new(broker);
        update.reset = true;
        update.added_objects = self.objects.iter().copied().collect();
        update.added_usages = self.usages.iter().copied().collect();
        update
    }
}

/// Local ids waiting for their debounce delay.
#[derive(Debug)]
struct PendingIds<T> {
    added: BTreeSet<T>,
    removed: BTreeSet<T>,
}

impl<T> Default for PendingIds<T> {
    fn default() -> Self {
        Self {
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<T: Ord> PendingIds<T> {
    // An addition cancels an unsent removal and vice versa.
    fn add(&mut self, id: T) {
        if !self.removed.remove(&id) {
            self.added.insert(id);
        }
    }

    fn remove(&mut self, id: T) {
        if !self.added.remove(&id) {
            self.removed.insert(id);
        }
    }
}

/// Maintains advertisement entries and emits advertisement telegrams.
pub struct AdvertisementPropagator {
    own: BrokerId,
    config: AdvertisementConfig,
    routes: Arc<dyn RouteSelector>,
    entries: BTreeMap<BrokerId, AdvertisementEntry>,
    object_refs: BTreeMap<ObjectId, RefCount>,
    usage_refs: BTreeMap<AttributeUsageId, RefCount>,
    objects: PendingIds<ObjectId>,
    usages: PendingIds<AttributeUsageId>,
    addition_due: Option<Instant>,
    removal_due: Option<Instant>,
}

impl AdvertisementPropagator {
    /// Create a propagator for broker `own`.
    #[must_use]
    pub fn new(own: BrokerId, config: AdvertisementConfig, routes: Arc<dyn RouteSelector>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(own, AdvertisementEntry::default());
        Self {
            own,
            config,
            routes,
            entries,
            object_refs: BTreeMap::new(),
            usage_refs: BTreeMap::new(),
            objects: PendingIds::default(),
            usages: PendingIds::default(),
            addition_due: None,
            removal_due: None,
        }
    }

    /// A local application became Source or Drain for `key`.
    pub fn add_local(&mut self, key: &DataItemKey, now: Instant) {
        if self.object_refs.entry(key.object).or_default().acquire() == Transition::BecameNonzero {
            self.objects.add(key.object);
        }
        if self.usage_refs.entry(key.usage).or_default().acquire() == Transition::BecameNonzero {
            self.usages.add(key.usage);
        }
        self.schedule(now);
    }

    /// A local application stopped being Source or Drain for `key`.
    pub fn remove_local(&mut self, key: &DataItemKey, now: Instant) {
        if let Some(count) = self.object_refs.get_mut(&key.object) {
            if count.release() == Transition::BecameZero {
                self.object_refs.remove(&key.object);
                self.objects.remove(key.object);
            }
        }
        if let Some(count) = self.usage_refs.get_mut(&key.usage) {
            if count.release() == Transition::BecameZero {
                self.usage_refs.remove(&key.usage);
                self.usages.remove(key.usage);
            }
        }
        self.schedule(now);
    }

    fn schedule(&mut self, now: Instant) {
        if self.objects.added.is_empty() && self.usages.added.is_empty() {
            self.addition_due = None;
        } else if self.addition_due.is_none() {
            self.addition_due = Some(now + self.config.addition_delay);
        }
        if self.objects.removed.is_empty() && self.usages.removed.is_empty() {
            self.removal_due = None;
        } else if self.removal_due.is_none() {
            self.removal_due = Some(now + self.config.removal_delay);
        }
    }

    /// Earliest pending flush, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.addition_due, self.removal_due) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }

    /// Send the local changes whose delay has passed.
    ///
    /// Returns `true` if an update was sent.
    pub fn flush_due(&mut self, now: Instant, out: &mut Outbox) -> bool {
        let additions = self.addition_due.is_some_and(|due| due <= now);
        let removals = self.removal_due.is_some_and(|due| due <= now);
        if !additions && !removals {
            return false;
        }

        let mut update = AdvertisementUpdate::new(self.own);
        if additions {
            update.added_objects = std::mem::take(&mut self.objects.added).into_iter().collect();
            update.added_usages = std::mem::take(&mut self.usages.added).into_iter().collect();
            self.addition_due = None;
        }
        if removals {
            update.removed_objects =
                std::mem::take(&mut self.objects.removed).into_iter().collect();
            update.removed_usages = std::mem::take(&mut self.usages.removed).into_iter().collect();
            self.removal_due = None;
        }

        let entry = self.entries.entry(self.own).or_default();
        entry.objects.extend(update.added_objects.iter().copied());
        entry.usages.extend(update.added_usages.iter().copied());
        for object in &update.removed_objects {
            entry.objects.remove(object);
        }
        for usage in &update.removed_usages {
            entry.usages.remove(usage);
        }

        if update.is_empty() {
            return false;
        }
        tracing::debug!(
            added_objects = update.added_objects.len(),
            removed_objects = update.removed_objects.len(),
            added_usages = update.added_usages.len(),
            removed_usages = update.removed_usages.len(),
            "Flushing local advertisements"
        );
        self.forward(update, None, out);
        true
    }

    /// Brokers other than this one that may host the central role for `key`.
    #[must_use]
    pub fn potential_central_brokers(&self, key: &DataItemKey) -> Vec<BrokerId> {
        self.entries
            .iter()
            .filter(|(&broker, entry)| {
                broker != self.own
                    && entry.objects.contains(&key.object)
                    && entry.usages.contains(&key.usage)
            })
            .map(|(&broker, _)| broker)
            .collect()
    }

    /// Brokers with an entry, this one included.
    #[must_use]
    pub fn known_brokers(&self) -> Vec<BrokerId> {
        self.entries.keys().copied().collect()
    }

    /// Neighbor currently delivering the set of `broker`.
    #[must_use]
    pub fn deliverer(&self, broker: BrokerId) -> Option<BrokerId> {
        self.entries.get(&broker).and_then(|entry| entry.deliverer)
    }

    /// Neighbors receiving the set of `broker`.
    #[must_use]
    pub fn subscribers(&self, broker: BrokerId) -> Vec<BrokerId> {
        self.entries
            .get(&broker)
            .map(|entry| entry.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `neighbor` asks for the sets of `brokers`.
    pub fn on_neighbor_subscribe(
        &mut self,
        neighbor: BrokerId,
        brokers: &[BrokerId],
        out: &mut Outbox,
    ) {
        for &broker in brokers {
            let deliverer = if broker == self.own {
                None
            } else {
                match self.ensure_entry(broker, out) {
                    Some(deliverer) => Some(deliverer),
                    None => {
                        tracing::debug!(neighbor = %neighbor, broker = %broker, "Advertisement subscription for unreachable broker");
                        out.neighbor(neighbor, withdraw(broker));
                        continue;
                    }
                }
            };
            if deliverer == Some(neighbor) {
                tracing::debug!(neighbor = %neighbor, broker = %broker, "Refusing advertisement subscription from our deliverer");
                out.neighbor(neighbor, withdraw(broker));
                continue;
            }
            let Some(entry) = self.entries.get_mut(&broker) else {
                continue;
            };
            entry.subscribers.insert(neighbor);
            for chunk in entry
                .full_update(broker)
                .split(self.config.max_objects, self.config.max_usages)
            {
                out.neighbor(neighbor, Telegram::AdvertisementUpdate(chunk));
            }
        }
    }

    /// `neighbor` no longer wants the sets of `brokers`.
    pub fn on_neighbor_unsubscribe(&mut self, neighbor: BrokerId, brokers: &[BrokerId]) {
        for broker in brokers {
            if let Some(entry) = self.entries.get_mut(broker) {
                entry.subscribers.remove(&neighbor);
            }
        }
    }

    /// `neighbor` stopped delivering the sets of `brokers`.
    ///
    /// Returns `true` if a known set changed.
    pub fn on_neighbor_withdraw(
        &mut self,
        neighbor: BrokerId,
        brokers: &[BrokerId],
        out: &mut Outbox,
    ) -> bool {
        let mut changed = false;
        for &broker in brokers {
            if self.deliverer(broker) == Some(neighbor) {
                changed |= self.replace_deliverer(broker, neighbor, out);
            }
        }
        changed
    }

    /// The next hop towards `broker` may have changed.
    ///
    /// Returns `true` if a known set changed.
    pub fn on_route_changed(&mut self, broker: BrokerId, out: &mut Outbox) -> bool {
        if broker == self.own {
            return false;
        }
        let next = self.routes.next_hop(broker).filter(|&hop| hop != self.own);
        let current = self.deliverer(broker);
        if next == current {
            return false;
        }
        if let Some(old) = current {
            out.neighbor(
                old,
                Telegram::AdvertisementUnsubscribe(AdvertisementBrokers::single(broker)),
            );
        }
        let Some(hop) = next else {
            return self.tear_down(broker, out);
        };

        tracing::debug!(broker = %broker, deliverer = %hop, "Advertisement deliverer changed");
        let entry = self.entries.entry(broker).or_default();
        entry.deliverer = Some(hop);
        if entry.subscribers.remove(&hop) {
            out.neighbor(hop, withdraw(broker));
        }
        out.neighbor(hop, Telegram::AdvertisementSubscribe(AdvertisementBrokers::single(broker)));
        false
    }

    /// Merge an update received from `from`.
    ///
    /// Returns `true` if the set changed.
    pub fn on_update(
        &mut self,
        from: BrokerId,
        update: AdvertisementUpdate,
        out: &mut Outbox,
    ) -> bool {
        let broker = update.broker;
        if broker == self.own {
            return false;
        }
        let Some(entry) = self.entries.get_mut(&broker) else {
            tracing::debug!(from = %from, broker = %broker, "Advertisement update for unknown broker");
            return false;
        };
        if entry.deliverer != Some(from) {
            tracing::debug!(from = %from, broker = %broker, "Ignoring advertisement update from a neighbor that is not the deliverer");
            return false;
        }

        let forwarded = if update.reset {
            let objects: BTreeSet<ObjectId> = update.added_objects.into_iter().collect();
            let usages: BTreeSet<AttributeUsageId> = update.added_usages.into_iter().collect();
            if objects == entry.objects && usages == entry.usages {
                return false;
            }
            entry.objects = objects;
            entry.usages = usages;
            entry.full_update(broker)
        } else {
            let mut diff = AdvertisementUpdate::new(broker);
            for object in update.added_objects {
                if entry.objects.insert(object) {
                    diff.added_objects.push(object);
                }
            }
            for object in update.removed_objects {
                if entry.objects.remove(&object) {
                    diff.removed_objects.push(object);
                }
            }
            for usage in update.added_usages {
                if entry.usages.insert(usage) {
                    diff.added_usages.push(usage);
                }
            }
            for usage in update.removed_usages {
                if entry.usages.remove(&usage) {
                    diff.removed_usages.push(usage);
                }
            }
            if diff.is_empty() {
                return false;
            }
            diff
        };

        self.forward(forwarded, Some(from), out);
        true
    }

    /// `neighbor` disconnected.
    ///
    /// Returns `true` if a known set changed.
    pub fn on_neighbor_closed(&mut self, neighbor: BrokerId, out: &mut Outbox) -> bool {
        for entry in self.entries.values_mut() {
            entry.subscribers.remove(&neighbor);
        }
        let delivered: Vec<BrokerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deliverer == Some(neighbor))
            .map(|(&broker, _)| broker)
            .collect();
        let mut changed = false;
        for broker in delivered {
            changed |= self.replace_deliverer(broker, neighbor, out);
        }
        changed
    }

    /// Create the entry for `broker` if missing and subscribe upstream.
    fn ensure_entry(&mut self, broker: BrokerId, out: &mut Outbox) -> Option<BrokerId> {
        if let Some(entry) = self.entries.get(&broker) {
            return entry.deliverer;
        }
        let hop = self.routes.next_hop(broker).filter(|&hop| hop != self.own)?;
        self.entries.insert(
            broker,
            AdvertisementEntry {
                deliverer: Some(hop),
                ..AdvertisementEntry::default()
            },
        );
        out.neighbor(hop, Telegram::AdvertisementSubscribe(AdvertisementBrokers::single(broker)));
        Some(hop)
    }

    /// Drop `lost` as deliverer of `broker` and pick another one if possible.
    ///
    /// With an alternative deliverer the downstream subscribers stay
    /// subscribed and get an empty `reset` update instead of a withdrawal;
    /// the new deliverer's replay refills their sets. Without one the entry
    /// is torn down and withdrawn.
    fn replace_deliverer(&mut self, broker: BrokerId, lost: BrokerId, out: &mut Outbox) -> bool {
        let next = self
            .routes
            .next_hop(broker)
            .filter(|&hop| hop != lost && hop != self.own);
        let Some(hop) = next else {
            return self.tear_down(broker, out);
        };
        let Some(entry) = self.entries.get_mut(&broker) else {
            return false;
        };

        let had_ids = entry.has_ids();
        entry.objects.clear();
        entry.usages.clear();
        entry.deliverer = Some(hop);
        if entry.subscribers.remove(&hop) {
            out.neighbor(hop, withdraw(broker));
        }
        tracing::debug!(broker = %broker, lost = %lost, deliverer = %hop, "Advertisement deliverer replaced");
        out.neighbor(hop, Telegram::AdvertisementSubscribe(AdvertisementBrokers::single(broker)));
        if had_ids {
            let mut reset = AdvertisementUpdate::new(broker);
            reset.reset = true;
            self.forward(reset, None, out);
        }
        had_ids
    }

    /// Remove the entry of an unreachable broker and withdraw it downstream.
    fn tear_down(&mut self, broker: BrokerId, out: &mut Outbox) -> bool {
        let Some(entry) = self.entries.remove(&broker) else {
            return false;
        };
        tracing::debug!(broker = %broker, subscribers = entry.subscribers.len(), "Advertisement entry torn down");
        for &subscriber in &entry.subscribers {
            out.neighbor(subscriber, withdraw(broker));
        }
        entry.has_ids()
    }

    fn forward(&self, update: AdvertisementUpdate, except: Option<BrokerId>, out: &mut Outbox) {
        let Some(entry) = self.entries.get(&update.broker) else {
            return;
        };
        if entry.subscribers.is_empty() {
            return;
        }
        for chunk in update.split(self.config.max_objects, self.config.max_usages) {
            for &subscriber in &entry.subscribers {
                if Some(subscriber) != except {
                    out.neighbor(subscriber, Telegram::AdvertisementUpdate(chunk.clone()));
                }
            }
        }
    }
}

fn withdraw(broker: BrokerId) -> Telegram {
    Telegram::AdvertisementWithdraw(AdvertisementBrokers::single(broker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbound;
    use meshroute_core::StaticRouteTable;

    const OWN: BrokerId = BrokerId(1);

    fn propagator(routes: &Arc<StaticRouteTable>) -> AdvertisementPropagator {
        AdvertisementPropagator::new(OWN, AdvertisementConfig::default(), routes.clone())
    }

    fn sent(out: &mut Outbox) -> Vec<(BrokerId, Telegram)> {
        out.take()
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Neighbor { to, telegram } => Some((to, telegram)),
                Outbound::Application { .. } => None,
            })
            .collect()
    }

    fn update(broker: i64, objects: &[u64], usages: &[u64]) -> AdvertisementUpdate {
        let mut update = AdvertisementUpdate::new(BrokerId(broker));
        update.added_objects = objects.iter().copied().map(ObjectId).collect();
        update.added_usages = usages.iter().copied().map(AttributeUsageId).collect();
        update
    }

    #[test]
    fn shared_ids_are_sent_once() {
        let routes = Arc::new(StaticRouteTable::new());
        let mut adverts = propagator(&routes);
        let mut out = Outbox::new();
        let start = Instant::now();

        adverts.on_neighbor_subscribe(BrokerId(2), &[OWN], &mut out);
        sent(&mut out);

        adverts.add_local(&DataItemKey::new(7, 1, 0), start);
        adverts.add_local(&DataItemKey::new(7, 2, 0), start);
        assert_eq!(adverts.next_deadline(), Some(start + Duration::from_millis(100)));
        assert!(!adverts.flush_due(start, &mut out));

        assert!(adverts.flush_due(start + Duration::from_millis(100), &mut out));
        let telegrams = sent(&mut out);
        assert_eq!(telegrams.len(), 1);
        let Telegram::AdvertisementUpdate(update) = &telegrams[0].1 else {
            panic!("expected an update");
        };
        assert_eq!(update.added_objects, vec![ObjectId(7)]);
        assert_eq!(update.added_usages, vec![AttributeUsageId(1), AttributeUsageId(2)]);

        // Object 7 is still referenced by the second key.
        adverts.remove_local(&DataItemKey::new(7, 1, 0), start);
        assert!(adverts.flush_due(start + Duration::from_secs(1), &mut out));
        let telegrams = sent(&mut out);
        let Telegram::AdvertisementUpdate(update) = &telegrams[0].1 else {
            panic!("expected an update");
        };
        assert!(update.removed_objects.is_empty());
        assert_eq!(update.removed_usages, vec![AttributeUsageId(1)]);
    }

    #[test]
    fn add_then_remove_before_flush_is_silent() {
        let routes = Arc::new(StaticRouteTable::new());
        let mut adverts = propagator(&routes);
        let mut out = Outbox::new();
        let start = Instant::now();
        adverts.on_neighbor_subscribe(BrokerId(2), &[OWN], &mut out);
        sent(&mut out);

        let key = DataItemKey::new(3, 4, 0);
        adverts.add_local(&key, start);
        adverts.remove_local(&key, start + Duration::from_millis(10));

        assert_eq!(adverts.next_deadline(), None);
        assert!(!adverts.flush_due(start + Duration::from_secs(5), &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn deliverer_may_not_subscribe() {
        let routes = Arc::new(StaticRouteTable::with_routes([(BrokerId(9), BrokerId(2))]));
        let mut adverts = propagator(&routes);
        let mut out = Outbox::new();

        adverts.on_route_changed(BrokerId(9), &mut out);
        assert_eq!(
            sent(&mut out),
            vec![(
                BrokerId(2),
                Telegram::AdvertisementSubscribe(AdvertisementBrokers::single(BrokerId(9)))
            )]
        );

        adverts.on_neighbor_subscribe(BrokerId(2), &[BrokerId(9)], &mut out);
        assert_eq!(sent(&mut out), vec![(BrokerId(2), withdraw(BrokerId(9)))]);
        assert!(adverts.subscribers(BrokerId(9)).is_empty());
    }

    #[test]
    fn updates_are_merged_and_forwarded() {
        let routes = Arc::new(StaticRouteTable::with_routes([(BrokerId(9), BrokerId(2))]));
        let mut adverts = propagator(&routes);
        let mut out = Outbox::new();
        adverts.on_route_changed(BrokerId(9), &mut out);
        adverts.on_neighbor_subscribe(BrokerId(3), &[BrokerId(9)], &mut out);
        sent(&mut out);

        // Only the deliverer is listened to.
        assert!(!adverts.on_update(BrokerId(3), update(9, &[5], &[6]), &mut out));
        assert!(adverts.on_update(BrokerId(2), update(9, &[5], &[6]), &mut out));
        assert_eq!(
            adverts.potential_central_brokers(&DataItemKey::new(5, 6, 0)),
            vec![BrokerId(9)]
        );
        assert!(adverts
            .potential_central_brokers(&DataItemKey::new(5, 7, 0))
            .is_empty());

        let telegrams = sent(&mut out);
        assert_eq!(telegrams.len(), 1);
        assert_eq!(telegrams[0].0, BrokerId(3));

        // Nothing new, nothing forwarded.
        assert!(!adverts.on_update(BrokerId(2), update(9, &[5], &[]), &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn withdrawal_without_alternative_tears_down() {
        let routes = Arc::new(StaticRouteTable::with_routes([(BrokerId(9), BrokerId(2))]));
        let mut adverts = propagator(&routes);
        let mut out = Outbox::new();
        adverts.on_route_changed(BrokerId(9), &mut out);
        adverts.on_neighbor_subscribe(BrokerId(3), &[BrokerId(9)], &mut out);
        adverts.on_update(BrokerId(2), update(9, &[5], &[6]), &mut out);
        sent(&mut out);

        assert!(adverts.on_neighbor_withdraw(BrokerId(2), &[BrokerId(9)], &mut out));
        assert_eq!(sent(&mut out), vec![(BrokerId(3), withdraw(BrokerId(9)))]);
        assert_eq!(adverts.deliverer(BrokerId(9)), None);
        assert!(!adverts.known_brokers().contains(&BrokerId(9)));
    }

    #[test]
    fn route_change_moves_the_subscription() {
        let routes = Arc::new(StaticRouteTable::with_routes([(BrokerId(9), BrokerId(2))]));
        let mut adverts = propagator(&routes);
        let mut out = Outbox::new();
        adverts.on_route_changed(BrokerId(9), &mut out);
        adverts.on_neighbor_subscribe(BrokerId(3), &[BrokerId(9)], &mut out);
        sent(&mut out);

        routes.set_route(BrokerId(9), BrokerId(3));
        adverts.on_route_changed(BrokerId(9), &mut out);
        assert_eq!(
            sent(&mut out),
            vec![
                (
                    BrokerId(2),
                    Telegram::AdvertisementUnsubscribe(AdvertisementBrokers::single(BrokerId(9)))
                ),
                (BrokerId(3), withdraw(BrokerId(9))),
                (
                    BrokerId(3),
                    Telegram::AdvertisementSubscribe(AdvertisementBrokers::single(BrokerId(9)))
                ),
            ]
        );
        assert_eq!(adverts.deliverer(BrokerId(9)), Some(BrokerId(3)));
    }
}
