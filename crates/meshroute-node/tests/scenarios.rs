use meshroute_core::{
    ApplicationId, BrokerId, DataItemKey, MemoryValueCache, Origin, Principal, ReceiptState,
    RightsTable, Role, StaticRouteTable, StatusCode, UserId,
};
use meshroute_node::{
    AdvertisementConfig, ApplicationEvent, Outbound, RoutingEngine, RoutingError,
};
use meshroute_proto::{
    AdvertisementBrokers, AdvertisementUpdate, DataFlow, Telegram, TransmitterDataSubscription,
    TransmitterDataSubscriptionReceipt, TransmitterDataTelegram,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const APP: ApplicationId = ApplicationId(100);
const USER: UserId = UserId(100);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn key() -> DataItemKey {
    DataItemKey::new(1, 1, 0)
}

fn b(id: i64) -> BrokerId {
    BrokerId(id)
}

struct Node {
    engine: RoutingEngine,
    routes: Arc<StaticRouteTable>,
    rights: Arc<RightsTable>,
    now: Instant,
}

impl Node {
    fn new(own: i64) -> Self {
        init_tracing();
        let routes = Arc::new(StaticRouteTable::new());
        let rights = Arc::new(RightsTable::allow_all());
        let engine = RoutingEngine::new(
            b(own),
            AdvertisementConfig::default(),
            routes.clone(),
            rights.clone(),
            Box::new(MemoryValueCache::new()),
        );
        Self {
            engine,
            routes,
            rights,
            now: Instant::now(),
        }
    }

    fn route(&mut self, target: i64, hop: i64) {
        self.routes.set_route(b(target), b(hop));
        self.engine.on_route_changed(b(target), self.now);
    }

    /// Learn that `broker`, reached through `via`, hosts central roles for `keys`.
    fn advertise(&mut self, broker: i64, via: i64, keys: &[DataItemKey]) {
        self.route(broker, via);
        let mut update = AdvertisementUpdate::new(b(broker));
        update.reset = true;
        update.added_objects = keys.iter().map(|key| key.object).collect();
        update.added_usages = keys.iter().map(|key| key.usage).collect();
        self.telegram(via, Telegram::AdvertisementUpdate(update));
        self.drain();
    }

    fn telegram(&mut self, from: i64, telegram: Telegram) {
        self.engine.handle_telegram(b(from), telegram, self.now);
    }

    fn receiver(&mut self, app: ApplicationId) {
        self.engine
            .request_participant(app, UserId(app.0), key(), Role::Receiver, self.now)
            .unwrap();
    }

    fn drain(&mut self) -> Vec<Outbound> {
        self.engine.take_outbox()
    }
}

fn subscribe(role: Role, candidates: &[i64]) -> Telegram {
    Telegram::Subscribe(TransmitterDataSubscription::new(
        key(),
        role,
        candidates.iter().copied().map(b).collect(),
    ))
}

fn unsubscribe(role: Role, candidates: &[i64]) -> Telegram {
    Telegram::Unsubscribe(TransmitterDataSubscription::new(
        key(),
        role,
        candidates.iter().copied().map(b).collect(),
    ))
}

fn receipt(role: Role, candidates: &[i64], state: ReceiptState, central: Option<i64>) -> Telegram {
    Telegram::Receipt(TransmitterDataSubscriptionReceipt {
        key: key(),
        role,
        candidates: candidates.iter().copied().map(b).collect(),
        state,
        central: central.map(b),
    })
}

fn data(index: u64, flow: DataFlow) -> Telegram {
    Telegram::Data(TransmitterDataTelegram {
        key: key(),
        index,
        payload: index.to_be_bytes().to_vec(),
        flow,
    })
}

fn to_neighbor(out: &[Outbound], to: i64) -> Vec<Telegram> {
    out.iter()
        .filter_map(|outbound| match outbound {
            Outbound::Neighbor { to: dest, telegram } if *dest == b(to) => Some(telegram.clone()),
            _ => None,
        })
        .collect()
}

fn to_app(out: &[Outbound], app: ApplicationId) -> Vec<ApplicationEvent> {
    out.iter()
        .filter_map(|outbound| match outbound {
            Outbound::Application { to, event } if *to == app => Some(event.clone()),
            _ => None,
        })
        .collect()
}

/// Indexes of payload deliveries to `app`, in order.
fn delivered(out: &[Outbound], app: ApplicationId) -> Vec<u64> {
    to_app(out, app)
        .into_iter()
        .filter_map(|event| match event {
            ApplicationEvent::Deliver {
                index: Some(index),
                payload: Some(_),
                ..
            } => Some(index),
            _ => None,
        })
        .collect()
}

fn status(status: StatusCode) -> ApplicationEvent {
    ApplicationEvent::Deliver {
        key: key(),
        payload: None,
        index: None,
        status,
    }
}

/// Data subscriptions and cancellations sent to `to`.
fn subscriptions_to(out: &[Outbound], to: i64) -> Vec<Telegram> {
    to_neighbor(out, to)
        .into_iter()
        .filter(|telegram| matches!(telegram, Telegram::Subscribe(_) | Telegram::Unsubscribe(_)))
        .collect()
}

fn neighbor_telegrams(out: &[Outbound]) -> usize {
    out.iter()
        .filter(|outbound| matches!(outbound, Outbound::Neighbor { .. }))
        .count()
}

#[test]
fn receiver_forwards_one_leg_per_next_hop() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.advertise(11, 2, &[key()]);

    node.receiver(APP);
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![subscribe(Role::Receiver, &[10, 11])]);
    assert_eq!(neighbor_telegrams(&out), 1);
    assert!(to_app(&out, APP).is_empty());

    node.telegram(2, receipt(Role::Receiver, &[10, 11], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(1, DataFlow::FromSource));
    node.telegram(3, data(2, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(to_app(&out, APP)[0], status(StatusCode::Ok));
    assert_eq!(delivered(&out, APP), vec![1]);

    let request = node.engine.snapshot().requests.remove(0);
    assert_eq!(request.state, ReceiptState::Positive);
    assert_eq!(request.central, Some(b(10)));
    assert_eq!(request.next_hops, vec![b(2)]);
}

#[test]
fn second_central_role_is_rejected_without_effects() {
    let mut node = Node::new(1);
    node.engine
        .request_central_role(ApplicationId(1), UserId(1), key(), Role::Source, node.now)
        .unwrap();
    node.drain();

    for role in [Role::Source, Role::Drain] {
        let err = node
            .engine
            .request_central_role(ApplicationId(2), UserId(2), key(), role, node.now)
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::CentralRoleTaken {
                key: key(),
                holder: Origin::Application(ApplicationId(1)),
            }
        );
    }
    assert!(node.drain().is_empty());

    // The holder asking again is fine.
    assert!(node
        .engine
        .request_central_role(ApplicationId(1), UserId(1), key(), Role::Source, node.now)
        .is_ok());
    assert!(matches!(
        node.engine
            .request_central_role(ApplicationId(1), UserId(1), key(), Role::Receiver, node.now),
        Err(RoutingError::RoleMismatch { role: Role::Receiver })
    ));
}

#[test]
fn neighbor_receiver_is_bound_to_local_source() {
    let mut node = Node::new(1);
    let source = ApplicationId(1);
    node.engine
        .request_central_role(source, UserId(1), key(), Role::Source, node.now)
        .unwrap();
    node.engine.publish(source, key(), 5, b"five".to_vec());
    let out = node.drain();
    assert!(to_app(&out, source).is_empty());

    node.telegram(2, subscribe(Role::Receiver, &[1]));
    let out = node.drain();
    assert_eq!(
        to_neighbor(&out, 2),
        vec![
            receipt(Role::Receiver, &[1], ReceiptState::Positive, Some(1)),
            Telegram::Data(TransmitterDataTelegram {
                key: key(),
                index: 5,
                payload: b"five".to_vec(),
                flow: DataFlow::FromSource,
            }),
        ]
    );
    assert_eq!(
        to_app(&out, source),
        vec![ApplicationEvent::SetSendEnabled {
            key: key(),
            enabled: true,
            reason: StatusCode::Ok,
        }]
    );

    node.engine.publish(source, key(), 6, b"six".to_vec());
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2).len(), 1);

    node.telegram(2, unsubscribe(Role::Receiver, &[1]));
    let out = node.drain();
    assert_eq!(
        to_app(&out, source),
        vec![ApplicationEvent::SetSendEnabled {
            key: key(),
            enabled: false,
            reason: StatusCode::NoReceivers,
        }]
    );
}

#[test]
fn sender_data_reaches_local_drain() {
    let mut node = Node::new(1);
    let drain = ApplicationId(1);
    let sender = ApplicationId(2);
    node.engine
        .request_central_role(drain, UserId(1), key(), Role::Drain, node.now)
        .unwrap();

    node.telegram(2, subscribe(Role::Sender, &[1]));
    let out = node.drain();
    assert_eq!(
        to_neighbor(&out, 2),
        vec![receipt(Role::Sender, &[1], ReceiptState::Positive, Some(1))]
    );

    node.telegram(2, data(7, DataFlow::ToDrain));
    let out = node.drain();
    assert_eq!(delivered(&out, drain), vec![7]);

    node.engine
        .request_participant(sender, UserId(2), key(), Role::Sender, node.now)
        .unwrap();
    node.engine.publish(sender, key(), 8, b"eight".to_vec());
    let out = node.drain();
    assert_eq!(
        to_app(&out, sender),
        vec![ApplicationEvent::SetSendEnabled {
            key: key(),
            enabled: true,
            reason: StatusCode::Ok,
        }]
    );
    assert_eq!(delivered(&out, drain), vec![8]);

    // Sender data from a neighbor without a granted request goes nowhere.
    node.telegram(3, data(9, DataFlow::ToDrain));
    assert!(node.drain().is_empty());
}

#[test]
fn sender_data_follows_the_winning_leg() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    let sender = ApplicationId(5);
    node.engine
        .request_participant(sender, UserId(5), key(), Role::Sender, node.now)
        .unwrap();
    node.telegram(2, receipt(Role::Sender, &[10], ReceiptState::Positive, Some(10)));
    let out = node.drain();
    assert_eq!(
        to_app(&out, sender),
        vec![ApplicationEvent::SetSendEnabled {
            key: key(),
            enabled: true,
            reason: StatusCode::Ok,
        }]
    );

    node.engine.publish(sender, key(), 1, b"one".to_vec());
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![data_with(1, b"one", DataFlow::ToDrain)]);
}

fn data_with(index: u64, payload: &[u8], flow: DataFlow) -> Telegram {
    Telegram::Data(TransmitterDataTelegram {
        key: key(),
        index,
        payload: payload.to_vec(),
        flow,
    })
}

#[test]
fn redirection_keeps_index_continuity() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);
    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(1, DataFlow::FromSource));
    node.telegram(2, data(2, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(delivered(&out, APP), vec![1, 2]);

    node.route(10, 3);
    let out = node.drain();
    assert!(to_neighbor(&out, 3).contains(&subscribe(Role::Receiver, &[10])));
    assert!(!to_neighbor(&out, 2).contains(&unsubscribe(Role::Receiver, &[10])));
    assert_eq!(node.engine.snapshot().redirections.len(), 1);

    // The old route keeps delivering while the new one lags behind.
    node.telegram(3, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(3, DataFlow::FromSource));
    node.telegram(3, data(2, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(delivered(&out, APP), vec![3]);
    assert!(to_neighbor(&out, 2).is_empty());

    // Catching up cuts over without repeating index 3.
    node.telegram(3, data(3, DataFlow::FromSource));
    let out = node.drain();
    assert!(delivered(&out, APP).is_empty());
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);
    assert!(to_app(&out, APP).is_empty());

    node.telegram(3, data(4, DataFlow::FromSource));
    node.telegram(2, data(5, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(delivered(&out, APP), vec![4]);

    let snapshot = node.engine.snapshot();
    assert!(snapshot.redirections.is_empty());
    assert_eq!(snapshot.requests[0].next_hops, vec![b(3)]);
}

#[test]
fn redirection_timeout_cuts_over_or_abandons() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);
    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(1, DataFlow::FromSource));
    node.route(10, 3);
    node.drain();

    let timeout = Duration::from_secs(5);
    assert_eq!(
        node.engine.next_redirection_deadline(timeout),
        Some(node.now + timeout)
    );

    // Unresolved: the new legs go away, the old route stays.
    node.engine
        .expire_redirections(node.now + Duration::from_secs(6), timeout);
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 3), vec![unsubscribe(Role::Receiver, &[10])]);
    assert_eq!(node.engine.snapshot().requests[0].next_hops, vec![b(2)]);

    // Route flips again and this time resolves, but never catches up.
    node.route(10, 2);
    node.route(10, 3);
    node.telegram(3, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.drain();
    node.engine
        .expire_redirections(node.now + Duration::from_secs(6), timeout);
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);
    assert_eq!(node.engine.snapshot().requests[0].next_hops, vec![b(3)]);
    assert!(node.engine.next_redirection_deadline(timeout).is_none());
}

#[test]
fn second_route_change_supersedes_redirection() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);
    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(1, DataFlow::FromSource));
    node.route(10, 3);
    node.drain();

    node.route(10, 4);
    let out = node.drain();
    assert_eq!(subscriptions_to(&out, 3), vec![unsubscribe(Role::Receiver, &[10])]);
    assert_eq!(subscriptions_to(&out, 4), vec![subscribe(Role::Receiver, &[10])]);
    assert!(subscriptions_to(&out, 2).is_empty());

    let snapshot = node.engine.snapshot();
    assert_eq!(snapshot.redirections.len(), 1);
    assert_eq!(snapshot.redirections[0].old_hops, vec![b(2)]);
    assert_eq!(snapshot.redirections[0].new_hops, vec![b(4)]);

    // The route that was never replaced still delivers until cutover.
    node.telegram(4, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(2, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(delivered(&out, APP), vec![2]);

    node.telegram(4, data(2, DataFlow::FromSource));
    let out = node.drain();
    assert!(delivered(&out, APP).is_empty());
    assert_eq!(subscriptions_to(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);
    assert_eq!(node.engine.snapshot().requests[0].next_hops, vec![b(4)]);
}

#[test]
fn closing_redirection_hop_keeps_established_route() {
    let mut node = Node::new(1);
    node.routes.set_route(b(10), b(2));
    node.telegram(5, subscribe(Role::Receiver, &[10]));
    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(1, DataFlow::FromSource));
    let out = node.drain();
    assert!(to_neighbor(&out, 5).contains(&data(1, DataFlow::FromSource)));

    node.route(10, 3);
    assert_eq!(node.engine.snapshot().redirections.len(), 1);
    node.drain();

    // The link layer restores the old route and drops the new neighbor.
    node.routes.set_route(b(10), b(2));
    node.engine.connection_closed(Origin::Transmitter(b(3)), node.now);
    let out = node.drain();
    assert!(subscriptions_to(&out, 2).is_empty());
    assert!(to_neighbor(&out, 5).is_empty());

    let snapshot = node.engine.snapshot();
    assert!(snapshot.redirections.is_empty());
    assert_eq!(snapshot.requests[0].next_hops, vec![b(2)]);

    node.telegram(2, data(2, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 5), vec![data(2, DataFlow::FromSource)]);
}

#[test]
fn competing_authorities_resolve_multiple_positive_for_every_holder() {
    let mut node = Node::new(1);
    node.routes.set_route(b(2), b(2));
    node.routes.set_route(b(3), b(3));

    node.telegram(4, subscribe(Role::Receiver, &[2, 3]));
    node.telegram(5, subscribe(Role::Receiver, &[2, 3]));
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![subscribe(Role::Receiver, &[2])]);
    assert_eq!(to_neighbor(&out, 3), vec![subscribe(Role::Receiver, &[3])]);

    node.telegram(2, receipt(Role::Receiver, &[2], ReceiptState::Positive, Some(2)));
    assert!(node.drain().is_empty());
    node.telegram(3, receipt(Role::Receiver, &[3], ReceiptState::Positive, Some(3)));
    let out = node.drain();

    for asker in [4, 5] {
        assert_eq!(
            to_neighbor(&out, asker),
            vec![receipt(Role::Receiver, &[2, 3], ReceiptState::MultiplePositive, None)]
        );
    }
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[2])]);
    assert_eq!(to_neighbor(&out, 3), vec![unsubscribe(Role::Receiver, &[3])]);
    assert_eq!(node.engine.snapshot().shared_legs, 0);
}

#[test]
fn shared_leg_reuses_terminal_resolution() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);
    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.drain();

    let other = ApplicationId(101);
    node.receiver(other);
    let out = node.drain();
    assert_eq!(neighbor_telegrams(&out), 0);
    assert_eq!(to_app(&out, other), vec![status(StatusCode::Ok)]);

    node.telegram(2, data(1, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(delivered(&out, APP), vec![1]);
    assert_eq!(delivered(&out, other), vec![1]);

    // Only the last holder unsubscribes the leg.
    node.engine.unsubscribe(APP, key(), Role::Receiver, node.now);
    assert!(node.drain().is_empty());
    node.engine.unsubscribe(other, key(), Role::Receiver, node.now);
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);
}

#[test]
fn neighbor_request_is_relayed_towards_the_central_broker() {
    let mut node = Node::new(1);
    node.routes.set_route(b(10), b(2));

    // This broker is named as a candidate but holds no central role.
    node.telegram(5, subscribe(Role::Receiver, &[1, 10]));
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![subscribe(Role::Receiver, &[10])]);

    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(2, data(1, DataFlow::FromSource));
    let out = node.drain();
    assert_eq!(
        to_neighbor(&out, 5),
        vec![
            receipt(Role::Receiver, &[1, 10], ReceiptState::Positive, Some(10)),
            data(1, DataFlow::FromSource),
        ]
    );

    // A repeated subscription replays the outcome.
    node.telegram(5, subscribe(Role::Receiver, &[1, 10]));
    let out = node.drain();
    assert_eq!(
        to_neighbor(&out, 5)[0],
        receipt(Role::Receiver, &[1, 10], ReceiptState::Positive, Some(10))
    );
}

#[test]
fn request_is_never_routed_back_to_the_asker() {
    let mut node = Node::new(1);
    node.routes.set_route(b(10), b(2));

    node.telegram(2, subscribe(Role::Receiver, &[10]));
    let out = node.drain();
    assert_eq!(
        to_neighbor(&out, 2),
        vec![receipt(Role::Receiver, &[10], ReceiptState::Negative, None)]
    );
    assert_eq!(neighbor_telegrams(&out), 1);

    node.telegram(3, subscribe(Role::Source, &[10]));
    node.telegram(3, subscribe(Role::Receiver, &[]));
    let out = node.drain();
    assert_eq!(
        to_neighbor(&out, 3),
        vec![
            receipt(Role::Source, &[10], ReceiptState::Negative, None),
            receipt(Role::Receiver, &[], ReceiptState::Negative, None),
        ]
    );
}

#[test]
fn negative_outcomes_release_every_leg() {
    let mut node = Node::new(1);

    // No advertisement at all.
    node.receiver(APP);
    let out = node.drain();
    assert_eq!(to_app(&out, APP), vec![status(StatusCode::NoSourceDrain)]);
    assert_eq!(neighbor_telegrams(&out), 0);
    node.engine.unsubscribe(APP, key(), Role::Receiver, node.now);

    node.advertise(10, 2, &[key()]);
    node.advertise(11, 3, &[key()]);
    node.receiver(APP);
    node.drain();
    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Negative, None));
    node.telegram(3, receipt(Role::Receiver, &[11], ReceiptState::Negative, None));
    let out = node.drain();
    assert_eq!(to_app(&out, APP), vec![status(StatusCode::NoSourceDrain)]);
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);
    assert_eq!(to_neighbor(&out, 3), vec![unsubscribe(Role::Receiver, &[11])]);

    let request = node.engine.snapshot().requests.remove(0);
    assert_eq!(request.state, ReceiptState::Negative);
    assert_eq!(request.central, None);
    assert!(request.next_hops.is_empty());
}

#[test]
fn positive_outcome_keeps_only_the_winner() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.advertise(11, 3, &[key()]);
    node.receiver(APP);
    node.drain();

    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Negative, None));
    node.telegram(3, receipt(Role::Receiver, &[11], ReceiptState::Positive, Some(11)));
    let out = node.drain();
    assert_eq!(to_app(&out, APP), vec![status(StatusCode::Ok)]);
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);
    assert!(to_neighbor(&out, 3).is_empty());

    let request = node.engine.snapshot().requests.remove(0);
    assert_eq!(request.central, Some(b(11)));
    assert_eq!(request.next_hops, vec![b(3)]);
}

#[test]
fn denied_rights_are_reported_without_forwarding() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.rights.deny(Principal::User(USER), key(), Role::Receiver);

    node.receiver(APP);
    let out = node.drain();
    assert_eq!(to_app(&out, APP), vec![status(StatusCode::NoRights)]);
    assert_eq!(neighbor_telegrams(&out), 0);

    let source = ApplicationId(1);
    node.rights.deny(Principal::User(UserId(1)), key(), Role::Source);
    node.engine
        .request_central_role(source, UserId(1), key(), Role::Source, node.now)
        .unwrap();
    let out = node.drain();
    assert_eq!(
        to_app(&out, source),
        vec![ApplicationEvent::SetSendEnabled {
            key: key(),
            enabled: false,
            reason: StatusCode::NoRights,
        }]
    );
    assert!(node.engine.potential_central_brokers(&key()).contains(&b(10)));
}

#[test]
fn unsubscribe_is_idempotent() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);
    node.drain();

    node.engine.unsubscribe(APP, key(), Role::Receiver, node.now);
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);

    node.engine.unsubscribe(APP, key(), Role::Receiver, node.now);
    node.telegram(4, unsubscribe(Role::Receiver, &[10]));
    assert!(node.drain().is_empty());
    assert!(node.engine.snapshot().requests.is_empty());
}

#[test]
fn central_role_change_rebinds_participants() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);
    node.drain();

    let source = ApplicationId(1);
    node.engine
        .request_central_role(source, UserId(1), key(), Role::Source, node.now)
        .unwrap();
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![unsubscribe(Role::Receiver, &[10])]);
    assert_eq!(to_app(&out, APP), vec![status(StatusCode::Ok)]);
    let request = node.engine.snapshot().requests.remove(0);
    assert!(request.local);
    assert_eq!(request.central, Some(b(1)));

    // Removing the Source routes the receiver again.
    node.engine.unsubscribe(source, key(), Role::Source, node.now);
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2), vec![subscribe(Role::Receiver, &[10])]);
}

#[test]
fn advertisement_add_and_remove_before_flush_send_nothing() {
    let mut node = Node::new(1);
    node.telegram(2, Telegram::AdvertisementSubscribe(AdvertisementBrokers::single(b(1))));
    let out = node.drain();
    assert_eq!(to_neighbor(&out, 2).len(), 1);

    let source = ApplicationId(1);
    node.engine
        .request_central_role(source, UserId(1), key(), Role::Source, node.now)
        .unwrap();
    node.engine.unsubscribe(source, key(), Role::Source, node.now);
    node.engine.flush_advertisements(node.now + Duration::from_secs(5));
    assert!(node.drain().is_empty());
    assert!(node.engine.next_advertisement_deadline().is_none());

    node.engine
        .request_central_role(source, UserId(1), key(), Role::Source, node.now)
        .unwrap();
    assert_eq!(
        node.engine.next_advertisement_deadline(),
        Some(node.now + Duration::from_millis(100))
    );
    node.engine.flush_advertisements(node.now + Duration::from_millis(100));
    let out = node.drain();
    let mut expected = AdvertisementUpdate::new(b(1));
    expected.added_objects = vec![key().object];
    expected.added_usages = vec![key().usage];
    assert_eq!(to_neighbor(&out, 2), vec![Telegram::AdvertisementUpdate(expected)]);
}

#[test]
fn closed_neighbor_is_never_addressed_again() {
    let mut node = Node::new(1);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);
    node.telegram(2, receipt(Role::Receiver, &[10], ReceiptState::Positive, Some(10)));
    node.telegram(4, subscribe(Role::Receiver, &[10]));
    node.drain();

    // The link layer drops the route together with the connection.
    node.routes.remove_route(b(10));
    node.engine.connection_closed(Origin::Transmitter(b(2)), node.now);
    let out = node.drain();
    assert!(to_neighbor(&out, 2).is_empty());
    assert_eq!(to_app(&out, APP), vec![status(StatusCode::NoSourceDrain)]);
    assert_eq!(
        to_neighbor(&out, 4),
        vec![receipt(Role::Receiver, &[10], ReceiptState::Negative, None)]
    );
    assert_eq!(node.engine.snapshot().shared_legs, 0);

    node.engine.connection_closed(Origin::Transmitter(b(4)), node.now);
    node.engine.connection_closed(Origin::Application(APP), node.now);
    assert!(node.drain().is_empty());
    assert!(node.engine.snapshot().requests.is_empty());
}

#[test]
fn snapshot_serializes_to_json() {
    let mut node = Node::new(7);
    node.advertise(10, 2, &[key()]);
    node.receiver(APP);

    let json = serde_json::to_value(node.engine.snapshot()).unwrap();
    assert_eq!(json["broker"], 7);
    assert_eq!(json["shared_legs"], 1);
    assert_eq!(json["requests"][0]["next_hops"][0], 2);
    assert_eq!(json["requests"][0]["state"], "Pending");
}
