//! Arena of subscription requests with secondary indexes.
//!
//! Requests live in one map keyed by a generated [`RequestId`]; removal drops
//! the record instead of leaving a tombstone. Every query returns ids in
//! ascending order so that callers iterate deterministically.

use crate::key::{BrokerId, DataItemKey};
use crate::role::{ReceiptState, Role};
use crate::subscription::{Origin, Principal, RequestId, RequestKey, SubscriptionRequest, Upstream};
use std::collections::{BTreeMap, BTreeSet};

/// Keyed store of active subscription requests.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    requests: BTreeMap<RequestId, SubscriptionRequest>,
    by_ident: BTreeMap<RequestKey, RequestId>,
    by_key: BTreeMap<DataItemKey, BTreeSet<RequestId>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request unless one with the same identity exists.
    ///
    /// Returns the id of the stored request and `true` if it was inserted by
    /// this call (first writer wins).
    pub fn put(&mut self, ident: RequestKey, principal: Principal) -> (RequestId, bool) {
        if let Some(&existing) = self.by_ident.get(&ident) {
            return (existing, false);
        }
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.by_key.entry(ident.key).or_default().insert(id);
        self.by_ident.insert(ident.clone(), id);
        self.requests
            .insert(id, SubscriptionRequest::new(id, ident, principal));
        (id, true)
    }

    /// Look up a request by identity.
    #[must_use]
    pub fn lookup(&self, ident: &RequestKey) -> Option<RequestId> {
        self.by_ident.get(ident).copied()
    }

    /// Get a request.
    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<&SubscriptionRequest> {
        self.requests.get(&id)
    }

    /// Get a request for mutation.
    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut SubscriptionRequest> {
        self.requests.get_mut(&id)
    }

    /// Remove a request by identity. Removing a missing request is a no-op.
    pub fn remove(&mut self, ident: &RequestKey) -> Option<SubscriptionRequest> {
        let id = self.by_ident.get(ident).copied()?;
        self.remove_id(id)
    }

    /// Remove a request by id.
    pub fn remove_id(&mut self, id: RequestId) -> Option<SubscriptionRequest> {
        let request = self.requests.remove(&id)?;
        self.by_ident.remove(&request.ident);
        if let Some(ids) = self.by_key.get_mut(&request.key()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(&request.key());
            }
        }
        Some(request)
    }

    /// All requests for a data item.
    #[must_use]
    pub fn find_by_key(&self, key: &DataItemKey) -> Vec<RequestId> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All requests that came in on `origin`.
    #[must_use]
    pub fn find_by_origin(&self, origin: Origin) -> Vec<RequestId> {
        self.requests
            .values()
            .filter(|request| request.origin() == origin)
            .map(|request| request.id)
            .collect()
    }

    /// All requests holding an outgoing leg towards `next_hop`.
    #[must_use]
    pub fn find_by_next_hop(&self, next_hop: BrokerId) -> Vec<RequestId> {
        self.requests
            .values()
            .filter(|request| {
                request
                    .upstream
                    .legs()
                    .iter()
                    .any(|leg| leg.next_hop == next_hop)
            })
            .map(|request| request.id)
            .collect()
    }

    /// Requests whose resolution depends on `id`.
    ///
    /// For a local central role these are the participants bound to it; for a
    /// forwarded request these are the requests sharing one of its legs.
    #[must_use]
    pub fn find_involved(&self, id: RequestId) -> Vec<RequestId> {
        let Some(request) = self.requests.get(&id) else {
            return Vec::new();
        };
        let key = request.key();
        let role = request.role();
        self.find_by_key(&key)
            .into_iter()
            .filter(|&other_id| other_id != id)
            .filter(|other_id| {
                let Some(other) = self.requests.get(other_id) else {
                    return false;
                };
                if role.is_central() {
                    return other.role() == role.participant_counterpart()
                        && other.upstream == Upstream::Local;
                }
                other.role() == role
                    && other.upstream.legs().iter().any(|theirs| {
                        request.upstream.legs().iter().any(|ours| {
                            ours.next_hop == theirs.next_hop && ours.candidates == theirs.candidates
                        })
                    })
            })
            .collect()
    }

    /// The central role a local application holds for `key`, if any.
    ///
    /// Only granted holders count; a denied central request stays registered
    /// but does not serve anybody.
    #[must_use]
    pub fn local_central(&self, key: &DataItemKey) -> Option<RequestId> {
        self.find_by_key(key).into_iter().find(|id| {
            self.requests.get(id).is_some_and(|request| {
                request.role().is_central()
                    && request.state == ReceiptState::Positive
                    && matches!(request.origin(), Origin::Application(_))
            })
        })
    }

    /// The local central request serving `role` for `key`, if any.
    #[must_use]
    pub fn local_central_for(&self, key: &DataItemKey, role: Role) -> Option<RequestId> {
        let wanted = role.central_counterpart();
        self.local_central(key)
            .filter(|id| self.requests.get(id).is_some_and(|r| r.role() == wanted))
    }

    /// Iterate all requests in id order.
    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionRequest> {
        self.requests.values()
    }

    /// All request ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.keys().copied().collect()
    }

    /// Number of requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
