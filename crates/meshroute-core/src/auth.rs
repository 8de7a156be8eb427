//! Authorization decisions.

use crate::key::DataItemKey;
use crate::role::Role;
use crate::subscription::Principal;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Decides whether a principal may take a role for a data item.
pub trait Authorizer: Send + Sync {
    /// Whether `principal` may act as `role` for `key`.
    fn is_allowed(&self, principal: Principal, key: &DataItemKey, role: Role) -> bool;
}

/// Grants everything except explicitly revoked rights.
#[derive(Debug, Default)]
pub struct RightsTable {
    denied: RwLock<HashSet<(Principal, DataItemKey, Role)>>,
}

impl RightsTable {
    /// A table granting every right.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Revoke one right.
    pub fn deny(&self, principal: Principal, key: DataItemKey, role: Role) {
        self.denied.write().insert((principal, key, role));
    }

    /// Restore one right.
    pub fn grant(&self, principal: Principal, key: DataItemKey, role: Role) {
        self.denied.write().remove(&(principal, key, role));
    }
}

impl Authorizer for RightsTable {
    fn is_allowed(&self, principal: Principal, key: &DataItemKey, role: Role) -> bool {
        !self.denied.read().contains(&(principal, *key, role))
    }
}
