//! # meshroute core
//!
//! Data model shared by the forwarding kernel of a publish/subscribe mesh.
//!
//! This crate provides:
//! - Identifiers for brokers, applications and data items
//! - Roles, receipt states and application status codes
//! - Subscription requests, outgoing legs and the arena registry holding them
//! - Redirection bookkeeping with the delivery-index continuity check
//! - Contracts for route selection, authorization and the most-recent-value
//!   cache, with in-memory implementations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cache;
pub mod key;
pub mod redirect;
pub mod refcount;
pub mod registry;
pub mod role;
pub mod route;
pub mod subscription;

pub use auth::{Authorizer, RightsTable};
pub use cache::{CachedValue, MemoryValueCache, ValueCache};
pub use key::{
    ApplicationId, AttributeUsageId, BrokerId, DataItemKey, ObjectId, SimulationVariant, UserId,
};
pub use redirect::{DeliveryPath, RedirectionTask};
pub use refcount::{RefCount, Transition};
pub use registry::SubscriptionRegistry;
pub use role::{ReceiptState, Role, StatusCode};
pub use route::{RouteSelector, StaticRouteTable};
pub use subscription::{
    leg_verdict, LegPlan, LegVerdict, Origin, OutgoingLeg, Principal, RequestId, RequestKey,
    SubscriptionRequest, Upstream,
};
