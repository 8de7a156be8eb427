//! # meshroute node
//!
//! Forwarding kernel of a meshroute broker.
//!
//! ## Architecture
//!
//! The node is built from three layers:
//! 1. **Advertisement**: learns which central roles exist behind which
//!    broker and keeps neighbors informed of changes
//! 2. **Routing**: resolves subscriptions towards the unique central role of
//!    a data item, shares identical legs, and redirects established routes
//!    without losing or repeating values
//! 3. **Runtime**: a single task owning all routing state, fed by connection
//!    handles and draining effects into neighbor and application sinks
//!
//! The routing layer is synchronous and performs no I/O, so it can be driven
//! directly in tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod advertise;
pub mod config;
pub mod engine;
pub mod error;
pub mod outbox;
pub mod runtime;
pub mod sink;

pub use advertise::{AdvertisementConfig, AdvertisementPropagator};
pub use config::NodeConfig;
pub use engine::{EngineSnapshot, RedirectionSnapshot, RequestSnapshot, RoutingEngine};
pub use error::{NodeError, RoutingError, SinkError};
pub use outbox::{ApplicationEvent, Outbound, Outbox};
pub use runtime::{NodeHandle, NodeRuntime};
pub use sink::{ApplicationSink, ChannelSink, NeighborSink};
