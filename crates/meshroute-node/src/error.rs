//! Error types for the node crate.

use meshroute_core::{DataItemKey, Origin, Role};

/// Errors returned synchronously by subscription calls.
///
/// Routing outcomes such as "no source" or "no rights" are not errors; they
/// are reported to the requester through its connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// Another local connection already holds the central role
    #[error("central role for {key} is already held by {holder}")]
    CentralRoleTaken {
        /// Data item
        key: DataItemKey,
        /// Connection holding the role
        holder: Origin,
    },
    /// The call does not accept this role
    #[error("role {role} is not valid for this call")]
    RoleMismatch {
        /// Role that was passed
        role: Role,
    },
}

/// Errors from the node runtime handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// The runtime task has stopped
    #[error("node runtime is not running")]
    ChannelClosed,
    /// The routing engine rejected the call
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Errors from delivering effects to a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// The receiving side is gone
    #[error("connection closed: {0}")]
    Closed(String),
}
