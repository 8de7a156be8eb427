//! Subscription roles, receipt states and application status codes.
//!
//! # Role pairing
//!
//! | Participant | Served by |
//! |-------------|-----------|
//! | Receiver | Source |
//! | Sender | Drain |
//!
//! `Source` and `Drain` are central roles: at most one live holder per
//! data item across the whole mesh.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a connection takes for one data item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Central origin of outgoing data
    Source,
    /// Ordinary producer, multiplexed through the Drain
    Sender,
    /// Central destination of incoming data
    Drain,
    /// Ordinary consumer, multiplexed through the Source
    Receiver,
}

impl Role {
    /// Whether this is a central role (`Source` or `Drain`).
    #[must_use]
    pub fn is_central(self) -> bool {
        matches!(self, Role::Source | Role::Drain)
    }

    /// The central role that serves this role.
    ///
    /// Central roles map onto themselves.
    #[must_use]
    pub fn central_counterpart(self) -> Role {
        match self {
            Role::Source | Role::Receiver => Role::Source,
            Role::Drain | Role::Sender => Role::Drain,
        }
    }

    /// The participant role served by this central role.
    ///
    /// Participant roles map onto themselves.
    #[must_use]
    pub fn participant_counterpart(self) -> Role {
        match self {
            Role::Source | Role::Receiver => Role::Receiver,
            Role::Drain | Role::Sender => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Source => "source",
            Role::Sender => "sender",
            Role::Drain => "drain",
            Role::Receiver => "receiver",
        };
        f.write_str(name)
    }
}

/// Resolution state of a subscription request or one of its outgoing legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReceiptState {
    /// Waiting for receipts
    #[default]
    Pending,
    /// Exactly one authority found and access is granted
    Positive,
    /// Exactly one authority found but access is denied
    PositiveNoRight,
    /// No authority reachable
    Negative,
    /// More than one authority reachable at the same time
    MultiplePositive,
}

impl ReceiptState {
    /// `Pending` is the only non-terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReceiptState::Pending)
    }

    /// An authority was found, whether or not access is granted.
    #[must_use]
    pub fn found_authority(self) -> bool {
        matches!(self, ReceiptState::Positive | ReceiptState::PositiveNoRight)
    }

    /// Status reported to an application for this state.
    ///
    /// Returns `None` while the state is still pending.
    #[must_use]
    pub fn status_code(self) -> Option<StatusCode> {
        match self {
            ReceiptState::Pending => None,
            ReceiptState::Positive => Some(StatusCode::Ok),
            ReceiptState::PositiveNoRight => Some(StatusCode::NoRights),
            ReceiptState::Negative => Some(StatusCode::NoSourceDrain),
            ReceiptState::MultiplePositive => Some(StatusCode::MultipleCentralRoles),
        }
    }
}

/// Status attached to application deliveries and send-control callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Data is flowing
    Ok,
    /// No source or drain is reachable for the data item
    NoSourceDrain,
    /// The user lacks the right for the requested action
    NoRights,
    /// More than one source or drain is reachable; the mesh is misconfigured
    MultipleCentralRoles,
    /// A source has nobody to send to
    NoReceivers,
}
