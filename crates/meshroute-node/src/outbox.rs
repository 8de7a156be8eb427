//! Effects produced by the routing engine.
//!
//! The engine never performs I/O. Every telegram and application callback it
//! decides on is queued here and handed to the sinks by whoever drives it.

use meshroute_core::{ApplicationId, BrokerId, DataItemKey, StatusCode};
use meshroute_proto::Telegram;

/// A callback to a local application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationEvent {
    /// A value or a status change for a receiving subscription
    Deliver {
        /// Data item
        key: DataItemKey,
        /// Payload, absent for pure status reports
        payload: Option<Vec<u8>>,
        /// Delivery index of the payload
        index: Option<u64>,
        /// Current status of the subscription
        status: StatusCode,
    },
    /// Start or stop sending
    SetSendEnabled {
        /// Data item
        key: DataItemKey,
        /// Whether sending is useful right now
        enabled: bool,
        /// Why
        reason: StatusCode,
    },
}

/// One queued effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A telegram for a neighbor broker
    Neighbor {
        /// Receiving neighbor
        to: BrokerId,
        /// Telegram
        telegram: Telegram,
    },
    /// A callback for a local application
    Application {
        /// Receiving application
        to: ApplicationId,
        /// Callback
        event: ApplicationEvent,
    },
}

/// Ordered queue of effects.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outbound>,
}

impl Outbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a telegram.
    pub fn neighbor(&mut self, to: BrokerId, telegram: Telegram) {
        tracing::debug!(to = %to, kind = telegram.kind(), "Queued telegram");
        self.items.push(Outbound::Neighbor { to, telegram });
    }

    /// Queue an application callback.
    pub fn application(&mut self, to: ApplicationId, event: ApplicationEvent) {
        self.items.push(Outbound::Application { to, event });
    }

    /// Take everything queued so far.
    pub fn take(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.items)
    }

    /// Number of queued effects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
