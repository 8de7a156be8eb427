//! Connection sinks.
//!
//! The transport layer implements these to receive what the engine emits.
//! [`ChannelSink`] forwards everything into a tokio channel, which is what
//! in-process wiring and tests use.

use crate::error::SinkError;
use crate::outbox::{ApplicationEvent, Outbound};
use meshroute_core::{ApplicationId, BrokerId};
use meshroute_proto::Telegram;
use tokio::sync::mpsc;

/// Receives telegrams addressed to neighbor brokers.
pub trait NeighborSink: Send + Sync {
    /// Send a telegram. Must not block.
    ///
    /// # Errors
    ///
    /// Returns error if the neighbor connection is gone.
    fn send(&self, to: BrokerId, telegram: Telegram) -> Result<(), SinkError>;
}

/// Receives callbacks addressed to local applications.
pub trait ApplicationSink: Send + Sync {
    /// Deliver a callback. Must not block.
    ///
    /// # Errors
    ///
    /// Returns error if the application connection is gone.
    fn notify(&self, to: ApplicationId, event: ApplicationEvent) -> Result<(), SinkError>;
}

/// A sink forwarding every effect into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    /// Create a sink and the receiver of its effects.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NeighborSink for ChannelSink {
    fn send(&self, to: BrokerId, telegram: Telegram) -> Result<(), SinkError> {
        self.tx
            .send(Outbound::Neighbor { to, telegram })
            .map_err(|_| SinkError::Closed(to.to_string()))
    }
}

impl ApplicationSink for ChannelSink {
    fn notify(&self, to: ApplicationId, event: ApplicationEvent) -> Result<(), SinkError> {
        self.tx
            .send(Outbound::Application { to, event })
            .map_err(|_| SinkError::Closed(to.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshroute_core::{DataItemKey, StatusCode};

    #[test]
    fn dropped_receiver_is_reported() {
        let (sink, rx) = ChannelSink::new();
        let event = ApplicationEvent::SetSendEnabled {
            key: DataItemKey::new(1, 1, 0),
            enabled: true,
            reason: StatusCode::Ok,
        };
        assert!(sink.notify(ApplicationId(1), event.clone()).is_ok());
        drop(rx);
        assert!(matches!(
            sink.notify(ApplicationId(1), event),
            Err(SinkError::Closed(_))
        ));
    }
}
