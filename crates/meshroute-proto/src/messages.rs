//! Neighbor telegrams.

use crate::batch::AdvertisementUpdate;
use meshroute_core::{BrokerId, DataItemKey, ReceiptState, Role};
use serde::{Deserialize, Serialize};

/// A forwarded subscription leg, also used to cancel one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitterDataSubscription {
    /// Requested data item
    pub key: DataItemKey,
    /// Participant role being requested
    pub role: Role,
    /// Candidate central brokers reachable through the receiver, sorted
    pub candidates: Vec<BrokerId>,
}

impl TransmitterDataSubscription {
    /// Create a subscription; the candidate list is normalized.
    #[must_use]
    pub fn new(key: DataItemKey, role: Role, mut candidates: Vec<BrokerId>) -> Self {
        candidates.sort_unstable();
        candidates.dedup();
        Self {
            key,
            role,
            candidates,
        }
    }
}

/// Outcome of a forwarded subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitterDataSubscriptionReceipt {
    /// Requested data item
    pub key: DataItemKey,
    /// Participant role that was requested
    pub role: Role,
    /// Candidate list of the subscription being answered
    pub candidates: Vec<BrokerId>,
    /// Resolution state
    pub state: ReceiptState,
    /// Broker hosting the central role, for positive outcomes
    pub central: Option<BrokerId>,
}

/// Direction a data telegram travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFlow {
    /// From the source towards receivers
    FromSource,
    /// From senders towards the drain
    ToDrain,
}

/// A delivered value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitterDataTelegram {
    /// Data item
    pub key: DataItemKey,
    /// Monotonic delivery index
    pub index: u64,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Direction of travel
    pub flow: DataFlow,
}

/// A list of brokers whose advertisement sets are being managed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementBrokers {
    /// Brokers concerned
    pub brokers: Vec<BrokerId>,
}

impl AdvertisementBrokers {
    /// A list naming one broker.
    #[must_use]
    pub fn single(broker: BrokerId) -> Self {
        Self {
            brokers: vec![broker],
        }
    }
}

/// Everything one broker sends to a neighbor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Telegram {
    /// Forward a subscription leg
    Subscribe(TransmitterDataSubscription),
    /// Cancel a subscription leg
    Unsubscribe(TransmitterDataSubscription),
    /// Answer a subscription leg
    Receipt(TransmitterDataSubscriptionReceipt),
    /// Deliver a value
    Data(TransmitterDataTelegram),
    /// Changes to an advertisement set
    AdvertisementUpdate(AdvertisementUpdate),
    /// Ask to receive advertisement sets
    AdvertisementSubscribe(AdvertisementBrokers),
    /// Stop receiving advertisement sets
    AdvertisementUnsubscribe(AdvertisementBrokers),
    /// The sender no longer delivers advertisement sets
    AdvertisementWithdraw(AdvertisementBrokers),
}

impl Telegram {
    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Telegram::Subscribe(_) => "subscribe",
            Telegram::Unsubscribe(_) => "unsubscribe",
            Telegram::Receipt(_) => "receipt",
            Telegram::Data(_) => "data",
            Telegram::AdvertisementUpdate(_) => "advertisement-update",
            Telegram::AdvertisementSubscribe(_) => "advertisement-subscribe",
            Telegram::AdvertisementUnsubscribe(_) => "advertisement-unsubscribe",
            Telegram::AdvertisementWithdraw(_) => "advertisement-withdraw",
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_cbor_roundtrip() {
        let receipt = Telegram::Receipt(TransmitterDataSubscriptionReceipt {
            key: DataItemKey::new(4711, 3, 0),
            role: Role::Receiver,
            candidates: vec![BrokerId(1), BrokerId(2)],
            state: ReceiptState::Positive,
            central: Some(BrokerId(1)),
        });

        let bytes = receipt.to_cbor().unwrap();
        let decoded = Telegram::from_cbor(&bytes).unwrap();

        assert_eq!(receipt, decoded);
        assert_eq!(decoded.kind(), "receipt");
    }

    #[test]
    fn subscription_candidates_are_normalized() {
        let subscription = TransmitterDataSubscription::new(
            DataItemKey::new(1, 1, 0),
            Role::Sender,
            vec![BrokerId(9), BrokerId(3), BrokerId(9)],
        );
        assert_eq!(subscription.candidates, vec![BrokerId(3), BrokerId(9)]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Telegram::from_cbor(&[0xff, 0x00, 0x13]),
            Err(MessageError::Deserialize(_))
        ));
    }
}
