//! # meshroute protocol
//!
//! Telegrams exchanged between neighbor brokers.
//!
//! ## Telegrams
//!
//! - `Subscribe` / `Unsubscribe`: forwarded subscription legs
//! - `Receipt`: resolution outcome of a forwarded leg
//! - `Data`: a delivered value travelling along a resolved route
//! - `AdvertisementUpdate`: incremental changes to a broker's advertised sets
//! - `AdvertisementSubscribe` / `AdvertisementUnsubscribe` / `AdvertisementWithdraw`:
//!   management of who delivers advertisement sets to whom
//!
//! Encoding is CBOR; the byte layout is not meant to match any other system.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod messages;

pub use batch::{AdvertisementUpdate, MAX_OBJECTS_PER_UPDATE, MAX_USAGES_PER_UPDATE};
pub use messages::{
    AdvertisementBrokers, DataFlow, MessageError, Telegram, TransmitterDataSubscription,
    TransmitterDataSubscriptionReceipt, TransmitterDataTelegram,
};
