//! Identifiers for brokers, connections and data items.
//!
//! A data item is addressed by the triple (object, attribute usage,
//! simulation variant). Brokers and applications are addressed by plain
//! numeric ids assigned outside this crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a broker node (a "transmitter") in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerId(pub i64);

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Identifier of a local application connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId(pub u64);

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// Identifier of the user an application authenticated as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

/// Identifier of a configured object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Identifier of an attribute-group usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeUsageId(pub u64);

/// Simulation variant; `0` is the live (non-simulated) variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct SimulationVariant(pub u16);

/// Identifies one deliverable data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataItemKey {
    /// Object the data belongs to
    pub object: ObjectId,
    /// Attribute-group usage within the object
    pub usage: AttributeUsageId,
    /// Simulation variant
    pub variant: SimulationVariant,
}

impl DataItemKey {
    /// Create a new key.
    #[must_use]
    pub fn new(object: u64, usage: u64, variant: u16) -> Self {
        Self {
            object: ObjectId(object),
            usage: AttributeUsageId(usage),
            variant: SimulationVariant(variant),
        }
    }
}

impl fmt::Display for DataItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.object.0, self.usage.0, self.variant.0)
    }
}
