//! Most-recent-value cache.
//!
//! Holds the last delivered payload per data item together with its
//! monotonic delivery index. Late subscribers are fast-forwarded from here and
//! redirections seed their continuity check with the cached index.

use crate::key::DataItemKey;
use std::collections::HashMap;

/// The last value delivered for a data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    /// Delivery index
    pub index: u64,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Storage for the most recent value per data item.
pub trait ValueCache: Send {
    /// Index of the cached value, if any.
    fn current_index(&self, key: &DataItemKey) -> Option<u64>;

    /// The cached value, if any.
    fn current(&self, key: &DataItemKey) -> Option<CachedValue>;

    /// Store a delivered value. Older indexes than the cached one are ignored.
    ///
    /// Returns `true` if the value was stored.
    fn update(&mut self, key: DataItemKey, index: u64, payload: Vec<u8>) -> bool;

    /// Drop the value for a data item nobody is interested in anymore.
    fn evict(&mut self, key: &DataItemKey);
}

/// In-process [`ValueCache`].
#[derive(Debug, Default)]
pub struct MemoryValueCache {
    values: HashMap<DataItemKey, CachedValue>,
}

impl MemoryValueCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached data items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ValueCache for MemoryValueCache {
    fn current_index(&self, key: &DataItemKey) -> Option<u64> {
        self.values.get(key).map(|value| value.index)
    }

    fn current(&self, key: &DataItemKey) -> Option<CachedValue> {
        self.values.get(key).cloned()
    }

    fn update(&mut self, key: DataItemKey, index: u64, payload: Vec<u8>) -> bool {
        match self.values.get_mut(&key) {
            Some(existing) if existing.index > index => false,
            Some(existing) => {
                existing.index = index;
                existing.payload = payload;
                true
            }
            None => {
                self.values.insert(key, CachedValue { index, payload });
                true
            }
        }
    }

    fn evict(&mut self, key: &DataItemKey) {
        if self.values.remove(key).is_some() {
            tracing::debug!(key = %key, "Evicted cached value");
        }
    }
}
