//! Advertisement updates and their size-capped chunking.
//!
//! An update names the broker whose advertisement set changed and carries the
//! object ids and attribute-usage ids that were added or removed behind it.
//! Large updates are split so that no telegram exceeds the configured number
//! of ids; every id is sent exactly once across the chunks.

use meshroute_core::{AttributeUsageId, BrokerId, ObjectId};
use serde::{Deserialize, Serialize};

/// Default cap on object ids per update telegram.
pub const MAX_OBJECTS_PER_UPDATE: usize = 1800;

/// Default cap on attribute-usage ids per update telegram.
pub const MAX_USAGES_PER_UPDATE: usize = 150;

/// Changes to the advertisement set of one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementUpdate {
    /// Broker the set belongs to
    pub broker: BrokerId,
    /// Replace the receiver's copy instead of merging into it
    pub reset: bool,
    /// Object ids that became advertised
    pub added_objects: Vec<ObjectId>,
    /// Object ids that are no longer advertised
    pub removed_objects: Vec<ObjectId>,
    /// Attribute-usage ids that became advertised
    pub added_usages: Vec<AttributeUsageId>,
    /// Attribute-usage ids that are no longer advertised
    pub removed_usages: Vec<AttributeUsageId>,
}

impl AdvertisementUpdate {
    /// An empty, merging update for `broker`.
    #[must_use]
    pub fn new(broker: BrokerId) -> Self {
        Self {
            broker,
            reset: false,
            added_objects: Vec::new(),
            removed_objects: Vec::new(),
            added_usages: Vec::new(),
            removed_usages: Vec::new(),
        }
    }

    /// Whether the update carries no ids.
    ///
    /// A reset update is never empty: it clears the receiver's copy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.reset
            && self.added_objects.is_empty()
            && self.removed_objects.is_empty()
            && self.added_usages.is_empty()
            && self.removed_usages.is_empty()
    }

    /// Split into chunks of at most `max_objects` object ids and `max_usages`
    /// usage ids each. Only the first chunk keeps the `reset` flag.
    ///
    /// Caps of zero are treated as one.
    #[must_use]
    pub fn split(self, max_objects: usize, max_usages: usize) -> Vec<Self> {
        let max_objects = max_objects.max(1);
        let max_usages = max_usages.max(1);
        if self.is_empty() {
            return Vec::new();
        }

        let broker = self.broker;
        let mut objects = Ids::new(self.added_objects, self.removed_objects);
        let mut usages = Ids::new(self.added_usages, self.removed_usages);
        let mut chunks = Vec::new();
        let mut reset = self.reset;

        loop {
            let mut chunk = AdvertisementUpdate::new(broker);
            chunk.reset = reset;
            reset = false;
            objects.take_into(max_objects, &mut chunk.added_objects, &mut chunk.removed_objects);
            usages.take_into(max_usages, &mut chunk.added_usages, &mut chunk.removed_usages);
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }
        chunks
    }
}

/// Remaining ids of one kind, additions first.
struct Ids<T> {
    added: std::vec::IntoIter<T>,
    removed: std::vec::IntoIter<T>,
}

impl<T> Ids<T> {
    fn new(added: Vec<T>, removed: Vec<T>) -> Self {
        Self {
            added: added.into_iter(),
            removed: removed.into_iter(),
        }
    }

    fn take_into(&mut self, cap: usize, added: &mut Vec<T>, removed: &mut Vec<T>) {
        added.extend(self.added.by_ref().take(cap));
        let left = cap - added.len();
        removed.extend(self.removed.by_ref().take(left));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(range: std::ops::Range<u64>) -> Vec<ObjectId> {
        range.map(ObjectId).collect()
    }

    #[test]
    fn large_update_is_chunked() {
        let mut update = AdvertisementUpdate::new(BrokerId(3));
        update.reset = true;
        update.added_objects = objects(0..5);
        update.removed_objects = objects(10..12);
        update.added_usages = vec![AttributeUsageId(1)];

        let chunks = update.split(3, 150);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].reset);
        assert!(!chunks[1].reset);
        assert_eq!(chunks[0].added_objects, objects(0..3));
        assert_eq!(chunks[0].added_usages, vec![AttributeUsageId(1)]);
        assert_eq!(chunks[1].added_objects, objects(3..5));
        assert_eq!(chunks[1].removed_objects, objects(10..11));
        assert_eq!(chunks[2].removed_objects, objects(11..12));

        let total: usize = chunks
            .iter()
            .map(|c| c.added_objects.len() + c.removed_objects.len())
            .sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn reset_without_ids_is_one_chunk() {
        let mut update = AdvertisementUpdate::new(BrokerId(3));
        update.reset = true;
        let chunks = update.split(MAX_OBJECTS_PER_UPDATE, MAX_USAGES_PER_UPDATE);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].reset);
    }

    #[test]
    fn empty_update_produces_nothing() {
        let update = AdvertisementUpdate::new(BrokerId(3));
        assert!(update.split(10, 10).is_empty());
    }
}
