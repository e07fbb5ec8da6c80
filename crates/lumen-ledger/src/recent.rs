// Per-jet recent-object and pending-request tracking.
//
// Eviction is TTL-based in pulses, not LRU. The pending-request count
// is shared across jets and feeds the admission decision in SetRecord.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use lumen_core::reference::{JetId, ObjectId, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub request: RecordId,
    pub active: bool,
}

/// Tracker for one jet. Sharded maps keep hot jets from serializing on
/// a single lock.
pub struct RecentTracker {
    default_ttl: u32,
    objects: DashMap<ObjectId, u32>,
    pending: DashMap<ObjectId, Vec<PendingEntry>>,
    global_pending: Arc<AtomicUsize>,
}

impl RecentTracker {
    fn new(default_ttl: u32, global_pending: Arc<AtomicUsize>) -> RecentTracker {
        RecentTracker {
            default_ttl,
            objects: DashMap::new(),
            pending: DashMap::new(),
            global_pending,
        }
    }

    /// Mark an object recently used with the default TTL.
    pub fn add_object(&self, object: ObjectId) {
        self.add_object_with_ttl(object, self.default_ttl);
    }

    /// Set or refresh the TTL for an object.
    pub fn add_object_with_ttl(&self, object: ObjectId, ttl: u32) {
        self.objects.insert(object, ttl);
    }

    pub fn is_recent(&self, object: &ObjectId) -> bool {
        self.objects.contains_key(object)
    }

    /// One pulse elapsed: decrement TTLs and return the expired objects.
    pub fn decay(&self) -> Vec<ObjectId> {
        let mut expired = Vec::new();
        self.objects.retain(|object, ttl| {
            if *ttl <= 1 {
                expired.push(*object);
                false
            } else {
                *ttl -= 1;
                true
            }
        });
        expired
    }

    pub fn add_pending_request(&self, object: ObjectId, request: RecordId, active: bool) {
        let mut entries = self.pending.entry(object).or_default();
        if entries.iter().any(|e| e.request == request) {
            return;
        }
        entries.push(PendingEntry { request, active });
        self.global_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_pending_request(&self, object: &ObjectId, request: &RecordId) {
        if let Some(mut entries) = self.pending.get_mut(object) {
            let before = entries.len();
            entries.retain(|e| e.request != *request);
            if entries.len() < before {
                self.global_pending.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Deactivate a request without forgetting it (abandoned work
    /// carried over in hot data).
    pub fn deactivate_pending_request(&self, object: &ObjectId, request: &RecordId) {
        if let Some(mut entries) = self.pending.get_mut(object) {
            for entry in entries.iter_mut() {
                if entry.request == *request {
                    entry.active = false;
                }
            }
        }
    }

    pub fn has_pending_requests(&self, object: &ObjectId) -> bool {
        self.pending
            .get(object)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// The oldest active pending request for an object.
    pub fn oldest_pending_request(&self, object: &ObjectId) -> Option<RecordId> {
        self.pending
            .get(object)?
            .iter()
            .find(|e| e.active)
            .map(|e| e.request)
    }

    pub fn pending_requests(&self, object: &ObjectId) -> Vec<PendingEntry> {
        self.pending
            .get(object)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Jet-keyed tracker registry with the shared admission counter.
pub struct RecentStorage {
    default_ttl: u32,
    trackers: DashMap<JetId, Arc<RecentTracker>>,
    global_pending: Arc<AtomicUsize>,
}

impl RecentStorage {
    pub fn new(default_ttl: u32) -> RecentStorage {
        RecentStorage {
            default_ttl,
            trackers: DashMap::new(),
            global_pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn for_jet(&self, jet: JetId) -> Arc<RecentTracker> {
        self.trackers
            .entry(jet)
            .or_insert_with(|| {
                Arc::new(RecentTracker::new(
                    self.default_ttl,
                    self.global_pending.clone(),
                ))
            })
            .clone()
    }

    /// Count of pending requests across all jets.
    pub fn pending_count(&self) -> usize {
        self.global_pending.load(Ordering::Relaxed)
    }

    /// Run TTL decay on every jet tracker.
    pub fn decay_all(&self) -> Vec<(JetId, Vec<ObjectId>)> {
        self.trackers
            .iter()
            .map(|entry| (*entry.key(), entry.value().decay()))
            .filter(|(_, expired)| !expired.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(b: u8) -> ObjectId {
        ObjectId([b; 32])
    }

    fn request(b: u8) -> RecordId {
        RecordId([b; 32])
    }

    #[test]
    fn ttl_decay_expires_objects() {
        let storage = RecentStorage::new(2);
        let tracker = storage.for_jet(JetId::ROOT);
        tracker.add_object(object(1));
        tracker.add_object_with_ttl(object(2), 1);

        assert_eq!(tracker.decay(), vec![object(2)]);
        assert!(tracker.is_recent(&object(1)));
        assert_eq!(tracker.decay(), vec![object(1)]);
        assert!(!tracker.is_recent(&object(1)));
    }

    #[test]
    fn refresh_resets_the_ttl() {
        let storage = RecentStorage::new(2);
        let tracker = storage.for_jet(JetId::ROOT);
        tracker.add_object(object(1));
        tracker.decay();
        tracker.add_object(object(1));
        assert!(tracker.decay().is_empty());
    }

    #[test]
    fn pending_count_spans_jets() {
        let storage = RecentStorage::new(2);
        let left = storage.for_jet(JetId::new(1, 0));
        let right = storage.for_jet(JetId::new(1, 0x8000_0000_0000_0000));

        left.add_pending_request(object(1), request(1), true);
        right.add_pending_request(object(2), request(2), true);
        assert_eq!(storage.pending_count(), 2);

        // A duplicate registration does not double-count.
        left.add_pending_request(object(1), request(1), true);
        assert_eq!(storage.pending_count(), 2);

        left.remove_pending_request(&object(1), &request(1));
        assert_eq!(storage.pending_count(), 1);
        assert!(!left.has_pending_requests(&object(1)));
    }

    #[test]
    fn deactivated_requests_are_kept_but_not_served() {
        let storage = RecentStorage::new(2);
        let tracker = storage.for_jet(JetId::ROOT);
        tracker.add_pending_request(object(1), request(1), true);
        tracker.deactivate_pending_request(&object(1), &request(1));

        assert!(tracker.has_pending_requests(&object(1)));
        assert_eq!(tracker.oldest_pending_request(&object(1)), None);
    }
}
