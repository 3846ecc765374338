use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

/// Access history of a single tracked frame.
#[derive(Debug)]
struct FrameRecord {
    /// Up to the last k access timestamps, oldest at the front
    history: VecDeque<Timestamp>,
    /// Whether this frame may currently be evicted
    evictable: bool,
}

impl FrameRecord {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            evictable: false,
        }
    }

    /// The timestamp the frame is ordered by: with fewer than k accesses the
    /// oldest retained access (LRU tie-break among the +inf distances), with
    /// k accesses the k-th most recent one (largest backward K-distance =
    /// smallest such timestamp).
    fn order_key(&self) -> Timestamp {
        *self.history.front().expect("tracked frame has history")
    }

    fn record(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }
}

/// LRU-K replacement policy.
///
/// A frame's backward K-distance is the time since its k-th most recent
/// access, or +inf with fewer than k accesses. `evict` removes the evictable
/// frame with the largest distance; +inf ties break by the oldest access.
///
/// The evictable frames are kept partitioned into two ordered sets so that
/// eviction pops a first element instead of scanning: frames short of k
/// accesses (always preferred) and frames with a full history.
pub struct LruKReplacer {
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Monotonically increasing logical clock
    current_timestamp: Timestamp,
    /// All tracked frames
    records: HashMap<FrameId, FrameRecord>,
    /// Evictable frames with fewer than k accesses, ordered by oldest access
    cold: BTreeSet<(Timestamp, FrameId)>,
    /// Evictable frames with k accesses, ordered by k-th most recent access
    hot: BTreeSet<(Timestamp, FrameId)>,
}

impl Inner {
    /// Removes the frame's entry from whichever candidate set holds it.
    /// Must be called before the record's history changes.
    fn unlink(&mut self, frame_id: FrameId, record: &FrameRecord, k: usize) {
        if !record.evictable {
            return;
        }
        let entry = (record.order_key(), frame_id);
        if record.history.len() < k {
            self.cold.remove(&entry);
        } else {
            self.hot.remove(&entry);
        }
    }

    /// Inserts the frame into the candidate set matching its history length.
    fn link(&mut self, frame_id: FrameId, record: &FrameRecord, k: usize) {
        if !record.evictable {
            return;
        }
        let entry = (record.order_key(), frame_id);
        if record.history.len() < k {
            self.cold.insert(entry);
        } else {
            self.hot.insert(entry);
        }
    }
}

impl LruKReplacer {
    pub fn new(k: usize, max_frames: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            k,
            max_frames,
            inner: Mutex::new(Inner {
                current_timestamp: 0,
                records: HashMap::new(),
                cold: BTreeSet::new(),
                hot: BTreeSet::new(),
            }),
        }
    }

    /// Evicts the evictable frame with the largest backward K-distance.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        let entry = inner.cold.iter().next().copied().or_else(|| {
            inner.hot.iter().next().copied()
        })?;
        let (_, frame_id) = entry;

        inner.cold.remove(&entry);
        inner.hot.remove(&entry);
        inner.records.remove(&frame_id);

        Some(frame_id)
    }

    /// Records an access to the given frame at the current logical time.
    /// Creates the tracking record (non-evictable) if absent.
    pub fn record_access(&self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut inner = self.inner.lock();
        let timestamp = inner.current_timestamp;
        inner.current_timestamp += 1;

        let mut record = inner
            .records
            .remove(&frame_id)
            .unwrap_or_else(FrameRecord::new);
        inner.unlink(frame_id, &record, self.k);
        record.record(timestamp, self.k);
        inner.link(frame_id, &record, self.k);
        inner.records.insert(frame_id, record);
    }

    /// Sets whether a frame may be evicted. A no-op for untracked frames.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut inner = self.inner.lock();
        let Some(mut record) = inner.records.remove(&frame_id) else {
            return;
        };
        if record.evictable != evictable {
            inner.unlink(frame_id, &record, self.k);
            record.evictable = evictable;
            inner.link(frame_id, &record, self.k);
        }
        inner.records.insert(frame_id, record);
    }

    /// Removes a frame from the replacer entirely. The frame must be
    /// evictable (or untracked).
    pub fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();

        if let Some(record) = inner.records.remove(&frame_id) {
            assert!(
                record.evictable,
                "remove() called on non-evictable frame {}",
                frame_id
            );
            inner.unlink(frame_id, &record, self.k);
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.cold.len() + inner.hot.len()
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_replacer_new() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.k(), 2);
    }

    #[test]
    fn test_lru_k_replacer_evict_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_cold_frames_evict_in_fifo_order() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(2));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);
        replacer.set_evictable(FrameId::new(2), true);

        assert_eq!(replacer.size(), 3);

        // All have a single access (< k), so all distances are +inf and the
        // oldest access goes first.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_prefers_short_history() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));

        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 1 has < k accesses and thus +inf distance.
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_largest_k_distance_wins() {
        let replacer = LruKReplacer::new(2, 10);

        for frame in 0..3u32 {
            replacer.record_access(FrameId::new(frame));
            replacer.record_access(FrameId::new(frame));
        }

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);
        replacer.set_evictable(FrameId::new(2), true);

        // Second access times are 1, 3, 5; frame 0's is oldest, so its
        // backward 2-distance is largest.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    }

    #[test]
    fn test_lru_k_replacer_non_evictable_is_skipped() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_remove() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.remove(FrameId::new(0));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        // Removing an untracked frame is a no-op.
        replacer.remove(FrameId::new(5));
    }

    #[test]
    fn test_lru_k_replacer_access_refreshes_order() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0)); // t=0
        replacer.record_access(FrameId::new(0)); // t=1
        replacer.record_access(FrameId::new(1)); // t=2
        replacer.record_access(FrameId::new(1)); // t=3
        replacer.record_access(FrameId::new(0)); // t=4, frame 0's 2-distance now from t=1

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 0's k-th recent access (t=1) is older than frame 1's (t=2).
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_one_is_plain_lru() {
        let replacer = LruKReplacer::new(1, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(2));
        replacer.record_access(FrameId::new(0)); // refresh frame 0

        for frame in 0..3u32 {
            replacer.set_evictable(FrameId::new(frame), true);
        }

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }
}
