use linked_hash_map::LinkedHashMap;

use crate::common::types::FrameId;

/// LRU queue of bound frames with a logical age per access.
///
/// The front of the map is the cold end. Refreshing a frame on every hit
/// would need the cache index lock exclusively, so a hit only refreshes
/// frames that have drifted out of the hottest quarter of the queue.
pub struct LRUReplacer {
    lru_list: LinkedHashMap<FrameId, u64>,
    buffer_age: u64,
    upper_fraction: u64,
}

impl LRUReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            lru_list: LinkedHashMap::with_capacity(pool_size),
            buffer_age: 0,
            upper_fraction: (pool_size / 4).max(1) as u64,
        }
    }

    /// Record that a frame has been accessed, moving it to the hot end
    pub fn record_access(&mut self, frame_id: FrameId) {
        self.buffer_age += 1;
        self.lru_list.remove(&frame_id);
        self.lru_list.insert(frame_id, self.buffer_age);
    }

    /// Remove a frame from the replacer
    pub fn remove(&mut self, frame_id: FrameId) {
        self.lru_list.remove(&frame_id);
    }

    /// Whether a hit on `frame_id` should move it to the hot end
    pub fn needs_refresh(&self, frame_id: FrameId) -> bool {
        match self.lru_list.get(&frame_id) {
            Some(&age) => age + self.upper_fraction < self.buffer_age,
            None => true,
        }
    }

    /// Frames from least to most recently used
    pub fn cold_to_hot(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.lru_list.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.lru_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru_list.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_order() {
        let mut lru = LRUReplacer::new(8);
        lru.record_access(1);
        lru.record_access(2);
        lru.record_access(3);
        lru.record_access(1);

        assert_eq!(lru.cold_to_hot().collect::<Vec<_>>(), vec![2, 3, 1]);

        lru.remove(3);
        assert_eq!(lru.cold_to_hot().collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_refresh_only_when_aged() {
        let mut lru = LRUReplacer::new(8); // upper fraction of 2
        lru.record_access(1);
        lru.record_access(2);
        assert!(!lru.needs_refresh(1));

        for frame in 3..6 {
            lru.record_access(frame);
        }
        assert!(lru.needs_refresh(1));
        assert!(!lru.needs_refresh(5));
    }
}
