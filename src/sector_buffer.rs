//! Holds recently-completed per-lap sector arrays, written by a separate
//! sector-timing feed and read by the Lap Saver when it joins sector
//! data onto a finalized lap record.

use std::collections::VecDeque;

/// Maximum number of laps' worth of sector data retained before the
/// oldest entry is evicted.
pub const CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct SectorEntry {
    pub lap_number: i64,
    pub sector_times: Vec<f64>,
    pub completion_frame_id: i64,
    pub partial: bool,
}

/// Bounded, insertion-ordered map from lap number to sector data.
pub struct SectorBuffer {
    capacity: usize,
    order: VecDeque<i64>,
    entries: std::collections::HashMap<i64, SectorEntry>,
}

impl SectorBuffer {
    pub fn new() -> Self {
        Self::with_capacity(CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: std::collections::HashMap::new(),
        }
    }

    /// Insert or replace a lap's sector data, evicting the oldest entry
    /// if the buffer is at capacity.
    pub fn push(&mut self, entry: SectorEntry) {
        if !self.entries.contains_key(&entry.lap_number) {
            if self.order.len() == self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            self.order.push_back(entry.lap_number);
        }
        self.entries.insert(entry.lap_number, entry);
    }

    /// Look up by the canonical key (lap number).
    pub fn get(&self, lap_number: i64) -> Option<&SectorEntry> {
        self.entries.get(&lap_number)
    }

    /// Fallback lookup by a range of plausible completion-frame ids, for
    /// laps whose number isn't known precisely at join time.
    pub fn find_by_frame_id_range(&self, lo: i64, hi: i64) -> Option<&SectorEntry> {
        self.entries
            .values()
            .find(|e| e.completion_frame_id >= lo && e.completion_frame_id <= hi)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SectorBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lap: i64, frame_id: i64) -> SectorEntry {
        SectorEntry {
            lap_number: lap,
            sector_times: vec![20.0, 20.0, 20.0],
            completion_frame_id: frame_id,
            partial: false,
        }
    }

    #[test]
    fn get_by_lap_number() {
        let mut buf = SectorBuffer::new();
        buf.push(entry(3, 100));
        assert!(buf.get(3).is_some());
        assert!(buf.get(4).is_none());
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut buf = SectorBuffer::with_capacity(2);
        buf.push(entry(1, 10));
        buf.push(entry(2, 20));
        buf.push(entry(3, 30));
        assert_eq!(buf.len(), 2);
        assert!(buf.get(1).is_none());
        assert!(buf.get(2).is_some());
        assert!(buf.get(3).is_some());
    }

    #[test]
    fn find_by_frame_id_range() {
        let mut buf = SectorBuffer::new();
        buf.push(entry(5, 500));
        let found = buf.find_by_frame_id_range(490, 510).unwrap();
        assert_eq!(found.lap_number, 5);
        assert!(buf.find_by_frame_id_range(0, 10).is_none());
    }
}
