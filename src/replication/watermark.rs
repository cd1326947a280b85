//! Per-origin replication watermarks
//!
//! `watermarks[o]` is the highest timestamp of origin `o` this node has
//! received contiguously from `o` itself. It is sent in every handshake so
//! the peer can skip what is already here, and it outlives connections.

use std::collections::BTreeMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub(crate) struct WatermarkTable {
    marks: Mutex<BTreeMap<u8, u64>>,
}

impl WatermarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<u8, u64> {
        self.marks.lock().clone()
    }

    /// Raise the mark for `origin`; never lowers it
    pub fn advance(&self, origin: u8, timestamp: u64) {
        let mut marks = self.marks.lock();
        let mark = marks.entry(origin).or_insert(0);
        *mark = (*mark).max(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let table = WatermarkTable::new();
        assert!(table.snapshot().is_empty());
        table.advance(2, 10);
        table.advance(2, 7);
        assert_eq!(table.snapshot().get(&2), Some(&10));
        table.advance(3, 1);
        assert_eq!(table.snapshot().into_iter().collect::<Vec<_>>(), vec![(2, 10), (3, 1)]);
    }
}
