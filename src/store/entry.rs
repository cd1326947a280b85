//! Entry definitions
//!
//! Provenance stamps, views of stored entries, and the owned form of an
//! entry that travels between replicas.

use std::cmp::Ordering;

use bytes::Bytes;

/// Origin node and logical timestamp of the last mutation of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stamp {
    pub origin: u8,
    pub timestamp: u64,
}

impl Stamp {
    pub fn new(origin: u8, timestamp: u64) -> Self {
        Self { origin, timestamp }
    }

    /// Last-writer-wins: later timestamp, then higher origin id
    pub fn wins_over(&self, other: &Stamp) -> bool {
        self > other
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// State of an indexed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Live,
    Tombstone,
}

/// Borrowed view of an entry inside a locked segment
#[derive(Debug)]
pub(crate) struct EntryView<'a> {
    pub state: EntryState,
    pub stamp: Stamp,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl EntryView<'_> {
    pub fn is_live(&self) -> bool {
        self.state == EntryState::Live
    }

    /// Owned copy for shipping to peers
    pub fn to_replicated(&self) -> ReplicatedEntry {
        ReplicatedEntry {
            stamp: self.stamp,
            key: Bytes::copy_from_slice(self.key),
            value: self.is_live().then(|| Bytes::copy_from_slice(self.value)),
        }
    }
}

/// A mutation as exchanged between replicas
///
/// `key` and `value` hold interop encodings; `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedEntry {
    pub stamp: Stamp,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl ReplicatedEntry {
    pub fn put(stamp: Stamp, key: Bytes, value: Bytes) -> Self {
        Self {
            stamp,
            key,
            value: Some(value),
        }
    }

    pub fn tombstone(stamp: Stamp, key: Bytes) -> Self {
        Self {
            stamp,
            key,
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Result of applying a remote mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The mutation won and is now the local state
    Applied,
    /// The local entry is as new or newer; the mutation was discarded
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_later_timestamp_wins() {
        assert!(Stamp::new(1, 6).wins_over(&Stamp::new(2, 5)));
        assert!(!Stamp::new(2, 5).wins_over(&Stamp::new(1, 6)));
    }

    #[test]
    fn test_higher_origin_breaks_ties() {
        let a = Stamp::new(1, 5);
        let b = Stamp::new(2, 5);
        assert!(b.wins_over(&a));
        assert!(!a.wins_over(&b));
    }

    #[test]
    fn test_equal_stamp_does_not_win() {
        let a = Stamp::new(3, 9);
        assert!(!a.wins_over(&a));
    }
}
