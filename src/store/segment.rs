//! Segment implementation
//!
//! A segment is a lock around one arena. Everything in `SegmentState` runs
//! with that lock held; callers nest several state calls under a single
//! acquisition instead of re-locking.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::arena::{Arena, SlotHeader};
use super::entry::{EntryState, EntryView, Stamp};
use super::layout::*;
use super::{KeySource, ValueSource};
use crate::error::{DriftError, Result};

/// Position of an indexed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Located {
    pub bucket: usize,
    pub slot: u64,
}

/// Tombstone found while scanning a recovered arena
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecoveredTombstone {
    pub slot: u64,
    pub hash: u64,
    pub stamp: Stamp,
}

/// An independently locked shard of the table
///
/// The state is `None` once the segment has been released.
pub(crate) struct Segment {
    index: usize,
    state: Mutex<Option<SegmentState>>,
}

impl Segment {
    pub fn new(index: usize, state: SegmentState) -> Self {
        Self {
            index,
            state: Mutex::new(Some(state)),
        }
    }

    /// Acquire the segment, waiting at most `timeout` when one is given
    pub fn lock(&self, timeout: Option<Duration>) -> Result<MutexGuard<'_, Option<SegmentState>>> {
        match timeout {
            Some(timeout) => self.state.try_lock_for(timeout).ok_or(DriftError::LockTimeout {
                segment: self.index,
                timeout,
            }),
            None => Ok(self.state.lock()),
        }
    }
}

/// Index, arena and free-list of one segment
pub(crate) struct SegmentState {
    arena: Arena,
    /// capacity -> slot offsets of freed slots
    free: BTreeMap<u32, Vec<u64>>,
}

impl SegmentState {
    pub fn new(arena: Arena) -> Self {
        Self {
            arena,
            free: BTreeMap::new(),
        }
    }

    /// Rebuild in-memory state from a mapped arena that already holds data
    ///
    /// Returns the state, its tombstones, and the highest stamp timestamp.
    pub fn recover(arena: Arena) -> Result<(Self, Vec<RecoveredTombstone>, u64)> {
        let geometry = arena.geometry();
        let bump = arena.bump();
        if bump > geometry.entry_space {
            return Err(DriftError::Corruption(format!(
                "bump pointer {} beyond entry space {}",
                bump, geometry.entry_space
            )));
        }

        let mut state = Self::new(arena);
        let mut tombstones = Vec::new();
        let mut max_timestamp = 0;
        let mut slot = 0u64;

        while slot < bump {
            let header = state.arena.slot_header(slot);
            let capacity = header.capacity as u64;
            let used = SLOT_HEADER_SIZE as u64 + header.key_len as u64 + header.value_len as u64;
            if capacity < SLOT_HEADER_SIZE as u64
                || capacity % SLOT_ALIGN as u64 != 0
                || slot + capacity > bump
                || (header.flags != FLAG_FREE && used > capacity)
            {
                return Err(DriftError::Corruption(format!(
                    "malformed slot at offset {}",
                    slot
                )));
            }

            match header.flags {
                FLAG_FREE => state.free.entry(header.capacity).or_default().push(slot),
                FLAG_LIVE => max_timestamp = max_timestamp.max(header.timestamp),
                FLAG_TOMBSTONE => {
                    max_timestamp = max_timestamp.max(header.timestamp);
                    tombstones.push(RecoveredTombstone {
                        slot,
                        hash: header.hash,
                        stamp: Stamp::new(header.origin, header.timestamp),
                    });
                }
                other => {
                    return Err(DriftError::Corruption(format!(
                        "unknown slot flags {:#x} at offset {}",
                        other, slot
                    )))
                }
            }
            slot += capacity;
        }

        Ok((state, tombstones, max_timestamp))
    }

    pub fn flush(&self) -> Result<()> {
        self.arena.flush()
    }

    fn mask(&self) -> usize {
        self.arena.geometry().buckets as usize - 1
    }

    fn home(&self, hash: u64) -> usize {
        // low bits already chose the segment
        hash.rotate_right(32) as usize & self.mask()
    }

    /// Number of indexed entries, tombstones included
    #[cfg(test)]
    pub fn occupied(&self) -> u64 {
        self.arena.occupied()
    }

    #[cfg(test)]
    pub fn free_slot_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub fn lookup<K: KeySource>(&self, key: &K) -> Option<Located> {
        let mask = self.mask();
        let mut bucket = self.home(key.hash());
        for _ in 0..=mask {
            let value = self.arena.bucket(bucket);
            if value == EMPTY_BUCKET {
                return None;
            }
            let slot = value - 1;
            if self.arena.slot_hash(slot) == key.hash() {
                let header = self.arena.slot_header(slot);
                if key.matches(self.arena.key(slot, header.key_len)) {
                    return Some(Located { bucket, slot });
                }
            }
            bucket = (bucket + 1) & mask;
        }
        None
    }

    /// Find the bucket pointing at `slot`, if it is still indexed
    pub fn locate_slot(&self, hash: u64, slot: u64) -> Option<Located> {
        let mask = self.mask();
        let mut bucket = self.home(hash);
        for _ in 0..=mask {
            match self.arena.bucket(bucket) {
                EMPTY_BUCKET => return None,
                value if value == slot + 1 => return Some(Located { bucket, slot }),
                _ => bucket = (bucket + 1) & mask,
            }
        }
        None
    }

    pub fn entry(&self, slot: u64) -> EntryView<'_> {
        let header = self.arena.slot_header(slot);
        EntryView {
            state: if header.flags == FLAG_LIVE {
                EntryState::Live
            } else {
                EntryState::Tombstone
            },
            stamp: Stamp::new(header.origin, header.timestamp),
            key: self.arena.key(slot, header.key_len),
            value: self.arena.value(slot, header.key_len, header.value_len),
        }
    }

    #[cfg(test)]
    pub fn slot_hash(&self, slot: u64) -> u64 {
        self.arena.slot_hash(slot)
    }

    /// Slots of every indexed entry, in bucket order
    pub fn indexed_slots(&self) -> impl Iterator<Item = u64> + '_ {
        (0..=self.mask()).filter_map(move |bucket| match self.arena.bucket(bucket) {
            EMPTY_BUCKET => None,
            value => Some(value - 1),
        })
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Insert a new entry; `value == None` inserts a tombstone
    pub fn insert<K: KeySource, V: ValueSource>(
        &mut self,
        key: &K,
        value: Option<&V>,
        stamp: Stamp,
    ) -> Result<u64> {
        let geometry = self.arena.geometry();
        if self.arena.occupied() >= geometry.max_occupied() {
            return Err(DriftError::CapacityExhausted(format!(
                "segment index full at {} entries",
                self.arena.occupied()
            )));
        }

        let key_len = key.encoded_len();
        let value_len = value.map_or(0, |v| v.encoded_len());
        let (slot, capacity) = self.allocate(SLOT_HEADER_SIZE + key_len + value_len)?;

        self.arena.write_slot_header(
            slot,
            &SlotHeader {
                capacity,
                flags: if value.is_some() { FLAG_LIVE } else { FLAG_TOMBSTONE },
                origin: stamp.origin,
                timestamp: stamp.timestamp,
                hash: key.hash(),
                key_len: key_len as u32,
                value_len: value_len as u32,
            },
        );

        let written = key.write_into(self.arena.key_mut(slot, key_len)).and_then(|_| match value {
            Some(v) => v.write_into(self.arena.value_mut(slot, key_len, value_len)),
            None => Ok(()),
        });
        if let Err(e) = written {
            self.release(slot);
            return Err(e);
        }

        let mask = self.mask();
        let mut bucket = self.home(key.hash());
        while self.arena.bucket(bucket) != EMPTY_BUCKET {
            bucket = (bucket + 1) & mask;
        }
        self.arena.set_bucket(bucket, slot + 1);
        self.arena.set_occupied(self.arena.occupied() + 1);
        Ok(slot)
    }

    /// Replace the value (or tombstone) of an indexed entry
    ///
    /// Writes in place when the slot is big enough, otherwise moves the
    /// entry to a new slot and frees the old one.
    pub fn overwrite<V: ValueSource>(
        &mut self,
        at: Located,
        value: Option<&V>,
        stamp: Stamp,
    ) -> Result<u64> {
        let old = self.arena.slot_header(at.slot);
        let key_len = old.key_len as usize;
        let value_len = value.map_or(0, |v| v.encoded_len());
        let updated = SlotHeader {
            flags: if value.is_some() { FLAG_LIVE } else { FLAG_TOMBSTONE },
            origin: stamp.origin,
            timestamp: stamp.timestamp,
            value_len: value_len as u32,
            ..old
        };

        let needed = SLOT_HEADER_SIZE + key_len + value_len;
        if needed <= old.capacity as usize {
            if let Some(v) = value {
                v.write_into(self.arena.value_mut(at.slot, key_len, value_len))?;
            }
            self.arena.write_slot_header(at.slot, &updated);
            return Ok(at.slot);
        }

        let (slot, capacity) = self.allocate(needed)?;
        self.arena
            .write_slot_header(slot, &SlotHeader { capacity, ..updated });
        self.arena.copy_key(at.slot, slot, key_len);
        if let Some(v) = value {
            if let Err(e) = v.write_into(self.arena.value_mut(slot, key_len, value_len)) {
                self.release(slot);
                return Err(e);
            }
        }
        self.arena.set_bucket(at.bucket, slot + 1);
        self.release(at.slot);
        Ok(slot)
    }

    /// Mark an entry deleted; its key stays indexed until reclaimed
    pub fn tombstone(&mut self, at: Located, stamp: Stamp) {
        let old = self.arena.slot_header(at.slot);
        self.arena.write_slot_header(
            at.slot,
            &SlotHeader {
                flags: FLAG_TOMBSTONE,
                origin: stamp.origin,
                timestamp: stamp.timestamp,
                value_len: 0,
                ..old
            },
        );
    }

    /// Drop an entry from the index and free its slot
    pub fn reclaim(&mut self, at: Located) {
        self.remove_bucket(at.bucket);
        self.release(at.slot);
        self.arena.set_occupied(self.arena.occupied() - 1);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Backward-shift deletion keeps every collision run contiguous
    fn remove_bucket(&mut self, removed: usize) {
        let mask = self.mask();
        let mut hole = removed;
        let mut next = removed;
        loop {
            next = (next + 1) & mask;
            let value = self.arena.bucket(next);
            if value == EMPTY_BUCKET {
                break;
            }
            let home = self.home(self.arena.slot_hash(value - 1));
            // entry stays put if its home lies cyclically in (hole, next]
            let stays = if hole <= next {
                hole < home && home <= next
            } else {
                hole < home || home <= next
            };
            if !stays {
                self.arena.set_bucket(hole, value);
                hole = next;
            }
        }
        self.arena.set_bucket(hole, EMPTY_BUCKET);
    }

    /// Best-fit from the free-list, else carve from the bump pointer
    fn allocate(&mut self, needed: usize) -> Result<(u64, u32)> {
        let needed = align_slot(needed);
        let needed32 = u32::try_from(needed).map_err(|_| {
            DriftError::CapacityExhausted(format!("entry of {} bytes is too large", needed))
        })?;

        let reused = self
            .free
            .range_mut(needed32..)
            .next()
            .and_then(|(&capacity, slots)| slots.pop().map(|slot| (slot, capacity)));
        if let Some((slot, capacity)) = reused {
            if self.free.get(&capacity).map_or(false, Vec::is_empty) {
                self.free.remove(&capacity);
            }
            return Ok((slot, capacity));
        }

        let bump = self.arena.bump();
        let entry_space = self.arena.geometry().entry_space;
        if bump + needed as u64 > entry_space {
            return Err(DriftError::CapacityExhausted(format!(
                "segment arena full: {} of {} bytes used, {} more needed",
                bump, entry_space, needed
            )));
        }
        self.arena.set_bump(bump + needed as u64);
        Ok((bump, needed32))
    }

    fn release(&mut self, slot: u64) {
        let capacity = self.arena.slot_header(slot).capacity;
        self.arena.set_slot_flags(slot, FLAG_FREE);
        if slot + capacity as u64 == self.arena.bump() {
            self.arena.set_bump(slot);
        } else {
            self.free.entry(capacity).or_default().push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::layout::Geometry;
    use crate::store::{RawKey, RawValue};

    fn state(buckets: u64, entry_space: u64) -> SegmentState {
        SegmentState::new(Arena::anonymous(Geometry { buckets, entry_space }).unwrap())
    }

    fn put(state: &mut SegmentState, key: &[u8], value: &[u8], ts: u64) -> u64 {
        let key = RawKey::new(key);
        let value = RawValue(value);
        match state.lookup(&key) {
            Some(at) => state.overwrite(at, Some(&value), Stamp::new(1, ts)).unwrap(),
            None => state.insert(&key, Some(&value), Stamp::new(1, ts)).unwrap(),
        }
    }

    fn value_of(state: &SegmentState, key: &[u8]) -> Option<Vec<u8>> {
        let at = state.lookup(&RawKey::new(key))?;
        let entry = state.entry(at.slot);
        entry.is_live().then(|| entry.value.to_vec())
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut s = state(8, 1024);
        put(&mut s, b"alpha", b"1", 1);
        put(&mut s, b"beta", b"2", 2);
        assert_eq!(value_of(&s, b"alpha"), Some(b"1".to_vec()));
        assert_eq!(value_of(&s, b"beta"), Some(b"2".to_vec()));
        assert_eq!(value_of(&s, b"gamma"), None);
        assert_eq!(s.occupied(), 2);
    }

    #[test]
    fn test_overwrite_fits_in_place() {
        let mut s = state(8, 1024);
        let first = put(&mut s, b"k", b"longer value", 1);
        let second = put(&mut s, b"k", b"short", 2);
        assert_eq!(first, second);
        assert_eq!(value_of(&s, b"k"), Some(b"short".to_vec()));
        let entry = s.entry(second);
        assert_eq!(entry.stamp, Stamp::new(1, 2));
    }

    #[test]
    fn test_overwrite_relocates_and_frees_old_slot() {
        let mut s = state(8, 1024);
        let first = put(&mut s, b"k", b"v", 1);
        put(&mut s, b"other", b"x", 2);
        let moved = put(&mut s, b"k", &[7u8; 100], 3);
        assert_ne!(first, moved);
        assert_eq!(value_of(&s, b"k"), Some(vec![7u8; 100]));
        assert_eq!(s.free_slot_count(), 1);

        // the freed slot is reused by the next small entry
        let reused = put(&mut s, b"small", b"y", 4);
        assert_eq!(reused, first);
        assert_eq!(s.free_slot_count(), 0);
    }

    #[test]
    fn test_tombstone_hides_value_until_reclaimed() {
        let mut s = state(8, 1024);
        put(&mut s, b"k", b"v", 1);
        let at = s.lookup(&RawKey::new(b"k")).unwrap();
        s.tombstone(at, Stamp::new(2, 5));

        let entry = s.entry(at.slot);
        assert!(!entry.is_live());
        assert_eq!(entry.stamp, Stamp::new(2, 5));
        assert_eq!(s.occupied(), 1);

        s.reclaim(at);
        assert!(s.lookup(&RawKey::new(b"k")).is_none());
        assert_eq!(s.occupied(), 0);
    }

    #[test]
    fn test_reclaim_keeps_collision_runs_intact() {
        let mut s = state(16, 4096);
        let keys: Vec<Vec<u8>> = (0u32..12).map(|i| i.to_le_bytes().to_vec()).collect();
        for (i, key) in keys.iter().enumerate() {
            put(&mut s, key, b"v", i as u64 + 1);
        }
        for key in keys.iter().step_by(2) {
            let at = s.lookup(&RawKey::new(key)).unwrap();
            s.reclaim(at);
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(value_of(&s, key).is_some(), i % 2 == 1, "key {}", i);
        }
    }

    #[test]
    fn test_index_full_is_capacity_error() {
        let mut s = state(8, 4096);
        for i in 0u8..6 {
            put(&mut s, &[i], b"v", 1);
        }
        let err = s
            .insert(&RawKey::new(b"seventh"), Some(&RawValue(b"v")), Stamp::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, DriftError::CapacityExhausted(_)));
    }

    #[test]
    fn test_arena_full_is_capacity_error() {
        let mut s = state(8, 64);
        put(&mut s, b"a", b"b", 1);
        let err = s
            .insert(&RawKey::new(b"big"), Some(&RawValue(&[0u8; 64])), Stamp::new(1, 2))
            .unwrap_err();
        assert!(matches!(err, DriftError::CapacityExhausted(_)));
        // the failed insert leaves the existing entry alone
        assert_eq!(value_of(&s, b"a"), Some(b"b".to_vec()));
    }

    #[test]
    fn test_lock_timeout() {
        let segment = Segment::new(3, state(8, 64));
        let _held = segment.lock(None).unwrap();
        let err = segment.lock(Some(Duration::from_millis(20))).err();
        assert!(matches!(
            err,
            Some(DriftError::LockTimeout { segment: 3, .. })
        ));
        assert!(err.map_or(false, |e| e.is_retryable()));
    }

    #[test]
    fn test_locate_slot() {
        let mut s = state(8, 1024);
        let slot = put(&mut s, b"k", b"v", 1);
        let hash = s.slot_hash(slot);
        assert_eq!(s.locate_slot(hash, slot).map(|at| at.slot), Some(slot));
        assert!(s.locate_slot(hash, slot + 8).is_none());
    }

    #[test]
    fn test_recover_rebuilds_free_list_and_tombstones() {
        let geometry = Geometry {
            buckets: 8,
            entry_space: 1024,
        };
        let mut s = SegmentState::new(Arena::anonymous(geometry).unwrap());
        put(&mut s, b"a", b"1", 10);
        put(&mut s, b"b", b"2", 11);
        put(&mut s, b"a", &[1u8; 64], 12); // frees the first slot
        let at = s.lookup(&RawKey::new(b"b")).unwrap();
        s.tombstone(at, Stamp::new(3, 20));

        let (recovered, tombstones, max_ts) = SegmentState::recover(s.arena).unwrap();
        assert_eq!(recovered.free_slot_count(), 1);
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].stamp, Stamp::new(3, 20));
        assert_eq!(max_ts, 20);
        assert_eq!(value_of(&recovered, b"a"), Some(vec![1u8; 64]));
    }
}
