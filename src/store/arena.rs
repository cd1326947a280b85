//! Off-heap arenas
//!
//! Each segment owns exactly one memory mapping: anonymous memory for
//! in-process stores, or a window of the store file when persisted. The
//! mapping is unmapped when the arena is dropped, which happens once, when
//! the segment is released on close.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use super::layout::*;
use crate::error::{DriftError, Result};

/// Decoded slot header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotHeader {
    pub capacity: u32,
    pub flags: u8,
    pub origin: u8,
    pub timestamp: u64,
    pub hash: u64,
    pub key_len: u32,
    pub value_len: u32,
}

/// One segment's mapped region
pub(crate) struct Arena {
    map: MmapMut,
    geometry: Geometry,
}

impl Arena {
    /// Zeroed anonymous mapping
    pub fn anonymous(geometry: Geometry) -> Result<Self> {
        let map = MmapMut::map_anon(geometry.segment_size() as usize)?;
        let mut arena = Self { map, geometry };
        arena.format();
        Ok(arena)
    }

    /// Map `geometry.segment_size()` bytes of `file` starting at `offset`
    fn file_window(file: &File, offset: u64, geometry: Geometry) -> Result<Self> {
        // SAFETY: the file is opened read-write by this process and each
        // window is mapped exactly once; windows of different segments do
        // not overlap, and all access goes through the segment lock.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(geometry.segment_size() as usize)
                .map_mut(file)?
        };
        Ok(Self { map, geometry })
    }

    fn format(&mut self) {
        write_u64(&mut self.map, SEG_BUMP, 0);
        write_u64(&mut self.map, SEG_OCCUPIED, 0);
        write_u32(&mut self.map, SEG_MAGIC, SEGMENT_MAGIC);
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Segment header
    // -------------------------------------------------------------------------

    pub fn magic(&self) -> u32 {
        read_u32(&self.map, SEG_MAGIC)
    }

    pub fn bump(&self) -> u64 {
        read_u64(&self.map, SEG_BUMP)
    }

    pub fn set_bump(&mut self, bump: u64) {
        write_u64(&mut self.map, SEG_BUMP, bump);
    }

    pub fn occupied(&self) -> u64 {
        read_u64(&self.map, SEG_OCCUPIED)
    }

    pub fn set_occupied(&mut self, count: u64) {
        write_u64(&mut self.map, SEG_OCCUPIED, count);
    }

    // -------------------------------------------------------------------------
    // Hash index
    // -------------------------------------------------------------------------

    pub fn bucket(&self, index: usize) -> u64 {
        read_u64(&self.map, self.geometry.index_start() + index * BUCKET_SIZE)
    }

    pub fn set_bucket(&mut self, index: usize, value: u64) {
        let at = self.geometry.index_start() + index * BUCKET_SIZE;
        write_u64(&mut self.map, at, value);
    }

    // -------------------------------------------------------------------------
    // Slots
    // -------------------------------------------------------------------------

    fn slot_start(&self, slot: u64) -> usize {
        self.geometry.entries_start() + slot as usize
    }

    pub fn slot_header(&self, slot: u64) -> SlotHeader {
        let at = self.slot_start(slot);
        let map = &self.map;
        SlotHeader {
            capacity: read_u32(map, at + SLOT_CAPACITY),
            flags: map[at + SLOT_FLAGS],
            origin: map[at + SLOT_ORIGIN],
            timestamp: read_u64(map, at + SLOT_TIMESTAMP),
            hash: read_u64(map, at + SLOT_HASH),
            key_len: read_u32(map, at + SLOT_KEY_LEN),
            value_len: read_u32(map, at + SLOT_VALUE_LEN),
        }
    }

    pub fn write_slot_header(&mut self, slot: u64, header: &SlotHeader) {
        let at = self.slot_start(slot);
        let map = &mut self.map;
        write_u32(map, at + SLOT_CAPACITY, header.capacity);
        map[at + SLOT_FLAGS] = header.flags;
        map[at + SLOT_ORIGIN] = header.origin;
        write_u64(map, at + SLOT_TIMESTAMP, header.timestamp);
        write_u64(map, at + SLOT_HASH, header.hash);
        write_u32(map, at + SLOT_KEY_LEN, header.key_len);
        write_u32(map, at + SLOT_VALUE_LEN, header.value_len);
    }

    pub fn slot_hash(&self, slot: u64) -> u64 {
        read_u64(&self.map, self.slot_start(slot) + SLOT_HASH)
    }

    pub fn set_slot_flags(&mut self, slot: u64, flags: u8) {
        let at = self.slot_start(slot) + SLOT_FLAGS;
        self.map[at] = flags;
    }

    pub fn key(&self, slot: u64, key_len: u32) -> &[u8] {
        let at = self.slot_start(slot) + SLOT_HEADER_SIZE;
        &self.map[at..at + key_len as usize]
    }

    pub fn value(&self, slot: u64, key_len: u32, value_len: u32) -> &[u8] {
        let at = self.slot_start(slot) + SLOT_HEADER_SIZE + key_len as usize;
        &self.map[at..at + value_len as usize]
    }

    pub fn key_mut(&mut self, slot: u64, key_len: usize) -> &mut [u8] {
        let at = self.slot_start(slot) + SLOT_HEADER_SIZE;
        &mut self.map[at..at + key_len]
    }

    pub fn value_mut(&mut self, slot: u64, key_len: usize, value_len: usize) -> &mut [u8] {
        let at = self.slot_start(slot) + SLOT_HEADER_SIZE + key_len;
        &mut self.map[at..at + value_len]
    }

    /// Copy `len` key bytes from one slot to another
    pub fn copy_key(&mut self, from: u64, to: u64, len: usize) {
        let src = self.slot_start(from) + SLOT_HEADER_SIZE;
        let dst = self.slot_start(to) + SLOT_HEADER_SIZE;
        self.map.copy_within(src..src + len, dst);
    }
}

// =============================================================================
// Store file
// =============================================================================

/// Map one arena per segment, from anonymous memory or the store file.
///
/// Returns the arenas and whether they hold recovered contents.
pub(crate) fn map_segments(
    segments: usize,
    geometry: Geometry,
    persist_path: Option<&Path>,
) -> Result<(Vec<Arena>, bool)> {
    let Some(path) = persist_path else {
        let arenas = (0..segments)
            .map(|_| Arena::anonymous(geometry))
            .collect::<Result<Vec<_>>>()?;
        return Ok((arenas, false));
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let expected_len = FILE_HEADER_SIZE + geometry.segment_size() * segments as u64;

    let recovered = file.metadata()?.len() > 0;
    if recovered {
        verify_file_header(&mut file, segments, geometry)?;
        if file.metadata()?.len() < expected_len {
            return Err(DriftError::Corruption(format!(
                "{} is shorter than its header declares",
                path.display()
            )));
        }
    } else {
        file.set_len(expected_len)?;
        write_file_header(&mut file, segments, geometry)?;
    }

    let mut arenas = Vec::with_capacity(segments);
    for i in 0..segments {
        let offset = FILE_HEADER_SIZE + geometry.segment_size() * i as u64;
        let mut arena = Arena::file_window(&file, offset, geometry)?;
        if !recovered {
            arena.format();
        } else if arena.magic() != SEGMENT_MAGIC {
            return Err(DriftError::Corruption(format!(
                "segment {} has bad magic {:#x}",
                i,
                arena.magic()
            )));
        }
        arenas.push(arena);
    }
    Ok((arenas, recovered))
}

fn write_file_header(file: &mut File, segments: usize, geometry: Geometry) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_SIZE as usize];
    header[0..8].copy_from_slice(FILE_MAGIC);
    write_u32(&mut header, 8, FILE_VERSION);
    write_u32(&mut header, 12, segments as u32);
    write_u64(&mut header, 16, geometry.segment_size());
    write_u64(&mut header, 24, geometry.buckets);
    write_u64(&mut header, 32, geometry.entry_space);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(())
}

fn verify_file_header(file: &mut File, segments: usize, geometry: Geometry) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;

    if &header[0..8] != FILE_MAGIC {
        return Err(DriftError::Corruption("not a DriftKV store file".to_string()));
    }
    let version = read_u32(&header, 8);
    if version != FILE_VERSION {
        return Err(DriftError::Corruption(format!(
            "unsupported file version {}",
            version
        )));
    }

    let stored = (
        read_u32(&header, 12) as usize,
        read_u64(&header, 16),
        read_u64(&header, 24),
        read_u64(&header, 32),
    );
    let wanted = (
        segments,
        geometry.segment_size(),
        geometry.buckets,
        geometry.entry_space,
    );
    if stored != wanted {
        return Err(DriftError::Corruption(format!(
            "file geometry {:?} does not match configuration {:?}",
            stored, wanted
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_geometry() -> Geometry {
        Geometry {
            buckets: 8,
            entry_space: 512,
        }
    }

    #[test]
    fn test_anonymous_arena_is_formatted() {
        let arena = Arena::anonymous(small_geometry()).unwrap();
        assert_eq!(arena.magic(), SEGMENT_MAGIC);
        assert_eq!(arena.bump(), 0);
        assert_eq!(arena.occupied(), 0);
        assert!((0..8).all(|i| arena.bucket(i) == EMPTY_BUCKET));
    }

    #[test]
    fn test_slot_header_round_trip() {
        let mut arena = Arena::anonymous(small_geometry()).unwrap();
        let header = SlotHeader {
            capacity: 48,
            flags: FLAG_LIVE,
            origin: 3,
            timestamp: 77,
            hash: 0xabcdef,
            key_len: 4,
            value_len: 8,
        };
        arena.write_slot_header(16, &header);
        assert_eq!(arena.slot_header(16), header);
        assert_eq!(arena.slot_hash(16), 0xabcdef);
    }

    #[test]
    fn test_file_reopen_recovers_and_checks_geometry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.dkv");

        {
            let (mut arenas, recovered) = map_segments(2, small_geometry(), Some(&path)).unwrap();
            assert!(!recovered);
            arenas[1].set_bump(40);
            arenas[1].flush().unwrap();
        }

        let (arenas, recovered) = map_segments(2, small_geometry(), Some(&path)).unwrap();
        assert!(recovered);
        assert_eq!(arenas[1].bump(), 40);
        drop(arenas);

        let other = Geometry {
            buckets: 16,
            entry_space: 512,
        };
        assert!(matches!(
            map_segments(2, other, Some(&path)),
            Err(DriftError::Corruption(_))
        ));
    }
}
