//! Byte layout of segments, slots and the store file
//!
//! All integers stored in the arena are little-endian.

use crate::config::Config;
use crate::error::{DriftError, Result};

// =============================================================================
// Store file header (file-backed stores only)
// =============================================================================

pub(crate) const FILE_MAGIC: &[u8; 8] = b"DRIFTKV1";
pub(crate) const FILE_VERSION: u32 = 1;
pub(crate) const FILE_HEADER_SIZE: u64 = 64;

// =============================================================================
// Segment header
// =============================================================================

pub(crate) const SEGMENT_HEADER_SIZE: usize = 64;
pub(crate) const SEG_BUMP: usize = 0;
pub(crate) const SEG_OCCUPIED: usize = 8;
pub(crate) const SEG_MAGIC: usize = 16;
pub(crate) const SEGMENT_MAGIC: u32 = 0x4453_4547; // "GESD"

pub(crate) const BUCKET_SIZE: usize = 8;
pub(crate) const EMPTY_BUCKET: u64 = 0;

// =============================================================================
// Slot header
// =============================================================================

pub(crate) const SLOT_CAPACITY: usize = 0;
pub(crate) const SLOT_FLAGS: usize = 4;
pub(crate) const SLOT_ORIGIN: usize = 5;
pub(crate) const SLOT_TIMESTAMP: usize = 8;
pub(crate) const SLOT_HASH: usize = 16;
pub(crate) const SLOT_KEY_LEN: usize = 24;
pub(crate) const SLOT_VALUE_LEN: usize = 28;
pub(crate) const SLOT_HEADER_SIZE: usize = 32;
pub(crate) const SLOT_ALIGN: usize = 8;

pub(crate) const FLAG_FREE: u8 = 0;
pub(crate) const FLAG_LIVE: u8 = 1;
pub(crate) const FLAG_TOMBSTONE: u8 = 2;

/// Headroom over the expected entry count for tombstones and fragmentation
const ENTRY_SPACE_SLACK_NUM: u64 = 3;
const ENTRY_SPACE_SLACK_DEN: u64 = 2;

pub(crate) fn align_slot(len: usize) -> usize {
    (len + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// Sizes shared by every segment of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub buckets: u64,
    pub entry_space: u64,
}

impl Geometry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let segments = config.segments as u64;
        let per_segment = ((config.entries + segments - 1) / segments).max(1);

        let buckets = per_segment
            .checked_mul(2)
            .map(u64::next_power_of_two)
            .ok_or_else(|| DriftError::Config(format!("too many entries: {}", config.entries)))?
            .max(8);

        let average_slot = align_slot(
            SLOT_HEADER_SIZE + config.average_key_size + config.average_value_size,
        ) as u64;
        let slots = per_segment * ENTRY_SPACE_SLACK_NUM / ENTRY_SPACE_SLACK_DEN + 1;
        let entry_space = average_slot.checked_mul(slots).ok_or_else(|| {
            DriftError::Config("entry size hints overflow the arena size".to_string())
        })?;

        let geometry = Self {
            buckets,
            entry_space,
        };
        geometry
            .segment_size()
            .checked_mul(segments)
            .ok_or_else(|| DriftError::Config("store size overflows".to_string()))?;
        Ok(geometry)
    }

    /// Most buckets that may be occupied at once
    pub fn max_occupied(&self) -> u64 {
        self.buckets / 4 * 3
    }

    pub fn index_start(&self) -> usize {
        SEGMENT_HEADER_SIZE
    }

    pub fn entries_start(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.buckets as usize * BUCKET_SIZE
    }

    pub fn segment_size(&self) -> u64 {
        self.entries_start() as u64 + self.entry_space
    }
}

// =============================================================================
// Raw accessors
// =============================================================================

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
