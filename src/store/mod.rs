//! Store Module
//!
//! The segmented off-heap hash table.
//!
//! ## Responsibilities
//! - Route each key to one of a fixed number of segments (`hash % segments`)
//! - Per-segment mutual exclusion with optional lock timeout
//! - Open-addressing index and slot arena inside each segment's mapping
//! - In-place updates, relocation on growth, free-slot reuse
//! - Tombstones with delayed reclamation so peers can observe deletions
//!
//! ## Segment Layout
//! ```text
//! ┌────────────┬───────────────────────┬──────────────────────────────┐
//! │ header 64B │ buckets × u64         │ slots (bump + free-list)     │
//! └────────────┴───────────────────────┴──────────────────────────────┘
//! slot: cap | flags | origin | ts | hash | key_len | value_len | key | value
//! ```

mod arena;
mod entry;
mod layout;
mod reclaim;
mod segment;
mod table;

pub(crate) use table::StoreCore;
pub(crate) use reclaim::Reclaimer;

pub use entry::{ApplyOutcome, ReplicatedEntry, Stamp};

use crate::error::{DriftError, Result};
use crate::interop::{BytesInterop, Fnv1a64, HashFunction};

/// Hash used for segment and bucket selection
pub(crate) const STORE_HASH: Fnv1a64 = Fnv1a64;

/// A key to look up or insert, in whatever form the caller holds it
pub(crate) trait KeySource {
    fn hash(&self) -> u64;
    fn encoded_len(&self) -> usize;
    /// True iff `stored` is exactly this key's encoding
    fn matches(&self, stored: &[u8]) -> bool;
    fn write_into(&self, dst: &mut [u8]) -> Result<()>;
}

/// A value to store
pub(crate) trait ValueSource {
    fn encoded_len(&self) -> usize;
    fn write_into(&self, dst: &mut [u8]) -> Result<()>;
}

/// Key already in encoded form (replication path)
pub(crate) struct RawKey<'a> {
    bytes: &'a [u8],
    hash: u64,
}

impl<'a> RawKey<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            hash: STORE_HASH.hash_bytes(bytes),
        }
    }
}

impl KeySource for RawKey<'_> {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn encoded_len(&self) -> usize {
        self.bytes.len()
    }

    fn matches(&self, stored: &[u8]) -> bool {
        stored == self.bytes
    }

    fn write_into(&self, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(self.bytes);
        Ok(())
    }
}

pub(crate) struct RawValue<'a>(pub &'a [u8]);

impl ValueSource for RawValue<'_> {
    fn encoded_len(&self) -> usize {
        self.0.len()
    }

    fn write_into(&self, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(self.0);
        Ok(())
    }
}

/// Typed key, compared and hashed through its interop without encoding it
pub(crate) struct TypedKey<'a, K, I> {
    key: &'a K,
    interop: &'a I,
    hash: u64,
    len: usize,
}

impl<'a, K, I: BytesInterop<K>> TypedKey<'a, K, I> {
    pub fn new(key: &'a K, interop: &'a I) -> Self {
        Self {
            key,
            interop,
            hash: interop.hash(&STORE_HASH, key),
            len: interop.size(key),
        }
    }
}

impl<K, I: BytesInterop<K>> KeySource for TypedKey<'_, K, I> {
    fn hash(&self) -> u64 {
        self.hash
    }

    fn encoded_len(&self) -> usize {
        self.len
    }

    fn matches(&self, stored: &[u8]) -> bool {
        stored.len() == self.len && self.interop.starts_with(stored, self.key)
    }

    fn write_into(&self, dst: &mut [u8]) -> Result<()> {
        write_exact(self.interop, self.key, dst)
    }
}

pub(crate) struct TypedValue<'a, V, I> {
    value: &'a V,
    interop: &'a I,
    len: usize,
}

impl<'a, V, I: BytesInterop<V>> TypedValue<'a, V, I> {
    pub fn new(value: &'a V, interop: &'a I) -> Self {
        Self {
            value,
            interop,
            len: interop.size(value),
        }
    }
}

impl<V, I: BytesInterop<V>> ValueSource for TypedValue<'_, V, I> {
    fn encoded_len(&self) -> usize {
        self.len
    }

    fn write_into(&self, dst: &mut [u8]) -> Result<()> {
        write_exact(self.interop, self.value, dst)
    }
}

/// Encode `e` so that it fills `dst` exactly
fn write_exact<E, I: BytesInterop<E>>(interop: &I, e: &E, dst: &mut [u8]) -> Result<()> {
    let mut cursor = dst;
    interop.write(&mut cursor, e)?;
    if !cursor.is_empty() {
        return Err(DriftError::Encoding(format!(
            "interop wrote {} bytes fewer than its declared size",
            cursor.len()
        )));
    }
    Ok(())
}
