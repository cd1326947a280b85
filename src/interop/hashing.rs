//! Streaming hash functions
//!
//! `BytesInterop::hash` feeds an encoding to the hash state piece by piece,
//! so every function here must give the same result for the same byte
//! sequence no matter how it is split across `update` calls.

/// Incremental hash computation
pub trait HashState {
    fn update(&mut self, bytes: &[u8]);
    fn finish(self) -> u64;
}

/// A 64-bit hash function over byte sequences
pub trait HashFunction: Send + Sync {
    type State: HashState;

    fn begin(&self) -> Self::State;

    fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        let mut state = self.begin();
        state.update(bytes);
        state.finish()
    }
}

// =============================================================================
// FNV-1a (64 bit)
// =============================================================================

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a, the store's default key hash
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1a64;

#[derive(Debug, Clone, Copy)]
pub struct Fnv1a64State(u64);

impl HashState for Fnv1a64State {
    fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn finish(self) -> u64 {
        // fold the high half in so `hash % segments` sees every byte
        self.0 ^ (self.0 >> 29)
    }
}

impl HashFunction for Fnv1a64 {
    type State = Fnv1a64State;

    fn begin(&self) -> Self::State {
        Fnv1a64State(FNV_OFFSET_BASIS)
    }
}

// =============================================================================
// CRC32
// =============================================================================

/// CRC32 (IEEE) widened to 64 bits
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Hash;

pub struct Crc32State(crc32fast::Hasher);

impl HashState for Crc32State {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(self) -> u64 {
        self.0.finalize() as u64
    }
}

impl HashFunction for Crc32Hash {
    type State = Crc32State;

    fn begin(&self) -> Self::State {
        Crc32State(crc32fast::Hasher::new())
    }
}
