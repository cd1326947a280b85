//! Serialization Interop Module
//!
//! Lets the store work with values as if they were already marshalled to
//! bytes: compare them with stored bytes, hash them, and test equivalence,
//! all without producing the encoding.
//!
//! ## Responsibilities
//! - Encode / decode values with `bytes::BufMut` / `bytes::Buf`
//! - `starts_with`: match a value against an encoded region
//! - `hash`: hash of the encoding, streamed without allocating it
//!
//! ## Contract
//! For every value `e` and streaming hash function `f`:
//! ```text
//! starts_with(encode(e), e)           == true
//! hash(f, e)                          == f.hash_bytes(encode(e))
//! equivalent(a, b)                    => hash(f, a) == hash(f, b)
//! read(encode(e))                     == e
//! ```

mod blob;
mod hashing;
mod primitives;
mod text;

pub use blob::ByteArrayInterop;
pub use hashing::{Crc32Hash, Fnv1a64, HashFunction, HashState};
pub use primitives::{I32Interop, I64Interop, U32Interop, U64Interop};
pub use text::Utf8Interop;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DriftError, Result};

/// Byte-level strategy for values of type `E`
///
/// Implementations are stateless and shared across every segment.
pub trait BytesInterop<E>: Send + Sync {
    /// Number of bytes `write` produces for `e`
    fn size(&self, e: &E) -> usize;

    /// Encode `e` at the buffer's write position, advancing it by `size(e)`.
    ///
    /// Must fail before writing anything: the store encodes straight into
    /// live slots and relies on a failed write leaving them untouched.
    fn write<B: BufMut>(&self, buf: &mut B, e: &E) -> Result<()>;

    /// Decode a value from the buffer's read position
    fn read<B: Buf>(&self, buf: &mut B) -> Result<E>;

    /// True iff `bytes` begins with the encoding of `e`
    fn starts_with(&self, bytes: &[u8], e: &E) -> bool;

    /// Same answer as `a == b` for every field that is encoded
    fn equivalent(&self, a: &E, b: &E) -> bool;

    /// Hash of the encoding of `e` under `f`, without encoding it
    ///
    /// Values `write` rejects have no encoding; for them the result only
    /// has to be deterministic. Such values never reach the arena.
    fn hash<F: HashFunction>(&self, f: &F, e: &E) -> u64;
}

/// Types with a default interop binding
pub trait Interoperable: Sized + Send + Sync + 'static {
    type Interop: BytesInterop<Self> + Default + 'static;
}

/// Encode `e` into a fresh buffer
pub fn encode<E, I: BytesInterop<E>>(interop: &I, e: &E) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(interop.size(e));
    interop.write(&mut buf, e)?;
    Ok(buf.freeze())
}

/// Decode a value that must occupy all of `bytes`
pub fn decode<E, I: BytesInterop<E>>(interop: &I, mut bytes: &[u8]) -> Result<E> {
    let value = interop.read(&mut bytes)?;
    if bytes.has_remaining() {
        return Err(DriftError::Encoding(format!(
            "{} trailing bytes after decoded value",
            bytes.remaining()
        )));
    }
    Ok(value)
}

/// Fail unless `buf` can take `needed` more bytes
pub(crate) fn ensure_writable<B: BufMut>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining_mut() < needed {
        return Err(DriftError::Encoding(format!(
            "buffer has {} bytes left, {} needed",
            buf.remaining_mut(),
            needed
        )));
    }
    Ok(())
}

/// Fail unless `buf` holds `needed` more bytes
pub(crate) fn ensure_readable<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(DriftError::Encoding(format!(
            "truncated input: {} bytes left, {} needed",
            buf.remaining(),
            needed
        )));
    }
    Ok(())
}
