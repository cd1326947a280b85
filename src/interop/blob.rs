//! Byte array binding
//!
//! Encoding: `len u32 LE | bytes`.

use bytes::{Buf, BufMut};

use super::{ensure_readable, ensure_writable, BytesInterop, HashFunction, HashState, Interoperable};
use crate::error::{DriftError, Result};

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteArrayInterop;

impl BytesInterop<Vec<u8>> for ByteArrayInterop {
    fn size(&self, e: &Vec<u8>) -> usize {
        LEN_PREFIX + e.len()
    }

    fn write<B: BufMut>(&self, buf: &mut B, e: &Vec<u8>) -> Result<()> {
        let len = u32::try_from(e.len()).map_err(|_| {
            DriftError::Encoding(format!("byte array of {} bytes is too large", e.len()))
        })?;
        ensure_writable(buf, LEN_PREFIX + e.len())?;
        buf.put_u32_le(len);
        buf.put_slice(e);
        Ok(())
    }

    fn read<B: Buf>(&self, buf: &mut B) -> Result<Vec<u8>> {
        ensure_readable(buf, LEN_PREFIX)?;
        let len = buf.get_u32_le() as usize;
        ensure_readable(buf, len)?;
        let mut out = vec![0u8; len];
        buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn starts_with(&self, bytes: &[u8], e: &Vec<u8>) -> bool {
        let end = LEN_PREFIX + e.len();
        bytes.len() >= end
            && bytes[..LEN_PREFIX] == (e.len() as u32).to_le_bytes()
            && &bytes[LEN_PREFIX..end] == e.as_slice()
    }

    fn equivalent(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a == b
    }

    fn hash<F: HashFunction>(&self, f: &F, e: &Vec<u8>) -> u64 {
        let mut state = f.begin();
        state.update(&(e.len() as u32).to_le_bytes());
        state.update(e);
        state.finish()
    }
}

impl Interoperable for Vec<u8> {
    type Interop = ByteArrayInterop;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::{decode, encode};

    #[test]
    fn test_empty_array() {
        let bytes = encode(&ByteArrayInterop, &Vec::new()).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 0]);
        assert_eq!(decode(&ByteArrayInterop, &bytes).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let raw = [5u8, 0, 0, 0, 1, 2];
        assert!(decode(&ByteArrayInterop, &raw).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected_by_decode() {
        let raw = [1u8, 0, 0, 0, 9, 9];
        assert!(decode(&ByteArrayInterop, &raw).is_err());
    }
}
