//! UTF-8 string binding
//!
//! Encoding: `len u16 LE | utf-8 bytes`. Strings longer than
//! `u16::MAX` bytes cannot be represented.

use bytes::{Buf, BufMut};

use super::{ensure_readable, ensure_writable, BytesInterop, HashFunction, HashState, Interoperable};
use crate::error::{DriftError, Result};

const LEN_PREFIX: usize = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Interop;

impl Utf8Interop {
    /// Largest string (in UTF-8 bytes) this binding can encode
    pub const MAX_LEN: usize = u16::MAX as usize;

    fn prefix(s: &str) -> Result<[u8; LEN_PREFIX]> {
        u16::try_from(s.len())
            .map(u16::to_le_bytes)
            .map_err(|_| {
                DriftError::Encoding(format!(
                    "string of {} bytes exceeds maximum of {}",
                    s.len(),
                    Self::MAX_LEN
                ))
            })
    }
}

impl BytesInterop<String> for Utf8Interop {
    fn size(&self, e: &String) -> usize {
        LEN_PREFIX + e.len()
    }

    fn write<B: BufMut>(&self, buf: &mut B, e: &String) -> Result<()> {
        let prefix = Self::prefix(e)?;
        ensure_writable(buf, LEN_PREFIX + e.len())?;
        buf.put_slice(&prefix);
        buf.put_slice(e.as_bytes());
        Ok(())
    }

    fn read<B: Buf>(&self, buf: &mut B) -> Result<String> {
        ensure_readable(buf, LEN_PREFIX)?;
        let len = buf.get_u16_le() as usize;
        ensure_readable(buf, len)?;
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        String::from_utf8(raw).map_err(|e| DriftError::Encoding(format!("invalid UTF-8: {}", e)))
    }

    fn starts_with(&self, bytes: &[u8], e: &String) -> bool {
        let Ok(prefix) = Self::prefix(e) else {
            return false;
        };
        let end = LEN_PREFIX + e.len();
        bytes.len() >= end && bytes[..LEN_PREFIX] == prefix && &bytes[LEN_PREFIX..end] == e.as_bytes()
    }

    fn equivalent(&self, a: &String, b: &String) -> bool {
        a == b
    }

    fn hash<F: HashFunction>(&self, f: &F, e: &String) -> u64 {
        let mut state = f.begin();
        // no encoding exists past MAX_LEN: saturate the prefix instead
        let prefix = Self::prefix(e).unwrap_or([0xff; LEN_PREFIX]);
        state.update(&prefix);
        state.update(e.as_bytes());
        state.finish()
    }
}

impl Interoperable for String {
    type Interop = Utf8Interop;
}
