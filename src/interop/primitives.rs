//! Fixed-width integer bindings (little-endian)

use bytes::{Buf, BufMut};

use super::{ensure_readable, ensure_writable, BytesInterop, HashFunction, HashState, Interoperable};
use crate::error::Result;

macro_rules! fixed_width_interop {
    ($name:ident, $ty:ty, $put:ident, $get:ident) => {
        #[doc = concat!("Interop for `", stringify!($ty), "`")]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl $name {
            const WIDTH: usize = std::mem::size_of::<$ty>();
        }

        impl BytesInterop<$ty> for $name {
            fn size(&self, _e: &$ty) -> usize {
                Self::WIDTH
            }

            fn write<B: BufMut>(&self, buf: &mut B, e: &$ty) -> Result<()> {
                ensure_writable(buf, Self::WIDTH)?;
                buf.$put(*e);
                Ok(())
            }

            fn read<B: Buf>(&self, buf: &mut B) -> Result<$ty> {
                ensure_readable(buf, Self::WIDTH)?;
                Ok(buf.$get())
            }

            fn starts_with(&self, bytes: &[u8], e: &$ty) -> bool {
                bytes.len() >= Self::WIDTH && bytes[..Self::WIDTH] == e.to_le_bytes()
            }

            fn equivalent(&self, a: &$ty, b: &$ty) -> bool {
                a == b
            }

            fn hash<F: HashFunction>(&self, f: &F, e: &$ty) -> u64 {
                let mut state = f.begin();
                state.update(&e.to_le_bytes());
                state.finish()
            }
        }

        impl Interoperable for $ty {
            type Interop = $name;
        }
    };
}

fixed_width_interop!(U32Interop, u32, put_u32_le, get_u32_le);
fixed_width_interop!(I32Interop, i32, put_i32_le, get_i32_le);
fixed_width_interop!(U64Interop, u64, put_u64_le, get_u64_le);
fixed_width_interop!(I64Interop, i64, put_i64_le, get_i64_le);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::{decode, encode, Fnv1a64};

    #[test]
    fn test_u64_layout_is_little_endian() {
        let bytes = encode(&U64Interop, &0x0102_0304_0506_0708).unwrap();
        assert_eq!(&bytes[..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_i32_negative_round_trip() {
        let bytes = encode(&I32Interop, &-42).unwrap();
        assert_eq!(decode(&I32Interop, &bytes).unwrap(), -42);
    }

    #[test]
    fn test_write_into_short_slice_fails() {
        let mut storage = [0u8; 3];
        let mut slice = &mut storage[..];
        assert!(U32Interop.write(&mut slice, &7).is_err());
    }

    #[test]
    fn test_starts_with_ignores_trailing_bytes() {
        let mut bytes = 99u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"tail");
        assert!(U32Interop.starts_with(&bytes, &99));
        assert!(!U32Interop.starts_with(&bytes, &98));
        assert!(!U32Interop.starts_with(&bytes[..2], &99));
    }

    #[test]
    fn test_hash_matches_encoding_hash() {
        let bytes = encode(&I64Interop, &-1).unwrap();
        assert_eq!(I64Interop.hash(&Fnv1a64, &-1), Fnv1a64.hash_bytes(&bytes));
    }
}
