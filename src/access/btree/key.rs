use byteorder::{ByteOrder, LittleEndian};
use std::fmt::Debug;

/// Fixed-width key stored in B+ tree pages.
///
/// Keys are compared with `Ord` after decoding, so the on-page encoding does
/// not need to preserve order.
pub trait IndexKey: Ord + Copy + Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;
}

macro_rules! impl_int_key {
    ($ty:ty, $size:expr, $read:ident, $write:ident) => {
        impl IndexKey for $ty {
            const SIZE: usize = $size;

            fn encode(&self, buf: &mut [u8]) {
                LittleEndian::$write(buf, *self);
            }

            fn decode(buf: &[u8]) -> Self {
                LittleEndian::$read(buf)
            }
        }
    };
}

impl_int_key!(i32, 4, read_i32, write_i32);
impl_int_key!(i64, 8, read_i64, write_i64);
impl_int_key!(u32, 4, read_u32, write_u32);
impl_int_key!(u64, 8, read_u64, write_u64);

/// Byte-string key compared lexicographically, zero padded to `N` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedKey<const N: usize>(pub [u8; N]);

impl<const N: usize> FixedKey<N> {
    /// Builds a key from a prefix of at most `N` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut key = [0u8; N];
        let len = bytes.len().min(N);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> From<&str> for FixedKey<N> {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl<const N: usize> IndexKey for FixedKey<N> {
    const SIZE: usize = N;

    fn encode(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.0);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; N];
        key.copy_from_slice(&buf[..N]);
        Self(key)
    }
}
