use crate::block::BgzfError;
use std::fmt;

/// Highest compressed position a virtual offset can address (48 bits).
pub const MAX_COMPRESSED_POSITION: u64 = (1 << 48) - 1;

/// Composite address into a blocked stream: the start position of a block in
/// the underlying compressed source (upper 48 bits) ORed with a byte offset
/// into that block's uncompressed payload (lower 16 bits).
///
/// A virtual offset is only meaningful for relative addressing — it does not
/// encode "uncompressed byte N of the whole stream".  Values obtained from
/// `tell` on one file can be fed back to `seek` on the same file, stored in
/// external indexes, and ordered: offsets compare the same way the positions
/// they address do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    /// Pack a compressed block start and an in-block offset.
    ///
    /// Fails with `Misuse` when `compressed` exceeds 48 bits.  The in-block
    /// offset is a `u16`, so its 16-bit range holds by construction.
    pub fn new(compressed: u64, uncompressed: u16) -> Result<Self, BgzfError> {
        if compressed > MAX_COMPRESSED_POSITION {
            return Err(BgzfError::Misuse(
                "compressed position exceeds 48 bits",
            ));
        }
        Ok(Self(compressed << 16 | u64::from(uncompressed)))
    }

    /// Start position of the addressed block in the compressed source.
    pub fn compressed(self) -> u64 {
        self.0 >> 16
    }

    /// Byte offset within the addressed block's uncompressed payload.
    pub fn uncompressed(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl From<u64> for VirtualOffset {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<VirtualOffset> for u64 {
    fn from(v: VirtualOffset) -> Self {
        v.0
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
