//! Block codec: the fixed on-disk block layout and its DEFLATE primitives.
//!
//! One block is `header ++ compressed payload ++ footer`:
//!
//! ```text
//!  +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!  | 31|139|  8|  4|       MTIME=0 |  0|255| XLEN=6| 66| 67| SLEN=2| BSIZE |
//!  +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//!  |                    DEFLATE payload (no zlib wrapper)                  |
//!  +---+---+---+---+---+---+---+---+
//!  |     CRC32     |     ISIZE     |
//!  +---+---+---+---+---+---+---+---+
//! ```
//!
//! The header is a gzip member header carrying one "BC" extra subfield whose
//! 16-bit value `BSIZE` is the total on-disk block length minus one.  That is
//! what makes blocks skippable without decompressing them, and it is also why
//! the uncompressed payload is capped below 64 KiB: even incompressible input
//! must deflate into a block whose length-minus-one still fits 16 bits.
//!
//! CRC32 and ISIZE in the footer describe the *uncompressed* payload.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use thiserror::Error;

pub const BLOCK_HEADER_LENGTH: usize = 18;
pub const BLOCK_FOOTER_LENGTH: usize = 8;

/// On-disk ceiling for one whole block; `BSIZE = length - 1` must fit in u16.
pub const MAX_BLOCK_SIZE: usize = 0x1_0000;

/// Uncompressed payload target for the write path.  Chosen below
/// [`MAX_BLOCK_SIZE`] so that worst-case DEFLATE expansion plus the 26 bytes
/// of framing can never overflow the on-disk ceiling.
pub const BLOCK_SIZE: usize = 0xff00;

/// The fixed header every block starts with.  Bytes 16..18 are the `BSIZE`
/// placeholder, patched after compression.
pub const HEADER_MAGIC: [u8; BLOCK_HEADER_LENGTH] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, b'B', b'C', 0x02,
    0x00, 0x00, 0x00,
];

/// The empty block terminating every well-formed stream.  Its presence is how
/// completeness of a file is checked without reading the whole stream.
pub const EOF_MARKER: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, b'B', b'C', 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// Sticky error bits accumulated in a stream handle's errcode.
pub const ERR_BACKEND: u32 = 1;
pub const ERR_HEADER: u32 = 2;
pub const ERR_IO: u32 = 4;
pub const ERR_MISUSE: u32 = 8;
pub const ERR_CORRUPT: u32 = 16;

#[derive(Error, Debug)]
pub enum BgzfError {
    /// The 18-byte header does not match the fixed pattern.  Fatal: a stream
    /// that hits this is poisoned and refuses further reads.
    #[error("malformed block header")]
    Format,
    /// The block decompressed, but its footer disagrees with the result.
    #[error("corrupt block: {0}")]
    Corruption(String),
    /// The DEFLATE backend rejected the stream or its parameters.
    #[error("deflate backend error: {0}")]
    Backend(String),
    #[error("misuse: {0}")]
    Misuse(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BgzfError {
    /// The bit this error contributes to a stream's sticky error bitmask.
    pub fn errcode_bit(&self) -> u32 {
        match self {
            BgzfError::Format => ERR_HEADER,
            BgzfError::Corruption(_) => ERR_CORRUPT,
            BgzfError::Backend(_) => ERR_BACKEND,
            BgzfError::Misuse(_) => ERR_MISUSE,
            BgzfError::Io(_) => ERR_IO,
        }
    }
}

/// Does `header` begin with a valid block header?
///
/// MTIME, XFL and OS are free per the gzip spec, so only the bytes that
/// identify the container are checked: the gzip magic, the deflate method,
/// the FEXTRA flag, and the 6-byte "BC" subfield shape.
pub fn check_header(header: &[u8]) -> bool {
    header.len() >= BLOCK_HEADER_LENGTH
        && header[0] == 31
        && header[1] == 139
        && header[2] == 8
        && (header[3] & 4) != 0
        && LittleEndian::read_u16(&header[10..12]) == 6
        && header[12] == b'B'
        && header[13] == b'C'
        && LittleEndian::read_u16(&header[14..16]) == 2
}

/// Compress `raw` into one complete block at the given level.
///
/// Level 0 stores the payload in uncompressed DEFLATE blocks; the framing is
/// identical either way.  `raw` must not exceed [`BLOCK_SIZE`].
pub fn encode_block(raw: &[u8], level: Compression) -> Result<Vec<u8>, BgzfError> {
    if raw.len() > BLOCK_SIZE {
        return Err(BgzfError::Misuse("block payload exceeds BLOCK_SIZE"));
    }

    let mut block = vec![0u8; MAX_BLOCK_SIZE];
    block[..BLOCK_HEADER_LENGTH].copy_from_slice(&HEADER_MAGIC);

    // Raw DEFLATE: no zlib header, no zlib checksum.
    let mut deflater = Compress::new(level, false);
    let status = deflater
        .compress(
            raw,
            &mut block[BLOCK_HEADER_LENGTH..MAX_BLOCK_SIZE - BLOCK_FOOTER_LENGTH],
            FlushCompress::Finish,
        )
        .map_err(|e| BgzfError::Backend(e.to_string()))?;
    if status != Status::StreamEnd {
        return Err(BgzfError::Backend(
            "deflate stream did not finish within one block".into(),
        ));
    }

    let total = BLOCK_HEADER_LENGTH + deflater.total_out() as usize + BLOCK_FOOTER_LENGTH;
    block.truncate(total);
    LittleEndian::write_u16(&mut block[16..18], (total - 1) as u16);

    let mut hasher = Hasher::new();
    hasher.update(raw);
    LittleEndian::write_u32(&mut block[total - 8..total - 4], hasher.finalize());
    LittleEndian::write_u32(&mut block[total - 4..total], raw.len() as u32);
    Ok(block)
}

/// Decompress one complete block back to its raw payload.
///
/// The header is validated first; the payload span is then inflated, and the
/// footer's ISIZE and CRC32 are checked against the result.
pub fn decode_block(block: &[u8]) -> Result<Vec<u8>, BgzfError> {
    if block.len() < BLOCK_HEADER_LENGTH + BLOCK_FOOTER_LENGTH || !check_header(block) {
        return Err(BgzfError::Format);
    }
    let payload = &block[BLOCK_HEADER_LENGTH..block.len() - BLOCK_FOOTER_LENGTH];

    let mut raw = vec![0u8; MAX_BLOCK_SIZE];
    let mut inflater = Decompress::new(false);
    let status = inflater
        .decompress(payload, &mut raw, FlushDecompress::Finish)
        .map_err(|e| BgzfError::Backend(e.to_string()))?;
    if status != Status::StreamEnd {
        return Err(BgzfError::Backend("deflate stream did not terminate".into()));
    }
    raw.truncate(inflater.total_out() as usize);

    let footer = &block[block.len() - BLOCK_FOOTER_LENGTH..];
    let declared_len = LittleEndian::read_u32(&footer[4..8]) as usize;
    if raw.len() != declared_len {
        return Err(BgzfError::Corruption(format!(
            "inflated {} bytes but footer declares {}",
            raw.len(),
            declared_len
        )));
    }
    let mut hasher = Hasher::new();
    hasher.update(&raw);
    let crc = hasher.finalize();
    let declared_crc = LittleEndian::read_u32(&footer[..4]);
    if crc != declared_crc {
        return Err(BgzfError::Corruption(format!(
            "CRC32 mismatch: computed {crc:08x}, footer says {declared_crc:08x}"
        )));
    }
    Ok(raw)
}
