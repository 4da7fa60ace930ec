//! Stream handles over the blocked container — reader and writer.
//!
//! # Reader
//! [`BgzfReader`] materializes one decompressed block at a time and serves
//! byte, buffered, and line reads out of it.  Exhausting the block records
//! the next block's start address and fetches lazily on the next read.  A
//! seek to a [`VirtualOffset`] repositions the source at the block start and
//! remembers the in-block offset; the offset is applied when the next block
//! is fetched, so seeking is cheap until data is actually needed.  An
//! optional [`BlockCache`] short-circuits re-decompression of revisited
//! blocks.
//!
//! # Writer
//! [`BgzfWriter`] buffers uncompressed bytes up to the configured block size
//! and emits one complete block per flush — through the [`Pipeline`] when
//! one is attached.  [`BgzfWriter::finish`] writes the fixed end-of-stream
//! marker; dropping an unfinished writer does so best-effort.
//!
//! # Errors
//! Both handles accumulate every error they ever hit into a sticky bitmask
//! (`errcode()`), alongside the per-call `Result`.  A reader that hits a
//! malformed header or a corrupt block is poisoned: every later read fails.
//! Running out of input at a block boundary is a normal end of stream, not
//! an error.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use flate2::Compression;

use crate::block::{
    check_header, decode_block, encode_block, BgzfError, BLOCK_FOOTER_LENGTH,
    BLOCK_HEADER_LENGTH, BLOCK_SIZE, EOF_MARKER, ERR_CORRUPT, ERR_HEADER, HEADER_MAGIC,
    MAX_BLOCK_SIZE,
};
use crate::cache::BlockCache;
use crate::pipeline::Pipeline;
use crate::voffset::VirtualOffset;

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct BgzfReader<R: Read + Seek> {
    inner: R,
    /// Decompressed contents of the materialized block; only the first
    /// `block_length` bytes are valid.
    block: Vec<u8>,
    /// Compressed scratch buffer reused across fetches.
    scratch: Vec<u8>,
    /// Start address of the materialized block in the underlying source.
    block_address: u64,
    /// Read cursor within the materialized block.
    block_offset: usize,
    /// Uncompressed length of the materialized block.  0 means no block is
    /// materialized — either nothing has been fetched yet, or a seek left an
    /// in-block offset pending for the next fetch.
    block_length: usize,
    cache: Option<BlockCache>,
    errcode: u32,
}

impl BgzfReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BgzfError> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read + Seek> BgzfReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            block: Vec::with_capacity(MAX_BLOCK_SIZE),
            scratch: Vec::with_capacity(MAX_BLOCK_SIZE),
            block_address: 0,
            block_offset: 0,
            block_length: 0,
            cache: None,
            errcode: 0,
        }
    }

    /// Sticky error bitmask: every `ERR_*` bit this stream has ever set.
    pub fn errcode(&self) -> u32 {
        self.errcode
    }

    /// Enable the block cache with the given byte budget; 0 disables it.
    /// Only useful for seek-heavy access; sequential reads never revisit a
    /// block.
    pub fn set_cache_size(&mut self, budget: usize) {
        self.cache = if budget == 0 {
            None
        } else {
            Some(BlockCache::new(budget))
        };
    }

    /// Copy up to `buf.len()` decompressed bytes, fetching blocks as needed.
    ///
    /// Returns the number of bytes copied; 0 means end of stream.  A short
    /// count because the source ran out mid-read is not an error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, BgzfError> {
        self.check_poisoned()?;
        match self.read_impl(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read a single decompressed byte; `None` at end of stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>, BgzfError> {
        self.check_poisoned()?;
        match self.read_byte_impl() {
            Ok(b) => Ok(b),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read bytes up to (not including) `delim`, appending to `line`.
    ///
    /// `Ok(Some(n))` is the number of bytes appended; `Ok(None)` means end of
    /// stream with no data.  A final unterminated line is still returned as
    /// data; the delimiter itself is consumed but never copied.
    pub fn read_line(&mut self, delim: u8, line: &mut Vec<u8>) -> Result<Option<usize>, BgzfError> {
        self.check_poisoned()?;
        match self.read_line_impl(delim, line) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reposition to a virtual offset previously obtained from [`tell`]
    /// (or an external index over this file).
    ///
    /// Discards the materialized block and records the in-block offset; the
    /// next read fetches the addressed block and starts there.
    ///
    /// [`tell`]: BgzfReader::tell
    pub fn seek(&mut self, voffset: VirtualOffset) -> Result<(), BgzfError> {
        if let Err(e) = self.inner.seek(SeekFrom::Start(voffset.compressed())) {
            return Err(self.fail(e.into()));
        }
        self.block_address = voffset.compressed();
        self.block_offset = usize::from(voffset.uncompressed());
        self.block_length = 0;
        Ok(())
    }

    /// The virtual offset of the next byte [`read`] would return.
    ///
    /// [`read`]: BgzfReader::read
    pub fn tell(&self) -> VirtualOffset {
        VirtualOffset::from(self.block_address << 16 | self.block_offset as u64)
    }

    fn fail(&mut self, err: BgzfError) -> BgzfError {
        self.errcode |= err.errcode_bit();
        err
    }

    /// A header or corruption fault leaves the stream unusable.
    fn check_poisoned(&self) -> Result<(), BgzfError> {
        if self.errcode & ERR_HEADER != 0 {
            return Err(BgzfError::Format);
        }
        if self.errcode & ERR_CORRUPT != 0 {
            return Err(BgzfError::Corruption(
                "stream poisoned by an earlier corrupt block".into(),
            ));
        }
        Ok(())
    }

    /// Fetch and decompress the block at the current source position.
    ///
    /// Leaves `block_length == 0` on a clean end of stream.  `block_offset`
    /// is preserved when a seek pre-set it (`block_length == 0` on entry) and
    /// reset to 0 on a sequential fetch.
    fn read_block(&mut self) -> Result<(), BgzfError> {
        let block_address = self.inner.stream_position()?;

        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(block_address) {
                let (data, end_offset) = (entry.data.clone(), entry.end_offset);
                if self.block_length != 0 {
                    self.block_offset = 0;
                }
                self.block_address = block_address;
                self.block_length = data.len();
                self.block = data;
                self.inner.seek(SeekFrom::Start(end_offset))?;
                return Ok(());
            }
        }

        let mut header = [0u8; BLOCK_HEADER_LENGTH];
        let got = read_fully(&mut self.inner, &mut header)?;
        if got == 0 {
            // Source exhausted exactly at a block boundary: end of stream.
            self.block_length = 0;
            return Ok(());
        }
        if got != BLOCK_HEADER_LENGTH || !check_header(&header) {
            return Err(BgzfError::Format);
        }
        let block_length = usize::from(LittleEndian::read_u16(&header[16..18])) + 1;
        if block_length < BLOCK_HEADER_LENGTH + BLOCK_FOOTER_LENGTH {
            return Err(BgzfError::Format);
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&header);
        self.scratch.resize(block_length, 0);
        self.inner.read_exact(&mut self.scratch[BLOCK_HEADER_LENGTH..])?;
        let raw = decode_block(&self.scratch)?;

        if self.block_length != 0 {
            self.block_offset = 0;
        }
        self.block_address = block_address;
        self.block_length = raw.len();
        if let Some(cache) = &mut self.cache {
            cache.insert(block_address, raw.clone(), block_address + block_length as u64);
        }
        self.block = raw;
        Ok(())
    }

    fn read_impl(&mut self, buf: &mut [u8]) -> Result<usize, BgzfError> {
        let mut bytes_read = 0;
        while bytes_read < buf.len() {
            let mut available = self.block_length.saturating_sub(self.block_offset);
            if available == 0 {
                self.read_block()?;
                available = self.block_length.saturating_sub(self.block_offset);
                if available == 0 {
                    break;
                }
            }
            let copy_length = (buf.len() - bytes_read).min(available);
            buf[bytes_read..bytes_read + copy_length]
                .copy_from_slice(&self.block[self.block_offset..self.block_offset + copy_length]);
            self.block_offset += copy_length;
            bytes_read += copy_length;
        }
        if self.block_offset == self.block_length && self.block_length != 0 {
            // Block fully consumed: the cursor now names the next block.
            self.block_address = self.inner.stream_position()?;
            self.block_offset = 0;
            self.block_length = 0;
        }
        Ok(bytes_read)
    }

    fn read_byte_impl(&mut self) -> Result<Option<u8>, BgzfError> {
        while self.block_offset >= self.block_length {
            self.read_block()?;
            if self.block_length == 0 {
                return Ok(None);
            }
        }
        let byte = self.block[self.block_offset];
        self.block_offset += 1;
        if self.block_offset == self.block_length {
            self.block_address = self.inner.stream_position()?;
            self.block_offset = 0;
            self.block_length = 0;
        }
        Ok(Some(byte))
    }

    fn read_line_impl(
        &mut self,
        delim: u8,
        line: &mut Vec<u8>,
    ) -> Result<Option<usize>, BgzfError> {
        line.clear();
        loop {
            if self.block_offset >= self.block_length {
                self.read_block()?;
                if self.block_length == 0 {
                    return Ok(if line.is_empty() { None } else { Some(line.len()) });
                }
                continue;
            }
            let window = &self.block[self.block_offset..self.block_length];
            match window.iter().position(|&b| b == delim) {
                Some(at) => {
                    line.extend_from_slice(&window[..at]);
                    self.block_offset += at + 1;
                    if self.block_offset >= self.block_length {
                        self.block_address = self.inner.stream_position()?;
                        self.block_offset = 0;
                        self.block_length = 0;
                    }
                    return Ok(Some(line.len()));
                }
                None => {
                    line.extend_from_slice(window);
                    self.block_address = self.inner.stream_position()?;
                    self.block_offset = 0;
                    self.block_length = 0;
                }
            }
        }
    }
}

impl<R: Read + Seek> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BgzfReader::read(self, buf).map_err(io::Error::other)
    }
}

/// Read as much of `buf` as the source can provide; a clean EOF before the
/// first byte yields 0 rather than an error.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct BgzfWriter<W: Write> {
    inner: W,
    /// Pending uncompressed bytes; never longer than `block_size`.
    buffer: Vec<u8>,
    /// Uncompressed payload size that triggers an implicit block cut.
    block_size: usize,
    level: Compression,
    /// Compressed bytes emitted so far — the start address of the next block.
    block_address: u64,
    pipeline: Option<Pipeline>,
    errcode: u32,
    finished: bool,
}

impl BgzfWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P, level: Compression) -> Result<Self, BgzfError> {
        Ok(Self::new(File::create(path)?, level))
    }
}

impl<W: Write> BgzfWriter<W> {
    pub fn new(inner: W, level: Compression) -> Self {
        Self::with_block_size(inner, level, BLOCK_SIZE)
    }

    /// A writer that cuts blocks at `block_size` uncompressed bytes instead
    /// of the default [`BLOCK_SIZE`].  Values above the default are clamped;
    /// small blocks trade compression ratio for addressing granularity.
    pub fn with_block_size(inner: W, level: Compression, block_size: usize) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(block_size.clamp(1, BLOCK_SIZE)),
            block_size: block_size.clamp(1, BLOCK_SIZE),
            level,
            block_address: 0,
            pipeline: None,
            errcode: 0,
            finished: false,
        }
    }

    /// Sticky error bitmask: every `ERR_*` bit this stream has ever set.
    pub fn errcode(&self) -> u32 {
        self.errcode
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Attach a parallel compression pipeline.
    ///
    /// Fails with `Misuse` when a pipeline is already attached, when fewer
    /// than two workers are requested (the caller is worker 0, so one worker
    /// means no parallelism), or when `blocks_per_worker` is zero.
    pub fn enable_pipeline(
        &mut self,
        workers: usize,
        blocks_per_worker: usize,
    ) -> Result<(), BgzfError> {
        let result = if self.pipeline.is_some() {
            Err(BgzfError::Misuse("pipeline already attached"))
        } else if workers < 2 {
            Err(BgzfError::Misuse("pipeline needs at least two workers"))
        } else if blocks_per_worker == 0 {
            Err(BgzfError::Misuse("blocks_per_worker must be nonzero"))
        } else {
            self.pipeline = Some(Pipeline::new(workers, blocks_per_worker, self.level));
            Ok(())
        };
        result.map_err(|e| self.fail(e))
    }

    /// Buffer `data`, cutting a block whenever the buffer reaches the
    /// configured block size.  Always consumes all of `data` on success.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BgzfError> {
        match self.write_impl(data) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Emit all buffered bytes now, as one block that may be smaller than
    /// the block size.  With a pipeline attached this also forces a batch,
    /// so every queued block reaches the sink before this returns.
    pub fn flush(&mut self) -> Result<(), BgzfError> {
        match self.flush_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Flush everything and write the end-of-stream marker.  Idempotent;
    /// dropping an unfinished writer performs this best-effort (call
    /// `finish` explicitly to see the errors).
    pub fn finish(&mut self) -> Result<(), BgzfError> {
        match self.finish_impl() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// The virtual offset of the next byte to be written.  Block-precise
    /// only at flush boundaries; with a pipeline attached, flush first.
    pub fn tell(&self) -> VirtualOffset {
        VirtualOffset::from(self.block_address << 16 | self.buffer.len() as u64)
    }

    fn fail(&mut self, err: BgzfError) -> BgzfError {
        self.errcode |= err.errcode_bit();
        err
    }

    fn write_impl(&mut self, data: &[u8]) -> Result<usize, BgzfError> {
        if self.finished {
            return Err(BgzfError::Misuse("write after finish"));
        }
        let mut written = 0;
        while written < data.len() {
            let room = self.block_size - self.buffer.len();
            let copy_length = room.min(data.len() - written);
            self.buffer
                .extend_from_slice(&data[written..written + copy_length]);
            written += copy_length;
            if self.buffer.len() == self.block_size {
                self.cut_block()?;
            }
        }
        Ok(written)
    }

    /// Emit the pending buffer as one block, or queue it on the pipeline —
    /// dispatching a batch only once the slot ring is full.
    fn cut_block(&mut self) -> Result<(), BgzfError> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.queue(&mut self.buffer)?;
            if pipeline.is_full() {
                self.block_address += pipeline.dispatch(&mut self.inner)?;
            }
        } else {
            let block = encode_block(&self.buffer, self.level)?;
            self.inner.write_all(&block)?;
            self.block_address += block.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    fn flush_impl(&mut self) -> Result<(), BgzfError> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            if !self.buffer.is_empty() {
                pipeline.queue(&mut self.buffer)?;
            }
            self.block_address += pipeline.dispatch(&mut self.inner)?;
        } else {
            while !self.buffer.is_empty() {
                let block = encode_block(&self.buffer, self.level)?;
                self.inner.write_all(&block)?;
                self.block_address += block.len() as u64;
                self.buffer.clear();
            }
        }
        Ok(())
    }

    fn finish_impl(&mut self) -> Result<(), BgzfError> {
        if self.finished {
            return Ok(());
        }
        self.flush_impl()?;
        // The marker is written even for an empty stream, and its bytes do
        // not depend on the writer's compression level.
        self.inner.write_all(&EOF_MARKER)?;
        self.inner.flush()?;
        self.block_address += EOF_MARKER.len() as u64;
        self.finished = true;
        Ok(())
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BgzfWriter::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        BgzfWriter::flush(self).map_err(io::Error::other)
    }
}

impl<W: Write> Drop for BgzfWriter<W> {
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

// ── File sniffers ────────────────────────────────────────────────────────────

/// Cheap container check: does `path` start with the fixed block header?
/// Only the first 16 bytes are examined (the BSIZE field varies per file);
/// nothing else about the file is validated.
pub fn is_bgzf<P: AsRef<Path>>(path: P) -> bool {
    let mut buf = [0u8; 16];
    match File::open(path).and_then(|mut f| f.read_exact(&mut buf)) {
        Ok(()) => buf[..] == HEADER_MAGIC[..16],
        Err(_) => false,
    }
}

/// Trailer check: does `path` end with the 28-byte end-of-stream marker?
/// Lets callers detect truncated files without reading the whole stream.
pub fn has_eof_marker<P: AsRef<Path>>(path: P) -> bool {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let marker_len = EOF_MARKER.len() as i64;
    if f.seek(SeekFrom::End(-marker_len)).is_err() {
        return false;
    }
    let mut buf = [0u8; 28];
    f.read_exact(&mut buf).map(|()| buf == EOF_MARKER).unwrap_or(false)
}
