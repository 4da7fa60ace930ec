pub mod voffset;
pub mod block;
pub mod cache;
pub mod stream;
pub mod pipeline;

pub use voffset::VirtualOffset;
pub use block::{encode_block, decode_block, BgzfError, BLOCK_SIZE, MAX_BLOCK_SIZE, EOF_MARKER};
pub use cache::BlockCache;
pub use stream::{BgzfReader, BgzfWriter, is_bgzf, has_eof_marker};
pub use pipeline::Pipeline;
