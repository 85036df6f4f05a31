//! Persistent frame cache for decoded animation frames.
//!
//! Each cached animation is a pair of files in the cache directory:
//!
//! ```text
//! <key>-v<version>-<codec>-bs<buffer size>-lt<live time>-map
//!   Magic: "LTFM" (4 bytes)
//!   Version: u16
//!   Flags: u16 (bit 0: finished)
//!   Fps, start frame, end frame: u32 each
//!   Entry count: u32
//!   Entries (count * 21 bytes):
//!     Frame: u32, Offset: u64, Length: u64, Finished: u8
//!
//! <key>-v<version>-<codec>-bs<buffer size>-lt<live time>-data
//!   Compressed frames back to back, addressed only through the map
//! ```
//!
//! Frames become readable once the whole sequence has been written and the
//! cache is marked finished. Until then every read is a miss.

mod codec;
mod evictor;
mod format;
mod frame_cache;
mod queue;
mod registry;
mod store;

pub use codec::{CodecError, FrameCodec, compress_lz4, decompress_lz4, xor_in_place};
pub use evictor::{Evictor, SweepReport, sweep};
pub use format::{
    CACHE_VERSION, CacheFileName, CodecTag, CompressionType, FileKind, FrameEntry, FrameIndex,
    INDEX_FORMAT_VERSION, INDEX_MAGIC, StorePaths,
};
pub use frame_cache::FrameCache;
pub use queue::StoreQueue;
pub use registry::{CacheRegistry, StoreLease};
pub use store::{FrameStore, StoreError, StoreStats};
