//! blobseal-session: client-side sessions over an encrypted remote file
//!
//! # Overview
//! - `descriptor`: what a session knows about a remote file
//! - `slice_cache`: chunk access at server-slice granularity
//! - `reader`: verified chunk decryption and byte-range reads
//! - `upload`: sequential upload of a new file
//! - `random_write`: read-modify-write with squashing and rollback
//! - `handles`: handle kinds and the id registry

pub mod descriptor;
pub mod handles;
pub mod random_write;
pub mod reader;
pub mod slice_cache;
pub mod squash;
pub mod upload;

pub use descriptor::{FileDescriptor, SyncParams};
pub use handles::{FileHandle, HandleRegistry, RandomWriteHandle, ReadHandle, WriteHandle};
pub use random_write::{RandomWriteEngine, WriteSnapshot};
pub use reader::{read_range, ChunkReader, ChunkSource, RangeReader};
pub use slice_cache::RemoteSliceCache;
pub use upload::{UploadReceipt, UploadSession};
