//! blobseal-chunks: fixed-size chunk layout and sequential chunk buffering
//!
//! # Overview
//! - `layout`: chunk count, offsets and encrypted sizes for a given chunk size
//! - `buffer`: accumulates a byte stream and yields complete chunks

pub mod buffer;
pub mod layout;

pub use buffer::ChunkBuffer;
pub use layout::ChunkLayout;
