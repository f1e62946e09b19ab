//! Discovery and ordered concatenation of upload chunks.
//!
//! Chunks live as individual files inside one directory per upload. Their
//! order comes from the first run of decimal digits in each file name, never
//! from the order the filesystem lists them in.

mod error;
mod locator;
mod reassembler;

pub use error::{MergeError, MergeResult};
pub use locator::{ChunkLocator, ChunkRef};
pub use reassembler::{MergeSummary, Reassembler};
