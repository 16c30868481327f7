//! Concurrent block-splitting, compression, deduplication and fragment-packing core for a
//! SquashFS writer.
//!
//! This crate implements only the data path: given a byte stream per file, it splits it into
//! fixed-size blocks plus a variable tail, dispatches blocks across a worker pool (or runs them
//! inline with one worker), reassembles completed blocks in the order they were submitted,
//! deduplicates identical data blocks and tail fragments, and packs fragments into shared
//! fragment blocks. Choosing a compression codec, defining the on-disk layout of the fragment
//! table, and writing blocks to their final destination are all external collaborators, supplied
//! through the [`compressor::Compressor`], [`fragment::FragmentTable`] and [`writer::BlockWriter`]
//! traits.
//!
//! [`processor::BlockProcessor`] is the entry point.

pub mod assembler;
pub mod block;
pub mod compressor;
pub mod error;
pub mod fragment;
pub mod inode;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod splitter;
pub mod stage;
pub mod stats;
pub mod writer;

pub use crate::block::BlockFlags;
pub use crate::compressor::{Codec, CompressOutcome, Compressor, DefaultCompressor};
pub use crate::error::BlockProcessorError;
pub use crate::fragment::{
    DefaultFragmentTable, FragmentEntry, FragmentSuperFields, FragmentTable, SuperBlockFlags,
};
pub use crate::inode::{BlockRecord, FragLocation, Inode, InodeArena, InodeHandle};
pub use crate::processor::{BlockProcessor, BlockProcessorConfig};
pub use crate::stats::Stats;
pub use crate::writer::{BlockWriter, DefaultBlockWriter, ReadWriteSeek};
