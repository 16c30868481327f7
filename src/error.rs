//! Errors

use std::io;

use thiserror::Error;

/// Errors generated by the block processor.
///
/// Variants split into two classes: misuse
/// ([`Sequence`](Self::Sequence), [`Unsupported`](Self::Unsupported)) and allocation
/// ([`Alloc`](Self::Alloc)) errors are returned directly and never latched; asynchronous errors
/// ([`Io`](Self::Io), [`Compressor`](Self::Compressor), [`Corrupted`](Self::Corrupted)) are the
/// ones [`crate::BlockProcessor`] latches into its shared status.
#[derive(Error, Debug)]
pub enum BlockProcessorError {
    #[error("std io error: {0}")]
    Io(#[from] io::Error),

    #[error("compressor error: {0}")]
    Compressor(String),

    #[error("corrupted or invalid data encountered")]
    Corrupted,

    #[error("allocation failure")]
    Alloc,

    #[error("API called out of sequence (e.g. begin_file while a file is already open)")]
    Sequence,

    #[error("flag bits not supported in this context: {0:#x}")]
    Unsupported(u16),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),
}

impl BlockProcessorError {
    /// Whether this error class is latched into [`crate::stats::Stats`]-adjacent processor
    /// status and made sticky until `destroy`.
    pub fn is_latched(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Compressor(_) | Self::Corrupted)
    }
}

/// A cheaply [`Clone`]-able copy of a latched [`BlockProcessorError`].
///
/// The original error types are not all [`Clone`] (`io::Error` isn't), but the shared processor
/// status must be readable from many call sites without consuming it. `LatchedError` captures
/// just enough information to report the fault again without moving the original out of the
/// mutex-guarded state.
#[derive(Debug, Clone)]
pub enum LatchedError {
    Io { kind: io::ErrorKind, message: String },
    Compressor(String),
    Corrupted,
    /// A non-latchable variant (`Alloc`, `Sequence`, `Unsupported`, `Deku`) reached a latch
    /// site anyway. The core never produces these asynchronously itself, but `BlockWriter`,
    /// `FragmentTable` and `Compressor` are public traits typed to return the full
    /// `BlockProcessorError` enum, so a third-party implementation is free to report, say,
    /// `Alloc` from a failed write. Captured rather than dropped so the fault still surfaces
    /// instead of panicking the processor.
    Other(String),
}

impl From<&BlockProcessorError> for LatchedError {
    fn from(e: &BlockProcessorError) -> Self {
        match e {
            BlockProcessorError::Io(e) => {
                LatchedError::Io { kind: e.kind(), message: e.to_string() }
            }
            BlockProcessorError::Compressor(msg) => LatchedError::Compressor(msg.clone()),
            BlockProcessorError::Corrupted => LatchedError::Corrupted,
            other => LatchedError::Other(other.to_string()),
        }
    }
}

impl From<LatchedError> for BlockProcessorError {
    fn from(e: LatchedError) -> Self {
        match e {
            LatchedError::Io { kind, message } => {
                BlockProcessorError::Io(io::Error::new(kind, message))
            }
            LatchedError::Compressor(msg) => BlockProcessorError::Compressor(msg),
            LatchedError::Corrupted => BlockProcessorError::Corrupted,
            LatchedError::Other(msg) => BlockProcessorError::Compressor(msg),
        }
    }
}

impl std::fmt::Display for LatchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        BlockProcessorError::from(self.clone()).fmt(f)
    }
}
