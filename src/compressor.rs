//! The `Compressor` capability and a reference implementation.
//!
//! The block processor core never picks a compression algorithm itself; it drives whatever is
//! handed to it through this trait. [`DefaultCompressor`] is the reference implementation the
//! crate's own tests and examples use, built from the same codec set `backhand`'s
//! `DefaultCompressor`/`CompressionAction` supports.

use std::io::{Cursor, Read};

use crate::error::BlockProcessorError;

/// Outcome of one [`Compressor::compress`] call: positive length, zero (incompressible, caller
/// keeps the original), or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressOutcome {
    /// The codec decided compressing wasn't worthwhile; the original bytes are kept.
    Incompressible,
    /// Compression succeeded; `scratch[..0]` holds `n < input.len()` compressed bytes.
    Compressed(usize),
}

/// A compression codec capability.
///
/// Each worker owns one instance, produced by [`deep_copy`](Self::deep_copy) from the
/// processor's configured codec — an independent instance sharing configuration but no mutable
/// state with the original, safe to use concurrently.
pub trait Compressor: Send {
    /// Produce an independent copy of this codec for exclusive use by one worker.
    fn deep_copy(&self) -> Box<dyn Compressor>;

    /// Compress `input` into `scratch`. `scratch.len() >= input.len()` is guaranteed by the
    /// caller (it is sized to the processor's block capacity). Returns
    /// [`CompressOutcome::Incompressible`] if compressing would not shrink the data, or
    /// [`CompressOutcome::Compressed(n)`] with `n < input.len()` bytes written to
    /// `scratch[..n]`.
    fn compress(
        &mut self,
        input: &[u8],
        scratch: &mut [u8],
    ) -> Result<CompressOutcome, BlockProcessorError>;
}

/// Which codec [`DefaultCompressor`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// No compression; every call reports [`CompressOutcome::Incompressible`].
    None,
    #[cfg(feature = "gzip")]
    Gzip,
    #[cfg(feature = "xz")]
    Xz,
    #[cfg(feature = "zstd")]
    Zstd { level: i32 },
    #[cfg(feature = "lz4")]
    Lz4,
}

/// Reference [`Compressor`] built from the codec crates `backhand` already depends on
/// (`flate2`, `xz2`, `zstd`, `lz4_flex`), each behind a matching Cargo feature.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCompressor {
    codec: Codec,
}

impl DefaultCompressor {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }
}

impl Compressor for DefaultCompressor {
    fn deep_copy(&self) -> Box<dyn Compressor> {
        Box::new(*self)
    }

    fn compress(
        &mut self,
        input: &[u8],
        scratch: &mut [u8],
    ) -> Result<CompressOutcome, BlockProcessorError> {
        let compressed = match self.codec {
            Codec::None => return Ok(CompressOutcome::Incompressible),
            #[cfg(feature = "gzip")]
            Codec::Gzip => {
                let mut encoder =
                    flate2::read::ZlibEncoder::new(input, flate2::Compression::best());
                let mut buf = Vec::with_capacity(input.len());
                encoder
                    .read_to_end(&mut buf)
                    .map_err(|e| BlockProcessorError::Compressor(e.to_string()))?;
                buf
            }
            #[cfg(feature = "xz")]
            Codec::Xz => {
                let mut encoder = xz2::read::XzEncoder::new(Cursor::new(input), 6);
                let mut buf = Vec::with_capacity(input.len());
                encoder
                    .read_to_end(&mut buf)
                    .map_err(|e| BlockProcessorError::Compressor(e.to_string()))?;
                buf
            }
            #[cfg(feature = "zstd")]
            Codec::Zstd { level } => zstd::bulk::compress(input, level)
                .map_err(|e| BlockProcessorError::Compressor(e.to_string()))?,
            #[cfg(feature = "lz4")]
            Codec::Lz4 => lz4_flex::compress(input),
        };

        if compressed.len() >= input.len() || compressed.len() > scratch.len() {
            return Ok(CompressOutcome::Incompressible);
        }
        scratch[..compressed.len()].copy_from_slice(&compressed);
        Ok(CompressOutcome::Compressed(compressed.len()))
    }
}
