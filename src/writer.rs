//! The `BlockWriter` capability and a reference implementation.
//!
//! Appending finished blocks to the output image and reporting their physical location is left to
//! the caller rather than baked into the core — different SquashFS images land on different kinds
//! of sinks. [`DefaultBlockWriter`] is a minimal reference implementation — good enough for the
//! crate's own tests — wrapping any `Read + Write + Seek` sink and maintaining a whole-block dedup
//! index the way `backhand`'s `DataWriter` maintains its duplicate-file cache, keyed off the same
//! CRC checksum the block stage already computes rather than a second hash.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::block::BlockFlags;
use crate::error::BlockProcessorError;

/// Marker trait for sinks the reference writer can wrap: written bytes must be re-readable so
/// dedup lookups can confirm a checksum match against the actual payload.
pub trait ReadWriteSeek: Read + Write + Seek {}
impl<T: Read + Write + Seek> ReadWriteSeek for T {}

/// The block-writer capability.
///
/// `write` takes the block's checksum up front rather than deriving it again internally — an
/// implementation needs it immediately to maintain its own dedup index.
pub trait BlockWriter: Send {
    /// Append `payload` (already compressed, if it was going to be), returning its on-disk
    /// `(offset, written_size)`. Pads to device-block alignment first if `flags` carries
    /// [`BlockFlags::ALIGN`].
    fn write(
        &mut self,
        checksum: u32,
        payload: &[u8],
        flags: BlockFlags,
    ) -> Result<(u64, u32), BlockProcessorError>;

    /// Look for an already-written block with the same `(checksum, size, is_compressed)`,
    /// confirming identity with a payload compare to rule out CRC collisions.
    fn lookup_dedup(
        &mut self,
        checksum: u32,
        size: usize,
        is_compressed: bool,
        payload: &[u8],
    ) -> Result<Option<(u64, u32)>, BlockProcessorError>;
}

type DedupKey = (u32, usize, bool);

/// Reference [`BlockWriter`] wrapping any [`ReadWriteSeek`] sink.
pub struct DefaultBlockWriter<W> {
    inner: W,
    devblksz: u32,
    index: HashMap<DedupKey, Vec<(u64, u32)>>,
}

impl<W: ReadWriteSeek> DefaultBlockWriter<W> {
    pub fn new(inner: W, devblksz: u32) -> Self {
        Self { inner, devblksz, index: HashMap::new() }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: ReadWriteSeek + Send> BlockWriter for DefaultBlockWriter<W> {
    fn write(
        &mut self,
        checksum: u32,
        payload: &[u8],
        flags: BlockFlags,
    ) -> Result<(u64, u32), BlockProcessorError> {
        let offset = self.inner.stream_position()?;
        self.inner.write_all(payload)?;

        if flags.contains(BlockFlags::ALIGN) && self.devblksz > 0 {
            let pos = self.inner.stream_position()?;
            let rem = pos % self.devblksz as u64;
            if rem != 0 {
                let pad = self.devblksz as u64 - rem;
                self.inner.write_all(&vec![0u8; pad as usize])?;
            }
        }

        let written_size = payload.len() as u32;
        let is_compressed = flags.contains(BlockFlags::IS_COMPRESSED);
        self.index
            .entry((checksum, payload.len(), is_compressed))
            .or_default()
            .push((offset, written_size));
        Ok((offset, written_size))
    }

    fn lookup_dedup(
        &mut self,
        checksum: u32,
        size: usize,
        is_compressed: bool,
        payload: &[u8],
    ) -> Result<Option<(u64, u32)>, BlockProcessorError> {
        let Some(candidates) = self.index.get(&(checksum, size, is_compressed)) else {
            return Ok(None);
        };
        for &(offset, written_size) in candidates {
            let mut buf = vec![0u8; written_size as usize];
            let saved = self.inner.stream_position()?;
            self.inner.seek(SeekFrom::Start(offset))?;
            self.inner.read_exact(&mut buf)?;
            self.inner.seek(SeekFrom::Start(saved))?;
            if buf == payload {
                return Ok(Some((offset, written_size)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn write_then_dedup_hit() {
        let mut w = DefaultBlockWriter::new(Cursor::new(Vec::new()), 0);
        let payload = b"hello world hello world".to_vec();
        let (offset, size) = w.write(0xdead_beef, &payload, BlockFlags::empty()).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(size as usize, payload.len());

        let hit = w.lookup_dedup(0xdead_beef, payload.len(), false, &payload).unwrap();
        assert_eq!(hit, Some((0, payload.len() as u32)));
    }

    #[test]
    fn checksum_collision_is_not_a_false_hit() {
        let mut w = DefaultBlockWriter::new(Cursor::new(Vec::new()), 0);
        let a = b"aaaaaaaa".to_vec();
        w.write(1, &a, BlockFlags::empty()).unwrap();

        let b = b"bbbbbbbb".to_vec();
        let hit = w.lookup_dedup(1, b.len(), false, &b).unwrap();
        assert_eq!(hit, None);
    }

    #[test]
    fn align_pads_to_device_block_size() {
        let mut w = DefaultBlockWriter::new(Cursor::new(Vec::new()), 512);
        w.write(1, &[0xffu8; 100], BlockFlags::ALIGN).unwrap();
        assert_eq!(w.into_inner().into_inner().len(), 512);
    }
}
