//! The per-block work performed off the producer thread.
//!
//! Checksum and compression are the only things a worker (or, with one worker, the producer
//! itself inline) does to a [`Block`] before it is filed back onto the completion list.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::block::{Block, BlockFlags};
use crate::compressor::{CompressOutcome, Compressor};
use crate::error::BlockProcessorError;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Run the block stage on `block` in place: checksum it, then compress unless it is a sparse
/// marker, a fragment (fragments compress later, as part of their containing fragment block), or
/// the caller asked for `DONT_COMPRESS`.
///
/// Compressor errors are returned rather than latched here — the caller (inline dispatch or a
/// worker thread) is the one with access to the shared queue's `latch_error`.
pub fn run_block_stage(
    block: &mut Block,
    compressor: &mut dyn Compressor,
    scratch: &mut [u8],
) -> Result<(), BlockProcessorError> {
    if block.size == 0 {
        // Only a sentinel ever reaches the stage with a zero-length payload; real sparse blocks
        // keep their full size and are merely flagged `IS_SPARSE` by the splitter.
        block.checksum = 0;
        return Ok(());
    }

    block.checksum = CRC32.checksum(&block.data[..block.size]);

    let skip_compression =
        block.flags.intersects(BlockFlags::IS_FRAGMENT | BlockFlags::DONT_COMPRESS);
    if skip_compression {
        return Ok(());
    }

    match compressor.compress(&block.data[..block.size], scratch)? {
        CompressOutcome::Incompressible => Ok(()),
        CompressOutcome::Compressed(n) => {
            block.data[..n].copy_from_slice(&scratch[..n]);
            block.size = n;
            block.flags.insert(BlockFlags::IS_COMPRESSED);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{Codec, DefaultCompressor};
    use crate::inode::InodeHandle;

    fn block(bytes: &[u8]) -> Block {
        let mut b = Block::new(bytes.len().max(1));
        b.data[..bytes.len()].copy_from_slice(bytes);
        b.size = bytes.len();
        b.inode = InodeHandle::DANGLING;
        b
    }

    #[test]
    fn zero_size_block_gets_zero_checksum() {
        let mut b = block(&[]);
        let mut c = DefaultCompressor::new(Codec::None);
        let mut scratch = vec![0u8; 16];
        run_block_stage(&mut b, &mut c, &mut scratch).unwrap();
        assert_eq!(b.checksum, 0);
    }

    #[test]
    fn sentinel_block_is_left_untouched() {
        let mut b = Block::new(16);
        b.flags.insert(BlockFlags::LAST_BLOCK);
        let mut c = DefaultCompressor::new(Codec::None);
        let mut scratch = vec![0u8; 16];
        run_block_stage(&mut b, &mut c, &mut scratch).unwrap();
        assert_eq!(b.checksum, 0);
        assert!(!b.flags.contains(BlockFlags::IS_COMPRESSED));
    }

    #[test]
    fn dont_compress_flag_is_honored() {
        let mut b = block(&[0xABu8; 64]);
        b.flags.insert(BlockFlags::DONT_COMPRESS);
        let mut c = DefaultCompressor::new(Codec::None);
        let mut scratch = vec![0u8; 64];
        run_block_stage(&mut b, &mut c, &mut scratch).unwrap();
        assert!(!b.flags.contains(BlockFlags::IS_COMPRESSED));
        assert_ne!(b.checksum, 0);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn compressible_block_gets_compressed_and_flagged() {
        let mut b = block(&[0u8; 4096]);
        let mut c = DefaultCompressor::new(Codec::Gzip);
        let mut scratch = vec![0u8; 4096];
        run_block_stage(&mut b, &mut c, &mut scratch).unwrap();
        assert!(b.flags.contains(BlockFlags::IS_COMPRESSED));
        assert!(b.size < 4096);
    }
}
