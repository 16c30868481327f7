//! The public API: [`BlockProcessor`] wiring the splitter, worker pool and assembler together
//! around one shared queue.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::assembler::Assembler;
use crate::block::BlockFlags;
use crate::compressor::Compressor;
use crate::error::BlockProcessorError;
use crate::fragment::{FragmentSuperFields, FragmentTable};
use crate::inode::{InodeArena, InodeHandle};
use crate::pool::Dispatch;
use crate::queue::SharedQueue;
use crate::splitter::Splitter;
use crate::stats::Stats;
use crate::writer::BlockWriter;

/// Construction-time configuration for a [`BlockProcessor`].
#[derive(Debug, Clone, Copy)]
pub struct BlockProcessorConfig {
    /// `B_max`: the fixed data-block size every full block is split to.
    pub block_size: usize,
    /// Number of persistent worker threads. `<= 1` runs the block stage inline on the caller's
    /// thread instead of spinning up a pool.
    pub num_workers: usize,
    /// Backpressure bound: `append` blocks once this many blocks are in flight between the
    /// splitter and the assembler.
    pub max_backlog: usize,
}

impl Default for BlockProcessorConfig {
    fn default() -> Self {
        Self { block_size: 128 * 1024, num_workers: 1, max_backlog: 64 }
    }
}

/// The concurrent data-path core: splits input into blocks, compresses them (inline or across a
/// worker pool), reassembles them in strict order, deduplicates, and packs tail fragments.
///
/// The four phases of a processor's life: [`create`](Self::create), a run of
/// `begin_file`/`append`/`end_file` per input file, [`finish`](Self::finish) once all files are
/// in, then [`write_fragment_table`](Self::write_fragment_table) and
/// [`destroy`](Self::destroy). Any latched asynchronous fault is returned from every subsequent
/// call until `destroy`.
pub struct BlockProcessor {
    queue: Arc<SharedQueue>,
    dispatch: Option<Dispatch>,
    splitter: Splitter,
    assembler: Assembler,
    arena: InodeArena,
    stats: Stats,
}

impl BlockProcessor {
    #[instrument(skip_all, fields(block_size = config.block_size, num_workers = config.num_workers))]
    pub fn create(
        config: BlockProcessorConfig,
        compressor: Box<dyn Compressor>,
        writer: Box<dyn BlockWriter>,
        frag_table: Box<dyn FragmentTable>,
    ) -> Result<Self, BlockProcessorError> {
        if config.block_size == 0 {
            return Err(BlockProcessorError::Alloc);
        }
        info!("creating block processor");
        let queue = Arc::new(SharedQueue::new(config.block_size, config.max_backlog));
        let dispatch =
            Dispatch::new(&queue, compressor.as_ref(), config.num_workers, config.block_size);
        let assembler = Assembler::new(writer, frag_table, compressor, config.block_size);
        Ok(Self {
            splitter: Splitter::new(Arc::clone(&queue), config.block_size),
            queue,
            dispatch: Some(dispatch),
            assembler,
            arena: InodeArena::new(),
            stats: Stats::default(),
        })
    }

    fn fail_fast(&self) -> Result<(), BlockProcessorError> {
        match self.queue.latched_status() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn is_file_open(&self) -> bool {
        self.splitter.is_file_open()
    }

    pub fn begin_file(&mut self, flags: BlockFlags) -> Result<InodeHandle, BlockProcessorError> {
        self.fail_fast()?;
        self.splitter.begin_file(flags, &mut self.arena)
    }

    pub fn append(&mut self, buf: &[u8]) -> Result<(), BlockProcessorError> {
        self.fail_fast()?;
        let dispatch = self.dispatch.as_mut().expect("destroy() consumes the processor");
        self.splitter.append(buf, &mut self.arena, dispatch, &mut self.stats)?;
        self.assembler.drain_ready(&self.queue, &mut self.arena, &mut self.stats);
        self.fail_fast()
    }

    pub fn end_file(&mut self) -> Result<(), BlockProcessorError> {
        self.fail_fast()?;
        let dispatch = self.dispatch.as_mut().expect("destroy() consumes the processor");
        self.splitter.end_file(dispatch)?;
        self.assembler.drain_ready(&self.queue, &mut self.arena, &mut self.stats);
        self.fail_fast()
    }

    /// Block until every in-flight block has drained and finalize any partially-packed fragment
    /// block. Does not join worker threads — that is [`destroy`](Self::destroy)'s job, done
    /// separately so `write_fragment_table` can still run against a live writer afterward.
    #[instrument(skip_all)]
    pub fn finish(&mut self) -> Result<(), BlockProcessorError> {
        self.assembler.finish(&self.queue, &mut self.arena, &mut self.stats);
        info!(stats = ?self.stats, "drained");
        self.fail_fast()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn inode_arena(&self) -> &InodeArena {
        &self.arena
    }

    /// Finalize the fragment table and report where it landed in the super-block fields it
    /// touches. Call after [`finish`](Self::finish).
    pub fn write_fragment_table(
        &mut self,
        super_fields: &mut FragmentSuperFields,
    ) -> Result<(), BlockProcessorError> {
        self.fail_fast()?;
        self.assembler.write_fragment_table(super_fields)
    }

    /// Join every worker thread and consume the processor. Call after `finish` and
    /// `write_fragment_table`.
    pub fn destroy(mut self) {
        info!("joining block processor workers");
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.shutdown(&self.queue);
        }
    }
}

impl Drop for BlockProcessor {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.shutdown(&self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{Codec, DefaultCompressor};
    use crate::fragment::DefaultFragmentTable;
    use crate::writer::DefaultBlockWriter;
    use std::io::Cursor;

    fn processor(block_size: usize, num_workers: usize) -> BlockProcessor {
        BlockProcessor::create(
            BlockProcessorConfig { block_size, num_workers, max_backlog: 8 },
            Box::new(DefaultCompressor::new(Codec::None)),
            Box::new(DefaultBlockWriter::new(Cursor::new(Vec::new()), 0)),
            Box::new(DefaultFragmentTable::new()),
        )
        .unwrap()
    }

    #[test]
    fn zero_byte_file_produces_no_blocks_end_to_end() {
        let mut bp = processor(16, 1);
        let inode = bp.begin_file(BlockFlags::empty()).unwrap();
        bp.end_file().unwrap();
        bp.finish().unwrap();

        assert_eq!(bp.stats().data_block_count, 0);
        assert_eq!(bp.stats().frag_block_count, 0);
        assert!(bp.inode_arena().get(inode).block_records().is_empty());
    }

    #[test]
    fn small_file_splits_into_block_and_fragment() {
        let mut bp = processor(16, 1);
        let inode = bp.begin_file(BlockFlags::empty()).unwrap();
        bp.append(&[9u8; 20]).unwrap();
        bp.end_file().unwrap();
        bp.finish().unwrap();

        assert_eq!(bp.stats().data_block_count, 1);
        assert_eq!(bp.stats().total_frag_count, 1);
        let records = bp.inode_arena().get(inode).block_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_some());
        assert!(bp.inode_arena().get(inode).frag_location().is_some());
    }

    #[test]
    fn duplicate_files_are_deduplicated_through_the_full_pipeline() {
        let mut bp = processor(16, 1);

        let inode_a = bp.begin_file(BlockFlags::empty()).unwrap();
        bp.append(&[5u8; 16]).unwrap();
        bp.end_file().unwrap();

        let inode_b = bp.begin_file(BlockFlags::empty()).unwrap();
        bp.append(&[5u8; 16]).unwrap();
        bp.end_file().unwrap();

        bp.finish().unwrap();

        assert_eq!(bp.stats().data_block_count, 1);
        let rec_a = bp.inode_arena().get(inode_a).block_records()[0].unwrap();
        let rec_b = bp.inode_arena().get(inode_b).block_records()[0].unwrap();
        assert_eq!(rec_a.on_disk_offset, rec_b.on_disk_offset);
    }

    #[test]
    fn write_fragment_table_reports_no_fragments_when_none_were_packed() {
        let mut bp = processor(16, 1);
        bp.begin_file(BlockFlags::DONT_FRAGMENT).unwrap();
        bp.append(&[1u8; 16]).unwrap();
        bp.end_file().unwrap();
        bp.finish().unwrap();

        let mut super_fields = FragmentSuperFields::default();
        bp.write_fragment_table(&mut super_fields).unwrap();
        assert_eq!(super_fields.fragment_count, 0);
        assert_eq!(super_fields.fragment_table_start, FragmentSuperFields::ALL_ONES);
    }

    #[test]
    fn write_fragment_table_reports_an_offset_when_fragments_were_packed() {
        let mut bp = processor(16, 1);
        bp.begin_file(BlockFlags::empty()).unwrap();
        bp.append(&[2u8; 5]).unwrap();
        bp.end_file().unwrap();
        bp.finish().unwrap();

        let mut super_fields = FragmentSuperFields::default();
        bp.write_fragment_table(&mut super_fields).unwrap();
        assert_eq!(super_fields.fragment_count, 1);
        assert_ne!(super_fields.fragment_table_start, FragmentSuperFields::ALL_ONES);
    }

    #[test]
    fn threaded_pipeline_preserves_many_files_in_order() {
        let mut bp = processor(64, 4);
        let mut inodes = Vec::new();
        for i in 0..50u8 {
            let inode = bp.begin_file(BlockFlags::empty()).unwrap();
            bp.append(&vec![i; 70]).unwrap();
            bp.end_file().unwrap();
            inodes.push((inode, i));
        }
        bp.finish().unwrap();

        for (inode, _) in &inodes {
            assert_eq!(bp.inode_arena().get(*inode).get_file_size(), 70);
        }
        assert_eq!(bp.stats().input_bytes_read, 50 * 70);
        bp.destroy();
    }

    #[test]
    fn sequence_error_on_append_without_begin_file() {
        let mut bp = processor(16, 1);
        let err = bp.append(&[1u8]).unwrap_err();
        assert!(matches!(err, BlockProcessorError::Sequence));
    }

    #[test]
    fn unsupported_flags_rejected_before_any_block_is_split() {
        let mut bp = processor(16, 1);
        let bogus = BlockFlags::from_bits_retain(0x4000);
        let err = bp.begin_file(bogus).unwrap_err();
        assert!(matches!(err, BlockProcessorError::Unsupported(_)));
        assert!(!bp.is_file_open());
    }
}
