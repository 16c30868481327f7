//! The back-end assembler: in-order drain, dedup, fragment packing.
//!
//! Runs on the producer thread, same as [`crate::splitter`]. Every front-end call that filed
//! work drains whatever the queue currently has ready, in strict sequence order; `finish` blocks
//! for the rest and finalizes any still-open fragment block.

use std::collections::HashMap;

use crate::block::{Block, BlockFlags};
use crate::compressor::{CompressOutcome, Compressor};
use crate::error::BlockProcessorError;
use crate::fragment::{FragmentSuperFields, FragmentTable, SuperBlockFlags};
use crate::inode::{BlockRecord, InodeArena};
use crate::queue::SharedQueue;
use crate::stage::CRC32;
use crate::stats::Stats;
use crate::writer::BlockWriter;

struct PendingFragEntry {
    local_offset: u32,
    uncompressed_size: u32,
}

/// Owns the writer, the fragment table, and every piece of state that spans multiple completed
/// blocks: the open fragment block, its dedup index, and the fragment payload cache kept for the
/// processor's lifetime so a later fragment can be compared against an already-finalized one
/// without round-tripping through the writer (decompression is out of scope — the processor only
/// ever writes).
pub struct Assembler {
    writer: Box<dyn BlockWriter>,
    frag_table: Box<dyn FragmentTable>,
    block_size: usize,
    main_compressor: Box<dyn Compressor>,
    scratch: Vec<u8>,

    open_fragment: Vec<u8>,
    pending_entries: Vec<PendingFragEntry>,
    frag_payloads: Vec<Vec<u8>>,
    frag_local_offsets: Vec<u32>,
    frag_dedup_index: HashMap<(u32, usize), Vec<u32>>,
}

impl Assembler {
    pub fn new(
        writer: Box<dyn BlockWriter>,
        frag_table: Box<dyn FragmentTable>,
        main_compressor: Box<dyn Compressor>,
        block_size: usize,
    ) -> Self {
        Self {
            writer,
            frag_table,
            block_size,
            main_compressor,
            scratch: vec![0u8; block_size],
            open_fragment: Vec::with_capacity(block_size),
            pending_entries: Vec::new(),
            frag_payloads: Vec::new(),
            frag_local_offsets: Vec::new(),
            frag_dedup_index: HashMap::new(),
        }
    }

    pub fn frag_table(&self) -> &dyn FragmentTable {
        self.frag_table.as_ref()
    }

    /// Finalize the fragment table against the super-block fields it touches. With zero
    /// fragments, marks the super `NO_FRAGMENTS` and clears `fragment_table_start`
    /// rather than writing an empty table.
    pub fn write_fragment_table(
        &mut self,
        super_fields: &mut FragmentSuperFields,
    ) -> Result<(), BlockProcessorError> {
        if self.frag_table.num_fragments() == 0 {
            super_fields.flags.insert(SuperBlockFlags::NO_FRAGMENTS);
            super_fields.flags.remove(SuperBlockFlags::ALWAYS_FRAGMENTS);
            super_fields.fragment_table_start = FragmentSuperFields::ALL_ONES;
            super_fields.fragment_count = 0;
            return Ok(());
        }

        let mut bytes = Vec::new();
        let count = self.frag_table.serialize(&mut bytes)?;
        let checksum = CRC32.checksum(&bytes);
        let (offset, _written_size) = self.writer.write(checksum, &bytes, BlockFlags::empty())?;

        super_fields.flags.remove(SuperBlockFlags::NO_FRAGMENTS);
        super_fields.fragment_table_start = offset;
        super_fields.fragment_count = count;
        Ok(())
    }

    /// Drain every block currently ready, applying each in sequence order. Any fault (from the
    /// writer or the fragment-block codec) is latched into `queue` rather than returned, so the
    /// caller observes it through the next front-end call the way a worker's fault would be.
    pub fn drain_ready(&mut self, queue: &SharedQueue, arena: &mut InodeArena, stats: &mut Stats) {
        loop {
            let ready = queue.drain_ready();
            if ready.is_empty() {
                break;
            }
            for block in ready {
                // A block can reach here after its own worker already latched a fault (the
                // worker still files the completion so sequence order isn't stalled). Once a
                // fault is latched, nothing past it is eligible for dedup/write/inode update —
                // just recycle it and stop, rather than writing a block whose stage never
                // actually finished successfully.
                if queue.latched_status().is_some() {
                    queue.recycle(block);
                    return;
                }
                if let Err(e) = self.apply(block, queue, arena, stats) {
                    queue.latch_error(&e);
                    return;
                }
            }
        }
    }

    /// Block until every in-flight block has been filed, drain what's left, and finalize any
    /// partially-packed fragment block.
    pub fn finish(&mut self, queue: &SharedQueue, arena: &mut InodeArena, stats: &mut Stats) {
        queue.wait_until_idle();
        self.drain_ready(queue, arena, stats);
        if queue.latched_status().is_some() {
            return;
        }
        if let Err(e) = self.finalize_fragment_block(stats) {
            queue.latch_error(&e);
        }
    }

    fn apply(
        &mut self,
        block: Block,
        queue: &SharedQueue,
        arena: &mut InodeArena,
        stats: &mut Stats,
    ) -> Result<(), BlockProcessorError> {
        // Sparse is checked ahead of the sentinel test: a sentinel never carries `IS_SPARSE`, so
        // this ordering only ever matters for genuine all-zero blocks.
        if block.flags.contains(BlockFlags::IS_SPARSE) {
            stats.record_sparse_block();
            arena.get_mut(block.inode).set_block_record(block.index, None);
            queue.recycle(block);
            return Ok(());
        }
        if block.is_sentinel() {
            queue.recycle(block);
            return Ok(());
        }
        if block.flags.contains(BlockFlags::IS_FRAGMENT) {
            self.apply_fragment(block, queue, arena, stats)
        } else {
            self.apply_data_block(block, queue, arena, stats)
        }
    }

    fn apply_data_block(
        &mut self,
        block: Block,
        queue: &SharedQueue,
        arena: &mut InodeArena,
        stats: &mut Stats,
    ) -> Result<(), BlockProcessorError> {
        let is_compressed = block.flags.contains(BlockFlags::IS_COMPRESSED);
        let checksum = block.checksum;
        let size = block.size;

        let dedup_hit =
            self.writer.lookup_dedup(checksum, size, is_compressed, &block.data[..size])?;
        let (offset, written_size) = match dedup_hit {
            Some(hit) => hit,
            None => {
                let written = self.writer.write(checksum, &block.data[..size], block.flags)?;
                stats.record_data_block();
                written
            }
        };

        arena.get_mut(block.inode).set_block_record(
            block.index,
            Some(BlockRecord {
                on_disk_offset: offset,
                compressed_size: written_size,
                uncompressed: !is_compressed,
            }),
        );
        queue.recycle(block);
        Ok(())
    }

    fn apply_fragment(
        &mut self,
        block: Block,
        queue: &SharedQueue,
        arena: &mut InodeArena,
        stats: &mut Stats,
    ) -> Result<(), BlockProcessorError> {
        let checksum = block.checksum;
        let size = block.size;

        if let Some(entry_index) = self.find_fragment_dup(checksum, size, &block.data[..size]) {
            let local_offset = self.frag_local_offsets[entry_index as usize];
            arena.get_mut(block.inode).set_frag_location(entry_index, local_offset);
            stats.record_fragment(false);
            queue.recycle(block);
            return Ok(());
        }

        if self.open_fragment.len() + size > self.block_size {
            self.finalize_fragment_block(stats)?;
        }

        let local_offset = self.open_fragment.len() as u32;
        let entry_index = self.frag_payloads.len() as u32;
        self.open_fragment.extend_from_slice(&block.data[..size]);
        self.frag_payloads.push(block.data[..size].to_vec());
        self.frag_local_offsets.push(local_offset);
        self.frag_dedup_index.entry((checksum, size)).or_default().push(entry_index);
        self.pending_entries
            .push(PendingFragEntry { local_offset, uncompressed_size: size as u32 });

        arena.get_mut(block.inode).set_frag_location(entry_index, local_offset);
        stats.record_fragment(true);
        queue.recycle(block);
        Ok(())
    }

    fn find_fragment_dup(&self, checksum: u32, size: usize, payload: &[u8]) -> Option<u32> {
        let candidates = self.frag_dedup_index.get(&(checksum, size))?;
        candidates.iter().copied().find(|&idx| self.frag_payloads[idx as usize] == payload)
    }

    /// Compress the packed fragment buffer with the main-thread codec, write it as one block,
    /// and emit a fragment-table record for every entry it contains.
    fn finalize_fragment_block(&mut self, stats: &mut Stats) -> Result<(), BlockProcessorError> {
        if self.open_fragment.is_empty() {
            return Ok(());
        }

        let (payload, compressed) =
            match self.main_compressor.compress(&self.open_fragment, &mut self.scratch)? {
                CompressOutcome::Incompressible => (self.open_fragment.clone(), false),
                CompressOutcome::Compressed(n) => (self.scratch[..n].to_vec(), true),
            };

        let mut flags = BlockFlags::IS_FRAGMENT;
        if compressed {
            flags.insert(BlockFlags::IS_COMPRESSED);
        }
        let checksum = CRC32.checksum(&payload);
        let (offset, _written_size) = self.writer.write(checksum, &payload, flags)?;

        for entry in self.pending_entries.drain(..) {
            self.frag_table.append_entry(
                offset + entry.local_offset as u64,
                entry.uncompressed_size,
                compressed,
            );
        }

        stats.record_frag_block();
        self.open_fragment.clear();
        Ok(())
    }
}
