//! The front-end splitter: `begin_file` / `append` / `end_file`.
//!
//! Chunks an arbitrary byte stream into fixed-size data blocks plus a variable-sized tail,
//! classifying the tail as a fragment unless the caller forbids it or it happens to land exactly
//! on a block boundary. Runs entirely on the producer thread; the only shared state it touches is
//! the block pool and work queue inside [`SharedQueue`].

use std::sync::Arc;

use crate::block::{Block, BlockFlags};
use crate::error::BlockProcessorError;
use crate::inode::{InodeArena, InodeHandle};
use crate::pool::Dispatch;
use crate::queue::SharedQueue;
use crate::stats::Stats;

struct FileState {
    inode: InodeHandle,
    blk_flags: BlockFlags,
    blk_index: u32,
    blk_current: Option<Block>,
}

pub struct Splitter {
    queue: Arc<SharedQueue>,
    block_size: usize,
    state: Option<FileState>,
}

impl Splitter {
    pub fn new(queue: Arc<SharedQueue>, block_size: usize) -> Self {
        Self { queue, block_size, state: None }
    }

    pub fn is_file_open(&self) -> bool {
        self.state.is_some()
    }

    /// Open a new file. `flags` may carry any combination of
    /// [`BlockFlags::USER_SETTABLE`](BlockFlags::USER_SETTABLE) bits; anything else is
    /// [`Unsupported`](BlockProcessorError::Unsupported).
    pub fn begin_file(
        &mut self,
        flags: BlockFlags,
        arena: &mut InodeArena,
    ) -> Result<InodeHandle, BlockProcessorError> {
        if self.state.is_some() {
            return Err(BlockProcessorError::Sequence);
        }
        let extra = flags - BlockFlags::USER_SETTABLE;
        if !extra.is_empty() {
            return Err(BlockProcessorError::Unsupported(extra.bits()));
        }
        let inode = arena.alloc();
        self.state = Some(FileState {
            inode,
            blk_flags: flags | BlockFlags::FIRST_BLOCK,
            blk_index: 0,
            blk_current: None,
        });
        Ok(inode)
    }

    /// Feed `buf` into the open file, flushing full blocks as they fill.
    pub fn append(
        &mut self,
        mut buf: &[u8],
        arena: &mut InodeArena,
        dispatch: &mut Dispatch,
        stats: &mut Stats,
    ) -> Result<(), BlockProcessorError> {
        let Some(mut state) = self.state.take() else {
            return Err(BlockProcessorError::Sequence);
        };
        arena.get_mut(state.inode).grow_file_size(buf.len() as u64);
        stats.record_input_bytes(buf.len() as u64);

        let result = (|| -> Result<(), BlockProcessorError> {
            while !buf.is_empty() {
                if state.blk_current.is_none() {
                    let mut block = self.queue.get_new_block();
                    block.flags = state.blk_flags;
                    block.inode = state.inode;
                    state.blk_current = Some(block);
                }
                let block = state.blk_current.as_mut().expect("just inserted above");
                let start = block.size;
                let take = (self.block_size - start).min(buf.len());
                block.data[start..start + take].copy_from_slice(&buf[..take]);
                block.size += take;
                buf = &buf[take..];

                if block.size == self.block_size {
                    let full = state.blk_current.take().expect("just checked size");
                    flush_block(&self.queue, self.block_size, &mut state, full, dispatch)?;
                }
            }
            Ok(())
        })();

        self.state = Some(state);
        result?;

        match self.queue.latched_status() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Close the open file, flushing its final (possibly partial) block and marking end-of-file
    /// for the assembler — directly on that block if one is in flight, or via a zero-size
    /// sentinel if the file emptied out on a block boundary (or was empty) and nothing remains to
    /// carry the flag.
    pub fn end_file(&mut self, dispatch: &mut Dispatch) -> Result<(), BlockProcessorError> {
        let Some(mut state) = self.state.take() else {
            return Err(BlockProcessorError::Sequence);
        };

        let result = (|| -> Result<(), BlockProcessorError> {
            match state.blk_current.as_mut() {
                Some(cur) => {
                    cur.flags.insert(BlockFlags::LAST_BLOCK);
                }
                None => {
                    if !state.blk_flags.contains(BlockFlags::FIRST_BLOCK) {
                        enqueue_sentinel(&self.queue, &mut state, dispatch)?;
                    }
                }
            }
            if let Some(cur) = state.blk_current.take() {
                flush_block(&self.queue, self.block_size, &mut state, cur, dispatch)?;
            }
            Ok(())
        })();

        result?;
        match self.queue.latched_status() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

fn flush_block(
    queue: &SharedQueue,
    block_size: usize,
    state: &mut FileState,
    mut block: Block,
    dispatch: &mut Dispatch,
) -> Result<(), BlockProcessorError> {
    if block.size < block_size && !state.blk_flags.contains(BlockFlags::DONT_FRAGMENT) {
        block.flags.insert(BlockFlags::IS_FRAGMENT);
    } else {
        state.blk_flags.remove(BlockFlags::FIRST_BLOCK);
    }
    if block.data[..block.size].iter().all(|&b| b == 0) {
        block.flags.insert(BlockFlags::IS_SPARSE);
    }
    block.index = state.blk_index;
    state.blk_index += 1;
    dispatch.submit(queue, block).map_err(BlockProcessorError::from)
}

fn enqueue_sentinel(
    queue: &SharedQueue,
    state: &mut FileState,
    dispatch: &mut Dispatch,
) -> Result<(), BlockProcessorError> {
    let mut sentinel = queue.get_new_block();
    sentinel.flags = BlockFlags::LAST_BLOCK;
    sentinel.inode = state.inode;
    sentinel.index = state.blk_index;
    dispatch.submit(queue, sentinel).map_err(BlockProcessorError::from)
}
