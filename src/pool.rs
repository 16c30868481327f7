//! Dispatching blocks to the block stage: a persistent worker pool, or an inline fallback —
//! "one worker" is common enough to deserve a fast path that skips the queue/thread machinery
//! entirely.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::block::Block;
use crate::compressor::Compressor;
use crate::error::LatchedError;
use crate::queue::SharedQueue;
use crate::stage::run_block_stage;

fn worker_loop(queue: Arc<SharedQueue>, mut compressor: Box<dyn Compressor>, scratch_len: usize) {
    let mut scratch = vec![0u8; scratch_len];
    while let Some(mut block) = queue.take_next_work_item() {
        trace!(seq = block.sequence_number, size = block.size, "processing block");
        if let Err(e) = run_block_stage(&mut block, compressor.as_mut(), &mut scratch) {
            queue.latch_error(&e);
        }
        queue.file_completion(block);
    }
}

/// `num_workers > 1`: a fixed pool of persistent threads, each with its own deep-copied codec.
pub struct ThreadedDispatch {
    handles: Vec<JoinHandle<()>>,
}

impl ThreadedDispatch {
    fn new(
        queue: &Arc<SharedQueue>,
        prototype: &dyn Compressor,
        num_workers: usize,
        block_size: usize,
    ) -> Self {
        let handles = (0..num_workers)
            .map(|n| {
                let queue = Arc::clone(queue);
                let compressor = prototype.deep_copy();
                thread::Builder::new()
                    .name(format!("block-processor-worker-{n}"))
                    .spawn(move || worker_loop(queue, compressor, block_size))
                    .expect("failed to spawn block processor worker thread")
            })
            .collect();
        Self { handles }
    }

    fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// `num_workers <= 1`: run the block stage synchronously on the caller's thread, filing the
/// result straight into the same completion list a threaded pool would use. This keeps
/// [`crate::assembler`]'s drain logic identical regardless of dispatch mode.
pub struct InlineDispatch {
    compressor: Box<dyn Compressor>,
    scratch: Vec<u8>,
}

impl InlineDispatch {
    fn new(prototype: &dyn Compressor, block_size: usize) -> Self {
        Self { compressor: prototype.deep_copy(), scratch: vec![0u8; block_size] }
    }

    fn submit(&mut self, queue: &SharedQueue, mut block: Block) -> Result<(), LatchedError> {
        if let Some(err) = queue.latched_status() {
            return Err(err);
        }
        queue.assign_sequence(&mut block);
        if let Err(e) = run_block_stage(&mut block, self.compressor.as_mut(), &mut self.scratch) {
            queue.latch_error(&e);
        }
        queue.file_completion(block);
        match queue.latched_status() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Either dispatch mode, selected once at construction.
pub enum Dispatch {
    Inline(InlineDispatch),
    Threaded(ThreadedDispatch),
}

impl Dispatch {
    pub fn new(
        queue: &Arc<SharedQueue>,
        prototype: &dyn Compressor,
        num_workers: usize,
        block_size: usize,
    ) -> Self {
        if num_workers <= 1 {
            Dispatch::Inline(InlineDispatch::new(prototype, block_size))
        } else {
            Dispatch::Threaded(ThreadedDispatch::new(queue, prototype, num_workers, block_size))
        }
    }

    /// Submit a freshly split block for processing. In threaded mode this may block on
    /// backpressure; in inline mode it runs (and files) the block before returning.
    pub fn submit(&mut self, queue: &SharedQueue, block: Block) -> Result<(), LatchedError> {
        match self {
            Dispatch::Inline(d) => d.submit(queue, block),
            Dispatch::Threaded(_) => queue.append_to_work_queue(block),
        }
    }

    /// Signal shutdown and, for threaded mode, join every worker thread.
    pub fn shutdown(self, queue: &SharedQueue) {
        queue.begin_shutdown();
        if let Dispatch::Threaded(d) = self {
            d.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockFlags;
    use crate::compressor::{Codec, DefaultCompressor};
    use crate::inode::InodeHandle;

    fn block(size: usize) -> Block {
        let mut b = Block::new(size);
        b.size = size;
        b.inode = InodeHandle::DANGLING;
        b
    }

    #[test]
    fn inline_dispatch_files_completion_synchronously() {
        let queue = Arc::new(SharedQueue::new(64, 8));
        let compressor = DefaultCompressor::new(Codec::None);
        let mut dispatch = Dispatch::new(&queue, &compressor, 1, 64);

        dispatch.submit(&queue, block(32)).unwrap();
        let ready = queue.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_ne!(ready[0].checksum, 0);

        dispatch.shutdown(&queue);
    }

    #[test]
    fn threaded_dispatch_preserves_order_under_many_blocks() {
        let queue = Arc::new(SharedQueue::new(64, 8));
        let compressor = DefaultCompressor::new(Codec::None);
        let mut dispatch = Dispatch::new(&queue, &compressor, 4, 64);

        for i in 0..200u32 {
            let mut b = block(32);
            b.index = i;
            b.flags = BlockFlags::empty();
            dispatch.submit(&queue, b).unwrap();
        }

        let mut drained = Vec::new();
        while drained.len() < 200 {
            drained.extend(queue.drain_ready());
        }
        for (expected, block) in drained.iter().enumerate() {
            assert_eq!(block.sequence_number, expected as u64);
        }

        dispatch.shutdown(&queue);
    }
}
