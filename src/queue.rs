//! The single mutex-guarded shared state at the heart of the pipeline.
//!
//! One [`parking_lot::Mutex`] protects the work queue, the completion list, the free list, the
//! backlog counter, the sequence-number generator and the latched error status; two
//! [`parking_lot::Condvar`]s (`has_work`, `not_full`) coordinate producer and workers around it.
//! `backhand`'s `DataWriter::process` drives a structurally similar reorder buffer with a
//! `rayon::scope` + `mpsc::channel` instead — this crate needs persistent worker threads and an
//! explicit backlog bound instead of rayon's fork-join shape, so the wait/notify pair is built
//! directly on `parking_lot` the way `backhand::data` already reaches for it elsewhere.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::block::{Block, BlockPool};
use crate::error::{BlockProcessorError, LatchedError};

/// Wraps a [`Block`] so it orders purely by `sequence_number` in the completion heap.
struct SequencedBlock(Block);

impl PartialEq for SequencedBlock {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence_number == other.0.sequence_number
    }
}
impl Eq for SequencedBlock {}
impl PartialOrd for SequencedBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SequencedBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.sequence_number.cmp(&other.0.sequence_number)
    }
}

struct Inner {
    pool: BlockPool,
    work_queue: VecDeque<Block>,
    /// Min-heap by sequence number: wrapping in `Reverse` turns `BinaryHeap`'s default max-heap
    /// into the min-heap `drain_ready` needs to pull the next-in-line block off the top.
    completions: BinaryHeap<Reverse<SequencedBlock>>,
    backlog: usize,
    next_seq: u64,
    next_drain_seq: u64,
    status: Option<LatchedError>,
    shutdown: bool,
}

/// The shared state threaded through [`crate::pool`], [`crate::splitter`] and
/// [`crate::assembler`].
pub struct SharedQueue {
    inner: Mutex<Inner>,
    has_work: Condvar,
    not_full: Condvar,
    max_backlog: usize,
}

impl SharedQueue {
    pub fn new(block_size: usize, max_backlog: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pool: BlockPool::new(block_size),
                work_queue: VecDeque::new(),
                completions: BinaryHeap::new(),
                backlog: 0,
                next_seq: 0,
                next_drain_seq: 0,
                status: None,
                shutdown: false,
            }),
            has_work: Condvar::new(),
            not_full: Condvar::new(),
            max_backlog: max_backlog.max(1),
        }
    }

    pub fn get_new_block(&self) -> Block {
        self.inner.lock().pool.get_new_block()
    }

    pub fn recycle(&self, block: Block) {
        self.inner.lock().pool.recycle(block);
    }

    pub fn latched_status(&self) -> Option<LatchedError> {
        self.inner.lock().status.clone()
    }

    /// Latch the first asynchronous error into the shared status. A second call after one is
    /// already latched is a no-op: only the first fault is kept.
    pub fn latch_error(&self, err: &BlockProcessorError) {
        let mut g = self.inner.lock();
        if g.status.is_none() {
            g.status = Some(LatchedError::from(err));
        }
        drop(g);
        // Unblock anyone waiting on backpressure or work so they can observe the fault.
        self.not_full.notify_all();
        self.has_work.notify_all();
    }

    /// Assign `block` the next sequence number and push it onto the work queue, blocking while
    /// the backlog is already at capacity. Returns the latched error if the queue has already
    /// faulted, either before or while waiting.
    pub fn append_to_work_queue(&self, mut block: Block) -> Result<(), LatchedError> {
        let mut g = self.inner.lock();
        while g.backlog >= self.max_backlog && g.status.is_none() {
            self.not_full.wait(&mut g);
        }
        if let Some(err) = &g.status {
            return Err(err.clone());
        }
        block.sequence_number = g.next_seq;
        g.next_seq += 1;
        g.backlog += 1;
        g.work_queue.push_back(block);
        drop(g);
        self.has_work.notify_one();
        Ok(())
    }

    /// Inline-dispatch path: assign the next sequence number without touching the work queue —
    /// the caller is about to run the block stage itself rather than handing the block to a
    /// worker.
    pub fn assign_sequence(&self, block: &mut Block) {
        let mut g = self.inner.lock();
        block.sequence_number = g.next_seq;
        g.next_seq += 1;
        g.backlog += 1;
    }

    /// Worker-side: block until work is available or the pool is shutting down.
    pub fn take_next_work_item(&self) -> Option<Block> {
        let mut g = self.inner.lock();
        loop {
            if let Some(block) = g.work_queue.pop_front() {
                return Some(block);
            }
            if g.shutdown {
                return None;
            }
            self.has_work.wait(&mut g);
        }
    }

    /// Worker-side: file a finished block into the completion list. Workers may finish in any
    /// order; [`drain_ready`](Self::drain_ready) is what restores sequence order.
    pub fn file_completion(&self, block: Block) {
        let mut g = self.inner.lock();
        g.backlog = g.backlog.saturating_sub(1);
        g.completions.push(Reverse(SequencedBlock(block)));
        drop(g);
        self.not_full.notify_one();
    }

    /// Pop every completed block whose sequence number is next in line, in order, stopping at
    /// the first gap (a lower-numbered block still in flight).
    pub fn drain_ready(&self) -> Vec<Block> {
        let mut g = self.inner.lock();
        let mut out = Vec::new();
        while let Some(Reverse(top)) = g.completions.peek() {
            if top.0.sequence_number != g.next_drain_seq {
                break;
            }
            let Reverse(SequencedBlock(block)) = g.completions.pop().expect("just peeked");
            g.next_drain_seq += 1;
            out.push(block);
        }
        out
    }

    pub fn backlog(&self) -> usize {
        self.inner.lock().backlog
    }

    /// Block until every admitted block has been filed as a completion, or the queue has
    /// latched an error.
    pub fn wait_until_idle(&self) {
        let mut g = self.inner.lock();
        while g.backlog > 0 && g.status.is_none() {
            self.not_full.wait(&mut g);
        }
    }

    /// Wake every worker and tell them to stop waiting for more work once the queue drains.
    pub fn begin_shutdown(&self) {
        let mut g = self.inner.lock();
        g.shutdown = true;
        drop(g);
        self.has_work.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeHandle;

    fn block(size: usize) -> Block {
        let mut b = Block::new(size);
        b.inode = InodeHandle::DANGLING;
        b
    }

    #[test]
    fn completions_drain_strictly_in_order() {
        let q = SharedQueue::new(16, 8);
        q.append_to_work_queue(block(16)).unwrap();
        q.append_to_work_queue(block(16)).unwrap();
        q.append_to_work_queue(block(16)).unwrap();

        let b0 = q.take_next_work_item().unwrap();
        let b1 = q.take_next_work_item().unwrap();
        let b2 = q.take_next_work_item().unwrap();

        // File out of order: 2, 0, 1.
        q.file_completion(b2);
        assert!(q.drain_ready().is_empty());
        q.file_completion(b0);
        let ready = q.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].sequence_number, 0);
        q.file_completion(b1);
        let ready = q.drain_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].sequence_number, 1);
        assert_eq!(ready[1].sequence_number, 2);
    }

    #[test]
    fn append_blocks_until_backlog_drains() {
        use std::sync::Arc;
        use std::time::Duration;

        let q = Arc::new(SharedQueue::new(16, 1));
        q.append_to_work_queue(block(16)).unwrap();

        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            q2.append_to_work_queue(block(16)).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        let taken = q.take_next_work_item().unwrap();
        q.file_completion(taken);
        q.drain_ready();

        handle.join().unwrap();
    }

    #[test]
    fn latched_error_unblocks_waiting_appender() {
        let q = SharedQueue::new(16, 1);
        q.append_to_work_queue(block(16)).unwrap();
        q.latch_error(&BlockProcessorError::Corrupted);
        let err = q.append_to_work_queue(block(16)).unwrap_err();
        assert!(matches!(err, LatchedError::Corrupted));
    }
}
