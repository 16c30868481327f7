//! The [`Block`] object and its free-list pool.

use bitflags::bitflags;

use crate::inode::InodeHandle;

bitflags! {
    /// Flags carried by a [`Block`].
    ///
    /// The low bits ([`USER_SETTABLE`](BlockFlags::USER_SETTABLE)) may be passed to
    /// `begin_file`; the rest are stamped internally by the splitter, the block stage, or the
    /// assembler. Any bit outside `USER_SETTABLE` appearing in a `begin_file` call is an
    /// [`Unsupported`](crate::error::BlockProcessorError::Unsupported) error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u16 {
        /// User-settable: never compress this block's payload.
        const DONT_COMPRESS = 0x0001;
        /// User-settable: never classify the file's tail as a fragment.
        const DONT_FRAGMENT = 0x0002;
        /// User-settable: pad the written block to device-block alignment.
        const ALIGN        = 0x0004;
        /// Internal: this is the first block emitted for its file.
        const FIRST_BLOCK  = 0x0008;
        /// Internal: this is the last block (or sentinel) of its file.
        const LAST_BLOCK   = 0x0010;
        /// Internal: this block is a tail fragment, not a full data block.
        const IS_FRAGMENT  = 0x0020;
        /// Internal: the block's `data` currently holds compressed bytes.
        const IS_COMPRESSED = 0x0040;
        /// Internal: the block's payload was observed to be all zero bytes.
        const IS_SPARSE    = 0x0080;
    }
}

impl BlockFlags {
    /// Bits a caller may pass to `begin_file`.
    pub const USER_SETTABLE: BlockFlags = BlockFlags::DONT_COMPRESS
        .union(BlockFlags::DONT_FRAGMENT)
        .union(BlockFlags::ALIGN);
}

/// A unit of file data moving through the pipeline.
///
/// `data` always has capacity `block_size` (the configured maximum block size); `size` is the
/// used prefix. Blocks carry a non-owning [`InodeHandle`] into the processor's inode arena rather
/// than an owning reference — this breaks the splitter/assembler ownership cycle without
/// `Rc`/`Weak` bookkeeping.
#[derive(Debug)]
pub struct Block {
    pub data: Vec<u8>,
    pub size: usize,
    pub flags: BlockFlags,
    pub checksum: u32,
    pub inode: InodeHandle,
    pub index: u32,
    pub sequence_number: u64,
}

impl Block {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size],
            size: 0,
            flags: BlockFlags::empty(),
            checksum: 0,
            inode: InodeHandle::DANGLING,
            index: 0,
            sequence_number: 0,
        }
    }

    /// Reset a recycled block back to its zero-initialized state, keeping its allocation.
    fn reset(&mut self) {
        self.size = 0;
        self.flags = BlockFlags::empty();
        self.checksum = 0;
        self.inode = InodeHandle::DANGLING;
        self.index = 0;
        self.sequence_number = 0;
    }

    pub fn is_sentinel(&self) -> bool {
        self.size == 0 && self.flags.contains(BlockFlags::LAST_BLOCK)
    }
}

/// Free-list of max-capacity [`Block`]s.
///
/// Callers must hold the processor's single mutex while calling [`get_new_block`] /
/// [`recycle`](BlockPool::recycle); this type does no locking of its own.
#[derive(Debug)]
pub struct BlockPool {
    block_size: usize,
    free: Vec<Block>,
}

impl BlockPool {
    pub fn new(block_size: usize) -> Self {
        Self { block_size, free: Vec::new() }
    }

    /// Pop a block off the free list, or allocate a fresh one, zero-initialized.
    pub fn get_new_block(&mut self) -> Block {
        match self.free.pop() {
            Some(mut b) => {
                b.reset();
                b
            }
            None => Block::new(self.block_size),
        }
    }

    pub fn recycle(&mut self, block: Block) {
        self.free.push(block);
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}
