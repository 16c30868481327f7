//! The `FragmentTable` capability and a reference implementation.
//!
//! The fragment table itself — its on-disk layout, how a reader locates an entry — is an
//! external collaborator; the block processor only needs to append entries and, at close, ask
//! the table to serialize itself and report where it landed. [`DefaultFragmentTable`]
//! is a minimal reference implementation good enough to drive the crate's own tests, serializing
//! entries with `deku` the way `backhand` serializes its own `Fragment` records.

use std::io::Write;

use deku::prelude::*;

use crate::error::BlockProcessorError;

/// On-disk byte size of one serialized [`FragmentEntry`] (`start: u64` + `packed_size: u32`).
pub const ENTRY_SIZE: usize = core::mem::size_of::<u64>() + core::mem::size_of::<u32>();

// bit 31 of `packed_size` marks the containing fragment block as stored uncompressed, matching
// the convention `backhand::data::DataSize` uses for block-size fields.
const UNCOMPRESSED_BIT: u32 = 1 << 31;

/// One fragment-table record: where its payload starts (the finalized fragment block's on-disk
/// offset plus the fragment's offset within the decompressed block), the uncompressed payload
/// size, and whether the containing fragment block was stored compressed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct FragmentEntry {
    pub start: u64,
    packed_size: u32,
}

impl FragmentEntry {
    pub fn new(start: u64, uncompressed_size: u32, compressed: bool) -> Self {
        let packed_size = if compressed { uncompressed_size } else { uncompressed_size | UNCOMPRESSED_BIT };
        Self { start, packed_size }
    }

    pub fn uncompressed_size(&self) -> u32 {
        self.packed_size & !UNCOMPRESSED_BIT
    }

    pub fn compressed(&self) -> bool {
        self.packed_size & UNCOMPRESSED_BIT == 0
    }
}

/// The fragment-table capability.
pub trait FragmentTable: Send {
    /// Append one entry, returning its index (used by the inode's `frag_index`).
    fn append_entry(&mut self, start: u64, uncompressed_size: u32, compressed: bool) -> u32;

    /// Number of entries recorded so far.
    fn num_fragments(&self) -> usize;

    /// Serialize every entry to `out`, returning the entry count. The table has no notion of
    /// where on disk it lands — [`crate::assembler::Assembler::write_fragment_table`] hands the
    /// serialized bytes to the block writer and records *that* offset in the super-block.
    fn serialize(&self, out: &mut dyn Write) -> Result<u64, BlockProcessorError>;
}

/// Reference [`FragmentTable`]: an in-memory `Vec` serialized on demand.
#[derive(Debug, Default)]
pub struct DefaultFragmentTable {
    entries: Vec<FragmentEntry>,
}

impl DefaultFragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[FragmentEntry] {
        &self.entries
    }
}

impl FragmentTable for DefaultFragmentTable {
    fn append_entry(&mut self, start: u64, uncompressed_size: u32, compressed: bool) -> u32 {
        self.entries.push(FragmentEntry::new(start, uncompressed_size, compressed));
        (self.entries.len() - 1) as u32
    }

    fn num_fragments(&self) -> usize {
        self.entries.len()
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<u64, BlockProcessorError> {
        let mut bytes = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for entry in &self.entries {
            let mut writer = Writer::new(&mut bytes);
            entry.to_writer(&mut writer, ())?;
        }
        out.write_all(&bytes)?;
        Ok(self.entries.len() as u64)
    }
}

bitflags::bitflags! {
    /// The subset of super-block flags [`crate::processor::BlockProcessor::write_fragment_table`]
    /// touches. The rest of the super-block is out of scope.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SuperBlockFlags: u16 {
        const NO_FRAGMENTS = 0x0001;
        const ALWAYS_FRAGMENTS = 0x0002;
    }
}

/// The super-block fields `write_fragment_table` reads and writes. Everything else about the
/// super-block (magic, inode table, id table, ...) is out of scope for the block processor.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentSuperFields {
    pub flags: SuperBlockFlags,
    pub fragment_table_start: u64,
    pub fragment_count: u64,
}

impl FragmentSuperFields {
    pub const ALL_ONES: u64 = u64::MAX;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_bit_round_trips() {
        let e = FragmentEntry::new(0x1000, 500, false);
        assert_eq!(e.uncompressed_size(), 500);
        assert!(!e.compressed());

        let e = FragmentEntry::new(0x2000, 500, true);
        assert_eq!(e.uncompressed_size(), 500);
        assert!(e.compressed());
    }

    #[test]
    fn serialize_writes_one_entry_per_fragment() {
        let mut table = DefaultFragmentTable::new();
        table.append_entry(0, 100, true);
        table.append_entry(100, 200, true);
        let mut out = Vec::new();
        let count = table.serialize(&mut out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(out.len(), 2 * ENTRY_SIZE);
    }
}
