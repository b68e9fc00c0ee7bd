//! Block Allocation Table
//!
//! One 32-bit big-endian sector offset per virtual block; `0xFFFFFFFF`
//! marks an unallocated block. On the wire the table is padded to a sector
//! boundary.

use vdigate_core::{bytes_padded, Error, Result, SECTOR_SHIFT};

/// Block Allocation Table for sparse VHDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bat {
    pub entries: Vec<u32>,
}

impl Bat {
    /// Sentinel for an unallocated block
    pub const UNUSED: u32 = 0xFFFF_FFFF;

    /// A table with every block unallocated
    pub fn new_unallocated(entries: usize) -> Self {
        Self {
            entries: vec![Self::UNUSED; entries],
        }
    }

    /// Wire size of a table with this many entries, sector padded
    pub fn padded_size(entries: usize) -> u64 {
        bytes_padded(entries as u64 * 4)
    }

    /// Decode `entries` big-endian table entries from a padded wire buffer
    pub fn from_wire(bytes: &[u8], entries: usize) -> Result<Self> {
        if bytes.len() < entries * 4 {
            return Err(Error::bad_request("BAT buffer too small"));
        }
        let mut table = Vec::with_capacity(entries);
        for i in 0..entries {
            let off = i * 4;
            table.push(u32::from_be_bytes([
                bytes[off],
                bytes[off + 1],
                bytes[off + 2],
                bytes[off + 3],
            ]));
        }
        Ok(Self { entries: table })
    }

    /// Encode the table big-endian, zero padded to a sector boundary
    pub fn to_wire_padded(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::padded_size(self.entries.len()) as usize];
        for (i, entry) in self.entries.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&entry.to_be_bytes());
        }
        out
    }

    /// Byte offset of a block's bitmap within the VHD stream, or `None` when
    /// the block is unallocated.
    pub fn block_offset(&self, block: usize) -> Option<u64> {
        match self.entries.get(block) {
            Some(&entry) if entry != Self::UNUSED => Some(u64::from(entry) << SECTOR_SHIFT),
            _ => None,
        }
    }

    /// Number of allocated blocks
    pub fn allocated_blocks(&self) -> u32 {
        self.entries.iter().filter(|&&e| e != Self::UNUSED).count() as u32
    }

    /// Find the virtual block whose data sits next in the stream at or after
    /// `curr_off` bytes.
    ///
    /// Searches the whole table starting from `hint` and wrapping, preferring
    /// the lowest qualifying offset. This trades memory for speed: no reverse
    /// table is kept, and for the common case of a sector-ordered VHD the
    /// scan terminates on the first probe.
    pub fn next_block_at_or_after(
        &self,
        curr_off: u64,
        hint: usize,
        block_size: u32,
    ) -> Option<usize> {
        let n = self.entries.len();
        if n == 0 {
            return None;
        }

        let mut next_blk = None;
        let mut next_off = 0u64;
        for i in 0..n {
            let blk = (hint + i) % n;
            let entry = self.entries[blk];
            if entry == Self::UNUSED {
                continue;
            }
            let off = u64::from(entry) << SECTOR_SHIFT;
            if off >= curr_off && (next_blk.is_none() || off < next_off) {
                next_blk = Some(blk);
                next_off = off;
                if next_off - curr_off < u64::from(block_size) {
                    return next_blk;
                }
            }
        }
        next_blk
    }
}
