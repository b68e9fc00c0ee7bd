//! # vdigate VHD codec
//!
//! Byte-exact encode/decode of Microsoft VHD (Conectix) control structures:
//! footer, dynamic header, Block Allocation Table, parent locators, and the
//! compressed block-presence bitmaps used to select which virtual blocks a
//! synthesized image carries.
//!
//! Only the sparse flavors are handled: dynamic and differencing disks.
//! Fixed (static) VHDs are rejected by validation.
//!
//! All on-wire integers are big-endian. Parsed records hold host-order
//! values; wire order exists only inside `parse`/`serialize` and the
//! checksum helpers.

pub mod bat;
pub mod bitmap;
pub mod footer;
pub mod header;

pub use bat::Bat;
pub use bitmap::BlockBitmap;
pub use footer::{DiskGeometry, DiskType, Footer};
pub use header::{DynamicHeader, ParentLocatorEntry};

use vdigate_core::{secs_round_up_no_zero, SECTOR_SHIFT, SECTOR_SIZE};

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 00:00:00 UTC).
pub const VHD_EPOCH_OFFSET: i64 = 946_684_800;

/// Current timestamp in VHD time (seconds since 2000-01-01 UTC).
pub fn vhd_time_now() -> u32 {
    let unix = chrono::Utc::now().timestamp();
    (unix - VHD_EPOCH_OFFSET).max(0) as u32
}

/// Sectors per block for the given block size.
pub fn sectors_per_block(block_size: u32) -> u32 {
    block_size >> SECTOR_SHIFT
}

/// Sectors of allocation bitmap preceding each data block.
///
/// One bit per sector of payload, rounded up to whole sectors, never zero.
/// A conventional 2 MiB block has 4096 sectors, a 512-byte bitmap, one
/// bitmap sector.
pub fn bitmap_sectors(block_size: u32) -> u32 {
    secs_round_up_no_zero(u64::from(sectors_per_block(block_size)) / 8) as u32
}

/// Bytes of allocation bitmap preceding each data block.
pub fn bitmap_bytes(block_size: u32) -> u64 {
    u64::from(bitmap_sectors(block_size)) * SECTOR_SIZE
}
