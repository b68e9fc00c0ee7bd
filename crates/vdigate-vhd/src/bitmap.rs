//! Block-presence bitmaps
//!
//! Callers describe which virtual blocks an image carries as a
//! zlib-compressed, base64-encoded bit array, one bit per block. Bit order
//! is MSB-first within each byte, matching the VHD per-block sector bitmaps.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::{Decompress, FlushDecompress, Status};
use vdigate_core::{Error, Result};

/// Worst-case zlib expansion allowed for the decoded parameter
const MAX_ZLIB_EXPANSION: f64 = 1.03;

/// Test a bit in an MSB-first bit array
pub fn test_bit(map: &[u8], bit: usize) -> bool {
    (map[bit >> 3] << (bit & 7)) & 0x80 != 0
}

/// Set a bit in an MSB-first bit array
pub fn set_bit(map: &mut [u8], bit: usize) {
    map[bit >> 3] |= 0x80 >> (bit & 7);
}

/// A dense bit array indexed by virtual block number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBitmap {
    bytes: Vec<u8>,
    num_blocks: usize,
}

impl BlockBitmap {
    /// A bitmap with every block present
    pub fn all_ones(num_blocks: usize) -> Self {
        Self {
            bytes: vec![0xFF; num_blocks.div_ceil(8)],
            num_blocks,
        }
    }

    /// A bitmap with no block present
    pub fn all_zeros(num_blocks: usize) -> Self {
        Self {
            bytes: vec![0; num_blocks.div_ceil(8)],
            num_blocks,
        }
    }

    /// Build from raw MSB-first bytes
    pub fn from_bytes(bytes: Vec<u8>, num_blocks: usize) -> Result<Self> {
        if bytes.len() != num_blocks.div_ceil(8) {
            return Err(Error::bad_request(format!(
                "block bitmap is {} bytes, expected {}",
                bytes.len(),
                num_blocks.div_ceil(8)
            )));
        }
        Ok(Self { bytes, num_blocks })
    }

    /// Decode a caller-supplied `base64(zlib(bitmap))` parameter.
    ///
    /// An empty parameter selects every block. Base64 failure, inflate
    /// failure, or a decompressed size other than `ceil(num_blocks/8)` bytes
    /// are all `BadRequest`.
    pub fn decode(param: &str, num_blocks: usize) -> Result<Self> {
        let bitmap_size = num_blocks.div_ceil(8);

        if param.is_empty() {
            tracing::debug!("no blocks parameter, selecting every block");
            return Ok(Self::all_ones(num_blocks));
        }

        let scratch_cap = ((bitmap_size as f64 * MAX_ZLIB_EXPANSION) as usize).max(128);
        let mut compressed = Vec::with_capacity(scratch_cap);
        BASE64
            .decode_vec(param, &mut compressed)
            .map_err(|e| Error::bad_request(format!("block bitmap base64: {}", e)))?;

        let mut bytes = Vec::with_capacity(bitmap_size);
        let mut inflate = Decompress::new(true);
        let status = inflate
            .decompress_vec(&compressed, &mut bytes, FlushDecompress::Finish)
            .map_err(|e| Error::bad_request(format!("block bitmap inflate: {}", e)))?;
        if status != Status::StreamEnd {
            return Err(Error::bad_request("block bitmap parameter too large"));
        }
        if bytes.len() != bitmap_size {
            return Err(Error::bad_request(format!(
                "decompressed block bitmap is {} bytes, expected {}",
                bytes.len(),
                bitmap_size
            )));
        }

        Ok(Self { bytes, num_blocks })
    }

    /// Number of virtual blocks the bitmap covers
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// True when block `i` is present
    pub fn get(&self, i: usize) -> bool {
        i < self.num_blocks && test_bit(&self.bytes, i)
    }

    /// Mark block `i` present
    pub fn set(&mut self, i: usize) {
        if i < self.num_blocks {
            set_bit(&mut self.bytes, i);
        }
    }

    /// Count of present blocks
    pub fn count_set(&self) -> usize {
        (0..self.num_blocks).filter(|&i| self.get(i)).count()
    }
}
