//! Streaming VHD upload state machine
//!
//! Consumes an inbound dynamic/differencing VHD byte stream in one pass:
//!
//! ```text
//! FOOTER -> HEADER -> BAT -> (BITMAP -> DATA)* -> TRAILER
//! ```
//!
//! Each data block's payload lands at `block_index * block_size` in the
//! backing device. The machine suspends cleanly at any queue underflow and
//! resumes when more bytes arrive, so it serves both single-request PUT
//! bodies and BITS fragments spread over many requests.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use vdigate_core::{Error, Result, SECTOR_SHIFT};
use vdigate_pipeline::blockio;
use vdigate_pipeline::{ChunkQueue, Fill};
use vdigate_vhd::bitmap::test_bit;
use vdigate_vhd::{bitmap_bytes, sectors_per_block, Bat, DynamicHeader, Footer};

/// How block payloads are written to the backing device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Honor per-block bitmaps: clear-bit sector runs are skipped with a
    /// seek, leaving holes in a freshly-truncated backing file
    Sparse,
    /// Ignore bitmaps and write every payload byte; optionally zero the
    /// blocks the BAT leaves unallocated once the upload completes
    Dense { zero_unallocated: bool },
}

/// Outcome of one [`VhdImport::advance`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The queue ran dry mid-structure; feed more bytes and call again
    NeedMore,
    /// Every allocated block has been written; remaining stream bytes
    /// (trailing footer) are discarded as they arrive
    Done,
}

#[derive(Debug)]
enum Phase {
    Footer,
    Header,
    Bat,
    BlockBitmap,
    BlockData,
    Trailer,
}

/// Single-pass VHD stream parser and writer
pub struct VhdImport {
    backing: PathBuf,
    mode: WriteMode,
    abs_off: u64,
    phase: Phase,
    fill: Fill,
    footer: Option<Footer>,
    header: Option<DynamicHeader>,
    bat: Option<Bat>,
    bitmap: Vec<u8>,
    num_blocks: usize,
    blocks_allocated: u32,
    blocks_written: u32,
    curr_blk: Option<usize>,
    file: Option<File>,
}

impl VhdImport {
    pub fn new(backing: impl Into<PathBuf>, mode: WriteMode) -> Self {
        Self {
            backing: backing.into(),
            mode,
            abs_off: 0,
            phase: Phase::Footer,
            fill: Fill::new(0, Footer::SIZE),
            footer: None,
            header: None,
            bat: None,
            bitmap: Vec::new(),
            num_blocks: 0,
            blocks_allocated: 0,
            blocks_written: 0,
            curr_blk: None,
            file: None,
        }
    }

    /// Absolute stream offset consumed so far
    pub fn abs_off(&self) -> u64 {
        self.abs_off
    }

    /// Blocks written so far
    pub fn blocks_written(&self) -> u32 {
        self.blocks_written
    }

    fn header_ref(&self) -> Result<&DynamicHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| Error::internal("VHD header consulted before parse"))
    }

    fn bat_ref(&self) -> Result<&Bat> {
        self.bat
            .as_ref()
            .ok_or_else(|| Error::internal("BAT consulted before parse"))
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::internal("backing device not open"))
    }

    /// Drive the state machine over whatever the queue holds.
    ///
    /// Returns [`Progress::NeedMore`] when the stream is exhausted before
    /// the machine completes, [`Progress::Done`] once all allocated blocks
    /// are written. Errors are terminal.
    pub fn advance(&mut self, q: &mut ChunkQueue) -> Result<Progress> {
        loop {
            match self.phase {
                Phase::Footer => {
                    if !self.fill.fill(q, &mut self.abs_off) {
                        return Ok(Progress::NeedMore);
                    }
                    let footer = Footer::parse(self.fill.buf())?;
                    footer.validate()?;
                    tracing::debug!(size = footer.current_size, "VHD footer parsed");
                    self.fill = Fill::new(footer.data_offset, DynamicHeader::SIZE);
                    self.footer = Some(footer);
                    self.phase = Phase::Header;
                }

                Phase::Header => {
                    if !self.fill.fill(q, &mut self.abs_off) {
                        return Ok(Progress::NeedMore);
                    }
                    let header = DynamicHeader::parse(self.fill.buf())?;
                    header.validate()?;

                    let current_size = self
                        .footer
                        .as_ref()
                        .map(|f| f.current_size)
                        .unwrap_or_default();
                    let num_blocks = current_size.div_ceil(u64::from(header.block_size)) as usize;
                    tracing::debug!(
                        current_size,
                        num_blocks,
                        max_bat = header.max_table_entries,
                        "VHD header parsed"
                    );
                    if (header.max_table_entries as usize) < num_blocks {
                        return Err(Error::bad_request("BAT smaller than VHD size"));
                    }

                    self.bitmap = vec![0u8; bitmap_bytes(header.block_size) as usize];
                    self.fill = Fill::new(
                        header.table_offset,
                        Bat::padded_size(num_blocks) as usize,
                    );
                    self.num_blocks = num_blocks;
                    self.header = Some(header);
                    self.phase = Phase::Bat;
                }

                Phase::Bat => {
                    if !self.fill.fill(q, &mut self.abs_off) {
                        return Ok(Progress::NeedMore);
                    }
                    let bat = Bat::from_wire(self.fill.buf(), self.num_blocks)?;
                    self.blocks_allocated = bat.allocated_blocks();

                    let current_size = self
                        .footer
                        .as_ref()
                        .map(|f| f.current_size)
                        .unwrap_or_default();
                    self.file = Some(blockio::open_for_write(&self.backing, current_size)?);

                    let block_size = self.header_ref()?.block_size;
                    self.curr_blk = bat.next_block_at_or_after(self.abs_off, 0, block_size);
                    tracing::debug!(
                        allocated = self.blocks_allocated,
                        first_block = ?self.curr_blk,
                        "BAT parsed, backing device open"
                    );
                    self.bat = Some(bat);
                    self.enter_block_or_trailer()?;
                }

                Phase::BlockBitmap => {
                    if !self.fill.fill(q, &mut self.abs_off) {
                        return Ok(Progress::NeedMore);
                    }
                    self.bitmap.copy_from_slice(self.fill.buf());
                    self.phase = Phase::BlockData;
                }

                Phase::BlockData => {
                    if !self.write_block_data(q)? {
                        return Ok(Progress::NeedMore);
                    }
                    self.blocks_written += 1;
                    let block_size = self.header_ref()?.block_size;
                    let hint = self.curr_blk.map(|b| b + 1).unwrap_or(0);
                    self.curr_blk = if self.blocks_written < self.blocks_allocated {
                        self.bat_ref()?
                            .next_block_at_or_after(self.abs_off, hint, block_size)
                    } else {
                        None
                    };
                    self.enter_block_or_trailer()?;
                }

                Phase::Trailer => {
                    let n = q.available();
                    q.discard(n);
                    self.abs_off += n as u64;
                    return Ok(Progress::Done);
                }
            }
        }
    }

    /// Begin the next allocated block, or finish the upload.
    fn enter_block_or_trailer(&mut self) -> Result<()> {
        match self.curr_blk {
            Some(blk) => {
                let blk_off = self
                    .bat_ref()?
                    .block_offset(blk)
                    .ok_or_else(|| Error::internal("current block unallocated"))?;
                let bm_len = self.bitmap.len();
                self.fill = Fill::new(blk_off, bm_len);
                self.phase = Phase::BlockBitmap;
            }
            None => {
                if self.blocks_written < self.blocks_allocated {
                    return Err(Error::bad_request(format!(
                        "no stream data for {} of {} allocated blocks",
                        self.blocks_allocated - self.blocks_written,
                        self.blocks_allocated
                    )));
                }
                if let WriteMode::Dense {
                    zero_unallocated: true,
                } = self.mode
                {
                    self.zero_unallocated()?;
                }
                tracing::debug!(blocks = self.blocks_written, "VHD upload complete");
                self.phase = Phase::Trailer;
            }
        }
        Ok(())
    }

    /// Write payload bytes for the current block. Returns true when the
    /// block's full `block_size` bytes have been consumed.
    fn write_block_data(&mut self, q: &mut ChunkQueue) -> Result<bool> {
        let blk = self
            .curr_blk
            .ok_or_else(|| Error::internal("block write without current block"))?;
        let header = self.header_ref()?;
        let block_size = u64::from(header.block_size);
        let spb = sectors_per_block(header.block_size) as usize;
        let bm_bytes = bitmap_bytes(header.block_size);
        let blk_off = self
            .bat_ref()?
            .block_offset(blk)
            .ok_or_else(|| Error::internal("current block unallocated"))?;
        let data_start = blk_off + bm_bytes;
        let blk_real = blk as u64 * block_size;
        let sparse = self.mode == WriteMode::Sparse;

        while self.abs_off < data_start + block_size {
            let off_in_blk = self.abs_off - data_start;
            let avail = q.available();
            if avail == 0 {
                return Ok(false);
            }

            let (write, run_len) = if sparse {
                // Group sectors by equal bitmap bits; the first sector of a
                // resumed write may be partial.
                let curr_sec = (off_in_blk >> SECTOR_SHIFT) as usize;
                let bit = test_bit(&self.bitmap, curr_sec);
                let mut end_sec = curr_sec + 1;
                while end_sec < spb && test_bit(&self.bitmap, end_sec) == bit {
                    end_sec += 1;
                }
                let run_end = (end_sec as u64) << SECTOR_SHIFT;
                (bit, (run_end - off_in_blk).min(avail as u64))
            } else {
                (true, (block_size - off_in_blk).min(avail as u64))
            };

            if write {
                let file = self.file_mut()?;
                file.seek(SeekFrom::Start(blk_real + off_in_blk))?;
                let n = file_write(file, q, run_len as usize)?;
                self.abs_off += n as u64;
            } else {
                let n = q.discard(run_len as usize);
                self.abs_off += n as u64;
            }
        }

        Ok(true)
    }

    /// Dense-mode sweep: zero every virtual block the BAT leaves
    /// unallocated, in sector-sized bursts.
    fn zero_unallocated(&mut self) -> Result<()> {
        let block_size = self.header_ref()?.block_size;
        let unused: Vec<u64> = self
            .bat_ref()?
            .entries
            .iter()
            .enumerate()
            .filter(|(_, &e)| e == Bat::UNUSED)
            .map(|(i, _)| i as u64)
            .collect();
        let file = self.file_mut()?;
        for blk in unused {
            tracing::debug!(block = blk, "zeroing unallocated block");
            blockio::zero_block(file, blk, block_size)?;
        }
        Ok(())
    }
}

fn file_write(file: &mut File, q: &mut ChunkQueue, len: usize) -> Result<usize> {
    let n = q.write_to(file, len)?;
    if n < len && q.available() > 0 {
        return Err(Error::internal(format!(
            "short write: {} of {} bytes",
            n, len
        )));
    }
    Ok(n)
}

/// Feed an entire in-memory stream through an import in one shot.
///
/// Used by the single-request PUT path; the stream must contain the whole
/// VHD.
pub fn import_stream(
    backing: impl Into<PathBuf>,
    mode: WriteMode,
    q: &mut ChunkQueue,
) -> Result<()> {
    let mut import = VhdImport::new(backing, mode);
    match import.advance(q)? {
        Progress::Done => Ok(()),
        Progress::NeedMore => Err(Error::bad_request("request too short to be a VHD")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::{Read, Write};
    use tempfile::NamedTempFile;
    use vdigate_export::{ExportParams, Segment, VhdExport};
    use vdigate_vhd::{DiskGeometry, DiskType};

    const MIB: u64 = 1024 * 1024;
    const BS: u32 = 2 * 1024 * 1024;

    fn patterned_backing(len: u64) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn empty_backing(len: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        file
    }

    fn read_all(file: &NamedTempFile) -> Vec<u8> {
        let mut out = Vec::new();
        std::fs::File::open(file.path())
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn export_stream(backing: &NamedTempFile, size: u64) -> Vec<u8> {
        use std::io::Seek;
        let export = VhdExport::prepare(ExportParams::new(backing.path(), size)).unwrap();
        let mut out = Vec::new();
        for seg in export.all_segments() {
            match seg {
                Segment::Memory(b) => out.extend_from_slice(&b),
                Segment::FileSlice { path, offset, len } => {
                    let mut f = std::fs::File::open(path).unwrap();
                    f.seek(std::io::SeekFrom::Start(offset)).unwrap();
                    let mut buf = vec![0u8; len as usize];
                    f.read_exact(&mut buf).unwrap();
                    out.extend_from_slice(&buf);
                }
            }
        }
        out
    }

    #[test]
    fn test_round_trip_single_shot() {
        let source = patterned_backing(4 * MIB);
        let stream = export_stream(&source, 4 * MIB);

        let dest = empty_backing(4 * MIB);
        let mut q = ChunkQueue::new();
        q.push(Bytes::from(stream));
        import_stream(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: false,
            },
            &mut q,
        )
        .unwrap();

        assert_eq!(read_all(&dest), read_all(&source));
    }

    #[test]
    fn test_round_trip_fragmented_feed() {
        let source = patterned_backing(4 * MIB);
        let stream = export_stream(&source, 4 * MIB);

        let dest = empty_backing(4 * MIB);
        let mut import = VhdImport::new(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: false,
            },
        );

        // Feed in awkward 1000-byte chunks, exercising every suspension
        let mut q = ChunkQueue::new();
        let mut progress = Progress::NeedMore;
        for chunk in stream.chunks(1000) {
            q.push(Bytes::copy_from_slice(chunk));
            progress = import.advance(&mut q).unwrap();
        }

        assert_eq!(progress, Progress::Done);
        assert_eq!(import.abs_off(), stream.len() as u64);
        assert_eq!(read_all(&dest), read_all(&source));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let source = patterned_backing(4 * MIB);
        let stream = export_stream(&source, 4 * MIB);

        let dest = empty_backing(4 * MIB);
        let mut q = ChunkQueue::new();
        q.push(Bytes::copy_from_slice(&stream[..stream.len() / 2]));
        let err = import_stream(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: false,
            },
            &mut q,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_backing_size_mismatch_rejected() {
        let source = patterned_backing(4 * MIB);
        let stream = export_stream(&source, 4 * MIB);

        let dest = empty_backing(8 * MIB); // wrong size
        let mut q = ChunkQueue::new();
        q.push(Bytes::from(stream));
        let mut import = VhdImport::new(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: false,
            },
        );
        let err = import.advance(&mut q).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        let dest = empty_backing(4 * MIB);
        let mut q = ChunkQueue::new();
        q.push(Bytes::from(vec![0xAAu8; 4096]));
        let mut import = VhdImport::new(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: false,
            },
        );
        assert!(import.advance(&mut q).is_err());
    }

    #[test]
    fn test_zero_unallocated_sweep() {
        // Source where block 1 of 2 is absent from the stream
        let source = patterned_backing(4 * MIB);
        let export = {
            use base64::engine::general_purpose::STANDARD as BASE64;
            use base64::Engine as _;
            use flate2::{write::ZlibEncoder, Compression};
            let mut params = ExportParams::new(source.path(), 4 * MIB);
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&[0b1000_0000u8]).unwrap();
            params.blocks = BASE64.encode(enc.finish().unwrap());
            VhdExport::prepare(params).unwrap()
        };
        let mut stream = Vec::new();
        for seg in export.all_segments() {
            match seg {
                Segment::Memory(b) => stream.extend_from_slice(&b),
                Segment::FileSlice { path, offset, len } => {
                    use std::io::Seek;
                    let mut f = std::fs::File::open(path).unwrap();
                    f.seek(std::io::SeekFrom::Start(offset)).unwrap();
                    let mut buf = vec![0u8; len as usize];
                    f.read_exact(&mut buf).unwrap();
                    stream.extend_from_slice(&buf);
                }
            }
        }

        // Destination starts dirty
        let dest = NamedTempFile::new().unwrap();
        std::fs::write(dest.path(), vec![0xABu8; 4 * MIB as usize]).unwrap();

        let mut q = ChunkQueue::new();
        q.push(Bytes::from(stream));
        import_stream(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: true,
            },
            &mut q,
        )
        .unwrap();

        let out = read_all(&dest);
        // Block 0 carries the source pattern
        assert_eq!(out[0], 0);
        assert_eq!(out[513], 1);
        // Block 1 was swept to zero
        assert!(out[2 * MIB as usize..].iter().all(|&b| b == 0));
    }

    /// Hand-build a one-block VHD whose bitmap marks only two sectors
    fn sparse_block_vhd(size: u64, payload: &[u8], set_sectors: &[usize]) -> Vec<u8> {
        let num_blocks = size.div_ceil(u64::from(BS)) as usize;
        let mut footer = Footer {
            cookie: *Footer::COOKIE,
            features: Footer::FEATURES_RESERVED,
            version: Footer::VERSION,
            data_offset: 512,
            timestamp: 0,
            creator_app: *Footer::CREATOR_APP,
            creator_version: 0x0001_0000,
            creator_os: 0,
            original_size: size,
            current_size: size,
            geometry: DiskGeometry::for_size(size),
            disk_type: DiskType::Dynamic,
            checksum: 0,
            uuid: uuid::Uuid::nil(),
            saved_state: 0,
        };
        footer.update_checksum();

        let mut header = DynamicHeader {
            cookie: *DynamicHeader::COOKIE,
            data_offset: u64::MAX,
            table_offset: 1536,
            header_version: DynamicHeader::VERSION,
            max_table_entries: num_blocks as u32,
            block_size: BS,
            checksum: 0,
            parent_uuid: uuid::Uuid::nil(),
            parent_timestamp: 0,
            reserved1: 0,
            parent_unicode_name: [0u16; 256],
            parent_locators: [vdigate_vhd::ParentLocatorEntry::default(); 8],
        };
        header.update_checksum();

        let mut bat = Bat::new_unallocated(num_blocks);
        let data_off = 1536 + Bat::padded_size(num_blocks);
        bat.entries[0] = (data_off >> SECTOR_SHIFT) as u32;

        let mut bitmap = vec![0u8; 512];
        for &sec in set_sectors {
            vdigate_vhd::bitmap::set_bit(&mut bitmap, sec);
        }

        let mut out = Vec::new();
        let mut fb = [0u8; Footer::SIZE];
        footer.serialize(&mut fb);
        out.extend_from_slice(&fb);
        let mut hb = [0u8; DynamicHeader::SIZE];
        header.serialize(&mut hb);
        out.extend_from_slice(&hb);
        out.extend_from_slice(&bat.to_wire_padded());
        out.extend_from_slice(&bitmap);
        out.extend_from_slice(payload);
        out.extend_from_slice(&fb);
        out
    }

    #[test]
    fn test_sparse_write_preserves_holes() {
        let size = 4 * MIB;
        // Payload is nonzero everywhere so a stray write would be visible
        let payload = vec![0xCDu8; BS as usize];
        let stream = sparse_block_vhd(size, &payload, &[0, 4095]);

        let dest = empty_backing(size);
        let mut q = ChunkQueue::new();
        q.push(Bytes::from(stream));
        import_stream(dest.path(), WriteMode::Sparse, &mut q).unwrap();

        let out = read_all(&dest);
        // Sectors 0 and 4095 hold the uploaded bytes
        assert!(out[..512].iter().all(|&b| b == 0xCD));
        assert!(out[4095 * 512..4096 * 512].iter().all(|&b| b == 0xCD));
        // Everything between stayed zero
        assert!(out[512..4095 * 512].iter().all(|&b| b == 0));
        // Block 1 untouched
        assert!(out[BS as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dense_write_ignores_bitmap() {
        let size = 4 * MIB;
        let payload = vec![0xCDu8; BS as usize];
        let stream = sparse_block_vhd(size, &payload, &[0]);

        let dest = empty_backing(size);
        let mut q = ChunkQueue::new();
        q.push(Bytes::from(stream));
        import_stream(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: false,
            },
            &mut q,
        )
        .unwrap();

        let out = read_all(&dest);
        // The whole block was written regardless of the bitmap
        assert!(out[..BS as usize].iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn test_sparse_write_fragmented_feed() {
        let size = 4 * MIB;
        let payload = vec![0xCDu8; BS as usize];
        let stream = sparse_block_vhd(size, &payload, &[0, 1, 100, 4095]);

        let dest = empty_backing(size);
        let mut import = VhdImport::new(dest.path(), WriteMode::Sparse);
        let mut q = ChunkQueue::new();
        let mut progress = Progress::NeedMore;
        for chunk in stream.chunks(777) {
            q.push(Bytes::copy_from_slice(chunk));
            progress = import.advance(&mut q).unwrap();
        }
        assert_eq!(progress, Progress::Done);

        let out = read_all(&dest);
        assert!(out[..1024].iter().all(|&b| b == 0xCD));
        assert!(out[100 * 512..101 * 512].iter().all(|&b| b == 0xCD));
        assert!(out[4095 * 512..4096 * 512].iter().all(|&b| b == 0xCD));
        assert!(out[1024..100 * 512].iter().all(|&b| b == 0));
        assert!(out[101 * 512..4095 * 512].iter().all(|&b| b == 0));
    }
}
