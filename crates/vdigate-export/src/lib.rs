//! # vdigate export
//!
//! Synthesizes a sparse VHD byte stream from a raw backing device plus
//! caller-supplied metadata: UUIDs, an optional parent pointer, a
//! block-presence bitmap, and optional per-block device routing.
//!
//! The stream is never materialized. [`VhdExport::prepare`] builds the
//! control structures in memory and [`VhdExport::segments`] lowers the
//! whole image into a sequence of [`Segment`]s: small in-memory buffers
//! for footer/header/BAT/bitmaps, and `(path, offset, len)` slice
//! descriptors for block payloads, already clipped to the requested HTTP
//! range.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use vdigate_core::range::clip;
use vdigate_core::{Error, Result, BLOCK_SIZE, SECTOR_SHIFT};
use vdigate_pipeline::blockio;
use vdigate_vhd::{
    bitmap_bytes, header::encode_locator_macx, header::encode_locator_w2u,
    header::locator_data_space, sectors_per_block, vhd_time_now, Bat, BlockBitmap, DiskGeometry,
    DiskType, DynamicHeader, Footer, ParentLocatorEntry,
};

/// Default placeholder device for blocks no route claims
pub const SHADOW_DEVICE: &str = "/dev/shadow";

/// Routes a subset of virtual blocks to an auxiliary device
#[derive(Debug, Clone)]
pub struct BlockRoute {
    pub device: PathBuf,
    pub blocks: BlockBitmap,
}

/// Everything the synthesizer needs to describe one image
#[derive(Debug, Clone)]
pub struct ExportParams {
    /// Primary backing device
    pub backing: PathBuf,
    /// Declared virtual disk size; the backing device must match exactly
    /// unless `non_leaf` is set
    pub vdi_size: u64,
    /// Disk UUID; generated when absent
    pub uuid: Option<Uuid>,
    /// Parent disk UUID; presence selects a differencing image
    pub parent_uuid: Option<Uuid>,
    /// Parent image path, required for differencing images
    pub parent_path: Option<String>,
    /// base64+zlib block-presence bitmap; empty selects every block
    pub blocks: String,
    /// Skip the backing probe and route blocks through `block_map`
    pub non_leaf: bool,
    /// Ordered per-device routing, first match wins
    pub block_map: Vec<BlockRoute>,
    /// Filler device for unrouted blocks
    pub shadow: PathBuf,
}

impl ExportParams {
    pub fn new(backing: impl Into<PathBuf>, vdi_size: u64) -> Self {
        Self {
            backing: backing.into(),
            vdi_size,
            uuid: None,
            parent_uuid: None,
            parent_path: None,
            blocks: String::new(),
            non_leaf: false,
            block_map: Vec::new(),
            shadow: PathBuf::from(SHADOW_DEVICE),
        }
    }
}

/// One region of the synthesized stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Bytes held in memory (control structures, bitmaps)
    Memory(Bytes),
    /// A slice of a backing file or device
    FileSlice { path: PathBuf, offset: u64, len: u64 },
}

impl Segment {
    pub fn len(&self) -> u64 {
        match self {
            Segment::Memory(b) => b.len() as u64,
            Segment::FileSlice { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A prepared VHD synthesis: control structures plus routing
#[derive(Debug)]
pub struct VhdExport {
    footer: Footer,
    header: DynamicHeader,
    bat: Bat,
    ploc_buf: Bytes,
    /// Absolute offset of the first data block
    data_off: u64,
    total_size: u64,
    blocks_allocated: u32,
    backing: PathBuf,
    non_leaf: bool,
    block_map: Vec<BlockRoute>,
    shadow: PathBuf,
}

impl VhdExport {
    /// Build the in-memory VHD record for the given parameters.
    ///
    /// Probes the backing device (unless `non_leaf`), decodes the presence
    /// bitmap, constructs footer, header, parent locators and BAT, and
    /// computes the total stream size.
    pub fn prepare(params: ExportParams) -> Result<Self> {
        if params.vdi_size == 0 {
            return Err(Error::bad_request("vdi_size must be positive"));
        }
        if !params.non_leaf {
            blockio::probe_backing(&params.backing, params.vdi_size)?;
        }

        let num_blocks = params.vdi_size.div_ceil(BLOCK_SIZE) as usize;
        let blocks = BlockBitmap::decode(&params.blocks, num_blocks)?;

        let uuid = params.uuid.unwrap_or_else(|| {
            tracing::debug!("no disk UUID supplied, generating one");
            Uuid::new_v4()
        });

        let disk_type = if params.parent_uuid.is_some() {
            DiskType::Differencing
        } else {
            DiskType::Dynamic
        };
        if disk_type == DiskType::Differencing && params.parent_path.is_none() {
            return Err(Error::bad_request("parent UUID supplied without parent path"));
        }

        let block_size = BLOCK_SIZE as u32;
        let now = vhd_time_now();

        let mut footer = Footer {
            cookie: *Footer::COOKIE,
            features: Footer::FEATURES_RESERVED,
            version: Footer::VERSION,
            data_offset: Footer::SIZE as u64,
            timestamp: now,
            creator_app: *Footer::CREATOR_APP,
            creator_version: 0x0001_0000,
            creator_os: 0,
            original_size: params.vdi_size,
            current_size: params.vdi_size,
            geometry: DiskGeometry::for_size(params.vdi_size),
            disk_type,
            checksum: 0,
            uuid,
            saved_state: 0,
        };

        let mut header = DynamicHeader {
            cookie: *DynamicHeader::COOKIE,
            data_offset: u64::MAX,
            // one footer + 1024-byte header: the BAT starts at sector 3
            table_offset: (Footer::SIZE + DynamicHeader::SIZE) as u64,
            header_version: DynamicHeader::VERSION,
            max_table_entries: num_blocks as u32,
            block_size,
            checksum: 0,
            parent_uuid: Uuid::nil(),
            parent_timestamp: 0,
            reserved1: 0,
            parent_unicode_name: [0u16; 256],
            parent_locators: [ParentLocatorEntry::default(); 8],
        };

        let mut data_off = header.table_offset + Bat::padded_size(num_blocks);
        let mut ploc_buf = Bytes::new();

        if disk_type == DiskType::Differencing {
            let parent_uuid = params.parent_uuid.unwrap_or_default();
            let parent_path = params.parent_path.as_deref().unwrap_or_default();
            header.parent_uuid = parent_uuid;
            header.parent_timestamp = now;
            header.set_parent_name(parent_path)?;
            (ploc_buf, data_off) = build_parent_locators(&mut header, parent_path, data_off);
        }

        let spb = sectors_per_block(block_size);
        let bm_secs = vdigate_vhd::bitmap_sectors(block_size);
        let mut bat = Bat::new_unallocated(num_blocks);
        let mut blocks_allocated = 0u32;
        let mut sector = data_off >> SECTOR_SHIFT;
        for i in 0..num_blocks {
            if blocks.get(i) {
                bat.entries[i] = sector as u32;
                sector += u64::from(spb + bm_secs);
                blocks_allocated += 1;
            }
        }

        footer.update_checksum();
        footer.validate()?;
        header.update_checksum();
        header.validate()?;

        let total_size = data_off
            + u64::from(blocks_allocated) * (u64::from(block_size) + bitmap_bytes(block_size))
            + Footer::SIZE as u64;

        tracing::debug!(
            vdi_size = params.vdi_size,
            blocks_allocated,
            data_off,
            total_size,
            ?disk_type,
            "prepared VHD export"
        );

        Ok(Self {
            footer,
            header,
            bat,
            ploc_buf,
            data_off,
            total_size,
            blocks_allocated,
            backing: params.backing,
            non_leaf: params.non_leaf,
            block_map: params.block_map,
            shadow: params.shadow,
        })
    }

    /// Total size of the synthesized stream in bytes
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of allocated blocks in the image
    pub fn blocks_allocated(&self) -> u32 {
        self.blocks_allocated
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn header(&self) -> &DynamicHeader {
        &self.header
    }

    pub fn bat(&self) -> &Bat {
        &self.bat
    }

    /// Pick the payload source for one virtual block.
    ///
    /// Routed exports take the first map entry claiming the block; a block
    /// no entry claims is shadowed. Leaf exports always read the primary
    /// backing device.
    fn block_source(&self, block: usize) -> (&Path, u64) {
        let block_start = block as u64 * u64::from(self.header.block_size);
        if self.non_leaf {
            for route in &self.block_map {
                if route.blocks.get(block) {
                    return (&route.device, block_start);
                }
            }
            tracing::debug!(block, "no route claims block, shadowing");
            // The shadow device is a single block of filler, addressed
            // from zero.
            (&self.shadow, 0)
        } else {
            (&self.backing, block_start)
        }
    }

    /// Lower the image into segments clipped to `[req_start, req_end]`
    /// (inclusive bounds, as in an HTTP range).
    pub fn segments(&self, req_start: u64, req_end: u64) -> Vec<Segment> {
        let mut out = Vec::new();
        let push_buf = |out: &mut Vec<Segment>, buf: &Bytes, off: u64| {
            let (skip, len) = clip(off, buf.len() as u64, req_start, req_end);
            if len > 0 {
                out.push(Segment::Memory(
                    buf.slice(skip as usize..(skip + len) as usize),
                ));
            }
        };

        let mut footer_bytes = [0u8; Footer::SIZE];
        self.footer.serialize(&mut footer_bytes);
        let footer_buf = Bytes::copy_from_slice(&footer_bytes);
        let mut header_bytes = [0u8; DynamicHeader::SIZE];
        self.header.serialize(&mut header_bytes);
        let header_buf = Bytes::copy_from_slice(&header_bytes);
        let bat_buf = Bytes::from(self.bat.to_wire_padded());

        // Backup footer, header, BAT
        push_buf(&mut out, &footer_buf, 0);
        push_buf(&mut out, &header_buf, Footer::SIZE as u64);
        push_buf(&mut out, &bat_buf, self.header.table_offset);

        // Parent locator payload (differencing only)
        if !self.ploc_buf.is_empty() {
            push_buf(
                &mut out,
                &self.ploc_buf,
                self.header.table_offset + bat_buf.len() as u64,
            );
        }

        // Data blocks, in BAT sector order (which is ascending virtual
        // block order: sectors were assigned in one pass)
        let bm_bytes = bitmap_bytes(self.header.block_size);
        let block_size = u64::from(self.header.block_size);
        let bitmap_buf = Bytes::from(vec![0xFFu8; bm_bytes as usize]);
        for block in 0..self.bat.entries.len() {
            let Some(off) = self.bat.block_offset(block) else {
                continue;
            };
            if off > req_end {
                break;
            }

            push_buf(&mut out, &bitmap_buf, off);

            let (skip, len) = clip(off + bm_bytes, block_size, req_start, req_end);
            if len > 0 {
                let (path, source_off) = self.block_source(block);
                out.push(Segment::FileSlice {
                    path: path.to_path_buf(),
                    offset: source_off + skip,
                    len,
                });
            }
        }

        // Primary footer
        push_buf(&mut out, &footer_buf, self.total_size - Footer::SIZE as u64);

        out
    }

    /// Segments for the whole stream
    pub fn all_segments(&self) -> Vec<Segment> {
        self.segments(0, self.total_size - 1)
    }
}

/// Encode the parent path into the three locator slots and lay the payloads
/// out after the BAT. Returns the payload buffer and the advanced data
/// offset.
fn build_parent_locators(
    header: &mut DynamicHeader,
    parent_path: &str,
    mut data_off: u64,
) -> (Bytes, u64) {
    let mac_enc = encode_locator_macx(parent_path);
    let win_enc = encode_locator_w2u(parent_path);
    let mac_space = locator_data_space(mac_enc.len());
    let win_space = locator_data_space(win_enc.len());

    let slots: [(&[u8; 4], &[u8], u32); 3] = [
        (ParentLocatorEntry::PLATFORM_MACX, &mac_enc, mac_space),
        (ParentLocatorEntry::PLATFORM_W2KU, &win_enc, win_space),
        (ParentLocatorEntry::PLATFORM_W2RU, &win_enc, win_space),
    ];

    let mut buf = Vec::with_capacity((mac_space + 2 * win_space) as usize);
    for (i, (code, encoded, space)) in slots.iter().enumerate() {
        header.parent_locators[i] = ParentLocatorEntry {
            platform_code: **code,
            data_space: *space,
            data_length: encoded.len() as u32,
            reserved: 0,
            data_offset: data_off,
        };
        buf.extend_from_slice(encoded);
        buf.resize(buf.len() + (*space as usize - encoded.len()), 0);
        data_off += u64::from(*space);
    }

    (Bytes::from(buf), data_off)
}
