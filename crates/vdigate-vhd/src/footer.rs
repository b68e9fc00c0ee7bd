//! VHD footer (512 bytes)
//!
//! The footer opens and closes every sparse VHD stream: a backup copy at
//! byte 0 and the primary copy as the last 512 bytes.

use uuid::Uuid;
use vdigate_core::{Error, Result, SECTOR_SHIFT};

/// VHD disk type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskType {
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl DiskType {
    /// Parse a disk type from its on-wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            _ => Err(Error::bad_request(format!("invalid VHD disk type: {}", value))),
        }
    }

    /// True for the sparse flavors (dynamic and differencing)
    pub fn is_sparse(self) -> bool {
        matches!(self, DiskType::Dynamic | DiskType::Differencing)
    }
}

/// Disk geometry (CHS addressing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    /// Parse disk geometry from 4 wire bytes
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors: bytes[3],
        }
    }

    /// Convert geometry to wire bytes
    pub fn to_bytes(self) -> [u8; 4] {
        let cyl = self.cylinders.to_be_bytes();
        [cyl[0], cyl[1], self.heads, self.sectors]
    }

    /// Derive CHS geometry from a virtual disk size, per the VHD
    /// specification's layout algorithm.
    pub fn for_size(size: u64) -> Self {
        let mut total_sectors = size >> SECTOR_SHIFT;
        if total_sectors > 65535 * 16 * 255 {
            total_sectors = 65535 * 16 * 255;
        }

        let (mut sectors, mut heads, mut cyl_times_heads);
        if total_sectors >= 65535 * 16 * 63 {
            sectors = 255u64;
            heads = 16u64;
            cyl_times_heads = total_sectors / sectors;
        } else {
            sectors = 17;
            cyl_times_heads = total_sectors / sectors;
            heads = ((cyl_times_heads + 1023) / 1024).max(4);

            if cyl_times_heads >= heads * 1024 || heads > 16 {
                sectors = 31;
                heads = 16;
                cyl_times_heads = total_sectors / sectors;
            }
            if cyl_times_heads >= heads * 1024 {
                sectors = 63;
                heads = 16;
                cyl_times_heads = total_sectors / sectors;
            }
        }

        Self {
            cylinders: (cyl_times_heads / heads) as u16,
            heads: heads as u8,
            sectors: sectors as u8,
        }
    }
}

/// VHD footer structure (512 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub cookie: [u8; 8],
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uuid: Uuid,
    pub saved_state: u8,
}

impl Footer {
    /// VHD footer cookie value
    pub const COOKIE: &'static [u8; 8] = b"conectix";

    /// Size of the VHD footer in bytes
    pub const SIZE: usize = 512;

    /// File format version 1.0
    pub const VERSION: u32 = 0x0001_0000;

    /// Features field: reserved bit, always set
    pub const FEATURES_RESERVED: u32 = 0x0000_0002;

    /// Creator application tag written into synthesized images
    pub const CREATOR_APP: &'static [u8; 4] = b"vdg\0";

    /// Parse a VHD footer from raw wire bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::bad_request("VHD footer too small"));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);
        if &cookie != Self::COOKIE {
            return Err(Error::bad_request(format!(
                "invalid VHD footer cookie: expected 'conectix', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[28..32]);
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&bytes[68..84]);

        let disk_type_raw = u32::from_be_bytes([bytes[60], bytes[61], bytes[62], bytes[63]]);

        Ok(Self {
            cookie,
            features: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            version: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            data_offset: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
            timestamp: u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            creator_app,
            creator_version: u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]),
            creator_os: u32::from_be_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]),
            original_size: u64::from_be_bytes([
                bytes[40], bytes[41], bytes[42], bytes[43], bytes[44], bytes[45], bytes[46],
                bytes[47],
            ]),
            current_size: u64::from_be_bytes([
                bytes[48], bytes[49], bytes[50], bytes[51], bytes[52], bytes[53], bytes[54],
                bytes[55],
            ]),
            geometry: DiskGeometry::parse(&bytes[56..60]),
            disk_type: DiskType::from_u32(disk_type_raw)?,
            checksum: u32::from_be_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]),
            uuid: Uuid::from_bytes(uuid_bytes),
            saved_state: bytes[84],
        })
    }

    /// Serialize the footer into wire bytes
    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes.fill(0);
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..12].copy_from_slice(&self.features.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.version.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        bytes[56..60].copy_from_slice(&self.geometry.to_bytes());
        bytes[60..64].copy_from_slice(&(self.disk_type as u32).to_be_bytes());
        bytes[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[68..84].copy_from_slice(self.uuid.as_bytes());
        bytes[84] = self.saved_state;
    }

    /// Compute the checksum: one's complement of the byte sum with the
    /// checksum field zeroed.
    pub fn compute_checksum(&self) -> u32 {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        bytes[64..68].fill(0);

        let mut sum: u32 = 0;
        for &byte in bytes.iter() {
            sum = sum.wrapping_add(u32::from(byte));
        }
        !sum
    }

    /// Recompute and store the checksum
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Verify the stored checksum
    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// Validate a parsed footer: version, checksum, and a sparse disk type.
    ///
    /// # Errors
    ///
    /// `BadRequest` on version or checksum mismatch, `NotImplemented` for
    /// fixed (static) disks.
    pub fn validate(&self) -> Result<()> {
        if self.version != Self::VERSION {
            return Err(Error::bad_request(format!(
                "unsupported VHD footer version: {:#010x}",
                self.version
            )));
        }
        if !self.verify_checksum() {
            return Err(Error::bad_request("VHD footer checksum mismatch"));
        }
        if !self.disk_type.is_sparse() {
            return Err(Error::not_implemented("static VHDs are not supported"));
        }
        Ok(())
    }
}
