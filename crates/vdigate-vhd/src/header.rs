//! VHD dynamic header (1024 bytes) and parent locators
//!
//! The dynamic header follows the backup footer in sparse VHDs and carries
//! the BAT location and block size. Differencing disks additionally carry
//! the parent identity plus up to eight parent-locator slots pointing at
//! encoded copies of the parent path.

use uuid::Uuid;
use vdigate_core::{bytes_padded, Error, Result};

/// Parent locator entry (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParentLocatorEntry {
    /// Platform code (`MacX`, `W2ku`, `W2ru`, ...)
    pub platform_code: [u8; 4],
    /// Bytes reserved for the encoded payload, sector padded
    pub data_space: u32,
    /// Actual byte length of the encoded payload
    pub data_length: u32,
    pub reserved: u32,
    /// Absolute file offset of the payload
    pub data_offset: u64,
}

impl ParentLocatorEntry {
    /// Mac OS X POSIX-style path, UTF-8
    pub const PLATFORM_MACX: &'static [u8; 4] = b"MacX";
    /// Windows absolute path, UTF-16-LE
    pub const PLATFORM_W2KU: &'static [u8; 4] = b"W2ku";
    /// Windows relative path, UTF-16-LE
    pub const PLATFORM_W2RU: &'static [u8; 4] = b"W2ru";

    /// Size of a parent locator entry on the wire
    pub const SIZE: usize = 24;

    /// Parse a locator entry from 24 wire bytes
    pub fn parse(bytes: &[u8]) -> Self {
        let mut platform_code = [0u8; 4];
        platform_code.copy_from_slice(&bytes[0..4]);
        Self {
            platform_code,
            data_space: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            data_length: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            reserved: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            data_offset: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
        }
    }

    /// Serialize the locator entry into 24 wire bytes
    pub fn serialize(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.platform_code);
        bytes[4..8].copy_from_slice(&self.data_space.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.data_length.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.reserved.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
    }

    /// True when the slot is unused
    pub fn is_empty(&self) -> bool {
        self.platform_code == [0u8; 4] || self.data_length == 0
    }
}

/// Encode a parent path for the `MacX` platform slot: UTF-8, NUL-terminated.
pub fn encode_locator_macx(path: &str) -> Vec<u8> {
    let mut out = path.as_bytes().to_vec();
    out.push(0);
    out
}

/// Encode a parent path for the `W2ku`/`W2ru` platform slots: UTF-16-LE with
/// byte-counted NUL termination.
pub fn encode_locator_w2u(path: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((path.len() + 1) * 2);
    for unit in path.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Bytes of locator payload space reserved on disk for an encoding
pub fn locator_data_space(encoded_len: usize) -> u32 {
    bytes_padded(encoded_len as u64) as u32
}

/// VHD dynamic header structure (1024 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicHeader {
    pub cookie: [u8; 8],
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: Uuid,
    pub parent_timestamp: u32,
    pub reserved1: u32,
    /// Parent path, UTF-16-BE code units, NUL padded
    pub parent_unicode_name: [u16; 256],
    pub parent_locators: [ParentLocatorEntry; 8],
}

impl DynamicHeader {
    /// VHD dynamic header cookie value
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";

    /// Size of the VHD dynamic header in bytes
    pub const SIZE: usize = 1024;

    /// Header version 1.0
    pub const VERSION: u32 = 0x0001_0000;

    /// Parse a VHD dynamic header from raw wire bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::bad_request("VHD dynamic header too small"));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);
        if &cookie != Self::COOKIE {
            return Err(Error::bad_request(format!(
                "invalid VHD dynamic header cookie: expected 'cxsparse', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&bytes[40..56]);

        let mut parent_unicode_name = [0u16; 256];
        for (i, unit) in parent_unicode_name.iter_mut().enumerate() {
            let off = 64 + i * 2;
            *unit = u16::from_be_bytes([bytes[off], bytes[off + 1]]);
        }

        let mut parent_locators = [ParentLocatorEntry::default(); 8];
        for (i, entry) in parent_locators.iter_mut().enumerate() {
            let off = 576 + i * ParentLocatorEntry::SIZE;
            *entry = ParentLocatorEntry::parse(&bytes[off..off + ParentLocatorEntry::SIZE]);
        }

        Ok(Self {
            cookie,
            data_offset: u64::from_be_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
            table_offset: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
            header_version: u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            max_table_entries: u32::from_be_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
            block_size: u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]),
            checksum: u32::from_be_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]),
            parent_uuid: Uuid::from_bytes(parent_uuid),
            parent_timestamp: u32::from_be_bytes([bytes[56], bytes[57], bytes[58], bytes[59]]),
            reserved1: u32::from_be_bytes([bytes[60], bytes[61], bytes[62], bytes[63]]),
            parent_unicode_name,
            parent_locators,
        })
    }

    /// Serialize the dynamic header into wire bytes
    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes.fill(0);
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.header_version.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[40..56].copy_from_slice(self.parent_uuid.as_bytes());
        bytes[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        bytes[60..64].copy_from_slice(&self.reserved1.to_be_bytes());

        for (i, unit) in self.parent_unicode_name.iter().enumerate() {
            let off = 64 + i * 2;
            bytes[off..off + 2].copy_from_slice(&unit.to_be_bytes());
        }

        for (i, entry) in self.parent_locators.iter().enumerate() {
            let off = 576 + i * ParentLocatorEntry::SIZE;
            entry.serialize(&mut bytes[off..off + ParentLocatorEntry::SIZE]);
        }
    }

    /// Compute the checksum: one's complement of the byte sum with the
    /// checksum field zeroed.
    pub fn compute_checksum(&self) -> u32 {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        bytes[36..40].fill(0);

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

    /// Validate a parsed header: version, checksum, sane block size.
    pub fn validate(&self) -> Result<()> {
        if self.header_version != Self::VERSION {
            return Err(Error::bad_request(format!(
                "unsupported VHD header version: {:#010x}",
                self.header_version
            )));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::bad_request(format!(
                "VHD block size {} is not a power of two",
                self.block_size
            )));
        }
        if !self.verify_checksum() {
            return Err(Error::bad_request("VHD header checksum mismatch"));
        }
        Ok(())
    }

    /// Store the parent path as UTF-16-BE, NUL padded
    pub fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > self.parent_unicode_name.len() {
            return Err(Error::bad_request("parent path too long for VHD header"));
        }
        self.parent_unicode_name.fill(0);
        self.parent_unicode_name[..units.len()].copy_from_slice(&units);
        Ok(())
    }

    /// The parent path, decoded from the unicode name field
    pub fn parent_name(&self) -> Option<String> {
        let end = self
            .parent_unicode_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.parent_unicode_name.len());
        if end == 0 {
            return None;
        }
        String::from_utf16(&self.parent_unicode_name[..end]).ok()
    }

    /// The locator slots that are populated
    pub fn active_locators(&self) -> impl Iterator<Item = &ParentLocatorEntry> {
        self.parent_locators.iter().filter(|e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> DynamicHeader {
        let mut header = DynamicHeader {
            cookie: *DynamicHeader::COOKIE,
            data_offset: u64::MAX,
            table_offset: 1536,
            header_version: DynamicHeader::VERSION,
            max_table_entries: 2,
            block_size: 2 * 1024 * 1024,
            checksum: 0,
            parent_uuid: Uuid::nil(),
            parent_timestamp: 0,
            reserved1: 0,
            parent_unicode_name: [0u16; 256],
            parent_locators: [ParentLocatorEntry::default(); 8],
        };
        header.update_checksum();
        header
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = sample_header();
        header.parent_uuid = Uuid::from_u128(0x6ba7_b810_9dad_11d1_80b4_00c0_4fd4_30c8);
        header.set_parent_name("/vhd/base.vhd").unwrap();
        header.parent_locators[0] = ParentLocatorEntry {
            platform_code: *ParentLocatorEntry::PLATFORM_MACX,
            data_space: 512,
            data_length: 14,
            reserved: 0,
            data_offset: 3072,
        };
        header.update_checksum();

        let mut bytes = [0u8; DynamicHeader::SIZE];
        header.serialize(&mut bytes);
        let parsed = DynamicHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        parsed.validate().unwrap();
        assert_eq!(parsed.parent_name().as_deref(), Some("/vhd/base.vhd"));
        assert_eq!(parsed.active_locators().count(), 1);
    }

    #[test]
    fn test_header_rejects_bad_cookie() {
        let mut bytes = [0u8; DynamicHeader::SIZE];
        sample_header().serialize(&mut bytes);
        bytes[0..8].copy_from_slice(b"notvalid");
        assert!(DynamicHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_header_checksum_detects_corruption() {
        let mut bytes = [0u8; DynamicHeader::SIZE];
        sample_header().serialize(&mut bytes);
        bytes[32] ^= 0xFF; // flip a block_size byte (keeps it a power of two? no matter)

        let parsed = DynamicHeader::parse(&bytes).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_header_rejects_bad_block_size() {
        let mut header = sample_header();
        header.block_size = 3 * 1024 * 1024;
        header.update_checksum();
        assert!(header.validate().is_err());

        header.block_size = 0;
        header.update_checksum();
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_locator_encodings() {
        let macx = encode_locator_macx("/vhd/base.vhd");
        assert_eq!(macx.len(), 14);
        assert_eq!(macx[13], 0);
        assert_eq!(&macx[..13], b"/vhd/base.vhd");

        let w2u = encode_locator_w2u("/vhd/base.vhd");
        assert_eq!(w2u.len(), 28); // 13 chars + NUL, 2 bytes each
        assert_eq!(&w2u[0..2], &[b'/', 0]); // little-endian code units
        assert_eq!(&w2u[26..28], &[0, 0]);

        assert_eq!(locator_data_space(14), 512);
        assert_eq!(locator_data_space(513), 1024);
    }

    #[test]
    fn test_locator_entry_round_trip() {
        let entry = ParentLocatorEntry {
            platform_code: *ParentLocatorEntry::PLATFORM_W2KU,
            data_space: 1024,
            data_length: 600,
            reserved: 0,
            data_offset: 0x1_0000,
        };
        let mut bytes = [0u8; ParentLocatorEntry::SIZE];
        entry.serialize(&mut bytes);
        assert_eq!(ParentLocatorEntry::parse(&bytes), entry);
        assert!(!entry.is_empty());
        assert!(ParentLocatorEntry::default().is_empty());
    }
}
