//! Compound file header codec.
//!
//! The header occupies the first 512 bytes of the file; version 4 files pad
//! the first block out to 4096 bytes with zeroes. All fields are
//! little-endian. The trailing 436 bytes hold the first 109 DIFAT entries.

use crate::config::Version;
use crate::consts::*;
use crate::error::{CfbError, Result};
use zerocopy::{FromBytes, IntoBytes, LE, U16, U32};
use zerocopy_derive::{
    FromBytes as DeriveFromBytes, Immutable as DeriveImmutable, IntoBytes as DeriveIntoBytes,
    KnownLayout as DeriveKnownLayout,
};

/// Raw header structure (512 bytes, on-disk layout).
#[derive(Debug, Clone, DeriveFromBytes, DeriveIntoBytes, DeriveImmutable, DeriveKnownLayout)]
#[repr(C)]
struct RawHeader {
    /// Signature bytes
    signature: [u8; 8],
    /// CLSID (unused, zero)
    clsid: [u8; 16],
    /// Minor version (commonly 0x003E)
    minor_version: U16<LE>,
    /// Major version (3 or 4)
    major_version: U16<LE>,
    /// Byte order marker (0xFFFE, little-endian)
    byte_order: U16<LE>,
    /// Sector shift (9 or 12)
    sector_shift: U16<LE>,
    /// Mini sector shift (always 6)
    mini_sector_shift: U16<LE>,
    /// Reserved, zero
    reserved: [u8; 6],
    /// Directory sector count (zero for version 3)
    num_dir_sectors: U32<LE>,
    /// FAT sector count
    num_fat_sectors: U32<LE>,
    /// First directory sector ID
    first_dir_sector: U32<LE>,
    /// Transaction signature (reserved)
    transaction_signature: U32<LE>,
    /// Mini stream cutoff size
    mini_stream_cutoff: U32<LE>,
    /// First mini-FAT sector ID
    first_minifat_sector: U32<LE>,
    /// Mini-FAT sector count
    num_minifat_sectors: U32<LE>,
    /// First DIFAT sector ID
    first_difat_sector: U32<LE>,
    /// DIFAT sector count
    num_difat_sectors: U32<LE>,
    /// First 109 DIFAT entries (FAT sector IDs, FREESECT-padded)
    difat: [U32<LE>; HEADER_DIFAT_ENTRIES],
}

/// Parsed compound file header.
#[derive(Debug, Clone)]
pub struct Header {
    /// Format version (determines the sector size)
    pub version: Version,
    /// Directory sector count (serialized as zero for version 3)
    pub num_dir_sectors: u32,
    /// FAT sector count
    pub num_fat_sectors: u32,
    /// First directory sector ID
    pub first_dir_sector: u32,
    /// Streams strictly smaller than this live in the mini stream
    pub mini_stream_cutoff: u32,
    /// First mini-FAT sector ID
    pub first_minifat_sector: u32,
    /// Mini-FAT sector count
    pub num_minifat_sectors: u32,
    /// First DIFAT sector ID
    pub first_difat_sector: u32,
    /// DIFAT sector count
    pub num_difat_sectors: u32,
    /// The 109 header DIFAT entries
    pub difat: [u32; HEADER_DIFAT_ENTRIES],
}

impl Header {
    /// A fresh header for an empty file of the given version.
    pub fn new(version: Version) -> Self {
        Header {
            version,
            num_dir_sectors: 0,
            num_fat_sectors: 0,
            first_dir_sector: ENDOFCHAIN,
            mini_stream_cutoff: MINI_STREAM_CUTOFF,
            first_minifat_sector: ENDOFCHAIN,
            num_minifat_sectors: 0,
            first_difat_sector: ENDOFCHAIN,
            num_difat_sectors: 0,
            difat: [FREESECT; HEADER_DIFAT_ENTRIES],
        }
    }

    /// Parse and validate the fixed 512-byte header data.
    pub fn parse(data: &[u8]) -> Result<Header> {
        if data.len() < HEADER_SIZE {
            return Err(CfbError::BadSignature);
        }
        let raw = RawHeader::read_from_bytes(&data[..HEADER_SIZE])
            .map_err(|_| CfbError::CorruptedFile("header block truncated".to_string()))?;

        if &raw.signature != MAGIC {
            return Err(CfbError::BadSignature);
        }
        let major = raw.major_version.get();
        let version =
            Version::from_number(major).ok_or(CfbError::UnsupportedVersion(major))?;
        if raw.byte_order.get() != 0xFFFE {
            return Err(CfbError::CorruptedFile(format!(
                "invalid byte order marker 0x{:04X}",
                raw.byte_order.get()
            )));
        }
        if raw.sector_shift.get() != version.sector_shift() {
            return Err(CfbError::UnsupportedVersion(major));
        }
        if raw.mini_sector_shift.get() != 6 {
            return Err(CfbError::CorruptedFile(format!(
                "invalid mini sector shift {}",
                raw.mini_sector_shift.get()
            )));
        }

        let mut difat = [FREESECT; HEADER_DIFAT_ENTRIES];
        for (slot, value) in difat.iter_mut().zip(raw.difat.iter()) {
            *slot = value.get();
        }

        Ok(Header {
            version,
            num_dir_sectors: raw.num_dir_sectors.get(),
            num_fat_sectors: raw.num_fat_sectors.get(),
            first_dir_sector: raw.first_dir_sector.get(),
            mini_stream_cutoff: raw.mini_stream_cutoff.get(),
            first_minifat_sector: raw.first_minifat_sector.get(),
            num_minifat_sectors: raw.num_minifat_sectors.get(),
            first_difat_sector: raw.first_difat_sector.get(),
            num_difat_sectors: raw.num_difat_sectors.get(),
            difat,
        })
    }

    /// Serialize into a buffer of one sector (512 bytes for v3, 4096 for v4
    /// with the tail zero-filled).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut difat = [U32::<LE>::new(FREESECT); HEADER_DIFAT_ENTRIES];
        for (slot, &value) in difat.iter_mut().zip(self.difat.iter()) {
            *slot = U32::new(value);
        }
        let raw = RawHeader {
            signature: *MAGIC,
            clsid: [0; 16],
            minor_version: U16::new(0x003E),
            major_version: U16::new(self.version.number()),
            byte_order: U16::new(0xFFFE),
            sector_shift: U16::new(self.version.sector_shift()),
            mini_sector_shift: U16::new(6),
            reserved: [0; 6],
            // 512-byte sector files must declare zero directory sectors.
            num_dir_sectors: U32::new(match self.version {
                Version::V3 => 0,
                Version::V4 => self.num_dir_sectors,
            }),
            num_fat_sectors: U32::new(self.num_fat_sectors),
            first_dir_sector: U32::new(self.first_dir_sector),
            transaction_signature: U32::new(0),
            mini_stream_cutoff: U32::new(self.mini_stream_cutoff),
            first_minifat_sector: U32::new(self.first_minifat_sector),
            num_minifat_sectors: U32::new(self.num_minifat_sectors),
            first_difat_sector: U32::new(self.first_difat_sector),
            num_difat_sectors: U32::new(self.num_difat_sectors),
            difat,
        };

        let mut block = vec![0u8; self.version.sector_size()];
        block[..HEADER_SIZE].copy_from_slice(raw.as_bytes());
        block
    }

    /// Sector size implied by the version.
    pub fn sector_size(&self) -> usize {
        self.version.sector_size()
    }
}
