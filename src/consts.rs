/// Magic bytes at the start of every compound file
pub const MAGIC: &[u8; 8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

/// Size of the fixed header data (the v4 header block is this, zero-padded to 4096)
pub const HEADER_SIZE: usize = 512;

/// Minimal size of an empty compound file with 512-byte sectors
pub const MINIMAL_FILE_SIZE: usize = 1536;

/// Size of a directory entry in bytes
pub const DIRENTRY_SIZE: usize = 128;

/// Sector size for version 3 (512 bytes)
pub const SECTOR_SIZE_V3: usize = 512;

/// Sector size for version 4 (4096 bytes)
pub const SECTOR_SIZE_V4: usize = 4096;

/// Mini sector size (64 bytes, both versions)
pub const MINI_SECTOR_SIZE: usize = 64;

/// Default boundary below which streams live in the mini stream
pub const MINI_STREAM_CUTOFF: u32 = 4096;

/// Number of DIFAT entries carried directly in the header
pub const HEADER_DIFAT_ENTRIES: usize = 109;

// Sector IDs (from AAF specifications)
/// Maximum regular sector ID
pub const MAXREGSECT: u32 = 0xFFFFFFFA; // -6
/// Denotes a DIFAT sector in a FAT
pub const DIFSECT: u32 = 0xFFFFFFFC; // -4
/// Denotes a FAT sector in a FAT
pub const FATSECT: u32 = 0xFFFFFFFD; // -3
/// End of a virtual stream chain
pub const ENDOFCHAIN: u32 = 0xFFFFFFFE; // -2
/// Unallocated sector
pub const FREESECT: u32 = 0xFFFFFFFF; // -1

/// Placeholder ID for a sector that has been reserved in a chain but not yet
/// assigned a slot in the collection. Never valid on disk.
pub(crate) const PENDING_SECT: u32 = 0xFFFFFFFB; // -5

// Directory entry IDs
/// Maximum directory entry ID
pub const MAXREGSID: u32 = 0xFFFFFFFA; // -6
/// Unallocated directory entry reference
pub const NOSTREAM: u32 = 0xFFFFFFFF; // -1

/// File offset of the v4 range-lock region
pub const RANGE_LOCK_OFFSET: u64 = 0x7FFF_FF00;

/// ID of the v4 sector that contains the range-lock offset
pub const RANGE_LOCK_SECTOR_ID: u32 = (RANGE_LOCK_OFFSET / SECTOR_SIZE_V4 as u64 - 1) as u32;

/// Characters that may not appear in storage or stream names
pub const FORBIDDEN_NAME_CHARS: [char; 4] = ['\\', '/', ':', '!'];

/// Maximum name length in UTF-16 code units, excluding the terminator
pub const MAX_NAME_UNITS: usize = 31;
