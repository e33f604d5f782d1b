//! Directory entry records.
//!
//! Each entry is a fixed 128-byte record: UTF-16LE name, object type,
//! red-black color, sibling/child SIDs, CLSID, timestamps, and the location
//! and length of the associated byte payload.

use crate::config::Version;
use crate::consts::*;
use crate::error::{CfbError, Result};
use smallvec::SmallVec;
use std::cmp::Ordering;
use zerocopy::{FromBytes, IntoBytes, LE, U16, U32, U64};
use zerocopy_derive::{
    FromBytes as DeriveFromBytes, Immutable as DeriveImmutable, IntoBytes as DeriveIntoBytes,
    KnownLayout as DeriveKnownLayout,
};

/// Raw directory entry structure (128 bytes, on-disk layout).
#[derive(Debug, Clone, DeriveFromBytes, DeriveIntoBytes, DeriveImmutable, DeriveKnownLayout)]
#[repr(C)]
struct RawDirEntry {
    /// Entry name in UTF-16LE (64 bytes, null-padded)
    name: [u8; 64],
    /// Length of name in bytes (including null terminator)
    name_len: U16<LE>,
    /// Entry type (0 = invalid, 1 = storage, 2 = stream, 5 = root)
    entry_type: u8,
    /// Node color (0 = red, 1 = black)
    color: u8,
    /// Left sibling SID
    sid_left: U32<LE>,
    /// Right sibling SID
    sid_right: U32<LE>,
    /// Child SID
    sid_child: U32<LE>,
    /// CLSID (16 bytes)
    clsid: [u8; 16],
    /// State bits
    state_bits: U32<LE>,
    /// Creation time (FILETIME)
    creation_time: U64<LE>,
    /// Modified time (FILETIME)
    modified_time: U64<LE>,
    /// Starting sector
    start_sector: U32<LE>,
    /// Stream size
    stream_size: U64<LE>,
}

/// Object type stored in a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    /// Unallocated / recyclable slot
    Invalid,
    /// A storage (directory of further entries)
    Storage,
    /// A stream (byte payload)
    Stream,
    /// The root storage, owner of the mini stream
    Root,
}

impl ObjType {
    fn from_byte(byte: u8) -> Option<ObjType> {
        match byte {
            0 => Some(ObjType::Invalid),
            1 => Some(ObjType::Storage),
            2 => Some(ObjType::Stream),
            5 => Some(ObjType::Root),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            ObjType::Invalid => 0,
            ObjType::Storage => 1,
            ObjType::Stream => 2,
            ObjType::Root => 5,
        }
    }
}

/// Red-black node color, persisted in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Red node
    Red,
    /// Black node
    Black,
}

/// A parsed directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name (UTF-16 decoded)
    pub name: String,
    /// Object type
    pub obj_type: ObjType,
    /// Red-black color of this node among its siblings
    pub color: Color,
    /// Left sibling SID
    pub left: u32,
    /// Right sibling SID
    pub right: u32,
    /// SID of the root of this entry's children tree
    pub child: u32,
    /// Storage CLSID
    pub clsid: [u8; 16],
    /// User-defined state bits
    pub state_bits: u32,
    /// Creation time (FILETIME ticks)
    pub creation_time: u64,
    /// Modification time (FILETIME ticks)
    pub modified_time: u64,
    /// First sector of the payload, ENDOFCHAIN when empty
    pub start_sector: u32,
    /// Payload length in bytes
    pub size: u64,
}

impl DirEntry {
    /// The root entry of a fresh file.
    pub fn empty_root() -> DirEntry {
        DirEntry {
            name: "Root Entry".to_string(),
            obj_type: ObjType::Root,
            color: Color::Black,
            left: NOSTREAM,
            right: NOSTREAM,
            child: NOSTREAM,
            clsid: [0; 16],
            state_bits: 0,
            creation_time: 0,
            modified_time: 0,
            start_sector: ENDOFCHAIN,
            size: 0,
        }
    }

    /// An unallocated record (used for padding and recycled slots).
    pub fn invalid() -> DirEntry {
        DirEntry {
            name: String::new(),
            obj_type: ObjType::Invalid,
            color: Color::Black,
            left: NOSTREAM,
            right: NOSTREAM,
            child: NOSTREAM,
            clsid: [0; 16],
            state_bits: 0,
            creation_time: 0,
            modified_time: 0,
            start_sector: ENDOFCHAIN,
            size: 0,
        }
    }

    /// A new empty stream entry.
    pub fn new_stream(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            obj_type: ObjType::Stream,
            ..DirEntry::invalid()
        }
    }

    /// A new storage entry stamped with the given creation time.
    pub fn new_storage(name: &str, now: u64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            obj_type: ObjType::Storage,
            creation_time: now,
            modified_time: now,
            ..DirEntry::invalid()
        }
    }

    /// Whether this slot holds a live entry.
    pub fn is_valid(&self) -> bool {
        self.obj_type != ObjType::Invalid
    }

    /// Parse a 128-byte record.
    ///
    /// With `strict` set, malformed type or color bytes fail with
    /// `CorruptedFile`; otherwise the record degrades to an invalid slot
    /// (bad type) or black color.
    pub fn parse(data: &[u8], version: Version, strict: bool) -> Result<DirEntry> {
        if data.len() < DIRENTRY_SIZE {
            return Err(CfbError::CorruptedFile(
                "directory record truncated".to_string(),
            ));
        }
        let raw = RawDirEntry::read_from_bytes(&data[..DIRENTRY_SIZE])
            .map_err(|_| CfbError::CorruptedFile("directory record truncated".to_string()))?;

        let obj_type = match ObjType::from_byte(raw.entry_type) {
            Some(t) => t,
            None if strict => {
                return Err(CfbError::CorruptedFile(format!(
                    "invalid directory entry type {}",
                    raw.entry_type
                )));
            }
            None => ObjType::Invalid,
        };
        let color = match raw.color {
            0 => Color::Red,
            1 => Color::Black,
            _ if strict => {
                return Err(CfbError::CorruptedFile(format!(
                    "invalid node color {}",
                    raw.color
                )));
            }
            _ => Color::Black,
        };

        let name_len = (raw.name_len.get() as usize).min(64);
        let name_bytes = &raw.name[..name_len.saturating_sub(2)];
        let units: Vec<u16> = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let name = String::from_utf16_lossy(&units)
            .trim_end_matches('\0')
            .to_string();

        // Version 3 files only use the low dword of the size field; the high
        // half may carry garbage and must be masked.
        let size = match version {
            Version::V3 => raw.stream_size.get() & 0xFFFF_FFFF,
            Version::V4 => raw.stream_size.get(),
        };

        Ok(DirEntry {
            name,
            obj_type,
            color,
            left: raw.sid_left.get(),
            right: raw.sid_right.get(),
            child: raw.sid_child.get(),
            clsid: raw.clsid,
            state_bits: raw.state_bits.get(),
            creation_time: raw.creation_time.get(),
            modified_time: raw.modified_time.get(),
            start_sector: raw.start_sector.get(),
            size,
        })
    }

    /// Serialize as a 128-byte record.
    pub fn to_bytes(&self, version: Version) -> [u8; DIRENTRY_SIZE] {
        let mut name = [0u8; 64];
        let mut name_len = 0u16;
        if self.is_valid() {
            let units: SmallVec<[u16; 32]> =
                self.name.encode_utf16().take(MAX_NAME_UNITS).collect();
            for (i, &unit) in units.iter().enumerate() {
                name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            }
            name_len = (units.len() as u16 + 1) * 2;
        }

        let size = match version {
            Version::V3 => self.size & 0xFFFF_FFFF,
            Version::V4 => self.size,
        };

        let raw = RawDirEntry {
            name,
            name_len: U16::new(name_len),
            entry_type: self.obj_type.to_byte(),
            color: match self.color {
                Color::Red => 0,
                Color::Black => 1,
            },
            sid_left: U32::new(self.left),
            sid_right: U32::new(self.right),
            sid_child: U32::new(self.child),
            clsid: self.clsid,
            state_bits: U32::new(self.state_bits),
            creation_time: U64::new(self.creation_time),
            modified_time: U64::new(self.modified_time),
            start_sector: U32::new(self.start_sector),
            stream_size: U64::new(size),
        };

        let mut out = [0u8; DIRENTRY_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }
}

/// Validate a caller-supplied storage or stream name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CfbError::InvalidArgument("name must not be empty"));
    }
    if name.encode_utf16().count() > MAX_NAME_UNITS {
        return Err(CfbError::InvalidArgument(
            "name longer than 31 UTF-16 units",
        ));
    }
    if name.chars().any(|c| FORBIDDEN_NAME_CHARS.contains(&c)) {
        return Err(CfbError::InvalidArgument(
            "name contains a forbidden character (\\ / : !)",
        ));
    }
    Ok(())
}

/// Order two entry names: shorter names sort first; equal lengths compare
/// UTF-16 code units after ASCII uppercasing. The uppercasing is invariant
/// across locales.
pub fn name_cmp(a: &str, b: &str) -> Ordering {
    let a_units: SmallVec<[u16; 32]> = a.encode_utf16().collect();
    let b_units: SmallVec<[u16; 32]> = b.encode_utf16().collect();
    match a_units.len().cmp(&b_units.len()) {
        Ordering::Equal => {}
        other => return other,
    }
    for (&x, &y) in a_units.iter().zip(b_units.iter()) {
        match upper_invariant(x).cmp(&upper_invariant(y)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn upper_invariant(unit: u16) -> u16 {
    if (b'a' as u16..=b'z' as u16).contains(&unit) {
        unit - 32
    } else {
        unit
    }
}

/// Format a CLSID as `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`, or an empty
/// string for the nil CLSID.
pub fn format_clsid(bytes: &[u8; 16]) -> String {
    if bytes.iter().all(|&b| b == 0) {
        return String::new();
    }
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
        u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
        bytes[8],
        bytes[9],
        bytes[10],
        bytes[11],
        bytes[12],
        bytes[13],
        bytes[14],
        bytes[15],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let mut entry = DirEntry::new_stream("MyStream");
        entry.start_sector = 12;
        entry.size = 4500;
        entry.color = Color::Red;

        let bytes = entry.to_bytes(Version::V3);
        assert_eq!(bytes.len(), DIRENTRY_SIZE);

        let parsed = DirEntry::parse(&bytes, Version::V3, true).unwrap();
        assert_eq!(parsed.name, "MyStream");
        assert_eq!(parsed.obj_type, ObjType::Stream);
        assert_eq!(parsed.color, Color::Red);
        assert_eq!(parsed.start_sector, 12);
        assert_eq!(parsed.size, 4500);
    }

    #[test]
    fn test_name_length_includes_terminator() {
        let entry = DirEntry::new_stream("AB");
        let bytes = entry.to_bytes(Version::V3);
        assert_eq!(u16::from_le_bytes([bytes[64], bytes[65]]), 6);
        assert_eq!(bytes[0], b'A');
        assert_eq!(bytes[1], 0);
        assert_eq!(bytes[2], b'B');
    }

    #[test]
    fn test_v3_size_high_dword_masked() {
        let mut entry = DirEntry::new_stream("S");
        entry.size = 100;
        let mut bytes = entry.to_bytes(Version::V3);
        // Poison the high dword, as seen in real v3 files.
        bytes[124..128].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let parsed = DirEntry::parse(&bytes, Version::V3, true).unwrap();
        assert_eq!(parsed.size, 100);
        // V4 takes the full quadword.
        let parsed = DirEntry::parse(&bytes, Version::V4, true).unwrap();
        assert_eq!(parsed.size, 0xDEADBEEF_00000064);
    }

    #[test]
    fn test_bad_type_byte() {
        let mut bytes = DirEntry::new_stream("S").to_bytes(Version::V3);
        bytes[66] = 9;
        assert!(DirEntry::parse(&bytes, Version::V3, true).is_err());
        let lenient = DirEntry::parse(&bytes, Version::V3, false).unwrap();
        assert_eq!(lenient.obj_type, ObjType::Invalid);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Workbook").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(32)).is_err());
        assert!(validate_name(&"x".repeat(31)).is_ok());
        for bad in ["a\\b", "a/b", "a:b", "a!b"] {
            assert!(validate_name(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_name_ordering_length_first() {
        assert_eq!(name_cmp("Data", "1Table"), Ordering::Less);
        assert_eq!(name_cmp("1Table", "WordDocument"), Ordering::Less);
        assert_eq!(name_cmp("abc", "ABD"), Ordering::Less);
        assert_eq!(name_cmp("abc", "ABC"), Ordering::Equal);
        assert_eq!(name_cmp("b", "A"), Ordering::Greater);
    }

    #[test]
    fn test_name_ordering_is_ascii_invariant() {
        // Non-ASCII units compare by raw code unit; no locale tables.
        assert_eq!(name_cmp("é", "z"), Ordering::Greater);
        assert_eq!(name_cmp("é", "é"), Ordering::Equal);
    }

    #[test]
    fn test_format_clsid() {
        assert_eq!(format_clsid(&[0; 16]), "");
        let word = [
            0x06, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x46,
        ];
        assert_eq!(format_clsid(&word), "00020906-0000-0000-C000-000000000046");
    }
}
