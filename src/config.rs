//! Engine configuration: format version, open mode, and behavior flags.

use crate::consts::{SECTOR_SIZE_V3, SECTOR_SIZE_V4};

bitflags::bitflags! {
    /// Behavior flags for a compound file session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Config: u32 {
        /// Scan the allocation tables for free sectors and reuse them before
        /// growing the file. Slower for append-only workloads, keeps file
        /// size stable across edit cycles.
        const SECTOR_RECYCLE = 0b0001;
        /// Zero sector payloads when their chain is released.
        const ERASE_FREE_SECTORS = 0b0010;
        /// Skip suspicious directory siblings during load instead of
        /// failing with a corruption error. Read-only traversal of the
        /// intact portion keeps working.
        const NO_VALIDATION_EXCEPTION = 0b0100;
        /// Keep ownership of the backing stream with the caller; `close`
        /// hands it back instead of dropping it.
        const LEAVE_OPEN = 0b1000;
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::empty()
    }
}

/// Compound file format version. Determines the sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Major version 3: 512-byte sectors, 32-bit stream sizes
    V3,
    /// Major version 4: 4096-byte sectors, 64-bit stream sizes
    V4,
}

impl Version {
    /// Sector size in bytes for this version.
    pub fn sector_size(self) -> usize {
        match self {
            Version::V3 => SECTOR_SIZE_V3,
            Version::V4 => SECTOR_SIZE_V4,
        }
    }

    /// The header's sector-shift value (sector_size == 1 << shift).
    pub fn sector_shift(self) -> u16 {
        match self {
            Version::V3 => 9,
            Version::V4 => 12,
        }
    }

    /// The on-disk major version number.
    pub fn number(self) -> u16 {
        match self {
            Version::V3 => 3,
            Version::V4 => 4,
        }
    }

    pub(crate) fn from_number(major: u16) -> Option<Version> {
        match major {
            3 => Some(Version::V3),
            4 => Some(Version::V4),
            _ => None,
        }
    }
}

/// How the compound file was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Mutations stay in memory; `commit` is rejected. `save_to` still works.
    ReadOnly,
    /// `commit` writes dirty sectors back to the backing stream.
    Update,
}
