//! Directory repository: the ordered list of 128-byte entries and the
//! red-black sibling trees threaded through them.

/// Directory entry records and name ordering
pub mod entry;

/// Red-black tree over sibling SIDs
pub mod rbtree;

pub use entry::{format_clsid, name_cmp, validate_name, Color, DirEntry, ObjType};
pub use rbtree::RbTree;

use crate::config::Version;
use crate::consts::{DIRENTRY_SIZE, NOSTREAM};
use crate::error::{CfbError, Result};

/// SID of the root entry.
pub const ROOT_SID: u32 = 0;

/// All directory entries, indexed by SID. Entry 0 is the root. Invalid
/// entries pad the last directory sector and are recycled on insert.
#[derive(Debug)]
pub struct Directory {
    entries: Vec<DirEntry>,
    free_slots: Vec<u32>,
}

impl Directory {
    /// A directory holding only a fresh root entry.
    pub fn new() -> Directory {
        Directory { entries: vec![DirEntry::empty_root()], free_slots: Vec::new() }
    }

    /// Wrap entries loaded from the directory chain.
    pub fn from_entries(entries: Vec<DirEntry>) -> Result<Directory> {
        match entries.first() {
            Some(root) if root.obj_type == ObjType::Root => {}
            _ => {
                return Err(CfbError::CorruptedFile(
                    "directory has no root entry at SID 0".to_string(),
                ));
            }
        }
        let free_slots = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_valid())
            .map(|(sid, _)| sid as u32)
            .collect();
        Ok(Directory { entries, free_slots })
    }

    /// Number of entry slots (including invalid padding).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the repository holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The root entry.
    pub fn root(&self) -> &DirEntry {
        &self.entries[ROOT_SID as usize]
    }

    /// The root entry, mutably.
    pub fn root_mut(&mut self) -> &mut DirEntry {
        &mut self.entries[ROOT_SID as usize]
    }

    /// Borrow an entry slot by SID.
    pub fn get(&self, sid: u32) -> Option<&DirEntry> {
        self.entries.get(sid as usize)
    }

    /// Borrow an entry slot mutably.
    pub fn get_mut(&mut self, sid: u32) -> Option<&mut DirEntry> {
        self.entries.get_mut(sid as usize)
    }

    /// Borrow a live entry, failing on out-of-range or invalid SIDs.
    pub fn entry(&self, sid: u32) -> Result<&DirEntry> {
        match self.get(sid) {
            Some(entry) if entry.is_valid() => Ok(entry),
            _ => Err(CfbError::CorruptedFile(format!(
                "SID {sid} does not reference a live directory entry"
            ))),
        }
    }

    /// Borrow a live entry mutably.
    pub fn entry_mut(&mut self, sid: u32) -> Result<&mut DirEntry> {
        match self.get_mut(sid) {
            Some(entry) if entry.is_valid() => Ok(entry),
            _ => Err(CfbError::CorruptedFile(format!(
                "SID {sid} does not reference a live directory entry"
            ))),
        }
    }

    /// Insert an entry, preferring a recycled invalid slot over growing the
    /// list. Returns the assigned SID.
    pub fn insert(&mut self, entry: DirEntry) -> u32 {
        while let Some(sid) = self.free_slots.pop() {
            if let Some(slot) = self.entries.get_mut(sid as usize) {
                if !slot.is_valid() {
                    *slot = entry;
                    return sid;
                }
            }
        }
        let sid = self.entries.len() as u32;
        self.entries.push(entry);
        sid
    }

    /// Mark an entry invalid and make its slot recyclable.
    pub fn remove(&mut self, sid: u32) {
        if let Some(slot) = self.entries.get_mut(sid as usize) {
            *slot = DirEntry::invalid();
            self.free_slots.push(sid);
        }
    }

    /// Iterate over all slots with their SIDs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &DirEntry)> {
        self.entries.iter().enumerate().map(|(sid, e)| (sid as u32, e))
    }

    /// Serialize every record, padding with invalid records up to a sector
    /// boundary.
    pub fn to_stream_bytes(&self, version: Version, sector_size: usize) -> Vec<u8> {
        let per_sector = sector_size / DIRENTRY_SIZE;
        let padded = self.entries.len().div_ceil(per_sector) * per_sector;
        let mut data = Vec::with_capacity(padded * DIRENTRY_SIZE);
        for entry in &self.entries {
            data.extend_from_slice(&entry.to_bytes(version));
        }
        let filler = DirEntry::invalid().to_bytes(version);
        for _ in self.entries.len()..padded {
            data.extend_from_slice(&filler);
        }
        data
    }
}

impl Default for Directory {
    fn default() -> Self {
        Directory::new()
    }
}

/// Detach an entry's tree links before it is inserted into a sibling tree.
pub(crate) fn reset_links(entry: &mut DirEntry) {
    entry.left = NOSTREAM;
    entry.right = NOSTREAM;
    entry.color = Color::Black;
}
