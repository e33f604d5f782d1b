//! Sectors and the sparse in-memory sector index.
//!
//! Sector payloads are materialized lazily from the backing stream; a sector
//! whose bytes were never touched costs only its bookkeeping slot. The index
//! grows in fixed-size slices so that large files never force a single giant
//! reallocation.

use crate::consts::RANGE_LOCK_SECTOR_ID;
use crate::error::Result;
use std::io::{Read, Seek, SeekFrom};

/// Number of sector slots per index slice.
const SLICE_LEN: usize = 4096;

/// Role of a sector within the file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorKind {
    /// Stream payload data
    Normal,
    /// Backing sector of the mini stream
    Mini,
    /// Holds FAT entries
    Fat,
    /// Holds DIFAT entries
    Difat,
    /// Holds directory records
    Directory,
    /// Reserved placeholder covering the v4 range-lock offset
    RangeLock,
}

/// A fixed-size block of the file, addressed by its position in the index.
#[derive(Debug)]
pub struct Sector {
    payload: Option<Vec<u8>>,
    dirty: bool,
    kind: SectorKind,
}

impl Sector {
    fn unloaded(kind: SectorKind) -> Self {
        Sector { payload: None, dirty: false, kind }
    }

    /// Whether this sector must be rewritten on commit.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The sector's role tag.
    pub fn kind(&self) -> SectorKind {
        self.kind
    }

    /// The payload bytes, if materialized.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// Sparse index of all sectors in the file, keyed by sector ID.
#[derive(Debug)]
pub struct SectorCollection {
    slices: Vec<Vec<Sector>>,
    sector_size: usize,
    range_lock_installed: bool,
}

impl SectorCollection {
    /// Create an empty collection for the given sector size.
    pub fn new(sector_size: usize) -> Self {
        SectorCollection { slices: Vec::new(), sector_size, range_lock_installed: false }
    }

    /// Create a collection with `count` unloaded slots, as implied by the
    /// length of an existing backing stream.
    pub fn with_len(sector_size: usize, count: usize) -> Self {
        let mut collection = SectorCollection::new(sector_size);
        for _ in 0..count {
            collection.push(SectorKind::Normal);
        }
        // A v4 file already spanning the range-lock offset was laid out by
        // its writer; the reservation exists on disk.
        if sector_size == crate::consts::SECTOR_SIZE_V4
            && count > RANGE_LOCK_SECTOR_ID as usize
        {
            collection.range_lock_installed = true;
        }
        collection
    }

    /// Number of sector slots.
    pub fn len(&self) -> usize {
        match self.slices.last() {
            Some(last) => (self.slices.len() - 1) * SLICE_LEN + last.len(),
            None => 0,
        }
    }

    /// Whether the collection holds no sectors.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Sector size of every sector in this collection.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Append a new unloaded slot and return its ID.
    pub fn push(&mut self, kind: SectorKind) -> u32 {
        let id = self.len() as u32;
        match self.slices.last_mut() {
            Some(last) if last.len() < SLICE_LEN => last.push(Sector::unloaded(kind)),
            _ => {
                let mut slice = Vec::with_capacity(SLICE_LEN);
                slice.push(Sector::unloaded(kind));
                self.slices.push(slice);
            }
        }
        if kind == SectorKind::RangeLock {
            self.range_lock_installed = true;
        }
        id
    }

    /// Borrow a sector slot.
    pub fn get(&self, id: u32) -> Option<&Sector> {
        let idx = id as usize;
        self.slices.get(idx / SLICE_LEN)?.get(idx % SLICE_LEN)
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut Sector> {
        let idx = id as usize;
        self.slices.get_mut(idx / SLICE_LEN)?.get_mut(idx % SLICE_LEN)
    }

    /// Mark a sector for rewrite on the next commit.
    pub fn set_dirty(&mut self, id: u32) {
        if let Some(sector) = self.get_mut(id) {
            sector.dirty = true;
        }
    }

    /// Clear a sector's dirty flag after its bytes reached the stream.
    pub fn clear_dirty(&mut self, id: u32) {
        if let Some(sector) = self.get_mut(id) {
            sector.dirty = false;
        }
    }

    /// Re-tag a sector's role.
    pub fn set_kind(&mut self, id: u32, kind: SectorKind) {
        if let Some(sector) = self.get_mut(id) {
            sector.kind = kind;
            if kind == SectorKind::RangeLock {
                self.range_lock_installed = true;
            }
        }
    }

    /// Borrow a sector's payload, reading it from the backing stream on first
    /// access. A sector past the end of the stream materializes as zeroes.
    pub fn payload<F: Read + Seek>(&mut self, id: u32, file: &mut F) -> Result<&mut Vec<u8>> {
        let sector_size = self.sector_size;
        let sector = match self.get_mut(id) {
            Some(sector) => sector,
            None => {
                return Err(crate::error::CfbError::CorruptedFile(format!(
                    "sector {id} out of range"
                )));
            }
        };
        if sector.payload.is_none() {
            let mut buffer = vec![0u8; sector_size];
            let offset = (id as u64 + 1) * sector_size as u64;
            file.seek(SeekFrom::Start(offset))?;
            let mut filled = 0;
            while filled < sector_size {
                let n = file.read(&mut buffer[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            sector.payload = Some(buffer);
        }
        Ok(sector.payload.as_mut().unwrap())
    }

    /// Install `bytes` as the sector's payload without touching the backing
    /// stream, marking it dirty. Short buffers are zero-padded.
    pub fn replace_payload(&mut self, id: u32, mut bytes: Vec<u8>, kind: SectorKind) {
        bytes.resize(self.sector_size, 0);
        if let Some(sector) = self.get_mut(id) {
            sector.payload = Some(bytes);
            sector.dirty = true;
            sector.kind = kind;
        }
    }

    /// Reset a recycled slot: zeroed payload, dirty, re-tagged.
    pub fn reset(&mut self, id: u32, kind: SectorKind) {
        let sector_size = self.sector_size;
        if let Some(sector) = self.get_mut(id) {
            sector.payload = Some(vec![0u8; sector_size]);
            sector.dirty = true;
            sector.kind = kind;
        }
    }

    /// Zero a sector's payload in memory and mark it dirty.
    pub fn erase(&mut self, id: u32) {
        self.reset(id, SectorKind::Normal);
    }

    /// True when the next fresh allocation in a v4 file would hand out the
    /// sector that covers the range-lock offset. The allocator must install
    /// the reserved placeholder before continuing.
    pub fn range_lock_pending(&self) -> bool {
        self.sector_size == crate::consts::SECTOR_SIZE_V4
            && !self.range_lock_installed
            && self.len() as u32 == RANGE_LOCK_SECTOR_ID
    }

    /// Whether the range-lock placeholder has been installed.
    pub fn range_lock_installed(&self) -> bool {
        self.range_lock_installed
    }

    /// Iterate over all sectors with their IDs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Sector)> {
        self.slices
            .iter()
            .flatten()
            .enumerate()
            .map(|(id, sector)| (id as u32, sector))
    }

    /// Drop payload buffers of clean sectors to reclaim memory. They will be
    /// re-read from the backing stream on next access.
    pub fn release_clean_payloads(&mut self) {
        for slice in &mut self.slices {
            for sector in slice {
                if !sector.dirty {
                    sector.payload = None;
                }
            }
        }
    }
}
