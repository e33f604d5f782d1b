//! FAT, mini-FAT and DIFAT management.
//!
//! Chains are encoded in allocation tables: `table[id]` holds the ID of the
//! next sector in the chain, or `ENDOFCHAIN` for the tail. The FAT itself is
//! located through the DIFAT (109 entries in the header, extended through
//! self-chained DIFAT sectors). Both tables are mirrored in memory and
//! serialized back into sectors when the file is persisted.

use crate::consts::*;
use crate::error::{CfbError, Result};
use crate::header::Header;
use crate::sector::{SectorCollection, SectorKind};
use std::collections::{HashSet, VecDeque};

/// The main allocation table plus the location of its own sectors.
#[derive(Debug, Default)]
pub struct Fat {
    /// Next-sector entry per sector ID
    entries: Vec<u32>,
    /// IDs of the sectors holding the FAT, in DIFAT order
    sector_ids: Vec<u32>,
    /// IDs of the DIFAT sectors, in chain order
    difat_sector_ids: Vec<u32>,
    /// Recycled sector IDs handed out before fresh ones
    free: VecDeque<u32>,
}

impl Fat {
    /// Build the in-memory mirror from loaded table data.
    pub fn from_loaded(entries: Vec<u32>, sector_ids: Vec<u32>, difat_sector_ids: Vec<u32>) -> Self {
        Fat { entries, sector_ids, difat_sector_ids, free: VecDeque::new() }
    }

    /// The raw table.
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// IDs of the sectors holding the FAT.
    pub fn sector_ids(&self) -> &[u32] {
        &self.sector_ids
    }

    /// IDs of the DIFAT sectors.
    pub fn difat_sector_ids(&self) -> &[u32] {
        &self.difat_sector_ids
    }

    /// Entry for `id`, FREESECT when out of range.
    pub fn get(&self, id: u32) -> u32 {
        self.entries.get(id as usize).copied().unwrap_or(FREESECT)
    }

    /// Set the entry for `id`, growing the table as needed.
    pub fn set(&mut self, id: u32, value: u32) {
        let idx = id as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, FREESECT);
        }
        self.entries[idx] = value;
    }

    fn ensure_len(&mut self, len: usize) {
        if self.entries.len() < len {
            self.entries.resize(len, FREESECT);
        }
    }

    /// Follow a chain from `head` until ENDOFCHAIN, rejecting reserved IDs,
    /// out-of-range IDs and revisits.
    pub fn chain(&self, head: u32) -> Result<Vec<u32>> {
        if head == ENDOFCHAIN {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut current = head;
        while current != ENDOFCHAIN {
            if current > MAXREGSECT {
                return Err(CfbError::CorruptedFile(format!(
                    "chain refers to reserved sector ID 0x{current:08X}"
                )));
            }
            if current as usize >= self.entries.len() {
                return Err(CfbError::CorruptedFile(format!(
                    "chain refers to sector {current} beyond table length {}",
                    self.entries.len()
                )));
            }
            if !seen.insert(current) {
                return Err(CfbError::CorruptedFile(format!(
                    "cyclic chain revisits sector {current}"
                )));
            }
            ids.push(current);
            current = self.entries[current as usize];
        }
        Ok(ids)
    }

    /// Hand a fresh slot out of the collection, installing the v4 range-lock
    /// placeholder first when the allocation would cross it.
    fn fresh(&mut self, sectors: &mut SectorCollection, kind: SectorKind) -> u32 {
        if sectors.range_lock_pending() {
            let lock_id = sectors.push(SectorKind::RangeLock);
            self.set(lock_id, ENDOFCHAIN);
            log::debug!("installed range-lock sector {lock_id}");
        }
        let id = sectors.push(kind);
        self.ensure_len(sectors.len());
        id
    }

    /// Pop a recycled sector whose entry is still free, resetting its slot.
    fn take_free(&mut self, sectors: &mut SectorCollection, kind: SectorKind) -> Option<u32> {
        while let Some(id) = self.free.pop_front() {
            if self.get(id) == FREESECT && (id as usize) < sectors.len() {
                sectors.reset(id, kind);
                return Some(id);
            }
        }
        None
    }

    /// Give placeholder entries in `chain` real sector IDs (recycled ones
    /// first), then thread the FAT links for the whole chain.
    pub fn allocate_chain(
        &mut self,
        chain: &mut [u32],
        sectors: &mut SectorCollection,
        kind: SectorKind,
    ) {
        for slot in chain.iter_mut() {
            if *slot == PENDING_SECT {
                *slot = match self.take_free(sectors, kind) {
                    Some(id) => id,
                    None => self.fresh(sectors, kind),
                };
            }
        }
        for i in 0..chain.len() {
            let next = if i + 1 < chain.len() { chain[i + 1] } else { ENDOFCHAIN };
            self.set(chain[i], next);
        }
    }

    /// Release every sector of the chain headed by `head`. Returns the freed
    /// IDs so the caller can erase payloads or recycle them.
    pub fn free_chain(&mut self, head: u32) -> Result<Vec<u32>> {
        let ids = self.chain(head)?;
        for &id in &ids {
            self.set(id, FREESECT);
        }
        Ok(ids)
    }

    /// Release the chain's sectors from index `keep` onward, writing the new
    /// tail's ENDOFCHAIN. Returns the freed IDs.
    pub fn free_tail(&mut self, chain: &[u32], keep: usize) -> Vec<u32> {
        let freed: Vec<u32> = chain[keep.min(chain.len())..].to_vec();
        for &id in &freed {
            self.set(id, FREESECT);
        }
        if keep > 0 && keep <= chain.len() {
            self.set(chain[keep - 1], ENDOFCHAIN);
        }
        freed
    }

    /// Queue IDs for reuse by later allocations.
    pub fn recycle(&mut self, ids: &[u32]) {
        self.free.extend(ids.iter().copied());
    }

    /// Scan the table for free entries and queue them for reuse.
    pub fn scan_free(&mut self, sector_count: usize) {
        self.free.clear();
        for id in 0..sector_count.min(self.entries.len()) {
            if self.entries[id] == FREESECT {
                self.free.push_back(id as u32);
            }
        }
    }

    /// Serialize the table into its sectors and re-thread the DIFAT,
    /// allocating FAT/DIFAT sectors until the table covers every sector in
    /// the collection (including the sectors the table itself occupies).
    /// Updates the header's FAT and DIFAT fields.
    pub fn persist(&mut self, sectors: &mut SectorCollection, header: &mut Header) {
        let sector_size = sectors.sector_size();
        let entries_per_sector = sector_size / 4;
        let ids_per_difat_sector = entries_per_sector - 1;

        loop {
            self.ensure_len(sectors.len());
            let needed_fat = sectors.len().div_ceil(entries_per_sector);
            if self.sector_ids.len() < needed_fat {
                let id = match self.take_free(sectors, SectorKind::Fat) {
                    Some(id) => id,
                    None => self.fresh(sectors, SectorKind::Fat),
                };
                self.set(id, FATSECT);
                self.sector_ids.push(id);
                continue;
            }
            let needed_difat = if self.sector_ids.len() > HEADER_DIFAT_ENTRIES {
                (self.sector_ids.len() - HEADER_DIFAT_ENTRIES).div_ceil(ids_per_difat_sector)
            } else {
                0
            };
            if self.difat_sector_ids.len() < needed_difat {
                let id = match self.take_free(sectors, SectorKind::Difat) {
                    Some(id) => id,
                    None => self.fresh(sectors, SectorKind::Difat),
                };
                self.set(id, DIFSECT);
                self.difat_sector_ids.push(id);
                continue;
            }
            break;
        }

        // Re-assert the reserved markers before writing the table out.
        for i in 0..self.sector_ids.len() {
            self.set(self.sector_ids[i], FATSECT);
        }
        for i in 0..self.difat_sector_ids.len() {
            self.set(self.difat_sector_ids[i], DIFSECT);
        }

        // FAT sectors.
        for (i, &sid) in self.sector_ids.iter().enumerate() {
            let mut buffer = vec![0xFFu8; sector_size];
            for j in 0..entries_per_sector {
                let idx = i * entries_per_sector + j;
                let value = self.entries.get(idx).copied().unwrap_or(FREESECT);
                buffer[j * 4..j * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
            sectors.replace_payload(sid, buffer, SectorKind::Fat);
        }

        // Header DIFAT slots, then self-chained DIFAT sectors.
        header.difat = [FREESECT; HEADER_DIFAT_ENTRIES];
        for (slot, &sid) in header
            .difat
            .iter_mut()
            .zip(self.sector_ids.iter().take(HEADER_DIFAT_ENTRIES))
        {
            *slot = sid;
        }
        let overflow = &self.sector_ids[HEADER_DIFAT_ENTRIES.min(self.sector_ids.len())..];
        for (i, &sid) in self.difat_sector_ids.iter().enumerate() {
            let mut buffer = vec![0xFFu8; sector_size];
            let start = i * ids_per_difat_sector;
            let end = (start + ids_per_difat_sector).min(overflow.len());
            for (j, &fat_id) in overflow[start..end].iter().enumerate() {
                buffer[j * 4..j * 4 + 4].copy_from_slice(&fat_id.to_le_bytes());
            }
            let next = self
                .difat_sector_ids
                .get(i + 1)
                .copied()
                .unwrap_or(ENDOFCHAIN);
            buffer[sector_size - 4..].copy_from_slice(&next.to_le_bytes());
            sectors.replace_payload(sid, buffer, SectorKind::Difat);
        }

        header.num_fat_sectors = self.sector_ids.len() as u32;
        header.num_difat_sectors = self.difat_sector_ids.len() as u32;
        header.first_difat_sector = self.difat_sector_ids.first().copied().unwrap_or(ENDOFCHAIN);
    }
}

/// The allocation table for 64-byte mini sectors.
#[derive(Debug, Default)]
pub struct MiniFat {
    /// Next-sector entry per mini sector ID
    entries: Vec<u32>,
    /// High-water mark: the next fresh mini sector ID
    next_mini: u32,
    /// Recycled mini sector IDs
    free: VecDeque<u32>,
}

impl MiniFat {
    /// Build the mirror from loaded table data. The high-water mark comes
    /// from the root entry's stream length.
    pub fn from_loaded(entries: Vec<u32>, ministream_len: u64) -> Self {
        MiniFat {
            entries,
            next_mini: (ministream_len / MINI_SECTOR_SIZE as u64) as u32,
            free: VecDeque::new(),
        }
    }

    /// Number of mini sectors the mini stream must hold.
    pub fn mini_sector_count(&self) -> u32 {
        self.next_mini
    }

    /// Entry for a mini sector ID.
    pub fn get(&self, id: u32) -> u32 {
        self.entries.get(id as usize).copied().unwrap_or(FREESECT)
    }

    /// Follow a mini chain from `head`, with the same hostile-input checks as
    /// the main table.
    pub fn chain(&self, head: u32) -> Result<Vec<u32>> {
        if head == ENDOFCHAIN {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut current = head;
        while current != ENDOFCHAIN {
            if current > MAXREGSECT {
                return Err(CfbError::CorruptedFile(format!(
                    "mini chain refers to reserved sector ID 0x{current:08X}"
                )));
            }
            if current as usize >= self.entries.len() {
                return Err(CfbError::CorruptedFile(format!(
                    "mini chain refers to sector {current} beyond table length {}",
                    self.entries.len()
                )));
            }
            if !seen.insert(current) {
                return Err(CfbError::CorruptedFile(format!(
                    "cyclic mini chain revisits sector {current}"
                )));
            }
            ids.push(current);
            current = self.entries[current as usize];
        }
        Ok(ids)
    }

    fn set(&mut self, id: u32, value: u32) {
        let idx = id as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, FREESECT);
        }
        self.entries[idx] = value;
    }

    /// Resolve placeholder entries to mini sector IDs and thread the links.
    /// Freshly handed-out IDs extend the high-water mark; the caller must
    /// grow the mini stream's backing chain to match `mini_sector_count`.
    pub fn allocate_chain(&mut self, chain: &mut [u32]) {
        for slot in chain.iter_mut() {
            if *slot == PENDING_SECT {
                *slot = loop {
                    match self.free.pop_front() {
                        Some(id) if self.get(id) == FREESECT => break id,
                        Some(_) => continue,
                        None => {
                            let id = self.next_mini;
                            self.next_mini += 1;
                            break id;
                        }
                    }
                };
            }
        }
        for i in 0..chain.len() {
            let next = if i + 1 < chain.len() { chain[i + 1] } else { ENDOFCHAIN };
            self.set(chain[i], next);
        }
    }

    /// Release a whole mini chain. Returns the freed IDs.
    pub fn free_chain(&mut self, head: u32) -> Result<Vec<u32>> {
        let ids = self.chain(head)?;
        for &id in &ids {
            self.set(id, FREESECT);
        }
        Ok(ids)
    }

    /// Release the chain's mini sectors from index `keep` onward.
    pub fn free_tail(&mut self, chain: &[u32], keep: usize) -> Vec<u32> {
        let freed: Vec<u32> = chain[keep.min(chain.len())..].to_vec();
        for &id in &freed {
            self.set(id, FREESECT);
        }
        if keep > 0 && keep <= chain.len() {
            self.set(chain[keep - 1], ENDOFCHAIN);
        }
        freed
    }

    /// Queue IDs for reuse.
    pub fn recycle(&mut self, ids: &[u32]) {
        self.free.extend(ids.iter().copied());
    }

    /// Scan for free entries below the high-water mark and queue them.
    pub fn scan_free(&mut self) {
        self.free.clear();
        for id in 0..(self.next_mini as usize).min(self.entries.len()) {
            if self.entries[id] == FREESECT {
                self.free.push_back(id as u32);
            }
        }
    }

    /// Serialize the table as sector-sized byte blocks, FREESECT-padded.
    pub fn to_blocks(&self, sector_size: usize) -> Vec<Vec<u8>> {
        let count = self.next_mini as usize;
        if count == 0 {
            return Vec::new();
        }
        let entries_per_sector = sector_size / 4;
        let num_blocks = count.div_ceil(entries_per_sector);
        let mut blocks = Vec::with_capacity(num_blocks);
        for block_idx in 0..num_blocks {
            let mut buffer = vec![0xFFu8; sector_size];
            for j in 0..entries_per_sector {
                let idx = block_idx * entries_per_sector + j;
                if idx >= count {
                    break;
                }
                let value = self.entries.get(idx).copied().unwrap_or(FREESECT);
                buffer[j * 4..j * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
            blocks.push(buffer);
        }
        blocks
    }
}
