//! Compound file controller.
//!
//! Ties the header, sector collection, allocation tables and directory
//! together: open/create, the four-way stream resize (including promotion
//! between the mini stream and normal sectors), transactional commit, fresh
//! image writing, and the v3 shrink pass.

use crate::config::{Config, UpdateMode, Version};
use crate::consts::*;
use crate::directory::{
    entry::validate_name, reset_links, DirEntry, Directory, ObjType, RbTree, ROOT_SID,
};
use crate::error::{CfbError, Result};
use crate::fat::{Fat, MiniFat};
use crate::header::Header;
use crate::sector::{SectorCollection, SectorKind};
use crate::storage::Storage;
use crate::stream_view::StreamView;
use crate::time::filetime_now;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

/// Backing streams that can be cut to an exact length after a commit.
pub trait Truncate {
    /// Set the stream's length to exactly `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for fs::File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl Truncate for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

impl<T: Truncate + ?Sized> Truncate for &mut T {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate(len)
    }
}

/// Shared engine state behind every handle.
pub(crate) struct Core<F> {
    file: F,
    version: Version,
    config: Config,
    mode: UpdateMode,
    header: Header,
    sectors: SectorCollection,
    fat: Fat,
    minifat: MiniFat,
    directory: Directory,
}

impl<F: Read + Seek> Core<F> {
    fn strict(&self) -> bool {
        !self.config.contains(Config::NO_VALIDATION_EXCEPTION)
    }

    fn recycle(&self) -> bool {
        self.config.contains(Config::SECTOR_RECYCLE)
    }

    fn erase(&self) -> bool {
        self.config.contains(Config::ERASE_FREE_SECTORS)
    }

    fn sector_size(&self) -> usize {
        self.version.sector_size()
    }

    fn cutoff(&self) -> u64 {
        self.header.mini_stream_cutoff as u64
    }

    // --- construction -----------------------------------------------------

    fn create(file: F, version: Version, mode: UpdateMode, config: Config) -> Core<F> {
        Core {
            file,
            version,
            config,
            mode,
            header: Header::new(version),
            sectors: SectorCollection::new(version.sector_size()),
            fat: Fat::default(),
            minifat: MiniFat::default(),
            directory: Directory::new(),
        }
    }

    fn load(mut file: F, mode: UpdateMode, config: Config) -> Result<Core<F>> {
        let file_len = file.seek(SeekFrom::End(0))?;
        if file_len < HEADER_SIZE as u64 {
            return Err(CfbError::BadSignature);
        }
        file.seek(SeekFrom::Start(0))?;
        let mut block = [0u8; HEADER_SIZE];
        file.read_exact(&mut block)?;
        let header = Header::parse(&block)?;

        let sector_size = header.sector_size();
        let sector_count = if file_len > sector_size as u64 {
            (file_len - sector_size as u64).div_ceil(sector_size as u64) as usize
        } else {
            0
        };

        let mut core = Core {
            file,
            version: header.version,
            config,
            mode,
            sectors: SectorCollection::with_len(sector_size, sector_count),
            header,
            fat: Fat::default(),
            minifat: MiniFat::default(),
            directory: Directory::new(),
        };

        core.load_fat()?;
        core.load_directory()?;
        core.load_minifat()?;

        if core.recycle() {
            core.fat.scan_free(core.sectors.len());
            core.minifat.scan_free();
        }
        log::debug!(
            "opened compound file: version {:?}, {} sectors, {} directory slots",
            core.version,
            core.sectors.len(),
            core.directory.len()
        );
        Ok(core)
    }

    /// Walk the DIFAT and FAT sectors into the in-memory table.
    fn load_fat(&mut self) -> Result<()> {
        let sector_size = self.sector_size();
        let sector_count = self.sectors.len() as u32;

        // DIFAT chain: linked through the trailing 4 bytes of each sector.
        // FREESECT terminators appear in the wild and are treated as ends.
        let mut difat_ids = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.header.first_difat_sector;
        while current != ENDOFCHAIN && current != FREESECT {
            if current > MAXREGSECT || current >= sector_count {
                return Err(CfbError::CorruptedFile(format!(
                    "DIFAT chain refers to invalid sector {current}"
                )));
            }
            if !seen.insert(current) {
                return Err(CfbError::CorruptedFile(format!(
                    "cyclic DIFAT chain revisits sector {current}"
                )));
            }
            difat_ids.push(current);
            let payload = self.sectors.payload(current, &mut self.file)?;
            current = u32::from_le_bytes(payload[sector_size - 4..].try_into().unwrap());
        }

        // FAT sector IDs: 109 header slots, then the DIFAT sector contents.
        let mut fat_ids = Vec::new();
        for &id in self.header.difat.iter() {
            if id == FREESECT || id == ENDOFCHAIN {
                break;
            }
            fat_ids.push(id);
        }
        for &difat_id in &difat_ids {
            let payload = self.sectors.payload(difat_id, &mut self.file)?;
            let mut ids = Vec::new();
            for chunk in payload[..sector_size - 4].chunks_exact(4) {
                let id = u32::from_le_bytes(chunk.try_into().unwrap());
                if id == FREESECT || id == ENDOFCHAIN {
                    break;
                }
                ids.push(id);
            }
            fat_ids.extend(ids);
        }
        fat_ids.truncate(self.header.num_fat_sectors as usize);
        for &id in &fat_ids {
            if id > MAXREGSECT || id >= sector_count {
                return Err(CfbError::CorruptedFile(format!(
                    "DIFAT refers to invalid FAT sector {id}"
                )));
            }
        }

        let mut entries = Vec::with_capacity(fat_ids.len() * (sector_size / 4));
        for &id in &fat_ids {
            let payload = self.sectors.payload(id, &mut self.file)?;
            let mut values = Vec::with_capacity(sector_size / 4);
            for chunk in payload.chunks_exact(4) {
                values.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
            entries.extend(values);
        }

        self.fat = Fat::from_loaded(entries, fat_ids, difat_ids);
        for i in 0..self.fat.sector_ids().len() {
            let id = self.fat.sector_ids()[i];
            self.sectors.set_kind(id, SectorKind::Fat);
        }
        for i in 0..self.fat.difat_sector_ids().len() {
            let id = self.fat.difat_sector_ids()[i];
            self.sectors.set_kind(id, SectorKind::Difat);
        }
        Ok(())
    }

    /// Read every 128-byte record out of the directory chain.
    fn load_directory(&mut self) -> Result<()> {
        let chain = self.fat.chain(self.header.first_dir_sector)?;
        if chain.is_empty() {
            return Err(CfbError::CorruptedFile(
                "file has no directory chain".to_string(),
            ));
        }
        let strict = self.strict();
        let version = self.version;
        let mut entries = Vec::with_capacity(chain.len() * (self.sector_size() / DIRENTRY_SIZE));
        for &sid in &chain {
            self.sectors.set_kind(sid, SectorKind::Directory);
            let payload = self.sectors.payload(sid, &mut self.file)?;
            for record in payload.chunks_exact(DIRENTRY_SIZE) {
                entries.push(DirEntry::parse(record, version, strict)?);
            }
        }
        self.directory = Directory::from_entries(entries)?;
        self.header.first_dir_sector = chain[0];
        Ok(())
    }

    fn load_minifat(&mut self) -> Result<()> {
        let mut entries = Vec::new();
        if self.header.first_minifat_sector != ENDOFCHAIN && self.header.num_minifat_sectors > 0 {
            let chain = self.fat.chain(self.header.first_minifat_sector)?;
            for &sid in &chain {
                self.sectors.set_kind(sid, SectorKind::Fat);
                let payload = self.sectors.payload(sid, &mut self.file)?;
                let mut values = Vec::with_capacity(payload.len() / 4);
                for chunk in payload.chunks_exact(4) {
                    values.push(u32::from_le_bytes(chunk.try_into().unwrap()));
                }
                entries.extend(values);
            }
        }
        self.minifat = MiniFat::from_loaded(entries, self.directory.root().size);

        // Tag the mini stream's backing sectors.
        match self.fat.chain(self.directory.root().start_sector) {
            Ok(chain) => {
                for &sid in &chain {
                    self.sectors.set_kind(sid, SectorKind::Mini);
                }
            }
            Err(err) if self.strict() => return Err(err),
            Err(err) => log::warn!("unreadable mini stream backing chain: {err}"),
        }
        Ok(())
    }

    // --- directory operations ---------------------------------------------

    pub(crate) fn entry(&self, sid: u32) -> Result<&DirEntry> {
        self.directory.entry(sid)
    }

    pub(crate) fn entry_mut(&mut self, sid: u32) -> Result<&mut DirEntry> {
        self.directory.entry_mut(sid)
    }

    fn require_storage(&self, sid: u32) -> Result<()> {
        match self.entry(sid)?.obj_type {
            ObjType::Storage | ObjType::Root => Ok(()),
            _ => Err(CfbError::InvalidOperation("not a storage")),
        }
    }

    /// Locate a child of `parent_sid` by name.
    pub(crate) fn find_child(&mut self, parent_sid: u32, name: &str) -> Result<Option<u32>> {
        self.require_storage(parent_sid)?;
        let root = self.entry(parent_sid)?.child;
        let strict = self.strict();
        let tree = RbTree::load(&mut self.directory, root, strict)?;
        Ok(tree.find(name))
    }

    /// Children of a storage in tree order.
    pub(crate) fn children_of(&mut self, parent_sid: u32) -> Result<Vec<u32>> {
        self.require_storage(parent_sid)?;
        let root = self.entry(parent_sid)?.child;
        let strict = self.strict();
        let tree = RbTree::load(&mut self.directory, root, strict)?;
        Ok(tree.in_order())
    }

    /// Insert a new child entry under `parent_sid`.
    pub(crate) fn add_child(&mut self, parent_sid: u32, entry: DirEntry) -> Result<u32> {
        validate_name(&entry.name)?;
        if self.find_child(parent_sid, &entry.name)?.is_some() {
            return Err(CfbError::DuplicatedItem(entry.name));
        }
        let sid = self.directory.insert(entry);
        reset_links(self.directory.get_mut(sid).unwrap());

        let root = self.entry(parent_sid)?.child;
        let strict = self.strict();
        let mut tree = RbTree::load(&mut self.directory, root, strict)?;
        if let Err(err) = tree.insert(sid) {
            self.directory.remove(sid);
            return Err(err);
        }
        let new_root = tree.root();
        self.entry_mut(parent_sid)?.child = new_root;
        Ok(sid)
    }

    /// Delete a named child: recursively for storages, releasing payload
    /// chains for streams, then unlink and invalidate the record.
    pub(crate) fn remove_child(&mut self, parent_sid: u32, name: &str) -> Result<()> {
        let sid = self
            .find_child(parent_sid, name)?
            .ok_or_else(|| CfbError::NotFound(name.to_string()))?;

        match self.entry(sid)?.obj_type {
            ObjType::Storage => {
                loop {
                    let children = self.children_of(sid)?;
                    let Some(&child) = children.first() else { break };
                    let child_name = self.entry(child)?.name.clone();
                    self.remove_child(sid, &child_name)?;
                }
            }
            ObjType::Stream => {
                self.free_stream_payload(sid)?;
            }
            _ => return Err(CfbError::InvalidOperation("cannot delete the root entry")),
        }

        let root = self.entry(parent_sid)?.child;
        let strict = self.strict();
        let mut tree = RbTree::load(&mut self.directory, root, strict)?;
        tree.remove(sid)?;
        let new_root = tree.root();
        self.entry_mut(parent_sid)?.child = new_root;
        self.directory.remove(sid);
        Ok(())
    }

    /// Rename a child. The comparison key changes, so the node is pulled out
    /// of the tree and re-inserted under its new name.
    pub(crate) fn rename_child(&mut self, parent_sid: u32, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;
        let sid = self
            .find_child(parent_sid, old)?
            .ok_or_else(|| CfbError::NotFound(old.to_string()))?;
        if let Some(existing) = self.find_child(parent_sid, new)? {
            if existing == sid {
                // Case-only rename: the ordering key is unchanged.
                self.entry_mut(sid)?.name = new.to_string();
                return Ok(());
            }
            return Err(CfbError::DuplicatedItem(new.to_string()));
        }

        let root = self.entry(parent_sid)?.child;
        let strict = self.strict();
        let mut tree = RbTree::load(&mut self.directory, root, strict)?;
        tree.remove(sid)?;
        let interim_root = tree.root();
        drop(tree);
        self.entry_mut(parent_sid)?.child = interim_root;

        self.entry_mut(sid)?.name = new.to_string();
        let mut tree = RbTree::load(&mut self.directory, interim_root, strict)?;
        tree.insert(sid)?;
        let new_root = tree.root();
        self.entry_mut(parent_sid)?.child = new_root;
        Ok(())
    }

    pub(crate) fn add_stream(&mut self, parent_sid: u32, name: &str) -> Result<u32> {
        self.add_child(parent_sid, DirEntry::new_stream(name))
    }

    pub(crate) fn add_storage(&mut self, parent_sid: u32, name: &str) -> Result<u32> {
        self.add_child(parent_sid, DirEntry::new_storage(name, filetime_now()))
    }

    // --- stream payload ---------------------------------------------------

    fn is_mini(&self, size: u64) -> bool {
        size < self.cutoff()
    }

    fn normal_view(&self, start: u32) -> Result<StreamView> {
        Ok(StreamView::normal(self.fat.chain(start)?, self.sector_size()))
    }

    fn mini_view(&self, start: u32) -> Result<StreamView> {
        let chain = self.minifat.chain(start)?;
        let root_chain = self.fat.chain(self.directory.root().start_sector)?;
        Ok(StreamView::mini(chain, root_chain, self.sector_size()))
    }

    fn stream_entry(&self, sid: u32) -> Result<&DirEntry> {
        let entry = self.entry(sid)?;
        if entry.obj_type != ObjType::Stream {
            return Err(CfbError::InvalidOperation("not a stream"));
        }
        Ok(entry)
    }

    pub(crate) fn stream_len(&self, sid: u32) -> Result<u64> {
        Ok(self.stream_entry(sid)?.size)
    }

    pub(crate) fn read_stream_at(&mut self, sid: u32, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self.stream_entry(sid)?;
        let (size, start) = (entry.size, entry.start_sector);
        let view = if self.is_mini(size) {
            self.mini_view(start)?
        } else {
            self.normal_view(start)?
        };
        view.read_at(&mut self.sectors, &mut self.file, pos, buf, size)
    }

    pub(crate) fn write_stream_at(&mut self, sid: u32, pos: u64, data: &[u8]) -> Result<()> {
        self.stream_entry(sid)?;
        if data.is_empty() {
            return Ok(());
        }
        let end = pos + data.len() as u64;
        if end > self.stream_len(sid)? {
            self.set_stream_len(sid, end)?;
        }
        let entry = self.stream_entry(sid)?;
        let (size, start) = (entry.size, entry.start_sector);
        let view = if self.is_mini(size) {
            self.mini_view(start)?
        } else {
            self.normal_view(start)?
        };
        view.write_at(&mut self.sectors, &mut self.file, pos, data)
    }

    pub(crate) fn read_stream_data(&mut self, sid: u32) -> Result<Vec<u8>> {
        let len = self.stream_len(sid)?;
        let mut data = vec![0u8; len as usize];
        let n = self.read_stream_at(sid, 0, &mut data)?;
        data.truncate(n);
        Ok(data)
    }

    pub(crate) fn set_stream_data(&mut self, sid: u32, data: &[u8]) -> Result<()> {
        self.set_stream_len(sid, data.len() as u64)?;
        self.write_stream_at(sid, 0, data)
    }

    /// Resize a stream. Crossing the cutoff moves the payload between the
    /// mini stream and normal sectors, byte for byte.
    pub(crate) fn set_stream_len(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let entry = self.stream_entry(sid)?;
        let old_len = entry.size;
        if new_len == old_len {
            return Ok(());
        }
        let start = entry.start_sector;
        let old_mini = self.is_mini(old_len);
        let new_mini = self.is_mini(new_len);

        match (old_mini, new_mini) {
            (false, false) => self.resize_normal(sid, start, new_len)?,
            (true, true) => self.resize_mini(sid, start, new_len)?,
            (true, false) => self.promote(sid, start, old_len, new_len)?,
            (false, true) => self.demote(sid, start, new_len)?,
        }
        Ok(())
    }

    fn resize_normal(&mut self, sid: u32, start: u32, new_len: u64) -> Result<()> {
        let sector_size = self.sector_size();
        let mut view = StreamView::normal(self.fat.chain(start)?, sector_size);
        let needed = new_len.div_ceil(sector_size as u64) as usize;
        if view.chain.len() < needed {
            view.ensure_capacity(new_len);
            self.fat
                .allocate_chain(&mut view.chain, &mut self.sectors, SectorKind::Normal);
        } else if view.chain.len() > needed {
            let freed = self.fat.free_tail(&view.chain, needed);
            self.release_sectors(&freed);
            view.chain.truncate(needed);
        }
        let entry = self.entry_mut(sid)?;
        entry.start_sector = view.chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = new_len;
        Ok(())
    }

    fn resize_mini(&mut self, sid: u32, start: u32, new_len: u64) -> Result<()> {
        let mut chain = self.minifat.chain(start)?;
        let needed = new_len.div_ceil(MINI_SECTOR_SIZE as u64) as usize;
        if chain.len() < needed {
            while chain.len() < needed {
                chain.push(PENDING_SECT);
            }
            self.minifat.allocate_chain(&mut chain);
            self.grow_ministream()?;
        } else if chain.len() > needed {
            let freed = self.minifat.free_tail(&chain, needed);
            self.release_mini_sectors(&freed)?;
            chain.truncate(needed);
        }
        let entry = self.entry_mut(sid)?;
        entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = new_len;
        Ok(())
    }

    fn promote(&mut self, sid: u32, start: u32, old_len: u64, new_len: u64) -> Result<()> {
        let sector_size = self.sector_size();
        let mut content = vec![0u8; old_len as usize];
        {
            let view = self.mini_view(start)?;
            view.read_at(&mut self.sectors, &mut self.file, 0, &mut content, old_len)?;
        }

        let mut view = StreamView::normal(Vec::new(), sector_size);
        view.ensure_capacity(new_len);
        self.fat
            .allocate_chain(&mut view.chain, &mut self.sectors, SectorKind::Normal);
        view.write_at(&mut self.sectors, &mut self.file, 0, &content)?;

        let freed = self.minifat.free_chain(start)?;
        self.release_mini_sectors(&freed)?;

        let first = view.chain.first().copied().unwrap_or(ENDOFCHAIN);
        let entry = self.entry_mut(sid)?;
        entry.start_sector = first;
        entry.size = new_len;
        log::debug!("promoted stream SID {sid} to normal sectors ({new_len} bytes)");
        Ok(())
    }

    fn demote(&mut self, sid: u32, start: u32, new_len: u64) -> Result<()> {
        let mut content = vec![0u8; new_len as usize];
        {
            let view = self.normal_view(start)?;
            view.read_at(&mut self.sectors, &mut self.file, 0, &mut content, new_len)?;
        }

        let mut chain = Vec::new();
        let needed = new_len.div_ceil(MINI_SECTOR_SIZE as u64) as usize;
        while chain.len() < needed {
            chain.push(PENDING_SECT);
        }
        self.minifat.allocate_chain(&mut chain);
        self.grow_ministream()?;
        if !content.is_empty() {
            let root_chain = self.fat.chain(self.directory.root().start_sector)?;
            let view = StreamView::mini(chain.clone(), root_chain, self.sector_size());
            view.write_at(&mut self.sectors, &mut self.file, 0, &content)?;
        }

        let freed = self.fat.free_chain(start)?;
        self.release_sectors(&freed);

        let entry = self.entry_mut(sid)?;
        entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = new_len;
        log::debug!("demoted stream SID {sid} into the mini stream ({new_len} bytes)");
        Ok(())
    }

    fn free_stream_payload(&mut self, sid: u32) -> Result<()> {
        let entry = self.stream_entry(sid)?;
        let (size, start) = (entry.size, entry.start_sector);
        if self.is_mini(size) {
            let freed = self.minifat.free_chain(start)?;
            self.release_mini_sectors(&freed)?;
        } else {
            let freed = self.fat.free_chain(start)?;
            self.release_sectors(&freed);
        }
        let entry = self.entry_mut(sid)?;
        entry.start_sector = ENDOFCHAIN;
        entry.size = 0;
        Ok(())
    }

    fn release_sectors(&mut self, freed: &[u32]) {
        if self.erase() {
            for &id in freed {
                self.sectors.erase(id);
            }
        }
        if self.recycle() {
            self.fat.recycle(freed);
        }
    }

    fn release_mini_sectors(&mut self, freed: &[u32]) -> Result<()> {
        if self.erase() && !freed.is_empty() {
            let root_chain = self.fat.chain(self.directory.root().start_sector)?;
            let zeroes = [0u8; MINI_SECTOR_SIZE];
            for &id in freed {
                let view =
                    StreamView::mini(vec![id], root_chain.clone(), self.sector_size());
                view.write_at(&mut self.sectors, &mut self.file, 0, &zeroes)?;
            }
        }
        if self.recycle() {
            self.minifat.recycle(freed);
        }
        Ok(())
    }

    /// Grow the mini stream's backing chain to cover the mini-FAT's
    /// high-water mark, updating the root entry.
    fn grow_ministream(&mut self) -> Result<()> {
        let bytes = self.minifat.mini_sector_count() as u64 * MINI_SECTOR_SIZE as u64;
        let mut view =
            StreamView::normal(self.fat.chain(self.directory.root().start_sector)?, self.sector_size());
        if view.capacity() < bytes {
            view.ensure_capacity(bytes);
            self.fat
                .allocate_chain(&mut view.chain, &mut self.sectors, SectorKind::Mini);
        }
        let root = self.directory.root_mut();
        root.start_sector = view.chain.first().copied().unwrap_or(ENDOFCHAIN);
        root.size = bytes;
        Ok(())
    }

    // --- persistence ------------------------------------------------------

    /// Rewrite the directory, mini-FAT, FAT and DIFAT sectors in memory so
    /// the on-disk structures will match the current state.
    fn serialize_structures(&mut self) -> Result<()> {
        let sector_size = self.sector_size();

        // Directory chain.
        let dir_bytes = self.directory.to_stream_bytes(self.version, sector_size);
        let mut chain = self.fat.chain(self.header.first_dir_sector)?;
        let needed = dir_bytes.len() / sector_size;
        if chain.len() < needed {
            while chain.len() < needed {
                chain.push(PENDING_SECT);
            }
            self.fat
                .allocate_chain(&mut chain, &mut self.sectors, SectorKind::Directory);
        } else if chain.len() > needed {
            let freed = self.fat.free_tail(&chain, needed);
            self.release_sectors(&freed);
            chain.truncate(needed);
        }
        for (i, &sid) in chain.iter().enumerate() {
            let block = dir_bytes[i * sector_size..(i + 1) * sector_size].to_vec();
            self.sectors.replace_payload(sid, block, SectorKind::Directory);
        }
        self.header.first_dir_sector = chain[0];
        self.header.num_dir_sectors = chain.len() as u32;

        // Mini-FAT chain.
        let blocks = self.minifat.to_blocks(sector_size);
        let mut chain = self.fat.chain(self.header.first_minifat_sector)?;
        let needed = blocks.len();
        if chain.len() < needed {
            while chain.len() < needed {
                chain.push(PENDING_SECT);
            }
            self.fat
                .allocate_chain(&mut chain, &mut self.sectors, SectorKind::Fat);
        } else if chain.len() > needed {
            let freed = self.fat.free_tail(&chain, needed);
            self.release_sectors(&freed);
            chain.truncate(needed);
        }
        for (sid, block) in chain.iter().zip(blocks) {
            self.sectors.replace_payload(*sid, block, SectorKind::Fat);
        }
        self.header.first_minifat_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.num_minifat_sectors = chain.len() as u32;

        // FAT and DIFAT last: every chain above is already threaded.
        self.fat.persist(&mut self.sectors, &mut self.header);
        Ok(())
    }

    /// Write a complete image of the current state to `writer`: header
    /// first, then every sector, materializing unloaded payloads from the
    /// source stream.
    fn save_to<W: Write + Seek>(&mut self, writer: &mut W) -> Result<()> {
        self.serialize_structures()?;
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&self.header.to_bytes())?;
        for id in 0..self.sectors.len() as u32 {
            let payload = self.sectors.payload(id, &mut self.file)?;
            writer.write_all(payload)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl<F: Read + Write + Seek + Truncate> Core<F> {
    /// Persist dirty state into the backing stream. Header bytes go last so
    /// an interrupted commit leaves the previous header intact.
    fn commit(&mut self, release_memory: bool) -> Result<()> {
        if self.mode != UpdateMode::Update {
            return Err(CfbError::InvalidOperation(
                "commit requires a file opened in update mode",
            ));
        }
        self.serialize_structures()?;

        let sector_size = self.sector_size();
        let count = self.sectors.len() as u32;
        let mut written = 0usize;
        let mut id = 0u32;
        while id < count {
            let dirty = self
                .sectors
                .get(id)
                .map(|s| s.is_dirty() && s.bytes().is_some())
                .unwrap_or(false);
            if !dirty {
                id += 1;
                continue;
            }
            // Contiguous dirty run: one seek, sequential writes.
            self.file
                .seek(SeekFrom::Start((id as u64 + 1) * sector_size as u64))?;
            while id < count {
                let Some(sector) = self.sectors.get(id) else { break };
                if !sector.is_dirty() {
                    break;
                }
                let Some(bytes) = sector.bytes() else { break };
                self.file.write_all(bytes)?;
                self.sectors.clear_dirty(id);
                written += 1;
                id += 1;
            }
        }

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        self.file.flush()?;
        self.file
            .truncate((self.sectors.len() as u64 + 1) * sector_size as u64)?;

        if release_memory {
            self.sectors.release_clean_payloads();
        }
        log::debug!("commit: wrote {written} dirty sectors");
        Ok(())
    }
}

/// A compound file: a hierarchy of storages and streams over one backing
/// stream.
pub struct CompoundFile<F> {
    core: Rc<RefCell<Core<F>>>,
}

impl<F: Read + Seek> CompoundFile<F> {
    /// Open an existing compound file in read-only mode with default
    /// configuration.
    pub fn open(file: F) -> Result<CompoundFile<F>> {
        CompoundFile::open_with(file, UpdateMode::ReadOnly, Config::default())
    }

    /// Open an existing compound file with an explicit mode and
    /// configuration.
    ///
    /// # Arguments
    ///
    /// * `file` - Backing stream positioned anywhere (it is rewound)
    /// * `mode` - `ReadOnly` rejects `commit`; `Update` allows it
    /// * `config` - Behavior flags (recycling, erasure, lenient load, ...)
    ///
    /// # Returns
    ///
    /// * `Result<CompoundFile<F>>` - The parsed compound file or an error
    pub fn open_with(file: F, mode: UpdateMode, config: Config) -> Result<CompoundFile<F>> {
        let core = Core::load(file, mode, config)?;
        Ok(CompoundFile { core: Rc::new(RefCell::new(core)) })
    }

    /// Create a new, empty compound file of the given version. Nothing is
    /// written until `commit` or `save_to`.
    pub fn create(file: F, version: Version) -> Result<CompoundFile<F>> {
        CompoundFile::create_with(file, version, Config::default())
    }

    /// Create a new compound file with an explicit configuration.
    pub fn create_with(file: F, version: Version, config: Config) -> Result<CompoundFile<F>> {
        let core = Core::create(file, version, UpdateMode::Update, config);
        Ok(CompoundFile { core: Rc::new(RefCell::new(core)) })
    }

    /// The format version of this file.
    pub fn version(&self) -> Version {
        self.core.borrow().version
    }

    /// The session configuration.
    pub fn config(&self) -> Config {
        self.core.borrow().config
    }

    /// The mode the file was opened in.
    pub fn update_mode(&self) -> UpdateMode {
        self.core.borrow().mode
    }

    /// Handle to the root storage.
    pub fn root_storage(&self) -> Storage<F> {
        Storage::new(Rc::downgrade(&self.core), ROOT_SID)
    }

    /// Write a complete image of the current state (including uncommitted
    /// changes) to `writer`.
    pub fn save_to<W: Write + Seek>(&mut self, writer: &mut W) -> Result<()> {
        self.core.borrow_mut().save_to(writer)
    }

    /// Save a complete image to a new file at `path`.
    pub fn save_as<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = fs::File::create(path)?;
        let mut writer = io::BufWriter::new(file);
        self.save_to(&mut writer)?;
        Ok(())
    }

    /// Close the compound file. Every outstanding storage and stream handle
    /// becomes disposed. With `LEAVE_OPEN` set, the backing stream is handed
    /// back to the caller; otherwise it is dropped.
    pub fn close(self) -> Option<F> {
        let core = match Rc::try_unwrap(self.core) {
            Ok(cell) => cell.into_inner(),
            // Handles only hold weak references, so this cannot happen.
            Err(_) => unreachable!("compound file core still shared at close"),
        };
        if core.config.contains(Config::LEAVE_OPEN) {
            Some(core.file)
        } else {
            None
        }
    }
}

#[cfg(test)]
impl<F: Read + Seek> CompoundFile<F> {
    /// Verify the red-black invariants of every storage's sibling tree.
    pub(crate) fn check_tree_invariants(&self) {
        let mut core = self.core.borrow_mut();
        let parents: Vec<u32> = core
            .directory
            .iter()
            .filter(|(_, e)| matches!(e.obj_type, ObjType::Storage | ObjType::Root))
            .map(|(sid, _)| sid)
            .collect();
        for sid in parents {
            let root = core.directory.entry(sid).unwrap().child;
            let tree = RbTree::load(&mut core.directory, root, true).unwrap();
            tree.check_invariants()
                .unwrap_or_else(|e| panic!("storage SID {sid}: {e}"));
        }
    }
}

impl<F: Read + Write + Seek + Truncate> CompoundFile<F> {
    /// Write dirty sectors, the directory and the header back into the
    /// backing stream. Only valid in update mode.
    pub fn commit(&mut self) -> Result<()> {
        self.core.borrow_mut().commit(false)
    }

    /// Like `commit`, additionally dropping clean payload buffers to reclaim
    /// memory.
    pub fn commit_and_release(&mut self) -> Result<()> {
        self.core.borrow_mut().commit(true)
    }
}

impl CompoundFile<fs::File> {
    /// Open the file at `path` read-only (shared read access).
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<CompoundFile<fs::File>> {
        let file = fs::File::open(path)?;
        CompoundFile::open(file)
    }

    /// Open the file at `path` for update (exclusive write access).
    pub fn open_path_update<P: AsRef<Path>>(path: P) -> Result<CompoundFile<fs::File>> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        CompoundFile::open_with(file, UpdateMode::Update, Config::default())
    }

    /// Create a fresh compound file at `path`, truncating anything there.
    pub fn create_path<P: AsRef<Path>>(
        path: P,
        version: Version,
    ) -> Result<CompoundFile<fs::File>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        CompoundFile::create(file, version)
    }
}

/// Compact a version 3 compound file in place: the hierarchy is cloned into
/// a fresh image (dropping free sectors and recycled slots), which then
/// overwrites the source. Version 4 files are rejected.
///
/// # Arguments
///
/// * `stream` - The file to compact, opened read-write
///
/// # Example
///
/// ```no_run
/// # fn main() -> longan::Result<()> {
/// longan::shrink_path("churned.doc")?;
/// # Ok(())
/// # }
/// ```
pub fn shrink<S: Read + Write + Seek + Truncate>(stream: &mut S) -> Result<()> {
    let image = {
        let source = CompoundFile::open(&mut *stream)?;
        if source.version() != Version::V3 {
            return Err(CfbError::InvalidOperation(
                "shrink supports only version 3 files",
            ));
        }
        let mut target = CompoundFile::create(Cursor::new(Vec::new()), Version::V3)?;
        let src_root = source.root_storage();
        let dst_root = target.root_storage();
        dst_root.set_clsid(src_root.clsid()?)?;
        clone_storage(&src_root, &dst_root)?;

        let mut buffer = Cursor::new(Vec::new());
        target.save_to(&mut buffer)?;
        buffer.into_inner()
    };

    stream.seek(SeekFrom::Start(0))?;
    stream.write_all(&image)?;
    stream.flush()?;
    stream.truncate(image.len() as u64)?;
    Ok(())
}

/// Shrink the compound file at `path` in place.
pub fn shrink_path<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;
    shrink(&mut file)
}

fn clone_storage<A, B>(source: &Storage<A>, target: &Storage<B>) -> Result<()>
where
    A: Read + Seek,
    B: Read + Seek,
{
    for item in source.items()? {
        match item {
            crate::storage::Item::Stream(src) => {
                let mut dst = target.add_stream(&src.name()?)?;
                dst.set_data(&src.get_data()?)?;
            }
            crate::storage::Item::Storage(src) => {
                let dst = target.add_storage(&src.name()?)?;
                dst.set_clsid(src.clsid()?)?;
                clone_storage(&src, &dst)?;
            }
        }
    }
    Ok(())
}
