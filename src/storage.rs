//! Storage and stream handles.
//!
//! Handles hold weak references to the compound file's shared core: closing
//! the file disposes every outstanding handle, which then fails with
//! `Disposed` instead of touching freed state.

use crate::compound::Core;
use crate::directory::{format_clsid, ObjType, ROOT_SID};
use crate::error::{CfbError, Result};
use crate::time::{datetime_to_filetime, filetime_to_datetime};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom};
use std::rc::{Rc, Weak};

/// A storage: a named directory of streams and further storages.
pub struct Storage<F> {
    core: Weak<RefCell<Core<F>>>,
    sid: u32,
}

/// A stream: a named byte payload. Carries a cursor position for the
/// `std::io` trait implementations.
pub struct Stream<F> {
    core: Weak<RefCell<Core<F>>>,
    sid: u32,
    pos: u64,
}

/// A child of a storage, as yielded by enumeration.
pub enum Item<F> {
    /// A sub-storage
    Storage(Storage<F>),
    /// A stream
    Stream(Stream<F>),
}

impl<F> Clone for Storage<F> {
    fn clone(&self) -> Self {
        Storage { core: self.core.clone(), sid: self.sid }
    }
}

impl<F> Clone for Stream<F> {
    fn clone(&self) -> Self {
        Stream { core: self.core.clone(), sid: self.sid, pos: 0 }
    }
}

impl<F: Read + Seek> Storage<F> {
    pub(crate) fn new(core: Weak<RefCell<Core<F>>>, sid: u32) -> Storage<F> {
        Storage { core, sid }
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut Core<F>) -> Result<R>) -> Result<R> {
        let rc = self.core.upgrade().ok_or(CfbError::Disposed)?;
        let mut core = rc.borrow_mut();
        f(&mut core)
    }

    /// The storage's name.
    pub fn name(&self) -> Result<String> {
        self.with_core(|core| Ok(core.entry(self.sid)?.name.clone()))
    }

    /// Whether this handle refers to the root storage.
    pub fn is_root(&self) -> bool {
        self.sid == ROOT_SID
    }

    /// Payload length: zero for ordinary storages, the mini-stream length
    /// for the root.
    pub fn size(&self) -> Result<u64> {
        self.with_core(|core| Ok(core.entry(self.sid)?.size))
    }

    /// The storage's CLSID.
    pub fn clsid(&self) -> Result<[u8; 16]> {
        self.with_core(|core| Ok(core.entry(self.sid)?.clsid))
    }

    /// The storage's CLSID formatted as a GUID string, empty when nil.
    pub fn clsid_string(&self) -> Result<String> {
        Ok(format_clsid(&self.clsid()?))
    }

    /// Set the storage's CLSID.
    pub fn set_clsid(&self, clsid: [u8; 16]) -> Result<()> {
        self.with_core(|core| {
            core.entry_mut(self.sid)?.clsid = clsid;
            Ok(())
        })
    }

    /// User-defined state bits.
    pub fn state_bits(&self) -> Result<u32> {
        self.with_core(|core| Ok(core.entry(self.sid)?.state_bits))
    }

    /// Set the user-defined state bits.
    pub fn set_state_bits(&self, bits: u32) -> Result<()> {
        self.with_core(|core| {
            core.entry_mut(self.sid)?.state_bits = bits;
            Ok(())
        })
    }

    /// Creation time, when recorded.
    pub fn creation_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_core(|core| Ok(filetime_to_datetime(core.entry(self.sid)?.creation_time)))
    }

    /// Last modification time, when recorded.
    pub fn modified_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_core(|core| Ok(filetime_to_datetime(core.entry(self.sid)?.modified_time)))
    }

    /// Stamp the modification time.
    pub fn touch(&self, when: DateTime<Utc>) -> Result<()> {
        self.with_core(|core| {
            core.entry_mut(self.sid)?.modified_time = datetime_to_filetime(when);
            Ok(())
        })
    }

    /// Create a new empty stream in this storage.
    ///
    /// Fails with `InvalidArgument` for malformed names and `DuplicatedItem`
    /// when the name is already taken.
    pub fn add_stream(&self, name: &str) -> Result<Stream<F>> {
        let sid = self.with_core(|core| core.add_stream(self.sid, name))?;
        Ok(Stream { core: self.core.clone(), sid, pos: 0 })
    }

    /// Create a new storage in this storage. The creation timestamp is set
    /// to the current time.
    pub fn add_storage(&self, name: &str) -> Result<Storage<F>> {
        let sid = self.with_core(|core| core.add_storage(self.sid, name))?;
        Ok(Storage { core: self.core.clone(), sid })
    }

    /// Look up a stream by exact name.
    pub fn get_stream(&self, name: &str) -> Result<Stream<F>> {
        self.try_get_stream(name)?
            .ok_or_else(|| CfbError::NotFound(name.to_string()))
    }

    /// Look up a storage by exact name.
    pub fn get_storage(&self, name: &str) -> Result<Storage<F>> {
        self.try_get_storage(name)?
            .ok_or_else(|| CfbError::NotFound(name.to_string()))
    }

    /// Non-failing stream lookup.
    pub fn try_get_stream(&self, name: &str) -> Result<Option<Stream<F>>> {
        self.with_core(|core| {
            match core.find_child(self.sid, name)? {
                Some(sid) if core.entry(sid)?.obj_type == ObjType::Stream => {
                    Ok(Some(Stream { core: self.core.clone(), sid, pos: 0 }))
                }
                _ => Ok(None),
            }
        })
    }

    /// Non-failing storage lookup.
    pub fn try_get_storage(&self, name: &str) -> Result<Option<Storage<F>>> {
        self.with_core(|core| {
            match core.find_child(self.sid, name)? {
                Some(sid) if core.entry(sid)?.obj_type == ObjType::Storage => {
                    Ok(Some(Storage { core: self.core.clone(), sid }))
                }
                _ => Ok(None),
            }
        })
    }

    /// Whether a child with this name exists.
    pub fn contains(&self, name: &str) -> Result<bool> {
        self.with_core(|core| Ok(core.find_child(self.sid, name)?.is_some()))
    }

    /// Delete a named child. Storages are deleted recursively; stream
    /// payload sectors return to the free pool.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.with_core(|core| core.remove_child(self.sid, name))
    }

    /// Rename a child.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.with_core(|core| core.rename_child(self.sid, old, new))
    }

    /// This storage's children, in name order.
    pub fn items(&self) -> Result<Vec<Item<F>>> {
        self.with_core(|core| {
            let sids = core.children_of(self.sid)?;
            let mut items = Vec::with_capacity(sids.len());
            for sid in sids {
                let item = match core.entry(sid)?.obj_type {
                    ObjType::Stream => Item::Stream(Stream {
                        core: self.core.clone(),
                        sid,
                        pos: 0,
                    }),
                    _ => Item::Storage(Storage { core: self.core.clone(), sid }),
                };
                items.push(item);
            }
            Ok(items)
        })
    }

    /// Visit this storage's children in name order. With `recursive`, each
    /// level is visited completely before descending into its sub-storages.
    pub fn visit_entries(
        &self,
        recursive: bool,
        action: &mut impl FnMut(&Item<F>),
    ) -> Result<()> {
        self.visit_entries_dyn(recursive, action)
    }

    fn visit_entries_dyn(
        &self,
        recursive: bool,
        action: &mut dyn FnMut(&Item<F>),
    ) -> Result<()> {
        let items = self.items()?;
        let mut sub_storages = Vec::new();
        for item in &items {
            action(item);
            if recursive {
                if let Item::Storage(storage) = item {
                    sub_storages.push(storage.clone());
                }
            }
        }
        for storage in sub_storages {
            storage.visit_entries_dyn(recursive, action)?;
        }
        Ok(())
    }
}

impl<F: Read + Seek> Stream<F> {
    fn with_core<R>(&self, f: impl FnOnce(&mut Core<F>) -> Result<R>) -> Result<R> {
        let rc = self.core.upgrade().ok_or(CfbError::Disposed)?;
        let mut core = rc.borrow_mut();
        f(&mut core)
    }

    /// The stream's name.
    pub fn name(&self) -> Result<String> {
        self.with_core(|core| Ok(core.entry(self.sid)?.name.clone()))
    }

    /// Current length in bytes.
    pub fn len(&self) -> Result<u64> {
        self.with_core(|core| core.stream_len(self.sid))
    }

    /// Whether the stream holds no bytes.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read up to `buf.len()` bytes at the given offset. Returns the number
    /// of bytes read; reads past the end return fewer, or zero.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.with_core(|core| core.read_stream_at(self.sid, pos, buf))
    }

    /// Write `data` at the given offset, growing the stream when the write
    /// reaches past the current end.
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.with_core(|core| core.write_stream_at(self.sid, pos, data))
    }

    /// Append `data` at the current end.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let end = self.len()?;
        self.write_at(end, data)
    }

    /// Replace the whole payload.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        self.with_core(|core| core.set_stream_data(self.sid, data))
    }

    /// Read the whole payload.
    pub fn get_data(&self) -> Result<Vec<u8>> {
        self.with_core(|core| core.read_stream_data(self.sid))
    }

    /// Resize the stream. Growth zero-fills; shrinking frees tail sectors.
    /// Crossing the mini-stream cutoff relocates the payload byte for byte.
    pub fn resize(&mut self, len: u64) -> Result<()> {
        self.with_core(|core| core.set_stream_len(self.sid, len))
    }

    /// Replace this stream's payload with the full contents of `source`.
    pub fn copy_from(&mut self, source: &Stream<F>) -> Result<()> {
        let data = source.get_data()?;
        self.set_data(&data)
    }

    /// User-defined state bits.
    pub fn state_bits(&self) -> Result<u32> {
        self.with_core(|core| Ok(core.entry(self.sid)?.state_bits))
    }

    /// Set the user-defined state bits.
    pub fn set_state_bits(&self, bits: u32) -> Result<()> {
        self.with_core(|core| {
            core.entry_mut(self.sid)?.state_bits = bits;
            Ok(())
        })
    }

    /// Creation time, when recorded.
    pub fn creation_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_core(|core| Ok(filetime_to_datetime(core.entry(self.sid)?.creation_time)))
    }

    /// Last modification time, when recorded.
    pub fn modified_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_core(|core| Ok(filetime_to_datetime(core.entry(self.sid)?.modified_time)))
    }
}

impl<F: Read + Seek> Item<F> {
    /// The item's name.
    pub fn name(&self) -> Result<String> {
        match self {
            Item::Storage(storage) => storage.name(),
            Item::Stream(stream) => stream.name(),
        }
    }

    /// Payload length: a stream's byte count, zero for storages.
    pub fn size(&self) -> Result<u64> {
        match self {
            Item::Storage(storage) => storage.size(),
            Item::Stream(stream) => stream.len(),
        }
    }

    /// Whether this item is a storage.
    pub fn is_storage(&self) -> bool {
        matches!(self, Item::Storage(_))
    }

    /// Whether this item is a stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Item::Stream(_))
    }
}

impl<F: Read + Seek> io::Read for Stream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<F: Read + Seek> io::Write for Stream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F: Read + Seek> io::Seek for Stream<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.len()?;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => len as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
