//! Longan - a Rust library for Microsoft Compound File Binary containers
//!
//! This library reads, modifies and writes CFB (OLE2 structured storage)
//! files: the hierarchical container format behind legacy Office documents,
//! MSI packages, OLE property sets and many other Windows file types. A
//! compound file is a small file system inside one file - a tree of named
//! *storages* (directories) holding *streams* (byte payloads), laid out over
//! fixed-size sectors tracked by allocation tables.
//!
//! # Features
//!
//! - **Version 3 and 4 files**: 512- and 4096-byte sectors, including the
//!   range-lock reservation for v4 files growing past 2 GiB
//! - **In-place editing**: create, resize, rename and delete streams and
//!   storages, then `commit` dirty sectors back to the file
//! - **Mini stream management**: streams under the cutoff live in 64-byte
//!   mini sectors and move between the mini stream and normal sectors
//!   automatically as they grow and shrink
//! - **Hostile input detection**: cyclic chains, out-of-range sector IDs and
//!   malformed directory records surface as `CorruptedFile` errors, or are
//!   skipped in lenient mode
//! - **Compaction**: `shrink` rewrites a v3 file without its free sectors
//!
//! # Example - creating a file
//!
//! ```no_run
//! use longan::{CompoundFile, Version};
//! use std::io::Cursor;
//!
//! # fn main() -> longan::Result<()> {
//! let mut comp = CompoundFile::create(Cursor::new(Vec::new()), Version::V3)?;
//! let root = comp.root_storage();
//!
//! let mut stream = root.add_stream("MyStream")?;
//! stream.set_data(b"Hello, World!")?;
//!
//! let storage = root.add_storage("MyStorage")?;
//! let mut nested = storage.add_stream("Nested")?;
//! nested.set_data(b"nested content")?;
//!
//! comp.save_as("output.cfb")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example - editing in place
//!
//! ```no_run
//! use longan::CompoundFile;
//!
//! # fn main() -> longan::Result<()> {
//! let mut comp = CompoundFile::open_path_update("report.xls")?;
//! let root = comp.root_storage();
//!
//! let mut workbook = root.get_stream("Workbook")?;
//! workbook.append(&[0u8; 16])?;
//!
//! comp.commit()?;
//! # Ok(())
//! # }
//! ```

/// On-disk constants: signature, sector markers, entry types
pub mod consts;

/// Error type and result alias
mod error;

/// Configuration flags, format version and open mode
mod config;

/// Windows FILETIME conversions
pub mod time;

/// Header codec
mod header;

/// Sectors and the sparse sector index
mod sector;

/// FAT, mini-FAT and DIFAT management
mod fat;

/// Directory records and the red-black sibling trees
mod directory;

/// Chain-backed byte stream views
mod stream_view;

/// Storage and stream handles
mod storage;

/// The compound file controller
mod compound;

#[cfg(test)]
mod tests;

// Re-export public types for convenient access
pub use compound::{shrink, shrink_path, CompoundFile, Truncate};
pub use config::{Config, UpdateMode, Version};
pub use directory::entry::format_clsid;
pub use error::{CfbError, Result};
pub use storage::{Item, Storage, Stream};

use consts::{MAGIC, MINIMAL_FILE_SIZE};

/// Check whether a byte buffer starts like a compound file.
pub fn is_compound_file(data: &[u8]) -> bool {
    data.len() >= MINIMAL_FILE_SIZE && &data[0..8] == MAGIC
}
