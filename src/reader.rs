//! Stream abstraction over ELF object sources.
//!
//! The parser and loader consume objects through [`ElfReader`], a positioned
//! seek+read capability. Two sources are provided: a file on the filesystem
//! and an in-memory byte buffer.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// A seek/read capability over an ELF object source.
///
/// `ElfReader` abstracts the underlying storage (memory, file system, etc.)
/// providing a unified interface for the loader to access ELF structures.
/// Any failure is surfaced as [`Error::ReadFailed`]; the loader never
/// retries.
pub trait ElfReader {
    /// Returns the full name or path of the ELF object.
    fn file_name(&self) -> &str;

    /// Reads `buf.len()` bytes starting at `offset` within the object.
    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()>;

    /// Returns the short name of the ELF object (the filename without the path).
    fn shortname(&self) -> &str {
        let name = self.file_name();
        name.rsplit('/').next().unwrap_or(name)
    }
}

/// An ELF object source backed by an in-memory byte slice.
///
/// Useful for objects that are already in memory, such as ones embedded in
/// the application image or received over a network.
#[derive(Debug)]
pub struct ElfBinary<'bytes> {
    name: String,
    bytes: &'bytes [u8],
}

impl<'bytes> ElfBinary<'bytes> {
    /// Creates a new memory-based ELF object source.
    ///
    /// `name` is an identifier used for error reporting and duplicate-open
    /// detection; it does not need to name a real file.
    pub fn new(name: &str, bytes: &'bytes [u8]) -> Self {
        Self {
            name: name.to_string(),
            bytes,
        }
    }
}

impl ElfReader for ElfBinary<'_> {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        let end = offset.checked_add(buf.len()).ok_or(Error::ReadFailed)?;
        let src = self.bytes.get(offset..end).ok_or(Error::ReadFailed)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// An ELF object source backed by a file on the filesystem.
pub struct ElfFile {
    name: String,
    file: File,
}

impl ElfFile {
    /// Opens the file at `path` for use as an ELF object source.
    pub fn from_path(path: impl AsRef<str>) -> Result<Self> {
        let name = path.as_ref().to_string();
        let file = File::open(&name).map_err(|_| Error::ReadFailed)?;
        Ok(ElfFile { name, file })
    }

    /// Wraps an already-open file.
    pub fn from_file(path: &str, file: File) -> Self {
        ElfFile {
            name: path.to_string(),
            file,
        }
    }
}

impl ElfReader for ElfFile {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|_| Error::ReadFailed)?;
        self.file.read_exact(buf).map_err(|_| Error::ReadFailed)
    }
}
