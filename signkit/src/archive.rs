/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! A read/overwrite view over a zip archive. Entries that are never touched
//! are read straight from the backing archive. Staged entries are kept in
//! memory and shadow the original data.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Cursor, Read, Write},
};

use thiserror::Error;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive, result::ZipError};

use crate::stream::ReadSeek;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Archive has already been closed")]
    Closed,
    #[error("Entry not found: {0:?}")]
    NotFound(String),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("Zip error for entry: {0:?}")]
    ZipEntryName(String, #[source] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub compression: CompressionMethod,
    pub is_dir: bool,
    /// Whether the entry exists in the backing archive.
    pub original: bool,
}

enum Backing {
    Seekable(ZipArchive<Box<dyn ReadSeek>>),
    Materialized(HashMap<String, Vec<u8>>),
}

pub struct ArchiveOverlay {
    /// [`None`] once closed.
    backing: Option<Backing>,
    /// Backing archive order, followed by newly added entries.
    index: Vec<EntryInfo>,
    /// Position of each name in `index`.
    positions: HashMap<String, usize>,
    staged: HashMap<String, Vec<u8>>,
}

impl ArchiveOverlay {
    fn index_archive<R: Read + io::Seek>(zip: &mut ZipArchive<R>) -> Result<Vec<EntryInfo>> {
        let mut index = Vec::with_capacity(zip.len());

        for i in 0..zip.len() {
            let entry = zip.by_index_raw(i)?;

            index.push(EntryInfo {
                name: entry.name().to_owned(),
                compression: entry.compression(),
                is_dir: entry.is_dir(),
                original: true,
            });
        }

        Ok(index)
    }

    fn new(backing: Backing, index: Vec<EntryInfo>) -> Self {
        let mut positions = HashMap::with_capacity(index.len());
        for (i, info) in index.iter().enumerate() {
            // Duplicate names resolve to the first occurrence.
            positions.entry(info.name.clone()).or_insert(i);
        }

        Self {
            backing: Some(backing),
            index,
            positions,
            staged: HashMap::new(),
        }
    }

    /// Open an archive backed by a file. Entry data is read lazily.
    pub fn open_file(file: File) -> Result<Self> {
        Self::open_seekable(BufReader::new(file))
    }

    /// Open an archive backed by any seekable reader. Entry data is read
    /// lazily.
    pub fn open_seekable(reader: impl ReadSeek + 'static) -> Result<Self> {
        let reader: Box<dyn ReadSeek> = Box::new(reader);
        let mut zip = ZipArchive::new(reader)?;
        let index = Self::index_archive(&mut zip)?;

        debug!("Opened seekable archive with {} entries", index.len());

        Ok(Self::new(Backing::Seekable(zip), index))
    }

    /// Open an archive from a forward-only stream. Every entry is read into
    /// memory before this returns and nothing refers to the stream afterwards.
    pub fn open_stream(mut reader: impl Read) -> Result<Self> {
        let mut data = vec![];
        reader.read_to_end(&mut data)?;

        let mut zip = ZipArchive::new(Cursor::new(data))?;
        let index = Self::index_archive(&mut zip)?;
        let mut contents = HashMap::with_capacity(index.len());

        for (i, info) in index.iter().enumerate() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::ZipEntryName(info.name.clone(), e))?;
            // Declared sizes are not trusted for preallocation.
            let mut buf = vec![];
            entry.read_to_end(&mut buf)?;

            contents.insert(info.name.clone(), buf);
        }

        debug!("Materialized streamed archive with {} entries", index.len());

        Ok(Self::new(Backing::Materialized(contents), index))
    }

    fn backing(&mut self) -> Result<&mut Backing> {
        self.backing.as_mut().ok_or(Error::Closed)
    }

    /// Open a reader for the current contents of an entry. Staged data takes
    /// precedence over the backing archive.
    pub fn read_entry(&mut self, name: &str) -> Result<Box<dyn Read + '_>> {
        let backing = self.backing.as_mut().ok_or(Error::Closed)?;

        if let Some(data) = self.staged.get(name) {
            return Ok(Box::new(data.as_slice()));
        }

        match backing {
            Backing::Seekable(zip) => match zip.by_name(name) {
                Ok(entry) => Ok(Box::new(entry)),
                Err(ZipError::FileNotFound) => Err(Error::NotFound(name.to_owned())),
                Err(e) => Err(Error::ZipEntryName(name.to_owned(), e)),
            },
            Backing::Materialized(contents) => match contents.get(name) {
                Some(data) => Ok(Box::new(data.as_slice())),
                None => Err(Error::NotFound(name.to_owned())),
            },
        }
    }

    /// Read the full current contents of an entry.
    pub fn get(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut reader = self.read_entry(name)?;
        let mut buf = vec![];
        reader.read_to_end(&mut buf)?;

        Ok(buf)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    pub fn entry(&self, name: &str) -> Option<&EntryInfo> {
        self.positions.get(name).map(|&i| &self.index[i])
    }

    /// All entries: the backing archive's order followed by newly added
    /// entries in the order they were first committed.
    pub fn entries(&self) -> impl Iterator<Item = &EntryInfo> {
        self.index.iter()
    }

    /// Start replacing or adding an entry. Nothing changes until
    /// [`StagedEntry::commit`] is called.
    pub fn stage(&mut self, name: &str) -> Result<StagedEntry<'_>> {
        self.backing()?;

        Ok(StagedEntry {
            overlay: self,
            name: name.to_owned(),
            buf: vec![],
        })
    }

    /// Replace or add an entry in one step.
    pub fn put(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut staged = self.stage(name)?;
        staged.write_all(data)?;
        staged.commit()
    }

    fn commit(&mut self, name: String, data: Vec<u8>) -> Result<()> {
        self.backing()?;

        if !self.contains(&name) {
            self.positions.insert(name.clone(), self.index.len());
            self.index.push(EntryInfo {
                name: name.clone(),
                compression: CompressionMethod::Deflated,
                is_dir: false,
                original: false,
            });
        }

        debug!("Staged {} bytes for {name:?}", data.len());
        self.staged.insert(name, data);

        Ok(())
    }

    /// Release the backing archive. All further reads and writes fail.
    pub fn close(&mut self) {
        self.backing = None;
        self.staged.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.backing.is_none()
    }
}

/// Buffered replacement for an entry. Dropping it without calling
/// [`Self::commit`] leaves the overlay untouched.
pub struct StagedEntry<'a> {
    overlay: &'a mut ArchiveOverlay,
    name: String,
    buf: Vec<u8>,
}

impl StagedEntry<'_> {
    pub fn commit(self) -> Result<()> {
        self.overlay.commit(self.name, self.buf)
    }
}

impl Write for StagedEntry<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
