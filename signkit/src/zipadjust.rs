/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Normalize the layout of a zip archive. Every local header is regenerated
//! from its central directory entry, so the two always agree. Data
//! descriptors, extra fields, comments, and any gaps between entries are
//! dropped. Entry data is copied verbatim.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::debug;

use crate::stream;

pub const LOCAL_HEADER_MAGIC: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_MAGIC: u32 = 0x0201_4b50;
pub const EOCD_MAGIC: u32 = 0x0605_4b50;

const LOCAL_HEADER_SIZE: u64 = 30;
const CENTRAL_HEADER_SIZE: u64 = 46;
/// Size of the end of central directory record, excluding the comment.
pub const EOCD_SIZE: u64 = 22;
const COMMENT_SIZE_MAX: u64 = 0xffff;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("End of central directory record not found")]
    EocdNotFound,
    #[error("Multi-disk archives are not supported")]
    MultiDisk,
    #[error("Zip64 archives are not supported")]
    Zip64,
    #[error("Central directory ({offset}+{size}) overlaps the end record at {eocd_offset}")]
    InvalidCentralDirectory {
        offset: u32,
        size: u32,
        eocd_offset: u64,
    },
    #[error("Invalid {kind} magic at offset {offset}: {magic:#010x}")]
    InvalidMagic {
        kind: &'static str,
        offset: u64,
        magic: u32,
    },
    #[error("Output exceeds 4GiB at offset {0}")]
    TooLarge(u64),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn read_magic(mut reader: impl Read, expected: u32, kind: &'static str, offset: u64) -> Result<()> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != expected {
        return Err(Error::InvalidMagic {
            kind,
            offset,
            magic,
        });
    }

    Ok(())
}

fn to_u32(offset: u64) -> Result<u32> {
    offset.try_into().map_err(|_| Error::TooLarge(offset))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_disk_number: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    /// Parse a record, excluding the magic.
    fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        Ok(Self {
            disk_number: reader.read_u16::<LittleEndian>()?,
            cd_disk_number: reader.read_u16::<LittleEndian>()?,
            disk_entries: reader.read_u16::<LittleEndian>()?,
            total_entries: reader.read_u16::<LittleEndian>()?,
            cd_size: reader.read_u32::<LittleEndian>()?,
            cd_offset: reader.read_u32::<LittleEndian>()?,
            comment_len: reader.read_u16::<LittleEndian>()?,
        })
    }

    /// Write the record with an empty comment.
    fn to_writer(&self, mut writer: impl Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(EOCD_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.disk_number)?;
        writer.write_u16::<LittleEndian>(self.cd_disk_number)?;
        writer.write_u16::<LittleEndian>(self.disk_entries)?;
        writer.write_u16::<LittleEndian>(self.total_entries)?;
        writer.write_u32::<LittleEndian>(self.cd_size)?;
        writer.write_u32::<LittleEndian>(self.cd_offset)?;
        writer.write_u16::<LittleEndian>(0)?;

        Ok(())
    }

    /// Find the last end of central directory record in the file. Returns
    /// the record's offset and contents.
    pub fn find(mut reader: impl Read + Seek) -> Result<(u64, Self)> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        if file_size < EOCD_SIZE {
            return Err(Error::EocdNotFound);
        }

        let window = file_size.min(EOCD_SIZE + COMMENT_SIZE_MAX);
        let window_start = file_size - window;
        let mut buf = vec![0u8; window as usize];
        reader.seek(SeekFrom::Start(window_start))?;
        reader.read_exact(&mut buf)?;

        let magic = EOCD_MAGIC.to_le_bytes();

        for i in (0..=buf.len() - EOCD_SIZE as usize).rev() {
            if buf[i..i + 4] != magic {
                continue;
            }

            let eocd = Self::from_reader(&buf[i + 4..])?;
            let end = i as u64 + EOCD_SIZE + u64::from(eocd.comment_len);

            if end <= window {
                return Ok((window_start + i as u64, eocd));
            }
        }

        Err(Error::EocdNotFound)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct CentralHeader {
    version_made_by: u16,
    version_needed: u16,
    flags: u16,
    compression: u16,
    mod_time: u16,
    mod_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    disk_number_start: u16,
    internal_attrs: u16,
    external_attrs: u32,
    local_header_offset: u32,
    name: Vec<u8>,
}

impl CentralHeader {
    fn from_reader(mut reader: impl Read + Seek) -> Result<Self> {
        let offset = reader.stream_position()?;
        read_magic(&mut reader, CENTRAL_HEADER_MAGIC, "central header", offset)?;

        let version_made_by = reader.read_u16::<LittleEndian>()?;
        let version_needed = reader.read_u16::<LittleEndian>()?;
        let flags = reader.read_u16::<LittleEndian>()?;
        let compression = reader.read_u16::<LittleEndian>()?;
        let mod_time = reader.read_u16::<LittleEndian>()?;
        let mod_date = reader.read_u16::<LittleEndian>()?;
        let crc32 = reader.read_u32::<LittleEndian>()?;
        let compressed_size = reader.read_u32::<LittleEndian>()?;
        let uncompressed_size = reader.read_u32::<LittleEndian>()?;
        let name_len = reader.read_u16::<LittleEndian>()?;
        let extra_len = reader.read_u16::<LittleEndian>()?;
        let comment_len = reader.read_u16::<LittleEndian>()?;
        let disk_number_start = reader.read_u16::<LittleEndian>()?;
        let internal_attrs = reader.read_u16::<LittleEndian>()?;
        let external_attrs = reader.read_u32::<LittleEndian>()?;
        let local_header_offset = reader.read_u32::<LittleEndian>()?;

        if compressed_size == u32::MAX
            || uncompressed_size == u32::MAX
            || local_header_offset == u32::MAX
        {
            return Err(Error::Zip64);
        }

        let mut name = vec![0u8; name_len.into()];
        reader.read_exact(&mut name)?;
        reader.seek(SeekFrom::Current(
            i64::from(extra_len) + i64::from(comment_len),
        ))?;

        Ok(Self {
            version_made_by,
            version_needed,
            flags,
            compression,
            mod_time,
            mod_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number_start,
            internal_attrs,
            external_attrs,
            local_header_offset,
            name,
        })
    }

    /// Write the header without an extra field or comment. Returns the number
    /// of bytes written.
    fn to_writer(&self, mut writer: impl Write) -> Result<u64> {
        writer.write_u32::<LittleEndian>(CENTRAL_HEADER_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.version_made_by)?;
        writer.write_u16::<LittleEndian>(self.version_needed)?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        writer.write_u16::<LittleEndian>(self.compression)?;
        writer.write_u16::<LittleEndian>(self.mod_time)?;
        writer.write_u16::<LittleEndian>(self.mod_date)?;
        writer.write_u32::<LittleEndian>(self.crc32)?;
        writer.write_u32::<LittleEndian>(self.compressed_size)?;
        writer.write_u32::<LittleEndian>(self.uncompressed_size)?;
        // Read from a u16, so cannot overflow.
        writer.write_u16::<LittleEndian>(self.name.len() as u16)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u16::<LittleEndian>(self.disk_number_start)?;
        writer.write_u16::<LittleEndian>(self.internal_attrs)?;
        writer.write_u32::<LittleEndian>(self.external_attrs)?;
        writer.write_u32::<LittleEndian>(self.local_header_offset)?;
        writer.write_all(&self.name)?;

        Ok(CENTRAL_HEADER_SIZE + self.name.len() as u64)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct LocalHeader {
    version_needed: u16,
    flags: u16,
    compression: u16,
    mod_time: u16,
    mod_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    name: Vec<u8>,
}

impl LocalHeader {
    /// Parse a local header and skip past its name and extra field, leaving
    /// the reader at the start of the entry data.
    fn from_reader(mut reader: impl Read + Seek) -> Result<Self> {
        let offset = reader.stream_position()?;
        read_magic(&mut reader, LOCAL_HEADER_MAGIC, "local header", offset)?;

        let version_needed = reader.read_u16::<LittleEndian>()?;
        let flags = reader.read_u16::<LittleEndian>()?;
        let compression = reader.read_u16::<LittleEndian>()?;
        let mod_time = reader.read_u16::<LittleEndian>()?;
        let mod_date = reader.read_u16::<LittleEndian>()?;
        let crc32 = reader.read_u32::<LittleEndian>()?;
        let compressed_size = reader.read_u32::<LittleEndian>()?;
        let uncompressed_size = reader.read_u32::<LittleEndian>()?;
        let name_len = reader.read_u16::<LittleEndian>()?;
        let extra_len = reader.read_u16::<LittleEndian>()?;

        let mut name = vec![0u8; name_len.into()];
        reader.read_exact(&mut name)?;
        reader.seek(SeekFrom::Current(extra_len.into()))?;

        Ok(Self {
            version_needed,
            flags,
            compression,
            mod_time,
            mod_date,
            crc32,
            compressed_size,
            uncompressed_size,
            name,
        })
    }

    fn to_writer(&self, mut writer: impl Write) -> Result<u64> {
        writer.write_u32::<LittleEndian>(LOCAL_HEADER_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.version_needed)?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        writer.write_u16::<LittleEndian>(self.compression)?;
        writer.write_u16::<LittleEndian>(self.mod_time)?;
        writer.write_u16::<LittleEndian>(self.mod_date)?;
        writer.write_u32::<LittleEndian>(self.crc32)?;
        writer.write_u32::<LittleEndian>(self.compressed_size)?;
        writer.write_u32::<LittleEndian>(self.uncompressed_size)?;
        writer.write_u16::<LittleEndian>(self.name.len() as u16)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_all(&self.name)?;

        Ok(LOCAL_HEADER_SIZE + self.name.len() as u64)
    }
}

/// Rewrite `reader`'s archive to `writer` with normalized headers. Returns the
/// size of the output.
pub fn zip_adjust(mut reader: impl Read + Seek, mut writer: impl Write) -> Result<u64> {
    let (eocd_offset, mut eocd) = EndOfCentralDirectory::find(&mut reader)?;

    if eocd.disk_number != 0 || eocd.cd_disk_number != 0 || eocd.disk_entries != eocd.total_entries
    {
        return Err(Error::MultiDisk);
    } else if eocd.cd_offset == u32::MAX || eocd.cd_size == u32::MAX {
        return Err(Error::Zip64);
    } else if u64::from(eocd.cd_offset) + u64::from(eocd.cd_size) > eocd_offset {
        return Err(Error::InvalidCentralDirectory {
            offset: eocd.cd_offset,
            size: eocd.cd_size,
            eocd_offset,
        });
    }

    // Bounded by the file size.
    let mut cd = vec![0u8; eocd.cd_size as usize];
    reader.seek(SeekFrom::Start(eocd.cd_offset.into()))?;
    reader.read_exact(&mut cd)?;

    let mut cd_reader = Cursor::new(cd);
    let mut headers = Vec::with_capacity(eocd.total_entries.into());
    for _ in 0..eocd.total_entries {
        headers.push(CentralHeader::from_reader(&mut cd_reader)?);
    }

    let mut offset = 0;

    for header in &mut headers {
        reader.seek(SeekFrom::Start(header.local_header_offset.into()))?;
        let local = LocalHeader::from_reader(&mut reader)?;

        header.flags &= !FLAG_DATA_DESCRIPTOR;
        header.local_header_offset = to_u32(offset)?;

        let local = LocalHeader {
            flags: header.flags,
            crc32: header.crc32,
            compressed_size: header.compressed_size,
            uncompressed_size: header.uncompressed_size,
            name: header.name.clone(),
            ..local
        };

        offset += local.to_writer(&mut writer)?;
        stream::copy_n(&mut reader, &mut writer, header.compressed_size.into())?;
        offset += u64::from(header.compressed_size);
    }

    let cd_offset = offset;
    for header in &headers {
        offset += header.to_writer(&mut writer)?;
    }

    eocd.cd_offset = to_u32(cd_offset)?;
    eocd.cd_size = to_u32(offset - cd_offset)?;
    eocd.comment_len = 0;
    eocd.to_writer(&mut writer)?;
    offset += EOCD_SIZE;

    writer.flush()?;

    debug!("Adjusted {} entries; output is {offset} bytes", headers.len());

    Ok(offset)
}
