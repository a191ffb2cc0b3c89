/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::io::{self, Read, Seek, Write};

use ring::digest::Context;

pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

/// Read into `buf` until it is full or the reader reaches EOF. Returns the
/// number of bytes read. Unlike [`Read::read_exact`], a short read is not an
/// error.
pub fn read_full(mut reader: impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;

    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(count) => n += count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(n)
}

/// Copy exactly `size` bytes from `reader` to `writer`. Reaching EOF early is
/// reported as [`io::ErrorKind::UnexpectedEof`].
pub fn copy_n(reader: impl Read, mut writer: impl Write, size: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(size), &mut writer)?;

    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Expected {size} bytes, but only read {copied}"),
        ));
    }

    Ok(())
}

/// A writer that feeds every byte written through a digest context before
/// passing it on to the inner writer.
pub struct HashingWriter<W: Write> {
    inner: W,
    context: Context,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, context: Context) -> Self {
        Self { inner, context }
    }

    pub fn finish(self) -> (W, Context) {
        (self.inner, self.context)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
