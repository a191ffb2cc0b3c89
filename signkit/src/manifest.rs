/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! JAR manifest (`MANIFEST.MF` and `.SF`) reading and writing.

use std::{
    collections::BTreeMap,
    io::{self, Write},
};

use thiserror::Error;

pub const MANIFEST_VERSION: &str = "Manifest-Version";
pub const SIGNATURE_VERSION: &str = "Signature-Version";
pub const CREATED_BY: &str = "Created-By";
pub const NAME: &str = "Name";

/// Maximum number of bytes per physical line, excluding the line ending.
const LINE_LENGTH_MAX: usize = 72;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Line {0}: continuation line without preceding header")]
    UnexpectedContinuation(usize),
    #[error("Line {0}: missing ': ' separator")]
    MissingSeparator(usize),
    #[error("Line {0}: header is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("Line {0}: section does not start with a Name header")]
    MissingName(usize),
    #[error("Duplicate section: {0:?}")]
    DuplicateSection(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Ordered attributes of a single manifest section. Names are compared
/// case-insensitively.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.0[i].1.as_str())
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.position(&name) {
            Some(i) => self.0[i].1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.0.remove(i).1)
    }

    pub fn retain(&mut self, mut f: impl FnMut(&str, &str) -> bool) {
        self.0.retain(|(k, v)| f(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut attrs = Self::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

/// Write a single `name: value` header, wrapped so that no physical line
/// exceeds 72 bytes. Continuation lines start with a space. Multi-byte UTF-8
/// sequences are never split.
fn write_header(mut writer: impl Write, name: &str, value: &str) -> io::Result<()> {
    let line = format!("{name}: {value}");
    let mut remaining = line.as_str();
    let mut limit = LINE_LENGTH_MAX;

    loop {
        if remaining.len() <= limit {
            writer.write_all(remaining.as_bytes())?;
            writer.write_all(b"\r\n")?;
            return Ok(());
        }

        let mut split = limit;
        while !remaining.is_char_boundary(split) {
            split -= 1;
        }

        let (chunk, rest) = remaining.split_at(split);
        writer.write_all(chunk.as_bytes())?;
        writer.write_all(b"\r\n ")?;

        remaining = rest;
        // The leading space counts towards the line length.
        limit = LINE_LENGTH_MAX - 1;
    }
}

/// Write the main section. The version attribute, if present, comes first.
pub fn write_main_section(mut writer: impl Write, attrs: &Attributes) -> io::Result<()> {
    let version = [MANIFEST_VERSION, SIGNATURE_VERSION]
        .into_iter()
        .find_map(|k| attrs.get(k).map(|v| (k, v)));

    if let Some((k, v)) = version {
        write_header(&mut writer, k, v)?;
    }

    for (k, v) in attrs.iter() {
        if version.is_some_and(|(key, _)| k.eq_ignore_ascii_case(key)) {
            continue;
        }
        write_header(&mut writer, k, v)?;
    }

    writer.write_all(b"\r\n")
}

/// Write a per-entry section: the `Name` header, the attributes, and the
/// terminating blank line.
pub fn write_entry_section(
    mut writer: impl Write,
    name: &str,
    attrs: &Attributes,
) -> io::Result<()> {
    write_header(&mut writer, NAME, name)?;

    for (k, v) in attrs.iter() {
        write_header(&mut writer, k, v)?;
    }

    writer.write_all(b"\r\n")
}

/// Exact bytes of a per-entry section as emitted by [`Manifest::write`].
pub fn entry_section_bytes(name: &str, attrs: &Attributes) -> Vec<u8> {
    let mut buf = vec![];
    // Writing to a Vec cannot fail.
    let _ = write_entry_section(&mut buf, name, attrs);
    buf
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub main: Attributes,
    /// Per-entry sections, always in name order.
    pub entries: BTreeMap<String, Attributes>,
}

/// Split into logical lines, accepting `\r\n`, `\n` or `\r` endings.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = vec![];
    let mut start = 0;
    let mut i = 0;

    while i < data.len() {
        match data[i] {
            b'\r' => {
                lines.push(&data[start..i]);
                if data.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            b'\n' => {
                lines.push(&data[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    if start < data.len() {
        lines.push(&data[start..]);
    }

    lines
}

/// Parse the headers of every section. Each section is a list of
/// `(line number, name, value)` tuples.
fn parse_sections(data: &[u8]) -> Result<Vec<Vec<(usize, String, String)>>> {
    let mut sections = vec![];
    let mut headers: Vec<(usize, Vec<u8>)> = vec![];
    let mut main_done = false;

    let mut finish_section = |headers: &mut Vec<(usize, Vec<u8>)>| -> Result<()> {
        let mut section = vec![];

        for (line_num, raw) in headers.drain(..) {
            let text = String::from_utf8(raw).map_err(|_| Error::InvalidUtf8(line_num))?;
            let (k, v) = text
                .split_once(": ")
                .or_else(|| text.strip_suffix(':').map(|k| (k, "")))
                .ok_or(Error::MissingSeparator(line_num))?;

            section.push((line_num, k.to_owned(), v.to_owned()));
        }

        sections.push(section);
        Ok(())
    };

    for (i, line) in split_lines(data).into_iter().enumerate() {
        let line_num = i + 1;

        if line.is_empty() {
            // The first blank line ends the main section, even if it is empty.
            if !headers.is_empty() || !main_done {
                finish_section(&mut headers)?;
                main_done = true;
            }
        } else if let Some(cont) = line.strip_prefix(b" ") {
            match headers.last_mut() {
                Some((_, raw)) => raw.extend_from_slice(cont),
                None => return Err(Error::UnexpectedContinuation(line_num)),
            }
        } else {
            headers.push((line_num, line.to_vec()));
        }
    }

    if !headers.is_empty() {
        finish_section(&mut headers)?;
    }

    Ok(sections)
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut manifest = Self::new();
        let mut sections = parse_sections(data)?.into_iter();

        if let Some(main) = sections.next() {
            manifest.main = main.into_iter().map(|(_, k, v)| (k, v)).collect();
        }

        for section in sections {
            let mut headers = section.into_iter();

            let name = match headers.next() {
                Some((_, k, v)) if k.eq_ignore_ascii_case(NAME) => v,
                Some((line_num, _, _)) => return Err(Error::MissingName(line_num)),
                None => continue,
            };

            if manifest.entries.contains_key(&name) {
                return Err(Error::DuplicateSection(name));
            }

            let attrs = headers.map(|(_, k, v)| (k, v)).collect();
            manifest.entries.insert(name, attrs);
        }

        Ok(manifest)
    }

    pub fn write(&self, mut writer: impl Write) -> io::Result<()> {
        write_main_section(&mut writer, &self.main)?;

        for (name, attrs) in &self.entries {
            write_entry_section(&mut writer, name, attrs)?;
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![];
        // Writing to a Vec cannot fail.
        let _ = self.write(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_headers_are_not_wrapped() {
        let attrs: Attributes = [("SHA-256-Digest", "abc=")].into_iter().collect();

        assert_eq!(
            entry_section_bytes("a.txt", &attrs),
            b"Name: a.txt\r\nSHA-256-Digest: abc=\r\n\r\n",
        );
    }

    #[test]
    fn long_headers_are_wrapped_at_72_bytes() {
        let name = "x".repeat(200);
        let data = entry_section_bytes(&name, &Attributes::new());
        let text = std::str::from_utf8(&data).unwrap();

        let lines = text.split("\r\n").collect::<Vec<_>>();
        assert_eq!(lines[0].len(), 72);
        assert!(lines[1].starts_with(' '));
        assert!(lines.iter().all(|l| l.len() <= 72));

        let data = [b"Manifest-Version: 1.0\r\n\r\n".as_slice(), data.as_slice()].concat();
        let parsed = Manifest::parse(&data).unwrap();
        assert!(parsed.entries.contains_key(&name));
    }

    #[test]
    fn wrapping_never_splits_utf8() {
        // "Name: " is 6 bytes, so the 3-byte character would straddle byte 72.
        let name = format!("{}{}", "a".repeat(65), "\u{20ac}".repeat(4));
        let data = entry_section_bytes(&name, &Attributes::new());

        for line in data.split(|b| *b == b'\n') {
            assert!(std::str::from_utf8(line).is_ok());
        }

        let parsed = Manifest::parse(&[b"\r\n".as_slice(), data.as_slice()].concat()).unwrap();
        assert!(parsed.entries.contains_key(&name));
    }

    #[test]
    fn version_is_written_first() {
        let mut manifest = Manifest::new();
        manifest.main.insert(CREATED_BY, "test");
        manifest.main.insert(MANIFEST_VERSION, "1.0");

        assert_eq!(
            manifest.to_bytes(),
            b"Manifest-Version: 1.0\r\nCreated-By: test\r\n\r\n",
        );
    }

    #[test]
    fn parse_mixed_line_endings() {
        let data = b"Manifest-Version: 1.0\nCreated-By: 1.0 (Android)\r\n\r\n\
            Name: lib/arm64-v8a/libfoo.so\rSHA1-Digest: AAAA\r\n\r\n\
            Name: res/long\n ername.xml\nX-Custom: kept\n";
        let manifest = Manifest::parse(data).unwrap();

        assert_eq!(manifest.main.get("manifest-version"), Some("1.0"));
        assert_eq!(manifest.main.get(CREATED_BY), Some("1.0 (Android)"));
        assert_eq!(
            manifest.entries["lib/arm64-v8a/libfoo.so"].get("SHA1-Digest"),
            Some("AAAA"),
        );
        assert_eq!(
            manifest.entries["res/longername.xml"].get("X-Custom"),
            Some("kept"),
        );
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Manifest::parse(b" continued\r\n"),
            Err(Error::UnexpectedContinuation(1)),
        ));
        assert!(matches!(
            Manifest::parse(b"Manifest-Version 1.0\r\n"),
            Err(Error::MissingSeparator(1)),
        ));
        assert!(matches!(
            Manifest::parse(b"Manifest-Version: 1.0\r\n\r\nSHA1-Digest: AAAA\r\n"),
            Err(Error::MissingName(3)),
        ));
        assert!(matches!(
            Manifest::parse(b"\r\nName: a\r\n\r\nName: a\r\n"),
            Err(Error::DuplicateSection(n)) if n == "a",
        ));
    }

    #[test]
    fn attributes_are_case_insensitive() {
        let mut attrs = Attributes::new();
        attrs.insert("SHA1-Digest", "old");
        attrs.insert("sha1-digest", "new");

        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get("SHA1-DIGEST"), Some("new"));
        assert_eq!(attrs.remove("Sha1-Digest").as_deref(), Some("new"));
        assert!(attrs.is_empty());
    }
}
