/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! JAR signature scheme v1 signing.
//!
//! The output is fully deterministic. Entries are written in name order with a
//! fixed timestamp. STORED entries come first so that their data can be
//! aligned. Then come the compressed entries, the manifest, and finally one
//! `.SF` file and signature block per signer.

use std::{
    io::{self, Read, Seek, Write},
    sync::LazyLock,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use byteorder::{LittleEndian, WriteBytesExt};
use const_oid::{ObjectIdentifier, db::rfc5912};
use regex::Regex;
use ring::digest::{self, Context};
use thiserror::Error;
use tracing::{debug, info};
use x509_cert::{Certificate, der::Encode};
use zip::{CompressionMethod, DateTime, ZipWriter, result::ZipError, write::FileOptions};

use crate::{
    archive::{self, ArchiveOverlay},
    crypto::{self, KeyAlgorithm, SignatureAlgorithm, SigningKey, VerifyingKey},
    manifest::{self, Attributes, CREATED_BY, MANIFEST_VERSION, Manifest, SIGNATURE_VERSION},
    signer::SignerConfig,
};

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";

/// Default alignment for STORED entries.
pub const DEFAULT_ALIGNMENT: u16 = 4;
/// Alignment for native libraries so that they can be mapped directly.
pub const LIBRARY_ALIGNMENT: u16 = 4096;

const COMPRESSION_LEVEL: i32 = 9;

/// Extra field that marks a file as a JAR. Always on the first entry.
const JAR_MAGIC_ID: u16 = 0xcafe;
/// Android's zipalign extra field: alignment (u16) followed by padding.
const ALIGNMENT_EXTRA_ID: u16 = 0xd935;
const ALIGNMENT_EXTRA_HEADER_SIZE: u64 = 6;

const CREATED_BY_VALUE: &str = "1.0 (Android SignApk)";
const APK_SIGNED_ATTRIBUTE: &str = "X-Android-APK-Signed";
/// Tells v2-aware verifiers to reject the file if the v2 signature was
/// stripped.
const APK_SIGNED_VALUE: &str = "2";

static STRIP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(META-INF/(.*\.(SF|RSA|DSA|EC)|com/android/otacert)|META-INF/MANIFEST\.MF)$")
        .expect("Invalid strip pattern")
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("No signers specified")]
    NoSigners,
    #[error("Unsupported certificate signature algorithm: {0}")]
    UnsupportedCertificateAlgorithm(ObjectIdentifier),
    #[error("Invalid fixed timestamp")]
    InvalidTimestamp,
    #[error("Entry {name:?} data starts at {offset}, which is not a multiple of {alignment}")]
    MisalignedEntry {
        name: String,
        offset: u64,
        alignment: u16,
    },
    #[error("Manifest error")]
    Manifest(#[from] manifest::Error),
    #[error("Archive error")]
    Archive(#[from] archive::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("DER error")]
    Der(#[from] x509_cert::der::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("Zip error for entry: {0:?}")]
    ZipEntryName(String, #[source] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn ring_algorithm(self) -> &'static digest::Algorithm {
        match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
        }
    }

    /// Per-entry attribute name.
    pub fn attribute(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1-Digest",
            Self::Sha256 => "SHA-256-Digest",
        }
    }

    /// `.SF` main attribute name for the digest of the whole manifest.
    pub fn manifest_attribute(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1-Digest-Manifest",
            Self::Sha256 => "SHA-256-Digest-Manifest",
        }
    }
}

/// Set of digests to include for each manifest entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DigestMask {
    pub sha1: bool,
    pub sha256: bool,
}

impl DigestMask {
    pub fn insert(&mut self, algorithm: DigestAlgorithm) {
        match algorithm {
            DigestAlgorithm::Sha1 => self.sha1 = true,
            DigestAlgorithm::Sha256 => self.sha256 = true,
        }
    }

    pub fn algorithms(self) -> impl Iterator<Item = DigestAlgorithm> {
        [
            (self.sha1, DigestAlgorithm::Sha1),
            (self.sha256, DigestAlgorithm::Sha256),
        ]
        .into_iter()
        .filter_map(|(enabled, a)| enabled.then_some(a))
    }
}

impl From<DigestAlgorithm> for DigestMask {
    fn from(algorithm: DigestAlgorithm) -> Self {
        let mut mask = Self::default();
        mask.insert(algorithm);
        mask
    }
}

/// Pick the digest algorithm based on how the certificate itself was signed.
pub fn digest_algorithm_for_cert(cert: &Certificate) -> Result<DigestAlgorithm> {
    match cert.signature_algorithm.oid {
        rfc5912::SHA_1_WITH_RSA_ENCRYPTION | rfc5912::MD_5_WITH_RSA_ENCRYPTION => {
            Ok(DigestAlgorithm::Sha1)
        }
        rfc5912::SHA_256_WITH_RSA_ENCRYPTION | rfc5912::ECDSA_WITH_SHA_256 => {
            Ok(DigestAlgorithm::Sha256)
        }
        oid => Err(Error::UnsupportedCertificateAlgorithm(oid)),
    }
}

/// Signature algorithm for the signature block. RSA follows the certificate's
/// digest algorithm. EC always uses SHA-256.
pub fn signature_algorithm_for_cert(cert: &Certificate) -> Result<SignatureAlgorithm> {
    match VerifyingKey::from_cert(cert)?.algorithm() {
        KeyAlgorithm::Rsa => match digest_algorithm_for_cert(cert)? {
            DigestAlgorithm::Sha1 => Ok(SignatureAlgorithm::Sha1WithRsa),
            DigestAlgorithm::Sha256 => Ok(SignatureAlgorithm::Sha256WithRsa),
        },
        KeyAlgorithm::Ec => Ok(SignatureAlgorithm::Sha256WithEcdsa),
    }
}

/// Whether an entry is produced by signing and must not be digested.
pub fn is_signature_artifact(name: &str) -> bool {
    STRIP_PATTERN.is_match(name)
}

fn digest_reader(mut reader: impl Read, mask: DigestMask) -> io::Result<Vec<digest::Digest>> {
    let mut contexts = mask
        .algorithms()
        .map(|a| Context::new(a.ring_algorithm()))
        .collect::<Vec<_>>();
    let mut buf = [0u8; 16384];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        for context in &mut contexts {
            context.update(&buf[..n]);
        }
    }

    Ok(contexts.into_iter().map(|c| c.finish()).collect())
}

/// Build a fresh manifest with digests of every non-directory entry. Main
/// attributes and non-digest entry attributes are carried over from the
/// existing manifest, if there is one.
pub fn add_digests_to_manifest(overlay: &mut ArchiveOverlay, mask: DigestMask) -> Result<Manifest> {
    let existing = if overlay.contains(MANIFEST_NAME) {
        Some(Manifest::parse(&overlay.get(MANIFEST_NAME)?)?)
    } else {
        None
    };

    let mut output = Manifest::new();

    match &existing {
        Some(m) => output.main = m.main.clone(),
        None => {
            output.main.insert(MANIFEST_VERSION, "1.0");
            output.main.insert(CREATED_BY, CREATED_BY_VALUE);
        }
    }

    let mut names = overlay
        .entries()
        .filter(|e| !e.is_dir && !is_signature_artifact(&e.name))
        .map(|e| e.name.clone())
        .collect::<Vec<_>>();
    names.sort();

    for name in names {
        let digests = digest_reader(overlay.read_entry(&name)?, mask)?;

        let mut attrs = existing
            .as_ref()
            .and_then(|m| m.entries.get(&name))
            .cloned()
            .unwrap_or_default();
        attrs.retain(|k, _| !k.to_ascii_lowercase().ends_with("-digest"));

        for (algorithm, digest) in mask.algorithms().zip(digests) {
            attrs.insert(algorithm.attribute(), STANDARD.encode(digest));
        }

        output.entries.insert(name, attrs);
    }

    debug!("Computed digests for {} entries", output.entries.len());

    Ok(output)
}

/// Generate the `.SF` file. Each per-entry digest covers exactly the bytes of
/// that entry's section in the serialized manifest.
pub fn write_signature_file(manifest: &Manifest, algorithm: DigestAlgorithm) -> Vec<u8> {
    let mut sf = Manifest::new();
    sf.main.insert(SIGNATURE_VERSION, "1.0");
    sf.main.insert(CREATED_BY, CREATED_BY_VALUE);
    sf.main.insert(APK_SIGNED_ATTRIBUTE, APK_SIGNED_VALUE);

    let manifest_digest = digest::digest(algorithm.ring_algorithm(), &manifest.to_bytes());
    sf.main
        .insert(algorithm.manifest_attribute(), STANDARD.encode(manifest_digest));

    for (name, attrs) in &manifest.entries {
        let section = manifest::entry_section_bytes(name, attrs);
        let section_digest = digest::digest(algorithm.ring_algorithm(), &section);

        let mut sf_attrs = Attributes::new();
        sf_attrs.insert(algorithm.attribute(), STANDARD.encode(section_digest));
        sf.entries.insert(name.clone(), sf_attrs);
    }

    let mut data = sf.to_bytes();
    pad_signature_file(&mut data);

    data
}

/// Older versions of Android fail to parse `.SF` files whose size is an exact
/// multiple of 1024 bytes.
fn pad_signature_file(data: &mut Vec<u8>) {
    if data.len() % 1024 == 0 {
        data.extend_from_slice(b"\r\n");
    }
}

/// Generate a DER-encoded detached CMS signature over the `.SF` file.
pub fn write_signature_block(sf: &[u8], cert: &Certificate, key: &SigningKey) -> Result<Vec<u8>> {
    let algorithm = signature_algorithm_for_cert(cert)?;
    let ci = crypto::cms_sign_detached(key, cert, algorithm, sf)?;

    Ok(ci.to_der()?)
}

/// Zip writer that handles the JAR magic on the first entry, the fixed
/// timestamp, and data alignment for STORED entries.
pub struct JarWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    timestamp: DateTime,
    first_entry: bool,
}

impl<W: Write + Seek> JarWriter<W> {
    pub fn new(writer: W) -> Result<Self> {
        // 2009-01-01 00:00:00
        let timestamp =
            DateTime::from_date_and_time(2009, 1, 1, 0, 0, 0).map_err(|_| Error::InvalidTimestamp)?;

        Ok(Self {
            zip: ZipWriter::new(writer),
            timestamp,
            first_entry: true,
        })
    }

    /// Begin a new entry. Data for STORED entries will start at a multiple of
    /// `alignment` bytes. Alignment is ignored for compressed entries.
    pub fn start_entry(
        &mut self,
        name: &str,
        compression: CompressionMethod,
        alignment: u16,
    ) -> Result<()> {
        let mut options = FileOptions::default()
            .compression_method(compression)
            .last_modified_time(self.timestamp)
            .unix_permissions(0o644);
        if compression == CompressionMethod::Deflated {
            options = options.compression_level(Some(COMPRESSION_LEVEL));
        }

        let align = compression == CompressionMethod::Stored && alignment > 1;

        if !self.first_entry && !align {
            self.zip
                .start_file(name, options)
                .map_err(|e| Error::ZipEntryName(name.to_owned(), e))?;
            return Ok(());
        }

        let offset = self
            .zip
            .start_file_with_extra_data(name, options)
            .map_err(|e| Error::ZipEntryName(name.to_owned(), e))?;
        let mut extra = vec![];

        if self.first_entry {
            extra.write_u16::<LittleEndian>(JAR_MAGIC_ID)?;
            extra.write_u16::<LittleEndian>(0)?;
        }

        // The central directory gets the same fields minus the padding.
        let central_extra = extra.clone();

        if align {
            let alignment_u64 = u64::from(alignment);
            let base = offset + extra.len() as u64 + ALIGNMENT_EXTRA_HEADER_SIZE;
            let padding = (alignment_u64 - base % alignment_u64) % alignment_u64;

            extra.write_u16::<LittleEndian>(ALIGNMENT_EXTRA_ID)?;
            // Padding is always less than a u16 alignment.
            extra.write_u16::<LittleEndian>(2 + padding as u16)?;
            extra.write_u16::<LittleEndian>(alignment)?;
            extra.resize(extra.len() + padding as usize, 0);
        }

        self.zip.write_all(&extra)?;
        let data_start = self
            .zip
            .end_local_start_central_extra_data()
            .map_err(|e| Error::ZipEntryName(name.to_owned(), e))?;
        self.zip.write_all(&central_extra)?;
        self.zip
            .end_extra_data()
            .map_err(|e| Error::ZipEntryName(name.to_owned(), e))?;

        self.first_entry = false;

        if align && data_start % u64::from(alignment) != 0 {
            return Err(Error::MisalignedEntry {
                name: name.to_owned(),
                offset: data_start,
                alignment,
            });
        }

        Ok(())
    }

    /// Write a complete entry from a buffer.
    pub fn write_entry(
        &mut self,
        name: &str,
        compression: CompressionMethod,
        data: &[u8],
    ) -> Result<()> {
        self.start_entry(name, compression, 0)?;
        self.zip.write_all(data)?;

        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}

impl<W: Write + Seek> Write for JarWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.zip.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.zip.flush()
    }
}

/// An alignment of 0 or 1 turns off padding for every entry, including native
/// libraries.
fn entry_alignment(name: &str, default_alignment: u16) -> u16 {
    if default_alignment <= 1 {
        default_alignment
    } else if name.ends_with(".so") {
        LIBRARY_ALIGNMENT
    } else {
        default_alignment
    }
}

/// Copy every entry named in the manifest. All STORED entries are written
/// first, aligned, followed by everything else, recompressed with deflate.
pub fn copy_files<W: Write + Seek>(
    manifest: &Manifest,
    overlay: &mut ArchiveOverlay,
    jar: &mut JarWriter<W>,
    default_alignment: u16,
) -> Result<()> {
    let mut stored = vec![];
    let mut compressed = vec![];

    for name in manifest.entries.keys() {
        let is_stored = overlay
            .entry(name)
            .is_some_and(|e| e.compression == CompressionMethod::Stored);

        if is_stored {
            stored.push(name.as_str());
        } else {
            compressed.push(name.as_str());
        }
    }

    for name in stored {
        let alignment = entry_alignment(name, default_alignment);
        jar.start_entry(name, CompressionMethod::Stored, alignment)?;
        io::copy(&mut overlay.read_entry(name)?, jar)?;
    }

    for name in compressed {
        jar.start_entry(name, CompressionMethod::Deflated, 0)?;
        io::copy(&mut overlay.read_entry(name)?, jar)?;
    }

    Ok(())
}

fn signature_prefix(index: usize, count: usize) -> String {
    if count == 1 {
        "META-INF/CERT".to_owned()
    } else {
        format!("META-INF/CERT{index}")
    }
}

/// Write the manifest and one `.SF` file plus signature block per signer.
fn sign_file<W: Write + Seek>(
    manifest: &Manifest,
    signers: &[SignerConfig],
    jar: &mut JarWriter<W>,
) -> Result<()> {
    jar.write_entry(
        MANIFEST_NAME,
        CompressionMethod::Deflated,
        &manifest.to_bytes(),
    )?;

    for (i, signer) in signers.iter().enumerate() {
        let prefix = signature_prefix(i, signers.len());
        let algorithm = digest_algorithm_for_cert(signer.certificate())?;

        let sf = write_signature_file(manifest, algorithm);
        let block = write_signature_block(&sf, signer.certificate(), signer.key())?;

        jar.write_entry(&format!("{prefix}.SF"), CompressionMethod::Deflated, &sf)?;
        jar.write_entry(
            &format!("{prefix}.{}", signer.key().algorithm().name()),
            CompressionMethod::Deflated,
            &block,
        )?;

        debug!(
            "Signed with {}: {prefix}",
            signer.certificate().tbs_certificate.subject,
        );
    }

    Ok(())
}

/// Produce a v1-signed archive from the overlay's current contents.
pub fn sign_jar<W: Write + Seek>(
    signers: &[SignerConfig],
    overlay: &mut ArchiveOverlay,
    writer: W,
    alignment: u16,
) -> Result<W> {
    if signers.is_empty() {
        return Err(Error::NoSigners);
    }

    let mut mask = DigestMask::default();
    for signer in signers {
        mask.insert(digest_algorithm_for_cert(signer.certificate())?);
    }

    let manifest = add_digests_to_manifest(overlay, mask)?;

    let mut jar = JarWriter::new(writer)?;
    copy_files(&manifest, overlay, &mut jar, alignment)?;
    sign_file(&manifest, signers, &mut jar)?;

    info!(
        "Signed {} entries with {} signer(s)",
        manifest.entries.len(),
        signers.len(),
    );

    jar.finish()
}
