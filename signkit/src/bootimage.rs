/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Signing and verification of Android boot images with the AVB 1.0
//! `BootSignature` footer.
//!
//! ```text
//! BootSignature ::= SEQUENCE {
//!     formatVersion ::= INTEGER,
//!     certificate ::= Certificate,
//!     algorithmIdentifier ::= SEQUENCE {
//!         algorithm OBJECT IDENTIFIER,
//!         parameters ANY DEFINED BY algorithm OPTIONAL
//!     },
//!     authenticatedAttributes ::= SEQUENCE {
//!         target CHARACTER STRING,
//!         length INTEGER
//!     },
//!     signature ::= OCTET STRING
//! }
//! ```

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use der::{
    Decode, Encode, Sequence, SliceReader,
    asn1::{OctetString, PrintableString},
};
use ring::digest::Context;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use x509_cert::{Certificate, spki::AlgorithmIdentifierOwned};

use crate::{
    crypto::{self, SignatureAlgorithm, SigningKey, VerifyingKey},
    signer::{self, SignerConfig},
    stream::{self, HashingWriter},
};

pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";

/// Number of bytes read up front to parse the header. This is the smallest
/// page size used by boot images.
pub const HEADER_SIZE_MAX: usize = 2048;

/// Number of bytes after the signable region that may hold the signature.
pub const FOOTER_SIZE: usize = 4096;

pub const FORMAT_VERSION: i32 = 1;

pub const DEFAULT_TARGET: &str = "/boot";

const V1_RECOVERY_DTBO_SIZE_OFFSET: u64 = 1632;
const V2_DTB_SIZE_OFFSET: u64 = 1648;

/// Header version values at or above this are treated as a dt/extra size.
const HEADER_VERSION_MAX: u32 = 8;

/// Page sizes at or above this indicate a PXA header.
const PXA_PAGE_SIZE_MIN: u32 = 0x0200_0000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid image header: missing magic")]
    MissingMagic,
    #[error("Invalid image header: PXA header detected")]
    PxaHeader,
    #[error("Invalid image header: page size is zero")]
    InvalidPageSize,
    #[error("Invalid image header: invalid header length: {expected} != {actual}")]
    InvalidHeaderLength { expected: u64, actual: u64 },
    #[error("Invalid image header: invalid length: {0}")]
    InvalidLength(u64),
    #[error("Signable size ({0}) is smaller than the header")]
    SignableSizeTooSmall(u64),
    #[error("Unsupported signature format version: {0}")]
    UnsupportedFormatVersion(i32),
    #[error("Signed length ({signed}) does not match image length ({actual})")]
    LengthMismatch { signed: u64, actual: u64 },
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Signer error")]
    Signer(#[from] signer::Error),
    #[error("DER error")]
    Der(#[from] der::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The field following the page size. Depending on its value, it is either a
/// real header version or, for older images, the size of the dt/extra section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderVersionField {
    Version(u32),
    LegacyExtraSize(u32),
}

impl From<u32> for HeaderVersionField {
    fn from(value: u32) -> Self {
        if value > 0 && value < HEADER_VERSION_MAX {
            Self::Version(value)
        } else {
            Self::LegacyExtraSize(value)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootImageHeader {
    pub kernel_size: u32,
    pub ramdisk_size: u32,
    pub second_size: u32,
    pub page_size: u32,
    pub version_field: HeaderVersionField,
    /// Version 1+ only.
    pub recovery_dtbo_size: Option<u32>,
    /// Version 1+ only.
    pub header_size: Option<u32>,
    /// Version 2 only.
    pub dtb_size: Option<u32>,
}

impl BootImageHeader {
    /// Parse the fields relevant for signing from the beginning of an image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !data.starts_with(BOOT_MAGIC) {
            return Err(Error::MissingMagic);
        }

        let mut reader = Cursor::new(data);
        reader.seek(SeekFrom::Start(BOOT_MAGIC.len() as u64))?;

        let kernel_size = reader.read_u32::<LittleEndian>()?;
        let _kernel_addr = reader.read_u32::<LittleEndian>()?;
        let ramdisk_size = reader.read_u32::<LittleEndian>()?;
        let _ramdisk_addr = reader.read_u32::<LittleEndian>()?;
        let second_size = reader.read_u32::<LittleEndian>()?;
        // second_addr + tags_addr
        reader.seek(SeekFrom::Current(8))?;
        let page_size = reader.read_u32::<LittleEndian>()?;

        if page_size >= PXA_PAGE_SIZE_MIN {
            return Err(Error::PxaHeader);
        } else if page_size == 0 {
            return Err(Error::InvalidPageSize);
        }

        let version_field = HeaderVersionField::from(reader.read_u32::<LittleEndian>()?);

        let mut header = Self {
            kernel_size,
            ramdisk_size,
            second_size,
            page_size,
            version_field,
            recovery_dtbo_size: None,
            header_size: None,
            dtb_size: None,
        };

        if let HeaderVersionField::Version(version) = version_field {
            reader.seek(SeekFrom::Start(V1_RECOVERY_DTBO_SIZE_OFFSET))?;
            header.recovery_dtbo_size = Some(reader.read_u32::<LittleEndian>()?);
            // recovery_dtbo_offset
            reader.seek(SeekFrom::Current(8))?;
            let header_size = reader.read_u32::<LittleEndian>()?;
            header.header_size = Some(header_size);

            if version == 2 {
                reader.seek(SeekFrom::Start(V2_DTB_SIZE_OFFSET))?;
                header.dtb_size = Some(reader.read_u32::<LittleEndian>()?);
                // dtb_addr
                reader.seek(SeekFrom::Current(8))?;
            }

            let position = reader.stream_position()?;
            if position != u64::from(header_size) {
                return Err(Error::InvalidHeaderLength {
                    expected: header_size.into(),
                    actual: position,
                });
            }
        }

        Ok(header)
    }

    fn page_align(&self, size: u32) -> u64 {
        u64::from(size).div_ceil(self.page_size.into()) * u64::from(self.page_size)
    }

    /// Number of leading bytes of the image covered by the signature.
    pub fn signable_size(&self) -> Result<u64> {
        let mut length = u64::from(self.page_size)
            + self.page_align(self.kernel_size)
            + self.page_align(self.ramdisk_size)
            + self.page_align(self.second_size);

        match self.version_field {
            HeaderVersionField::Version(_) => {
                for size in [self.recovery_dtbo_size, self.dtb_size].into_iter().flatten() {
                    length += self.page_align(size);
                }
            }
            HeaderVersionField::LegacyExtraSize(size) => length += self.page_align(size),
        }

        let page_size = u64::from(self.page_size);
        let length = length.div_ceil(page_size) * page_size;

        // Must fit in a signed 32-bit integer.
        if length == 0 || length > i32::MAX as u64 {
            return Err(Error::InvalidLength(length));
        }

        Ok(length)
    }
}

/// Compute the signable size from the first bytes of a boot image.
pub fn compute_signable_size(header: &[u8]) -> Result<u64> {
    let header = BootImageHeader::parse(header)?;
    let size = header.signable_size()?;

    debug!("Parsed boot image header: {header:?}; signable size: {size}");

    Ok(size)
}

#[derive(Clone, Debug, PartialEq, Eq, Sequence)]
pub struct AuthenticatedAttributes {
    pub target: PrintableString,
    pub length: u64,
}

impl AuthenticatedAttributes {
    pub fn new(target: &str, length: u64) -> Result<Self> {
        Ok(Self {
            target: PrintableString::new(target)?,
            length,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Sequence)]
pub struct BootSignature {
    pub format_version: i32,
    pub certificate: Certificate,
    pub algorithm_identifier: AlgorithmIdentifierOwned,
    pub authenticated_attributes: AuthenticatedAttributes,
    pub signature: OctetString,
}

impl BootSignature {
    /// Decode a signature from a footer. Data following the DER structure,
    /// typically zero padding, is ignored.
    pub fn from_footer(footer: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(footer)?;
        let signature = Self::decode(&mut reader)?;

        Ok(signature)
    }

    pub fn algorithm(&self) -> Result<SignatureAlgorithm> {
        Ok(SignatureAlgorithm::from_oid(self.algorithm_identifier.oid)?)
    }

    /// Check the signature against the signable portion of an image. If `cert`
    /// is specified, its public key is used instead of the embedded one.
    pub fn verify(&self, image: &[u8], cert: Option<&Certificate>) -> Result<bool> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedFormatVersion(self.format_version));
        }

        let public_key = VerifyingKey::from_cert(cert.unwrap_or(&self.certificate))?;

        let signed_length = self.authenticated_attributes.length;
        if signed_length != image.len() as u64 {
            return Err(Error::LengthMismatch {
                signed: signed_length,
                actual: image.len() as u64,
            });
        }

        let algorithm = self.algorithm()?;

        let mut context = Context::new(algorithm.digest());
        context.update(image);
        context.update(&self.authenticated_attributes.to_der()?);
        let digest = context.finish();

        Ok(public_key.verify_digest(algorithm, digest.as_ref(), self.signature.as_bytes())?)
    }
}

/// Human readable summary of a [`BootSignature`].
#[derive(Clone, Debug, Serialize)]
pub struct BootSignatureInfo {
    pub format_version: i32,
    pub target: String,
    pub length: u64,
    pub algorithm: String,
    pub subject: String,
    pub signature: String,
}

impl From<&BootSignature> for BootSignatureInfo {
    fn from(sig: &BootSignature) -> Self {
        let algorithm = match sig.algorithm() {
            Ok(a) => a.to_string(),
            Err(_) => sig.algorithm_identifier.oid.to_string(),
        };

        Self {
            format_version: sig.format_version,
            target: sig.authenticated_attributes.target.to_string(),
            length: sig.authenticated_attributes.length,
            algorithm,
            subject: sig.certificate.tbs_certificate.subject.to_string(),
            signature: hex::encode(sig.signature.as_bytes()),
        }
    }
}

/// Sign a boot image. The signable portion of `reader` is copied to `writer`,
/// followed by the DER-encoded signature. Returns the signable size.
pub fn sign(
    mut reader: impl Read,
    writer: impl Write,
    target: &str,
    cert: &Certificate,
    key: &SigningKey,
) -> Result<u64> {
    // The header is read into its own buffer first. It is both written out
    // verbatim and included in the digest before the rest is streamed.
    let mut header = vec![0u8; HEADER_SIZE_MAX];
    let header_len = stream::read_full(&mut reader, &mut header)?;
    let signable_size = compute_signable_size(&header)?;

    if signable_size < HEADER_SIZE_MAX as u64 {
        return Err(Error::SignableSizeTooSmall(signable_size));
    }

    if !crypto::cert_matches_key(cert, key)? {
        warn!(
            "Certificate does not match private key: {}",
            cert.tbs_certificate.subject,
        );
    }

    let algorithm = key.default_signature_algorithm();
    let mut writer = HashingWriter::new(writer, Context::new(algorithm.digest()));

    writer.write_all(&header[..header_len])?;
    stream::copy_n(&mut reader, &mut writer, signable_size - header_len as u64)?;

    let attrs = AuthenticatedAttributes::new(target, signable_size)?;
    let (mut writer, mut context) = writer.finish();
    context.update(&attrs.to_der()?);
    let digest = context.finish();

    let signature = key.sign_digest(algorithm, digest.as_ref())?;

    let boot_signature = BootSignature {
        format_version: FORMAT_VERSION,
        certificate: cert.clone(),
        algorithm_identifier: algorithm.algorithm_identifier(),
        authenticated_attributes: attrs,
        signature: OctetString::new(signature)?,
    };

    writer.write_all(&boot_signature.to_der()?)?;
    writer.flush()?;

    info!("Signed {signable_size} bytes for {target} with {algorithm}");

    Ok(signable_size)
}

/// Read the signable portion of an image and the signature that follows it.
/// Returns [`None`] for the signature if the footer is empty or all zeros.
pub fn read_signature(mut reader: impl Read) -> Result<(Vec<u8>, Option<BootSignature>)> {
    let mut image = vec![0u8; HEADER_SIZE_MAX];
    reader.read_exact(&mut image)?;

    let signable_size = compute_signable_size(&image)?;
    if signable_size < HEADER_SIZE_MAX as u64 {
        return Err(Error::SignableSizeTooSmall(signable_size));
    }

    // Fits in i32, so usize conversion cannot truncate.
    image.resize(signable_size as usize, 0);
    reader.read_exact(&mut image[HEADER_SIZE_MAX..])?;

    let mut footer = vec![0u8; FOOTER_SIZE];
    let footer_len = stream::read_full(&mut reader, &mut footer)?;
    footer.truncate(footer_len);

    if footer.iter().all(|b| *b == 0) {
        return Ok((image, None));
    }

    let signature = BootSignature::from_footer(&footer)?;

    Ok((image, Some(signature)))
}

/// Verify a signed boot image. An unsigned image or a signature that does not
/// match yields `Ok(false)`.
pub fn verify(reader: impl Read, cert: Option<&Certificate>) -> Result<bool> {
    let (image, signature) = read_signature(reader)?;

    let Some(signature) = signature else {
        info!("Invalid image: not signed");
        return Ok(false);
    };

    let valid = signature.verify(&image, cert)?;
    if valid {
        info!("Signature is VALID");
    } else {
        info!("Signature is INVALID");
    }

    Ok(valid)
}

fn sign_with_fallback(
    cert: Option<&Certificate>,
    key: Option<&SigningKey>,
    reader: impl Read,
    writer: impl Write,
    target: &str,
) -> Result<u64> {
    let fallback;
    let (cert, key) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (c, k) => {
            fallback = SignerConfig::test_default()?;
            (
                c.unwrap_or(fallback.certificate()),
                k.unwrap_or(fallback.key()),
            )
        }
    };

    sign(reader, writer, target, cert, key)
}

/// Sign a boot image, falling back to the compiled-in test key for whichever
/// of `cert` and `key` is missing. Errors are logged and reported as `false`.
pub fn sign_boot_image(
    cert: Option<&Certificate>,
    key: Option<&SigningKey>,
    reader: impl Read,
    writer: impl Write,
    target: &str,
) -> bool {
    match sign_with_fallback(cert, key, reader, writer, target) {
        Ok(_) => true,
        Err(e) => {
            error!("Failed to sign boot image: {:#}", anyhow::Error::from(e));
            false
        }
    }
}

/// Verify a boot image. Errors are logged and reported as `false`.
pub fn verify_boot_image(reader: impl Read, cert: Option<&Certificate>) -> bool {
    match verify(reader, cert) {
        Ok(valid) => valid,
        Err(e) => {
            error!("Failed to verify boot image: {:#}", anyhow::Error::from(e));
            false
        }
    }
}
