/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Whole-file signing for OTA packages. The signature covers the entire
//! archive except the 2-byte comment length field in the end of central
//! directory record, and is stored in the archive comment:
//!
//! ```text
//! "signed by SignApk" \0 <CMS signature> <footer>
//! ```
//!
//! The 6-byte footer holds the offset of the CMS signature from the end of the
//! file (u16), the `0xffff` marker, and the comment size (u16).

use std::{
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    slice,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cms::{cert::CertificateChoices, signed_data::SignedData};
use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_cert::{Certificate, der::Encode};

use crate::{
    archive::ArchiveOverlay,
    crypto::{self, SignatureAlgorithm, SigningKey, VerifyingKey},
    jar::{self, DEFAULT_ALIGNMENT},
    signer::SignerConfig,
    stream::{self, HashingWriter},
    zipadjust::{self, EOCD_MAGIC, EOCD_SIZE},
};

pub const COMMENT_MESSAGE: &[u8] = b"signed by SignApk\0";

const FOOTER_SIZE: usize = 6;
const FOOTER_MARKER: u16 = 0xffff;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Archive already has a comment")]
    CommentPresent,
    #[error("Signature is too large for the archive comment: {0} bytes")]
    SignatureTooLarge(usize),
    #[error("Signature comment contains an end of central directory magic at {0}")]
    SpuriousEocd(usize),
    #[error("Archive is not whole-file signed")]
    NotSigned,
    #[error("Invalid signature footer: {0}")]
    InvalidFooter(&'static str),
    #[error("Signature has no signer")]
    MissingSigner,
    #[error("Signature has no embedded certificate")]
    MissingCertificate,
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("DER error")]
    Der(#[from] x509_cert::der::Error),
    #[error("JAR error")]
    Jar(#[from] jar::Error),
    #[error("Zip adjust error")]
    ZipAdjust(#[from] zipadjust::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Hash the first `size` bytes of the reader.
fn hash_prefix(mut reader: impl Read + Seek, size: u64, context: Context) -> Result<Context> {
    reader.seek(SeekFrom::Start(0))?;

    let mut writer = HashingWriter::new(io::sink(), context);
    stream::copy_n(&mut reader, &mut writer, size)?;

    Ok(writer.finish().1)
}

/// Build the archive comment containing the signature and footer.
fn build_comment(signature: &[u8]) -> Result<Vec<u8>> {
    let total_size = COMMENT_MESSAGE.len() + signature.len() + FOOTER_SIZE;
    let total_size_u16 =
        u16::try_from(total_size).map_err(|_| Error::SignatureTooLarge(total_size))?;
    // Offset of the signature from the end of the file.
    let signature_start = (signature.len() + FOOTER_SIZE) as u16;

    let mut comment = Vec::with_capacity(total_size);
    comment.extend_from_slice(COMMENT_MESSAGE);
    comment.extend_from_slice(signature);
    comment.write_u16::<LittleEndian>(signature_start)?;
    comment.write_u16::<LittleEndian>(FOOTER_MARKER)?;
    comment.write_u16::<LittleEndian>(total_size_u16)?;

    // Readers look for the last end of central directory magic, so one inside
    // the comment would hide the real record.
    if let Some(i) = comment.windows(4).position(|w| w == EOCD_MAGIC.to_le_bytes()) {
        return Err(Error::SpuriousEocd(i));
    }

    Ok(comment)
}

fn embedded_certificate(sd: &SignedData) -> Option<&Certificate> {
    sd.certificates.as_ref()?.0.iter().find_map(|c| match c {
        CertificateChoices::Certificate(c) => Some(c),
        _ => None,
    })
}

/// Sign an archive that has no comment. The archive is copied to `writer` with
/// the signature appended as the comment. Returns the size of the output.
pub fn sign_whole_file(
    mut reader: impl Read + Seek,
    mut writer: impl Write,
    cert: &Certificate,
    key: &SigningKey,
) -> Result<u64> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < EOCD_SIZE {
        return Err(zipadjust::Error::EocdNotFound.into());
    }

    reader.seek(SeekFrom::Start(file_size - EOCD_SIZE))?;
    if reader.read_u32::<LittleEndian>()? != EOCD_MAGIC {
        return Err(Error::CommentPresent);
    }

    let algorithm = jar::signature_algorithm_for_cert(cert)?;
    let signed_size = file_size - 2;
    let context = hash_prefix(&mut reader, signed_size, Context::new(algorithm.digest()))?;
    let digest = context.finish();

    let signature = crypto::cms_sign_digest(key, cert, algorithm, digest.as_ref())?.to_der()?;
    let comment = build_comment(&signature)?;

    reader.seek(SeekFrom::Start(0))?;
    stream::copy_n(&mut reader, &mut writer, signed_size)?;
    writer.write_u16::<LittleEndian>(comment.len() as u16)?;
    writer.write_all(&comment)?;
    writer.flush()?;

    debug!("Whole-file signature uses {algorithm} over {signed_size} bytes");

    Ok(file_size + comment.len() as u64)
}

/// Check a whole-file signature. If `cert` is `None`, the certificate embedded
/// in the signature is trusted. Returns `Ok(false)` if the signature does not
/// match the data or the certificate.
pub fn verify_whole_file(mut reader: impl Read + Seek, cert: Option<&Certificate>) -> Result<bool> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    if file_size < EOCD_SIZE + FOOTER_SIZE as u64 {
        return Err(Error::NotSigned);
    }

    reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
    let signature_start = reader.read_u16::<LittleEndian>()?;
    let marker = reader.read_u16::<LittleEndian>()?;
    let comment_size = reader.read_u16::<LittleEndian>()?;

    if marker != FOOTER_MARKER {
        return Err(Error::NotSigned);
    } else if usize::from(signature_start) < FOOTER_SIZE {
        return Err(Error::InvalidFooter("signature start inside footer"));
    } else if signature_start > comment_size {
        return Err(Error::InvalidFooter("signature start outside comment"));
    }

    let eocd_size = EOCD_SIZE + u64::from(comment_size);
    if eocd_size > file_size {
        return Err(Error::InvalidFooter("comment larger than file"));
    }

    let mut eocd = vec![0u8; eocd_size as usize];
    reader.seek(SeekFrom::Start(file_size - eocd_size))?;
    reader.read_exact(&mut eocd)?;

    let mut eocd_reader = Cursor::new(&eocd);
    if eocd_reader.read_u32::<LittleEndian>()? != EOCD_MAGIC {
        return Err(Error::InvalidFooter("end of central directory not found"));
    }
    eocd_reader.seek(SeekFrom::Start(EOCD_SIZE - 2))?;
    if eocd_reader.read_u16::<LittleEndian>()? != comment_size {
        return Err(Error::InvalidFooter("comment size mismatch"));
    }

    if eocd[4..]
        .windows(4)
        .any(|w| w == EOCD_MAGIC.to_le_bytes())
    {
        return Err(Error::InvalidFooter("end of central directory magic in comment"));
    }

    let signature_offset = eocd.len() - usize::from(signature_start);
    let signature = &eocd[signature_offset..eocd.len() - FOOTER_SIZE];

    let sd = crypto::parse_cms(signature)?;
    let signer_info = sd.signer_infos.0.get(0).ok_or(Error::MissingSigner)?;
    let algorithm = SignatureAlgorithm::from_oid(signer_info.signature_algorithm.oid)?;

    let embedded = embedded_certificate(&sd).ok_or(Error::MissingCertificate);

    let cert = match cert {
        Some(c) => {
            if let Ok(e) = embedded {
                if e.to_der()? != c.to_der()? {
                    warn!("Embedded certificate does not match the trusted certificate");
                }
            }
            c
        }
        None => embedded?,
    };

    // The signed data ends before the comment length field.
    let signed_size = file_size - u64::from(comment_size) - 2;
    let context = hash_prefix(&mut reader, signed_size, Context::new(algorithm.digest()))?;
    let digest = context.finish();

    let public_key = VerifyingKey::from_cert(cert)?;
    let valid = public_key.verify_digest(
        algorithm,
        digest.as_ref(),
        signer_info.signature.as_bytes(),
    )?;

    debug!("Whole-file {algorithm} signature valid: {valid}");

    Ok(valid)
}

/// Sign an OTA package: v1-sign the archive, normalize its layout, then add
/// the whole-file signature. Returns the size of the output.
pub fn sign_ota(
    signer: &SignerConfig,
    overlay: &mut ArchiveOverlay,
    writer: impl Write,
) -> Result<u64> {
    let signed = jar::sign_jar(
        slice::from_ref(signer),
        overlay,
        Cursor::new(vec![]),
        DEFAULT_ALIGNMENT,
    )?;

    let mut adjusted = Cursor::new(vec![]);
    zipadjust::zip_adjust(Cursor::new(signed.into_inner()), &mut adjusted)?;

    let size = sign_whole_file(adjusted, writer, signer.certificate(), signer.key())?;

    info!("Signed OTA package ({size} bytes)");

    Ok(size)
}
