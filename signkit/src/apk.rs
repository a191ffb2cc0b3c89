/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::io::{self, Cursor, Write};

use thiserror::Error;
use tracing::{error, info};

use crate::{
    archive::ArchiveOverlay,
    jar::{self, DEFAULT_ALIGNMENT},
    signer::SignerConfig,
};

pub type SchemeV2Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("JAR signing error")]
    Jar(#[from] jar::Error),
    #[error("APK Signature Scheme v2 signer error")]
    SchemeV2(#[source] SchemeV2Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// APK Signature Scheme v2 signer. It receives a complete v1-signed archive and
/// returns the final archive as an ordered list of chunks. The chunks are
/// written out as-is.
pub trait SchemeV2Signer {
    fn sign(
        &self,
        v1_signed: &[u8],
        signers: &[SignerConfig],
    ) -> std::result::Result<Vec<Vec<u8>>, SchemeV2Error>;
}

/// Passes the v1-signed archive through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct V1Only;

impl SchemeV2Signer for V1Only {
    fn sign(
        &self,
        v1_signed: &[u8],
        _signers: &[SignerConfig],
    ) -> std::result::Result<Vec<Vec<u8>>, SchemeV2Error> {
        Ok(vec![v1_signed.to_vec()])
    }
}

/// Sign an APK with the v1 scheme in memory, then hand the result to the v2
/// signer and write its output to `writer`.
pub fn try_sign_apk(
    signers: &[SignerConfig],
    overlay: &mut ArchiveOverlay,
    v2_signer: &dyn SchemeV2Signer,
    mut writer: impl Write,
    alignment: u16,
) -> Result<()> {
    let v1_signed = jar::sign_jar(signers, overlay, Cursor::new(vec![]), alignment)?;
    let v1_signed = v1_signed.into_inner();

    let chunks = v2_signer
        .sign(&v1_signed, signers)
        .map_err(Error::SchemeV2)?;

    let mut total = 0;
    for chunk in &chunks {
        writer.write_all(chunk)?;
        total += chunk.len();
    }
    writer.flush()?;

    info!("Wrote {total} bytes in {} chunk(s)", chunks.len());

    Ok(())
}

/// Same as [`try_sign_apk`] with the default alignment, but errors are logged
/// and reported as `false`.
pub fn sign_apk(
    signers: &[SignerConfig],
    overlay: &mut ArchiveOverlay,
    v2_signer: &dyn SchemeV2Signer,
    writer: impl Write,
) -> bool {
    match try_sign_apk(signers, overlay, v2_signer, writer, DEFAULT_ALIGNMENT) {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to sign APK: {:#}", anyhow::Error::from(e));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io::Write};

    use zip::{ZipWriter, write::FileOptions};

    use super::*;

    fn overlay() -> ArchiveOverlay {
        let mut writer = ZipWriter::new(Cursor::new(vec![]));
        writer.start_file("a.txt", FileOptions::default()).unwrap();
        writer.write_all(b"a").unwrap();
        let data = writer.finish().unwrap().into_inner();

        ArchiveOverlay::open_stream(data.as_slice()).unwrap()
    }

    struct Recording {
        seen: RefCell<Option<(usize, Vec<u32>)>>,
    }

    impl SchemeV2Signer for Recording {
        fn sign(
            &self,
            v1_signed: &[u8],
            signers: &[SignerConfig],
        ) -> std::result::Result<Vec<Vec<u8>>, SchemeV2Error> {
            let ids = signers
                .iter()
                .flat_map(|s| s.signature_algorithms().iter().map(|a| a.id()))
                .collect();
            *self.seen.borrow_mut() = Some((v1_signed.len(), ids));

            let (head, tail) = v1_signed.split_at(v1_signed.len() / 2);
            Ok(vec![head.to_vec(), b"BLOCK".to_vec(), tail.to_vec()])
        }
    }

    struct Failing;

    impl SchemeV2Signer for Failing {
        fn sign(
            &self,
            _v1_signed: &[u8],
            _signers: &[SignerConfig],
        ) -> std::result::Result<Vec<Vec<u8>>, SchemeV2Error> {
            Err("no space for signing block".into())
        }
    }

    #[test]
    fn v1_only_is_identity() {
        let signers = [SignerConfig::test_default().unwrap()];
        let mut output = vec![];

        assert!(sign_apk(&signers, &mut overlay(), &V1Only, &mut output));

        let mut expected = vec![];
        assert!(sign_apk(&signers, &mut overlay(), &V1Only, &mut expected));
        assert_eq!(output, expected);
        assert!(output.starts_with(b"PK\x03\x04"));
    }

    #[test]
    fn chunks_are_written_in_order() {
        let signers = [SignerConfig::test_default().unwrap()];
        let recording = Recording {
            seen: RefCell::new(None),
        };
        let mut output = vec![];

        assert!(sign_apk(&signers, &mut overlay(), &recording, &mut output));

        let (len, ids) = recording.seen.into_inner().unwrap();
        assert_eq!(ids, [0x0103]);
        assert_eq!(output.len(), len + 5);
        assert_eq!(&output[len / 2..len / 2 + 5], b"BLOCK");
    }

    #[test]
    fn collaborator_failure_is_reported() {
        let signers = [SignerConfig::test_default().unwrap()];
        let mut output = vec![];

        assert!(matches!(
            try_sign_apk(&signers, &mut overlay(), &Failing, &mut output, DEFAULT_ALIGNMENT),
            Err(Error::SchemeV2(_)),
        ));
        assert!(!sign_apk(&signers, &mut overlay(), &Failing, &mut output));
        assert!(output.is_empty());
    }

    #[test]
    fn no_signers_is_reported() {
        assert!(!sign_apk(&[], &mut overlay(), &V1Only, io::sink()));
    }
}
