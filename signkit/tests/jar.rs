/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

mod common;

use std::io::{Cursor, Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD};
use cap_std::ambient_authority;
use cap_tempfile::TempDir;
use ring::digest;
use signkit::{
    archive::ArchiveOverlay,
    crypto::{self, SignatureAlgorithm, VerifyingKey},
    jar::{self, DEFAULT_ALIGNMENT, MANIFEST_NAME},
    manifest::Manifest,
    signer::SignerConfig,
};
use x509_cert::Certificate;
use zip::{CompressionMethod, ZipArchive, read::ZipFile};

const STORED: CompressionMethod = CompressionMethod::Stored;
const DEFLATED: CompressionMethod = CompressionMethod::Deflated;

fn sign(signers: &[SignerConfig], input: &[u8], alignment: u16) -> Vec<u8> {
    let mut overlay = ArchiveOverlay::open_seekable(Cursor::new(input.to_vec())).unwrap();

    jar::sign_jar(signers, &mut overlay, Cursor::new(vec![]), alignment)
        .unwrap()
        .into_inner()
}

fn read_entry(zip: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Vec<u8> {
    let mut buf = vec![];
    zip.by_name(name).unwrap().read_to_end(&mut buf).unwrap();
    buf
}

fn entry_names(zip: &mut ZipArchive<Cursor<Vec<u8>>>) -> Vec<String> {
    (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_owned())
        .collect()
}

fn open_output(data: Vec<u8>) -> ZipArchive<Cursor<Vec<u8>>> {
    ZipArchive::new(Cursor::new(data)).unwrap()
}

fn signature_block_is_valid(sf: &[u8], block: &[u8], cert: &Certificate) -> bool {
    let sd = crypto::parse_cms(block).unwrap();
    let signer_info = sd.signer_infos.0.get(0).unwrap();
    let algorithm = SignatureAlgorithm::from_oid(signer_info.signature_algorithm.oid).unwrap();
    let digest = digest::digest(algorithm.digest(), sf);

    VerifyingKey::from_cert(cert)
        .unwrap()
        .verify_digest(algorithm, digest.as_ref(), signer_info.signature.as_bytes())
        .unwrap()
}

/// Size of the extra field in the entry's local header.
fn local_extra_len(entry: &ZipFile) -> u64 {
    entry.data_start() - entry.header_start() - 30 - entry.name_raw().len() as u64
}

fn library_jar() -> Vec<u8> {
    common::build_zip(&[
        ("classes.dex", "dex\n035", DEFLATED),
        ("lib/arm64-v8a/libfoo.so", "\x7fELF", STORED),
        ("res/raw/x", "x", STORED),
        ("lib/x86/libbar.so", "\x7fELF", STORED),
    ])
}

fn three_entry_jar() -> Vec<u8> {
    common::build_zip(&[
        ("a.txt", "hello", DEFLATED),
        ("b.so", "\x7fELF", STORED),
        (MANIFEST_NAME, "Manifest-Version: 1.0\r\n\r\n", DEFLATED),
    ])
}

#[test]
fn scenario_three_entry_jar() {
    let signer = SignerConfig::test_default().unwrap();
    let output = sign(std::slice::from_ref(&signer), &three_entry_jar(), DEFAULT_ALIGNMENT);
    let mut zip = open_output(output);

    assert_eq!(
        entry_names(&mut zip),
        [
            "b.so",
            "a.txt",
            MANIFEST_NAME,
            "META-INF/CERT.SF",
            "META-INF/CERT.RSA",
        ],
    );

    let manifest_bytes = read_entry(&mut zip, MANIFEST_NAME);
    let sf_bytes = read_entry(&mut zip, "META-INF/CERT.SF");
    let block = read_entry(&mut zip, "META-INF/CERT.RSA");

    let sf = Manifest::parse(&sf_bytes).unwrap();
    let expected = STANDARD.encode(digest::digest(&digest::SHA256, &manifest_bytes));
    assert_eq!(sf.main.get("SHA-256-Digest-Manifest"), Some(expected.as_str()));

    let manifest = Manifest::parse(&manifest_bytes).unwrap();
    assert_eq!(
        manifest.entries.keys().collect::<Vec<_>>(),
        ["a.txt", "b.so"],
    );
    assert_eq!(
        manifest.entries["a.txt"].get("SHA-256-Digest"),
        Some(STANDARD.encode(digest::digest(&digest::SHA256, b"hello")).as_str()),
    );

    assert!(signature_block_is_valid(&sf_bytes, &block, signer.certificate()));
}

#[test]
fn signing_is_deterministic() {
    let signers = [SignerConfig::test_default().unwrap()];
    let input = three_entry_jar();

    assert_eq!(
        sign(&signers, &input, DEFAULT_ALIGNMENT),
        sign(&signers, &input, DEFAULT_ALIGNMENT),
    );
}

#[test]
fn stored_entries_are_aligned() {
    let signers = [SignerConfig::test_default().unwrap()];
    let input = common::build_zip(&[
        ("classes.dex", "dex\n035", DEFLATED),
        ("res/raw/x", "x", STORED),
        ("lib/arm64-v8a/libfoo.so", "\x7fELF", STORED),
        ("assets/odd-name.bin", "abc", STORED),
        ("lib/x86/libbar.so", "\x7fELF", STORED),
        ("resources.arsc", "arsc", STORED),
    ]);

    for alignment in [DEFAULT_ALIGNMENT, 16] {
        let mut zip = open_output(sign(&signers, &input, alignment));

        for i in 0..zip.len() {
            let entry = zip.by_index(i).unwrap();
            if entry.compression() != STORED {
                continue;
            }

            let required = if entry.name().ends_with(".so") {
                4096
            } else {
                u64::from(alignment)
            };
            assert_eq!(
                entry.data_start() % required,
                0,
                "{} is not aligned to {required}",
                entry.name(),
            );
        }
    }
}

#[test]
fn zero_alignment_disables_padding() {
    let signers = [SignerConfig::test_default().unwrap()];

    for alignment in [0, 1] {
        let mut zip = open_output(sign(&signers, &library_jar(), alignment));

        for i in 0..zip.len() {
            let entry = zip.by_index(i).unwrap();
            // Only the JAR magic on the first entry.
            let expected = if i == 0 { 4 } else { 0 };

            assert_eq!(local_extra_len(&entry), expected, "{}", entry.name());
        }
    }
}

#[test]
fn padding_stays_out_of_central_directory() {
    let signers = [SignerConfig::test_default().unwrap()];
    let mut zip = open_output(sign(&signers, &library_jar(), DEFAULT_ALIGNMENT));
    let mut padded = 0;

    for i in 0..zip.len() {
        let entry = zip.by_index(i).unwrap();
        let expected: &[u8] = if i == 0 { &[0xfe, 0xca, 0x00, 0x00] } else { &[] };

        assert_eq!(entry.extra_data(), expected, "{}", entry.name());

        if local_extra_len(&entry) > 4 {
            padded += 1;
        }
    }

    // Both libraries are padded out to a page boundary.
    assert!(padded >= 2);
}

#[test]
fn stored_entries_precede_compressed_entries() {
    let signers = [SignerConfig::test_default().unwrap()];
    let input = common::build_zip(&[
        ("a", "a", DEFLATED),
        ("b", "b", STORED),
        ("c", "c", DEFLATED),
        ("d", "d", STORED),
    ]);
    let mut zip = open_output(sign(&signers, &input, DEFAULT_ALIGNMENT));

    assert_eq!(
        entry_names(&mut zip),
        [
            "b",
            "d",
            "a",
            "c",
            MANIFEST_NAME,
            "META-INF/CERT.SF",
            "META-INF/CERT.RSA",
        ],
    );
    assert_eq!(zip.by_name("b").unwrap().compression(), STORED);
    assert_eq!(zip.by_name("a").unwrap().compression(), DEFLATED);
}

#[test]
fn manifest_names_are_sorted() {
    let signers = [SignerConfig::test_default().unwrap()];
    let input = common::build_zip(&[
        ("zeta", "z", DEFLATED),
        ("Alpha", "A", DEFLATED),
        ("alpha", "a", STORED),
        ("res/", "", DEFLATED),
        ("res/layout.xml", "<x/>", DEFLATED),
        ("META-INF/OLD.SF", "stale", DEFLATED),
        ("META-INF/OLD.RSA", "stale", DEFLATED),
        ("META-INF/services/foo", "bar", DEFLATED),
    ]);
    let mut zip = open_output(sign(&signers, &input, DEFAULT_ALIGNMENT));

    let manifest = String::from_utf8(read_entry(&mut zip, MANIFEST_NAME)).unwrap();
    let names = manifest
        .lines()
        .filter_map(|l| l.strip_prefix("Name: "))
        .collect::<Vec<_>>();

    assert_eq!(
        names,
        [
            "Alpha",
            "META-INF/services/foo",
            "alpha",
            "res/layout.xml",
            "zeta",
        ],
    );

    let output_names = entry_names(&mut zip);
    assert!(!output_names.iter().any(|n| n.contains("OLD")));
    assert!(!output_names.iter().any(|n| n == "res/"));
}

#[test]
fn multiple_signers() {
    let signers = [
        SignerConfig::test_default().unwrap(),
        common::load_signer("rsa_sha1"),
        common::load_signer("ec256"),
    ];
    let mut zip = open_output(sign(&signers, &three_entry_jar(), DEFAULT_ALIGNMENT));

    let names = entry_names(&mut zip);
    assert_eq!(
        &names[names.len() - 6..],
        [
            "META-INF/CERT0.SF",
            "META-INF/CERT0.RSA",
            "META-INF/CERT1.SF",
            "META-INF/CERT1.RSA",
            "META-INF/CERT2.SF",
            "META-INF/CERT2.EC",
        ],
    );

    // The SHA-1 signer requires SHA-1 digests in addition to SHA-256.
    let manifest = Manifest::parse(&read_entry(&mut zip, MANIFEST_NAME)).unwrap();
    let attrs = &manifest.entries["a.txt"];
    assert!(attrs.get("SHA1-Digest").is_some());
    assert!(attrs.get("SHA-256-Digest").is_some());

    let sf = Manifest::parse(&read_entry(&mut zip, "META-INF/CERT1.SF")).unwrap();
    assert!(sf.main.get("SHA1-Digest-Manifest").is_some());
    assert!(sf.main.get("SHA-256-Digest-Manifest").is_none());

    for (i, (signer, ext)) in signers.iter().zip(["RSA", "RSA", "EC"]).enumerate() {
        let sf = read_entry(&mut zip, &format!("META-INF/CERT{i}.SF"));
        let block = read_entry(&mut zip, &format!("META-INF/CERT{i}.{ext}"));

        assert!(
            signature_block_is_valid(&sf, &block, signer.certificate()),
            "Signature block {i} is invalid",
        );
    }
}

#[test]
fn ec_signer_uses_sha256_with_ecdsa() {
    let signer = common::load_signer("ec256");
    let mut zip = open_output(sign(
        std::slice::from_ref(&signer),
        &three_entry_jar(),
        DEFAULT_ALIGNMENT,
    ));

    let block = read_entry(&mut zip, "META-INF/CERT.EC");
    let sd = crypto::parse_cms(&block).unwrap();
    let signer_info = sd.signer_infos.0.get(0).unwrap();

    assert_eq!(
        signer_info.signature_algorithm.oid,
        SignatureAlgorithm::Sha256WithEcdsa.oid(),
    );
    assert!(signer_info.signed_attrs.is_none());
}

#[test]
fn staged_entries_are_signed() {
    let signers = [SignerConfig::test_default().unwrap()];
    let mut overlay = ArchiveOverlay::open_stream(three_entry_jar().as_slice()).unwrap();

    overlay.put("a.txt", b"replaced").unwrap();
    {
        let mut staged = overlay.stage("new/added.txt").unwrap();
        staged.write_all(b"added").unwrap();
        staged.commit().unwrap();
    }

    let output = jar::sign_jar(&signers, &mut overlay, Cursor::new(vec![]), DEFAULT_ALIGNMENT)
        .unwrap()
        .into_inner();
    let mut zip = open_output(output);

    assert_eq!(read_entry(&mut zip, "a.txt"), b"replaced");
    assert_eq!(read_entry(&mut zip, "new/added.txt"), b"added");
    assert_eq!(zip.by_name("new/added.txt").unwrap().compression(), DEFLATED);

    let manifest = Manifest::parse(&read_entry(&mut zip, MANIFEST_NAME)).unwrap();
    assert_eq!(
        manifest.entries["a.txt"].get("SHA-256-Digest"),
        Some(STANDARD.encode(digest::digest(&digest::SHA256, b"replaced")).as_str()),
    );
    assert!(manifest.entries.contains_key("new/added.txt"));
}

#[test]
fn file_backed_archive() {
    let temp_dir = TempDir::new(ambient_authority()).unwrap();

    temp_dir.write("input.apk", three_entry_jar()).unwrap();

    let file = temp_dir.open("input.apk").unwrap().into_std();
    let mut overlay = ArchiveOverlay::open_file(file).unwrap();

    let output = temp_dir.create("output.apk").unwrap().into_std();
    let signers = [SignerConfig::test_default().unwrap()];
    jar::sign_jar(&signers, &mut overlay, output, DEFAULT_ALIGNMENT).unwrap();
    overlay.close();

    let data = temp_dir.read("output.apk").unwrap();
    assert_eq!(data, sign(&signers, &three_entry_jar(), DEFAULT_ALIGNMENT));
}
