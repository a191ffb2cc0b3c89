/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

#![allow(dead_code)]

use std::{
    io::{Cursor, Write},
    path::PathBuf,
};

use signkit::{
    bootimage::{BOOT_MAGIC, HEADER_SIZE_MAX},
    crypto::{self, SigningKey},
    signer::{DEFAULT_V2_DIGESTS, SignerConfig},
};
use x509_cert::Certificate;
use zip::{CompressionMethod, ZipWriter, write::FileOptions};

pub fn data_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

/// Load `<name>.x509.pem` and `<name>.pk8.pem` from the test data directory.
pub fn load_key_pair(name: &str) -> (Certificate, SigningKey) {
    let cert = crypto::read_cert_file(&data_path(&format!("{name}.x509.pem"))).unwrap();
    let key = crypto::read_key_file(&data_path(&format!("{name}.pk8.pem"))).unwrap();

    (cert, key)
}

pub fn load_signer(name: &str) -> SignerConfig {
    SignerConfig::from_files(
        &data_path(&format!("{name}.x509.pem")),
        &data_path(&format!("{name}.pk8.pem")),
        DEFAULT_V2_DIGESTS,
    )
    .unwrap()
}

/// Build a legacy (header version 0) boot image. Everything after the header
/// is filled with a repeating pattern.
pub fn boot_image(kernel_size: u32, ramdisk_size: u32, page_size: u32, total: usize) -> Vec<u8> {
    let mut data = vec![0u8; HEADER_SIZE_MAX];
    data[..8].copy_from_slice(BOOT_MAGIC);

    for (i, value) in [
        kernel_size,
        0x1000_8000,
        ramdisk_size,
        0x1100_0000,
        0,
        0x10f0_0000,
        0x1000_0100,
        page_size,
        0,
    ]
    .into_iter()
    .enumerate()
    {
        let offset = 8 + i * 4;
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    data.extend((HEADER_SIZE_MAX..total).map(|i| (i % 251) as u8));

    data
}

/// Turn a legacy image from [`boot_image`] into a version 1 or 2 image.
pub fn set_header_version(image: &mut [u8], version: u32, recovery_dtbo_size: u32, dtb_size: u32) {
    let mut put = |offset: usize, value: u32| {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    };

    put(40, version);
    put(1632, recovery_dtbo_size);

    if version == 2 {
        put(1644, 1660);
        put(1648, dtb_size);
    } else {
        put(1644, 1648);
    }
}

/// Build a zip with the given entries and compression methods.
pub fn build_zip(entries: &[(&str, &str, CompressionMethod)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(vec![]));

    for (name, data, method) in entries {
        let options = FileOptions::default().compression_method(*method);

        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}
