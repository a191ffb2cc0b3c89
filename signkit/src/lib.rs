/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod apk;
pub mod archive;
pub mod bootimage;
pub mod cli;
pub mod crypto;
pub mod jar;
pub mod manifest;
pub mod ota;
pub mod signer;
pub mod stream;
pub mod zipadjust;
