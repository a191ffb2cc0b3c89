/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

fn main() -> anyhow::Result<()> {
    signkit::cli::main()
}
