/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, BufWriter, IsTerminal, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, info};

use crate::{
    apk::{self, V1Only},
    archive::ArchiveOverlay,
    bootimage::{self, BootSignatureInfo, DEFAULT_TARGET},
    crypto,
    jar::DEFAULT_ALIGNMENT,
    ota,
    signer::{DEFAULT_V2_DIGESTS, SignerConfig},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Short,
    Long,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Short => "short",
            Self::Long => "long",
        })
    }
}

/// Sign a boot image read from stdin and write the signed image to stdout.
///
/// With one argument, it is the target partition. With two, they are the
/// certificate and private key. With three, the certificate, private key, and
/// target partition. The compiled-in test key is used if no key is given.
#[derive(Debug, Parser)]
struct SignBoot {
    /// [CERT KEY] [TARGET]
    #[arg(value_name = "ARG", num_args = 0..=3)]
    args: Vec<String>,
}

/// Verify the signature of a boot image read from stdin.
#[derive(Debug, Parser)]
struct VerifyBoot {
    /// Certificate to verify against instead of the embedded one.
    #[arg(value_parser)]
    cert: Option<PathBuf>,
}

/// Show the signature of a boot image read from stdin without verifying it.
#[derive(Debug, Parser)]
struct ShowBoot {
    /// Show the raw JSON contents.
    ///
    /// This is useful when programmatically parsing the output.
    #[arg(short, long)]
    raw: bool,
}

/// Sign a JAR or APK with the v1 signature scheme.
#[derive(Debug, Parser)]
struct SignJar {
    /// Input path for the archive.
    #[arg(short, long, value_parser)]
    input: PathBuf,

    /// Output path for the signed archive.
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Path to certificate. May be repeated for multiple signers.
    #[arg(short, long, value_parser, requires = "key")]
    cert: Vec<PathBuf>,

    /// Path to private key. Must be specified once per certificate.
    #[arg(short, long, value_parser, requires = "cert")]
    key: Vec<PathBuf>,

    /// Alignment for uncompressed entries. Native libraries are always
    /// aligned to 4096 bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_ALIGNMENT)]
    alignment: u16,
}

/// Sign an OTA package with both a v1 signature and a whole-file signature.
#[derive(Debug, Parser)]
struct SignOta {
    /// Input path for the OTA package.
    #[arg(short, long, value_parser)]
    input: PathBuf,

    /// Output path for the signed OTA package.
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Path to certificate.
    #[arg(short, long, value_parser, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to private key.
    #[arg(short, long, value_parser, requires = "cert")]
    key: Option<PathBuf>,
}

/// Verify the whole-file signature of an OTA package.
#[derive(Debug, Parser)]
struct VerifyOta {
    /// Path to the OTA package.
    #[arg(short, long, value_parser)]
    input: PathBuf,

    /// Certificate to verify against instead of the embedded one.
    #[arg(short, long, value_parser)]
    cert: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Sign(SignBoot),
    Verify(VerifyBoot),
    Show(ShowBoot),
    SignJar(SignJar),
    SignOta(SignOta),
    VerifyOta(VerifyOta),
}

#[derive(Debug, Parser)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t = Level::INFO)]
    log_level: Level,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", default_value_t)]
    log_format: LogFormat,
}

/// Log to stderr. stdout is reserved for image data.
pub fn init_logging(log_level: Level, log_format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_max_level(log_level);

    match log_format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Long => builder.init(),
    }
}

fn subcommand_sign(args: &SignBoot) -> Result<()> {
    let (key_paths, target) = match args.args.as_slice() {
        [] => (None, DEFAULT_TARGET),
        [target] => (None, target.as_str()),
        [cert, key] => (Some((cert, key)), DEFAULT_TARGET),
        [cert, key, target] => (Some((cert, key)), target.as_str()),
        _ => bail!("Too many arguments"),
    };

    let (cert, key) = match key_paths {
        Some((cert_path, key_path)) => {
            let cert = crypto::read_cert_file(Path::new(cert_path))
                .with_context(|| anyhow!("Failed to load certificate: {cert_path:?}"))?;
            let key = crypto::read_key_file(Path::new(key_path))
                .with_context(|| anyhow!("Failed to load key: {key_path:?}"))?;
            (Some(cert), Some(key))
        }
        None => (None, None),
    };

    let reader = BufReader::new(io::stdin().lock());
    let mut writer = BufWriter::new(io::stdout().lock());

    if !bootimage::sign_boot_image(cert.as_ref(), key.as_ref(), reader, &mut writer, target) {
        bail!("Failed to sign boot image");
    }

    writer.flush()?;

    Ok(())
}

fn subcommand_verify(args: &VerifyBoot) -> Result<()> {
    let cert = args
        .cert
        .as_ref()
        .map(|p| {
            crypto::read_cert_file(p).with_context(|| anyhow!("Failed to load certificate: {p:?}"))
        })
        .transpose()?;

    let reader = BufReader::new(io::stdin().lock());

    if !bootimage::verify_boot_image(reader, cert.as_ref()) {
        bail!("Signature verification failed");
    }

    Ok(())
}

fn subcommand_show(args: &ShowBoot) -> Result<()> {
    let reader = BufReader::new(io::stdin().lock());

    let (_, signature) =
        bootimage::read_signature(reader).context("Failed to read boot image signature")?;
    let Some(signature) = signature else {
        bail!("Boot image is not signed");
    };

    let info = BootSignatureInfo::from(&signature);

    if args.raw {
        println!("{}", serde_json::to_string(&info)?);
    } else {
        println!("{info:#?}");
    }

    Ok(())
}

fn subcommand_sign_jar(args: &SignJar) -> Result<()> {
    if args.cert.len() != args.key.len() {
        bail!(
            "Number of certificates ({}) does not match number of keys ({})",
            args.cert.len(),
            args.key.len(),
        );
    }

    let signers = if args.cert.is_empty() {
        info!("No keys specified; using test key");
        vec![SignerConfig::test_default()?]
    } else {
        args.cert
            .iter()
            .zip(&args.key)
            .map(|(c, k)| {
                SignerConfig::from_files(c, k, DEFAULT_V2_DIGESTS)
                    .with_context(|| anyhow!("Failed to load signer: {c:?}, {k:?}"))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let file = File::open(&args.input)
        .with_context(|| anyhow!("Failed to open for reading: {:?}", args.input))?;
    let mut overlay = ArchiveOverlay::open_file(file)
        .with_context(|| anyhow!("Failed to read archive: {:?}", args.input))?;

    let file = File::create(&args.output)
        .with_context(|| anyhow!("Failed to open for writing: {:?}", args.output))?;

    apk::try_sign_apk(
        &signers,
        &mut overlay,
        &V1Only,
        BufWriter::new(file),
        args.alignment,
    )
    .with_context(|| anyhow!("Failed to sign archive: {:?}", args.input))?;

    overlay.close();

    info!("Wrote: {:?}", args.output);

    Ok(())
}

fn subcommand_sign_ota(args: &SignOta) -> Result<()> {
    let signer = match (&args.cert, &args.key) {
        (Some(c), Some(k)) => SignerConfig::from_files(c, k, DEFAULT_V2_DIGESTS)
            .with_context(|| anyhow!("Failed to load signer: {c:?}, {k:?}"))?,
        _ => {
            info!("No key specified; using test key");
            SignerConfig::test_default()?
        }
    };

    let file = File::open(&args.input)
        .with_context(|| anyhow!("Failed to open for reading: {:?}", args.input))?;
    let mut overlay = ArchiveOverlay::open_file(file)
        .with_context(|| anyhow!("Failed to read archive: {:?}", args.input))?;

    let file = File::create(&args.output)
        .with_context(|| anyhow!("Failed to open for writing: {:?}", args.output))?;

    ota::sign_ota(&signer, &mut overlay, BufWriter::new(file))
        .with_context(|| anyhow!("Failed to sign OTA package: {:?}", args.input))?;

    overlay.close();

    info!("Wrote: {:?}", args.output);

    Ok(())
}

fn subcommand_verify_ota(args: &VerifyOta) -> Result<()> {
    let cert = args
        .cert
        .as_ref()
        .map(|p| {
            crypto::read_cert_file(p).with_context(|| anyhow!("Failed to load certificate: {p:?}"))
        })
        .transpose()?;

    let file = File::open(&args.input)
        .with_context(|| anyhow!("Failed to open for reading: {:?}", args.input))?;

    let valid = ota::verify_whole_file(BufReader::new(file), cert.as_ref())
        .with_context(|| anyhow!("Failed to read signature: {:?}", args.input))?;
    if !valid {
        bail!("Signature verification failed");
    }

    info!("Signature is valid: {:?}", args.input);

    Ok(())
}

pub fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level, cli.log_format);

    match cli.command {
        Command::Sign(args) => subcommand_sign(&args),
        Command::Verify(args) => subcommand_verify(&args),
        Command::Show(args) => subcommand_show(&args),
        Command::SignJar(args) => subcommand_sign_jar(&args),
        Command::SignOta(args) => subcommand_sign_ota(&args),
        Command::VerifyOta(args) => subcommand_verify_ota(&args),
    }
}
