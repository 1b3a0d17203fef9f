// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use crate::{
    cli::{status, warning},
    copy::{self, CopyOptions},
    format::bmap::{Bmap, ChecksumAlgorithm},
    source::{CompressionFormat, Source},
    stream::FromReader,
};

fn open_source(input: &str) -> Result<Source> {
    // URLs are recognized by scheme prefix; everything else is a plain path.
    if input.starts_with("http://") || input.starts_with("https://") || input.starts_with("file:")
    {
        Source::url(input).with_context(|| format!("Failed to open source URL: {input}"))
    } else {
        Source::local(Path::new(input)).with_context(|| format!("Failed to open source: {input}"))
    }
}

fn open_writer(path: &Path) -> Result<File> {
    // Not truncated here. The copy sizes the file itself so that unwritten
    // regions become holes.
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open for writing: {path:?}"))
}

pub fn copy_main(cli: &CopyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let bmap = match &cli.bmap {
        Some(path) => {
            let reader = File::open(path)
                .with_context(|| format!("Failed to open for reading: {path:?}"))?;

            let bmap = Bmap::from_reader(BufReader::new(reader))
                .with_context(|| format!("Failed to load block map: {path:?}"))?;

            Some(bmap)
        }
        None => None,
    };

    if bmap.is_none() {
        warning!("No block map; copying the entire source without verification");
    }

    let mut source = open_source(&cli.input)?;

    let format = match cli.decompress {
        Decompress::None => None,
        Decompress::Auto => CompressionFormat::from_path(Path::new(&cli.input)),
        Decompress::Gz => Some(CompressionFormat::Gzip),
        Decompress::Bz2 => Some(CompressionFormat::Bzip2),
        Decompress::Xz => Some(CompressionFormat::Xz),
    };
    if let Some(format) = format {
        source = source.decoder(format);
    }

    let expected_checksum = cli
        .expected_checksum
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("Expected checksum is not valid hex")?;

    let mut dest = open_writer(&cli.output)?;

    let options = CopyOptions {
        bmap: bmap.as_ref(),
        expected_checksum,
        expected_size: cli.expected_size,
        algorithm: cli.checksum,
    };

    let report = copy::copy(&mut source, &mut dest, &options, cancel_signal)
        .with_context(|| format!("Failed to copy: {} -> {:?}", cli.input, cli.output))?;

    source
        .finish()
        .with_context(|| format!("Failed to finalize source: {}", cli.input))?;

    status!(
        "Copied {} bytes in {} ranges; skipped {} bytes in {} holes",
        report.bytes_copied,
        report.ranges_copied,
        report.hole_bytes,
        report.holes_skipped,
    );

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Decompress {
    /// Do not decompress.
    None,
    /// Pick the format from the source file extension.
    Auto,
    Gz,
    Bz2,
    Xz,
}

/// Copy an image to a destination, guided by a block map when one is given.
///
/// With a block map, only the mapped ranges are read and written; everything
/// else stays a hole in the destination. Each range is verified against its
/// recorded checksum.
#[derive(Debug, Parser)]
pub struct CopyCli {
    /// Source image path or URL (http://, https://, file:).
    #[arg(short, long, value_name = "PATH_OR_URL")]
    pub input: String,

    /// Path to output file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Path to block map document.
    #[arg(long, value_name = "FILE", value_parser)]
    pub bmap: Option<PathBuf>,

    /// Expected hex digest of the full image, with holes read as zeros.
    #[arg(long, value_name = "HEX")]
    pub expected_checksum: Option<String>,

    /// Expected image size in bytes.
    #[arg(long, value_name = "BYTES")]
    pub expected_size: Option<u64>,

    /// Decompress the source before copying.
    #[arg(long, value_name = "FORMAT", default_value = "auto")]
    pub decompress: Decompress,

    /// Checksum algorithm for --expected-checksum when no block map is given.
    #[arg(long, value_name = "ALGORITHM", default_value = "sha256")]
    pub checksum: ChecksumAlgorithm,
}
