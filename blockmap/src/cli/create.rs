// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, io, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{cli::status, create, format::bmap::ChecksumAlgorithm, stream::ToWriter};

pub fn create_main(cli: &CreateCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut reader = File::open(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;

    let bmap = create::generate(&mut reader, cli.block_size, cli.checksum, cancel_signal)
        .with_context(|| format!("Failed to generate block map: {:?}", cli.input))?;

    match &cli.output {
        Some(path) => {
            let writer = File::create(path)
                .with_context(|| format!("Failed to open for writing: {path:?}"))?;

            bmap.to_writer(writer)
                .with_context(|| format!("Failed to write block map: {path:?}"))?;

            status!(
                "Mapped {} of {} blocks ({} byte blocks, {} byte image)",
                bmap.mapped_blocks_count,
                bmap.blocks_count,
                bmap.block_size,
                bmap.image_size,
            );
        }
        None => {
            // The document owns stdout; the summary would corrupt it.
            bmap.to_writer(io::stdout().lock())
                .context("Failed to write block map to stdout")?;
        }
    }

    Ok(())
}

/// Generate a block map for an image file.
#[derive(Debug, Parser)]
pub struct CreateCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output block map document.
    ///
    /// Defaults to stdout.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: Option<PathBuf>,

    /// Block size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = 4096)]
    pub block_size: u64,

    /// Checksum algorithm for the document digests.
    #[arg(long, value_name = "ALGORITHM", default_value = "sha256")]
    pub checksum: ChecksumAlgorithm,
}
