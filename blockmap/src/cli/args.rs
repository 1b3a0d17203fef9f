// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli::{copy, create};

#[derive(Debug, Subcommand)]
pub enum Command {
    Create(create::CreateCli),
    Copy(copy::CopyCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    // Process args first so that --help and errors work without logging.
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Create(c) => create::create_main(&c, cancel_signal),
        Command::Copy(c) => copy::copy_main(&c, cancel_signal),
    }
}
