// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Executable git-annex spawns for the datalad-remake special remote.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Executable git-annex spawns for `externaltype=datalad-remake`.
//!
//! stdin and stdout carry the special remote protocol; logs go to stderr.

use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use remake::{init_logging, AnnexProtocol, GitSignatureVerifier, RemakeRemote};

#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "Recompute annexed content from datalad-remake compute pointers",
    long_about = None
)]
struct Cli {
    /// Enable debug logging on stderr.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    info!("datalad-remake special remote starting");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut protocol = AnnexProtocol::new(stdin.lock(), stdout.lock());
    let mut remote = RemakeRemote::new(Box::new(GitSignatureVerifier));
    protocol
        .serve(&mut remote)
        .context("special remote protocol session failed")
}
