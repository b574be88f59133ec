// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Host library behind the remake CLI and compute special remote.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Recompute dataset content on demand.
//!
//! `remake make` records a computation as a content-addressed specification
//! and attaches compute pointers to its outputs. When git-annex later needs
//! one of those outputs it asks the `datalad-remake` special remote, which
//! provisions the inputs in a throwaway worktree, reruns the method template
//! and hands the result back.

pub mod collect;
pub mod config;
pub mod dataset;
pub mod error;
pub mod execute;
pub mod git;
pub mod glob;
pub mod make;
pub mod provision;
pub mod remote;
pub mod report;
pub mod trust;

use env_logger::Env;
use log::LevelFilter;

pub use config::ConfigStack;
pub use dataset::Dataset;
pub use error::{ErrorClass, RemakeError, Result};
pub use make::{make, MakeRequest};
pub use provision::{provide, provide_context, remove, ProvisionOutcome};
pub use remote::{AnnexProtocol, RemakeRemote, SpecialRemote};
pub use report::{Status, StatusRecord};
pub use trust::{GitSignatureVerifier, SignatureVerifier};

/// Install the process logger. `RUST_LOG` overrides the default level.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}
