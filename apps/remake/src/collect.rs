// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Copy computed outputs from a worktree back into the dataset.
// Author: Lukas Bower

//! Output collection.
//!
//! Produced files are resolved against the output patterns in the worktree
//! and copied over their counterparts in the dataset, unlocking annexed
//! destinations first.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use remake_spec::PatternPath;

use crate::dataset::Dataset;
use crate::error::{RemakeError, Result};
use crate::glob::resolve_files;

/// Commit message used when recording collected outputs.
pub const COLLECT_MESSAGE: &str = "[DATALAD] Recorded changes";

/// Copy the outputs matched in `worktree` into `dataset` and commit them.
///
/// Returns the concrete output paths, including `stdout` when given.
pub fn collect(
    worktree: &Path,
    dataset: &Dataset,
    output_patterns: &[PatternPath],
    stdout: Option<&PatternPath>,
) -> Result<BTreeSet<PatternPath>> {
    let mut outputs = resolve_files(worktree, output_patterns)?;
    outputs.extend(stdout.cloned());
    info!("collecting {} output(s) into {}", outputs.len(), dataset.path().display());

    install_containing_subdatasets(dataset, &outputs)?;

    let destinations: Vec<PathBuf> = outputs
        .iter()
        .map(|output| output.to_host_path(dataset.path()))
        .collect();
    dataset.unlock(&destinations)?;
    for output in &outputs {
        copy_output(
            &output.to_host_path(worktree),
            &output.to_host_path(dataset.path()),
        )?;
    }
    dataset.save(COLLECT_MESSAGE, &destinations)?;
    Ok(outputs)
}

/// Install every nested dataset that contains one of `outputs`, parents first.
pub fn install_containing_subdatasets(
    dataset: &Dataset,
    outputs: &BTreeSet<PatternPath>,
) -> Result<()> {
    let mut prefixes: Vec<PatternPath> = outputs
        .iter()
        .flat_map(PatternPath::prefixes)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    prefixes.sort_by_key(|prefix| prefix.parts().len());

    let mut subdatasets = dataset.subdatasets(true)?;
    for prefix in prefixes {
        let location = prefix.to_host_path(dataset.path());
        let pending = subdatasets
            .iter()
            .find(|sub| !sub.installed && sub.path == location)
            .cloned();
        if let Some(sub) = pending {
            dataset.install_subdataset(&sub)?;
            subdatasets = dataset.subdatasets(true)?;
        }
    }
    Ok(())
}

/// Copy one file, creating parent directories and replacing links.
pub fn copy_output(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| RemakeError::io(format!("create {}", parent.display()), err))?;
    }
    if fs::symlink_metadata(destination).is_ok_and(|meta| meta.file_type().is_symlink()) {
        fs::remove_file(destination)
            .map_err(|err| RemakeError::io(format!("remove {}", destination.display()), err))?;
    }
    debug!("copy {} -> {}", source.display(), destination.display());
    fs::copy(source, destination).map_err(|err| {
        RemakeError::io(
            format!("copy {} to {}", source.display(), destination.display()),
            err,
        )
    })?;
    Ok(())
}
