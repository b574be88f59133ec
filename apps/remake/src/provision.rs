// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provision and tear down isolated worktrees holding computation inputs.
// Author: Lukas Bower

//! Worktree provisioning.
//!
//! A computation runs in a fresh `git worktree` of the dataset at the
//! requested commit. Only the files matched by the input patterns are
//! fetched, and nested datasets are installed as the patterns reach them.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::{debug, info, warn};
use remake_spec::PatternPath;
use walkdir::WalkDir;

use crate::dataset::{make_owner_writable, Dataset, DirtyEntry};
use crate::error::{RemakeError, Result};
use crate::git::Git;
use crate::glob::{resolve_patterns, WorktreeInstaller};

/// Environment variable that preserves worktrees for inspection.
pub const KEEP_TEMP_ENV: &str = "DATALAD_REMAKE_KEEP_TEMP";

const WORKTREE_PREFIX: &str = "remake-";
/// Namespace of the branches backing provisioned worktrees.
pub const BRANCH_NAMESPACE: &str = "remake/";

/// Result of [`provide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Worktree created and populated.
    Provisioned(PathBuf),
    /// Source dataset has uncommitted inputs; nothing was created.
    Dirty(Vec<DirtyEntry>),
}

/// Create a worktree of `dataset` at `source_branch` (default `HEAD`) in
/// `worktree_dir` (default a fresh temporary directory) holding the files
/// matched by `input_patterns`.
pub fn provide(
    dataset: &Dataset,
    input_patterns: &[PatternPath],
    source_branch: Option<&str>,
    worktree_dir: Option<&Path>,
) -> Result<ProvisionOutcome> {
    let dirty = dirty_inputs(dataset, input_patterns)?;
    if !dirty.is_empty() {
        return Ok(ProvisionOutcome::Dirty(dirty));
    }

    let revision = source_branch.unwrap_or("HEAD");
    let commit = dataset.resolve_commit(revision).map_err(|err| {
        RemakeError::InvalidInput(format!("cannot provision from {revision:?}: {err}"))
    })?;
    let worktree_dir = match worktree_dir {
        Some(dir) => {
            refuse_existing_branch(dataset, &branch_name(dir)?)?;
            prepare_directory(dir)?
        }
        None => tempfile::Builder::new()
            .prefix(WORKTREE_PREFIX)
            .tempdir()
            .map_err(|err| RemakeError::io("create temporary worktree directory", err))?
            .keep(),
    };
    let branch = branch_name(&worktree_dir)?;
    refuse_existing_branch(dataset, &branch)?;
    info!(
        "provisioning worktree {} of {} at {revision} ({commit})",
        worktree_dir.display(),
        dataset.path().display(),
    );
    Git::new(dataset.path())
        .args(["worktree", "add", "-b", branch.as_str()])
        .arg(&worktree_dir)
        .arg(&commit)
        .run()?;

    match populate(dataset, &worktree_dir, input_patterns) {
        Ok(()) => Ok(ProvisionOutcome::Provisioned(worktree_dir)),
        Err(err) => {
            if let Err(cleanup) = remove(dataset, &worktree_dir) {
                warn!("failed to remove {}: {cleanup}", worktree_dir.display());
            }
            Err(err)
        }
    }
}

/// Provision a worktree that is torn down when the guard is dropped.
pub fn provide_context<'a>(
    dataset: &'a Dataset,
    source_branch: Option<&str>,
    input_patterns: &[PatternPath],
) -> Result<ProvisionedWorktree<'a>> {
    match provide(dataset, input_patterns, source_branch, None)? {
        ProvisionOutcome::Provisioned(path) => Ok(ProvisionedWorktree {
            source: dataset,
            worktree: Dataset::open(&path)?,
            keep: env::var_os(KEEP_TEMP_ENV).is_some(),
            released: false,
        }),
        ProvisionOutcome::Dirty(entries) => Err(RemakeError::DirtyDataset {
            dataset: dataset.path().to_path_buf(),
            entries,
        }),
    }
}

/// Remove a provisioned worktree and its bookkeeping. Removing an absent
/// worktree is not an error.
///
/// Only the `remake/<name>` branch created by [`provide`] is deleted.
pub fn remove(dataset: &Dataset, worktree: &Path) -> Result<()> {
    if worktree.exists() {
        let canonical = fs::canonicalize(worktree)
            .map_err(|err| RemakeError::io(format!("resolve {}", worktree.display()), err))?;
        if canonical == dataset.path() {
            return Err(RemakeError::InvalidInput(format!(
                "refusing to remove the dataset itself at {}",
                worktree.display()
            )));
        }
        let admin = Git::new(&canonical)
            .args(["rev-parse", "--absolute-git-dir"])
            .oneline()
            .ok()
            .map(PathBuf::from)
            .filter(|dir| is_worktree_admin_dir(dir));
        make_tree_writable(&canonical);
        fs::remove_dir_all(&canonical)
            .map_err(|err| RemakeError::io(format!("remove {}", canonical.display()), err))?;
        if let Some(admin) = admin.filter(|dir| dir.exists()) {
            make_tree_writable(&admin);
            if let Err(err) = fs::remove_dir_all(&admin) {
                debug!("leaving {} to git worktree prune: {err}", admin.display());
            }
        }
    }
    Git::new(dataset.path()).args(["worktree", "prune"]).run()?;
    if let Ok(branch) = branch_name(worktree) {
        if branch_exists(dataset, &branch) {
            let deleted = Git::new(dataset.path())
                .args(["branch", "-D", "--", branch.as_str()])
                .success();
            debug!("branch {branch} deleted: {deleted}");
        }
    }
    Ok(())
}

/// Scope guard owning a provisioned worktree.
#[derive(Debug)]
pub struct ProvisionedWorktree<'a> {
    source: &'a Dataset,
    worktree: Dataset,
    keep: bool,
    released: bool,
}

impl ProvisionedWorktree<'_> {
    /// Worktree root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.worktree.path()
    }

    /// Worktree as a dataset.
    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.worktree
    }

    /// Tear down now, reporting failures instead of logging them.
    pub fn close(mut self) -> Result<()> {
        self.released = true;
        if self.keep {
            info!("keeping worktree {}", self.path().display());
            return Ok(());
        }
        remove(self.source, self.worktree.path())
    }
}

impl Drop for ProvisionedWorktree<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.keep {
            info!("keeping worktree {}", self.path().display());
            return;
        }
        if let Err(err) = remove(self.source, self.worktree.path()) {
            warn!("failed to remove worktree {}: {err}", self.path().display());
        }
    }
}

fn populate(dataset: &Dataset, worktree_dir: &Path, patterns: &[PatternPath]) -> Result<()> {
    let worktree = Dataset::open(worktree_dir)?;
    let mut installer = WorktreeInstaller::new(&worktree, dataset)?;
    let resolved = resolve_patterns(worktree.path(), patterns, &mut installer)?;
    debug!("resolved inputs: {resolved:?}");
    let paths: Vec<PathBuf> = resolved
        .iter()
        .map(|path| path.to_host_path(worktree.path()))
        .collect();
    worktree.get(&paths)
}

/// Dirty files of `dataset` that one of `patterns` would capture.
pub fn dirty_inputs(dataset: &Dataset, patterns: &[PatternPath]) -> Result<Vec<DirtyEntry>> {
    let matchers: Vec<Pattern> = patterns
        .iter()
        .filter_map(|pattern| Pattern::new(&pattern.to_string()).ok())
        .collect();
    Ok(dataset
        .dirty_entries()?
        .into_iter()
        .filter(|entry| captured_by(&entry.path, &matchers))
        .collect())
}

fn captured_by(path: &Path, matchers: &[Pattern]) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    path.ancestors()
        .filter(|candidate| !candidate.as_os_str().is_empty())
        .any(|candidate| {
            matchers
                .iter()
                .any(|matcher| matcher.matches_path_with(candidate, options))
        })
}

fn prepare_directory(dir: &Path) -> Result<PathBuf> {
    let occupied = fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some());
    if occupied {
        return Err(RemakeError::InvalidInput(format!(
            "worktree directory {} is not empty",
            dir.display()
        )));
    }
    fs::create_dir_all(dir)
        .map_err(|err| RemakeError::io(format!("create {}", dir.display()), err))?;
    fs::canonicalize(dir).map_err(|err| RemakeError::io(format!("resolve {}", dir.display()), err))
}

/// Branch backing the worktree at `worktree_dir`.
pub fn branch_name(worktree_dir: &Path) -> Result<String> {
    worktree_dir
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| format!("{BRANCH_NAMESPACE}{name}"))
        .ok_or_else(|| {
            RemakeError::InvalidInput(format!(
                "worktree directory {} has no usable name",
                worktree_dir.display()
            ))
        })
}

fn branch_exists(dataset: &Dataset, branch: &str) -> bool {
    Git::new(dataset.path())
        .args(["show-ref", "--verify", "--quiet"])
        .arg(format!("refs/heads/{branch}"))
        .success()
}

fn refuse_existing_branch(dataset: &Dataset, branch: &str) -> Result<()> {
    if branch_exists(dataset, branch) {
        return Err(RemakeError::InvalidInput(format!(
            "branch {branch} already exists, pick another worktree directory"
        )));
    }
    Ok(())
}

fn is_worktree_admin_dir(dir: &Path) -> bool {
    dir.parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name == "worktrees")
}

fn make_tree_writable(root: &Path) {
    for entry in WalkDir::new(root).into_iter().filter_map(|entry| entry.ok()) {
        if entry.path_is_symlink() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.permissions().readonly() {
            if let Err(err) = make_owner_writable(entry.path(), &meta) {
                debug!("cannot make {} writable: {err}", entry.path().display());
            }
        }
    }
}
