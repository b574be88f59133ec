// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: git-annex special remote that recomputes content from compute pointers.
// Author: Lukas Bower

//! Compute special remote.
//!
//! git-annex asks the remote for a key; the remote picks one of the compute
//! pointers registered against the key, locates the dataset holding the
//! pointer's commit, verifies the specification and method template, and
//! reruns the computation in a disposable worktree. The requested file is
//! handed back to git-annex, every sibling output that is annexed is
//! re-injected on the way.

pub mod protocol;

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use remake_spec::{
    claims_url, ComputePointer, ComputeSpec, PatternPath, SPECIFICATION_DIR, URL_SCHEME,
};

use crate::collect::copy_output;
use crate::config::ConfigStack;
use crate::dataset::{annexed_location, reinject, Dataset};
use crate::error::{RemakeError, Result};
use crate::execute::{execute, Execution};
use crate::git::Git;
use crate::glob::resolve_files;
use crate::provision::provide_context;
use crate::trust::SignatureVerifier;

pub use protocol::{AnnexProtocol, Request};

/// Cost reported to git-annex; computing is slower than a local copy.
pub const REMOTE_COST: u32 = 100;

/// Queries the special remote may send back to git-annex mid-request.
pub trait Annex {
    /// URLs recorded for `key` that start with `prefix`.
    fn get_urls(&mut self, key: &str, prefix: &str) -> Result<Vec<String>>;
    /// The repository's git directory.
    fn git_dir(&mut self) -> Result<PathBuf>;
    /// Forward a diagnostic line to git-annex.
    fn debug(&mut self, message: &str);
}

/// One method per protocol request a special remote answers.
pub trait SpecialRemote {
    /// Called once before any transfer.
    fn prepare(&mut self, annex: &mut dyn Annex) -> Result<()>;
    /// Called by `git annex initremote` and `enableremote`.
    fn initremote(&mut self, annex: &mut dyn Annex) -> Result<()>;
    /// Write the content of `key` to `file`.
    fn transfer_retrieve(&mut self, annex: &mut dyn Annex, key: &str, file: &Path) -> Result<()>;
    /// Store the content of `key` from `file`.
    fn transfer_store(&mut self, annex: &mut dyn Annex, key: &str, file: &Path) -> Result<()>;
    /// Whether the remote can provide `key`.
    fn checkpresent(&mut self, annex: &mut dyn Annex, key: &str) -> Result<bool>;
    /// Drop `key` from the remote.
    fn remove(&mut self, annex: &mut dyn Annex, key: &str) -> Result<()>;
    /// Whether `url` belongs to this remote.
    fn claimurl(&mut self, annex: &mut dyn Annex, url: &str) -> bool;
    /// Whether `url` can be fetched by this remote.
    fn checkurl(&mut self, annex: &mut dyn Annex, url: &str) -> bool;
    /// Relative transfer cost.
    fn cost(&self) -> u32 {
        REMOTE_COST
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteState {
    Idle,
    Prepared,
}

/// Stages of a retrieval request, reported as they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    /// Picking a pointer and loading its specification.
    Resolving,
    /// Creating the worktree with the inputs.
    Provisioning,
    /// Running the method template.
    Executing,
    /// Moving outputs back into the dataset.
    Collecting,
    /// Handing the requested file to git-annex.
    Responding,
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolving => "resolving",
            Self::Provisioning => "provisioning",
            Self::Executing => "executing",
            Self::Collecting => "collecting",
            Self::Responding => "responding",
        })
    }
}

/// The `datalad-remake` special remote.
pub struct RemakeRemote {
    verifier: Box<dyn SignatureVerifier>,
    overrides: BTreeMap<String, String>,
    state: RemoteState,
}

impl fmt::Debug for RemakeRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemakeRemote")
            .field("overrides", &self.overrides)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RemakeRemote {
    /// Remote verifying signatures with `verifier`.
    #[must_use]
    pub fn new(verifier: Box<dyn SignatureVerifier>) -> Self {
        Self {
            verifier,
            overrides: BTreeMap::new(),
            state: RemoteState::Idle,
        }
    }

    /// Configuration values that take precedence over every other layer.
    #[must_use]
    pub fn with_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    fn ensure_prepared(&self) -> Result<()> {
        match self.state {
            RemoteState::Prepared => Ok(()),
            RemoteState::Idle => Err(RemakeError::Protocol(
                "request received before PREPARE".to_owned(),
            )),
        }
    }

    fn stage(annex: &mut dyn Annex, key: &str, stage: RequestStage) {
        info!("{key}: {stage}");
        annex.debug(&format!("{key}: {stage}"));
    }

    fn pointers(annex: &mut dyn Annex, key: &str) -> Result<Vec<ComputePointer>> {
        let urls = annex.get_urls(key, &format!("{URL_SCHEME}:"))?;
        debug!("{key}: {} compute url(s)", urls.len());
        Ok(urls
            .iter()
            .filter_map(|url| match ComputePointer::decode(url) {
                Ok(pointer) => Some(pointer),
                Err(err) => {
                    warn!("ignoring undecodable compute url: {err}");
                    None
                }
            })
            .collect())
    }

    fn retrieve(&mut self, annex: &mut dyn Annex, key: &str, file: &Path) -> Result<()> {
        Self::stage(annex, key, RequestStage::Resolving);
        let start = dataset_dir(annex)?;
        let config = ConfigStack::load(&start, &self.overrides)?;
        let trusted_keys = match config.dataset_id() {
            Some(id) if config.allows_untrusted_execution(id) => {
                warn!("datalad remake remote performs UNTRUSTED execution for dataset {id}");
                annex.debug("performing untrusted execution");
                None
            }
            _ => Some(config.trusted_keys()),
        };

        let pointers = Self::pointers(annex, key)?;
        let pointer = select_pointer(&pointers, &config.priorities()).ok_or_else(|| {
            RemakeError::Resolution(format!("no compute instructions recorded for {key}"))
        })?;
        info!(
            "{key}: using label {:?} at {} for {}",
            pointer.label, pointer.root_version, pointer.this
        );

        let dataset = find_dataset(&start, &pointer.root_version)?;
        let spec = load_specification(
            &dataset,
            pointer,
            trusted_keys.as_deref(),
            self.verifier.as_ref(),
        )?;

        Self::stage(annex, key, RequestStage::Provisioning);
        let worktree = provide_context(&dataset, Some(&pointer.root_version), &spec.input)?;

        Self::stage(annex, key, RequestStage::Executing);
        execute(
            worktree.dataset(),
            &Execution {
                method: &spec.method,
                parameters: &spec.parameter,
                output_patterns: &spec.output,
                stdout: spec.stdout.as_ref(),
                trusted_keys: trusted_keys.as_deref(),
            },
            self.verifier.as_ref(),
        )?;

        Self::stage(annex, key, RequestStage::Collecting);
        collect_siblings(annex, worktree.path(), &dataset, &spec, &pointer.this)?;

        Self::stage(annex, key, RequestStage::Responding);
        let produced = pointer.this.to_host_path(worktree.path());
        fs::copy(&produced, file).map_err(|err| {
            RemakeError::io(
                format!("copy {} to {}", produced.display(), file.display()),
                err,
            )
        })?;
        worktree.close()
    }
}

impl SpecialRemote for RemakeRemote {
    fn prepare(&mut self, annex: &mut dyn Annex) -> Result<()> {
        annex.debug("PREPARE");
        self.state = RemoteState::Prepared;
        Ok(())
    }

    fn initremote(&mut self, annex: &mut dyn Annex) -> Result<()> {
        annex.debug("INITREMOTE");
        Ok(())
    }

    fn transfer_retrieve(&mut self, annex: &mut dyn Annex, key: &str, file: &Path) -> Result<()> {
        self.ensure_prepared()?;
        annex.debug(&format!("TRANSFER RETRIEVE {key} {}", file.display()));
        let result = self.retrieve(annex, key, file);
        if let Err(err) = &result {
            warn!("{key}: retrieval failed ({}): {err}", err.class());
        }
        result
    }

    fn transfer_store(&mut self, annex: &mut dyn Annex, key: &str, _file: &Path) -> Result<()> {
        annex.debug(&format!("TRANSFER STORE {key}"));
        Err(RemakeError::InvalidInput(
            "content of this remote is computed and cannot be stored".to_owned(),
        ))
    }

    fn checkpresent(&mut self, annex: &mut dyn Annex, key: &str) -> Result<bool> {
        self.ensure_prepared()?;
        Ok(!annex.get_urls(key, &format!("{URL_SCHEME}:"))?.is_empty())
    }

    fn remove(&mut self, annex: &mut dyn Annex, key: &str) -> Result<()> {
        annex.debug(&format!("REMOVE {key}"));
        Ok(())
    }

    fn claimurl(&mut self, annex: &mut dyn Annex, url: &str) -> bool {
        annex.debug(&format!("CLAIMURL {url}"));
        claims_url(url)
    }

    fn checkurl(&mut self, annex: &mut dyn Annex, url: &str) -> bool {
        annex.debug(&format!("CHECKURL {url}"));
        claims_url(url)
    }
}

/// Pick the pointer whose label comes first in `priorities`, falling back to
/// the first pointer when no configured label is present.
#[must_use]
pub fn select_pointer<'a>(
    pointers: &'a [ComputePointer],
    priorities: &[String],
) -> Option<&'a ComputePointer> {
    priorities
        .iter()
        .find_map(|label| pointers.iter().find(|pointer| &pointer.label == label))
        .or_else(|| pointers.first())
}

/// First repository at or above `start` that contains `commit`.
///
/// When nothing above `start` matches, the process working directory is
/// searched the same way.
pub fn find_dataset(start: &Path, commit: &str) -> Result<Dataset> {
    let mut origins = vec![start.to_path_buf()];
    if let Ok(cwd) = env::current_dir() {
        if cwd != start {
            origins.push(cwd);
        }
    }
    for origin in &origins {
        for dir in origin.ancestors() {
            if !dir.join(".git").exists() {
                continue;
            }
            match Dataset::open(dir) {
                Ok(dataset) if dataset.has_commit(commit) => {
                    debug!("found {commit} in {}", dataset.path().display());
                    return Ok(dataset);
                }
                Ok(_) => {}
                Err(err) => debug!("skipping {}: {err}", dir.display()),
            }
        }
    }
    Err(RemakeError::DatasetNotFound {
        commit: commit.to_owned(),
        start: start.to_path_buf(),
    })
}

/// Verify and parse the specification a pointer refers to.
///
/// The bytes are read from `root_version`, the revision that was verified,
/// and must hash to the specification id named by the pointer.
pub fn load_specification(
    dataset: &Dataset,
    pointer: &ComputePointer,
    trusted_keys: Option<&[String]>,
    verifier: &dyn SignatureVerifier,
) -> Result<ComputeSpec> {
    if !is_specification_id(&pointer.specification) {
        return Err(RemakeError::Resolution(format!(
            "malformed specification id {:?}",
            pointer.specification
        )));
    }
    let relative = format!("{SPECIFICATION_DIR}/{}", pointer.specification);
    if let Some(keys) = trusted_keys {
        verifier.verify(
            dataset.path(),
            Some(&pointer.root_version),
            Path::new(&relative),
            keys,
        )?;
    }
    let bytes = committed_specification(dataset.path(), &pointer.root_version, &relative)?;
    let spec = ComputeSpec::from_json(&bytes)?;
    let digest = spec.digest()?;
    if digest != pointer.specification {
        return Err(RemakeError::Resolution(format!(
            "specification {} at {} hashes to {digest}",
            pointer.specification, pointer.root_version
        )));
    }
    Ok(spec)
}

/// Content of `relative` as committed in `revision`, fetching annexed
/// content by the key recorded in that revision.
fn committed_specification(root: &Path, revision: &str, relative: &str) -> Result<Vec<u8>> {
    let output = Git::new(root)
        .args(["cat-file", "blob"])
        .arg(format!("{revision}:{relative}"))
        .output()?;
    if !output.status.success() {
        return Err(RemakeError::Resolution(format!(
            "specification {relative} is not recorded in {revision}"
        )));
    }
    let Some(key) = annex_key(&output.stdout) else {
        return Ok(output.stdout);
    };
    debug!("specification {relative} is annexed as {key}");
    Git::annex(root).args(["get", "--key", key.as_str()]).run()?;
    let location = Git::annex(root)
        .args(["contentlocation", key.as_str()])
        .oneline()?;
    let path = root.join(location);
    fs::read(&path).map_err(|err| {
        RemakeError::Resolution(format!("cannot read specification {relative}: {err}"))
    })
}

/// Annex key named by a committed symlink target or pointer file.
fn annex_key(blob: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(blob).ok()?.trim();
    if text.starts_with('{') || text.contains('\n') || !text.contains("annex/objects/") {
        return None;
    }
    text.rsplit('/')
        .next()
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
}

fn is_specification_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
}

/// Re-inject annexed outputs other than `this`, then the stdout capture.
fn collect_siblings(
    annex: &mut dyn Annex,
    worktree: &Path,
    dataset: &Dataset,
    spec: &ComputeSpec,
    this: &PatternPath,
) -> Result<()> {
    for output in resolve_files(worktree, &spec.output)? {
        if &output == this {
            continue;
        }
        inject(annex, worktree, dataset, &output);
    }
    if let Some(stdout) = &spec.stdout {
        if !inject(annex, worktree, dataset, stdout) {
            copy_output(
                &stdout.to_host_path(worktree),
                &stdout.to_host_path(dataset.path()),
            )?;
        }
    }
    Ok(())
}

/// Returns false when `output` is not annexed in `dataset`.
fn inject(
    annex: &mut dyn Annex,
    worktree: &Path,
    dataset: &Dataset,
    output: &PatternPath,
) -> bool {
    let Some((root, relative)) = annexed_location(&output.to_host_path(dataset.path())) else {
        return false;
    };
    let source = output.to_host_path(worktree);
    annex.debug(&format!(
        "reinject {} -> {}:{}",
        source.display(),
        root.display(),
        relative.display()
    ));
    if !reinject(&root, &source, &relative) {
        warn!("could not reinject {output} into {}", root.display());
    }
    true
}

fn dataset_dir(annex: &mut dyn Annex) -> Result<PathBuf> {
    let git_dir = annex.git_dir()?;
    if git_dir.file_name().is_some_and(|name| name == ".git") {
        if let Some(parent) = git_dir.parent() {
            return Ok(parent.to_path_buf());
        }
    }
    env::current_dir().map_err(|err| RemakeError::io("determine working directory", err))
}
