// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Register computations and record compute pointers for their outputs.
// Author: Lukas Bower

//! Registration of computations.
//!
//! `make` writes the specification, optionally runs it once, and attaches a
//! compute pointer to every output so git-annex can regenerate the content
//! later through the special remote.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use remake_spec::{
    ComputePointer, ComputeSpec, PatternPath, AUTO_REMOTE_NAME, SPECIFICATION_DIR, URL_SCHEME,
};

use crate::collect::collect;
use crate::config::ConfigStack;
use crate::dataset::{
    add_url as annex_add_url, annexed_location, containing_repository, is_annex_repo, Dataset,
};
use crate::error::{RemakeError, Result};
use crate::execute::{execute, Execution};
use crate::git::{split_nul, Git};
use crate::provision::provide_context;
use crate::report::{Status, StatusRecord};
use crate::trust::SignatureVerifier;

const UNVERIFIED_DOWNLOADS: &str = "ACKTHPPT";

/// Everything needed to register one computation.
#[derive(Debug, Clone, Default)]
pub struct MakeRequest {
    /// Method template name.
    pub template: String,
    /// Priority label; defaults to the template name.
    pub label: Option<String>,
    /// Revision to provision inputs from; defaults to `HEAD`.
    pub branch: Option<String>,
    /// Input patterns.
    pub inputs: Vec<PatternPath>,
    /// Output patterns.
    pub outputs: Vec<PatternPath>,
    /// Parameter bindings.
    pub parameters: BTreeMap<String, String>,
    /// Optional stdout capture path.
    pub stdout: Option<PatternPath>,
    /// Register pointers without running the computation.
    pub prospective: bool,
    /// Skip signature verification of the template.
    pub allow_untrusted_execution: bool,
}

/// Register `request` in `dataset`.
///
/// On failure `HEAD` is moved back to the commit preceding the
/// specification write.
pub fn make(
    dataset: &Dataset,
    request: &MakeRequest,
    config: &ConfigStack,
    verifier: &dyn SignatureVerifier,
) -> Result<Vec<StatusRecord>> {
    if request.template.trim().is_empty() {
        return Err(RemakeError::InvalidInput("template name must not be empty".to_owned()));
    }
    if request.outputs.is_empty() {
        return Err(RemakeError::InvalidInput("at least one output is required".to_owned()));
    }

    let (url_base, reset_commit) = get_url(dataset, request)?;
    match register(dataset, request, config, verifier, &url_base) {
        Ok(records) => Ok(records),
        Err(err) => {
            warn!("registration failed, resetting {} to {reset_commit}", dataset.path().display());
            let reset = Git::new(dataset.path())
                .args(["reset", "--keep", reset_commit.as_str()])
                .success();
            if !reset {
                warn!("could not reset {} to {reset_commit}", dataset.path().display());
            }
            Err(err)
        }
    }
}

/// Write the specification and return the pointer base together with the
/// commit to restore if registration fails.
pub fn get_url(dataset: &Dataset, request: &MakeRequest) -> Result<(String, String)> {
    let reset_commit = dataset.head()?;
    let spec = ComputeSpec::new(
        request.template.clone(),
        request.inputs.iter().cloned(),
        request.outputs.iter().cloned(),
        request.parameters.clone(),
        request.stdout.clone(),
    );
    let digest = write_spec(dataset, &spec)?;
    let label = request.label.as_deref().unwrap_or(&request.template);
    let url_base = ComputePointer::base_url(label, &dataset.head()?, &digest);
    Ok((url_base, reset_commit))
}

/// Store `spec` under its content address and commit it. Returns the id.
pub fn write_spec(dataset: &Dataset, spec: &ComputeSpec) -> Result<String> {
    let digest = spec.digest()?;
    let canonical = spec.to_canonical_json()?;
    let dir = dataset.path().join(SPECIFICATION_DIR);
    let path = dir.join(&digest);

    if fs::read_to_string(&path).is_ok_and(|existing| existing == canonical) {
        debug!("specification {digest} already recorded");
    } else {
        fs::create_dir_all(&dir)
            .map_err(|err| RemakeError::io(format!("create {}", dir.display()), err))?;
        if fs::symlink_metadata(&path).is_ok() {
            let unlocked = Git::annex(dataset.path())
                .args(["unlock", "--"])
                .arg(Path::new(SPECIFICATION_DIR).join(&digest))
                .success();
            if !unlocked && fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink()) {
                fs::remove_file(&path)
                    .map_err(|err| RemakeError::io(format!("remove {}", path.display()), err))?;
            }
        }
        fs::write(&path, &canonical)
            .map_err(|err| RemakeError::io(format!("write {}", path.display()), err))?;
    }
    dataset.save(
        &format!("[DATALAD] saving computation spec\n\nfile name: {digest}"),
        &[path],
    )?;
    Ok(digest)
}

fn register(
    dataset: &Dataset,
    request: &MakeRequest,
    config: &ConfigStack,
    verifier: &dyn SignatureVerifier,
    url_base: &str,
) -> Result<Vec<StatusRecord>> {
    let outputs: Vec<PatternPath> = if request.prospective {
        if request.allow_untrusted_execution {
            warn!("untrusted execution only applies when the computation runs");
        }
        request.outputs.clone()
    } else {
        let trusted_keys = (!request.allow_untrusted_execution).then(|| config.trusted_keys());
        let worktree = provide_context(dataset, request.branch.as_deref(), &request.inputs)?;
        execute(
            worktree.dataset(),
            &Execution {
                method: &request.template,
                parameters: &request.parameters,
                output_patterns: &request.outputs,
                stdout: request.stdout.as_ref(),
                trusted_keys: trusted_keys.as_deref(),
            },
            verifier,
        )?;
        let collected = collect(
            worktree.path(),
            dataset,
            &request.outputs,
            request.stdout.as_ref(),
        )?;
        worktree.close()?;
        collected.into_iter().collect()
    };

    initialize_remotes(dataset, &outputs)?;
    let mut records = Vec::with_capacity(outputs.len());
    for output in &outputs {
        let path = output.to_host_path(dataset.path());
        records.push(match add_url(dataset, url_base, output, request.prospective)? {
            Some(url) => StatusRecord::new("make", Status::Ok, path).with_url(url),
            None => StatusRecord::new("make", Status::NotNeeded, path)
                .with_message("output is not annexed, no pointer recorded"),
        });
    }
    Ok(records)
}

/// Attach the pointer for `file` to its annex key.
///
/// Returns `None` when the file is neither annexed nor a prospective output.
pub fn add_url(
    dataset: &Dataset,
    url_base: &str,
    file: &PatternPath,
    prospective: bool,
) -> Result<Option<String>> {
    let url = ComputePointer::with_target(url_base, file);
    let path = file.to_host_path(dataset.path());
    let exists = fs::symlink_metadata(&path).is_ok();
    if !exists && prospective {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| RemakeError::io(format!("create {}", parent.display()), err))?;
        }
    }
    let can_add = if exists {
        annexed_location(&path).is_some()
    } else {
        prospective
    };
    if !can_add {
        debug!("not recording {url} for {}", path.display());
        return Ok(None);
    }

    let (root, relative) = containing_repository(&path)?;
    if !annex_add_url(&root, &url, &relative, !exists) {
        return Err(RemakeError::Integration {
            dataset: root,
            url,
            path,
        });
    }
    info!("recorded {url} for {}", path.display());
    Ok(Some(url))
}

/// Ensure every annex repository holding one of `outputs` has a compute remote.
pub fn initialize_remotes(dataset: &Dataset, outputs: &[PatternPath]) -> Result<()> {
    let mut roots = BTreeSet::new();
    for output in outputs {
        let path = output.to_host_path(dataset.path());
        let Some(parent) = path.parent().filter(|parent| parent.is_dir()) else {
            continue;
        };
        roots.insert(containing_repository(parent)?.0);
    }
    for root in roots {
        if is_annex_repo(&root) {
            add_remake_remote(&root)?;
        }
    }
    Ok(())
}

/// Create (or enable) the compute special remote in `root`.
pub fn add_remake_remote(root: &Path) -> Result<String> {
    let name = match configured_remake_remote(root)? {
        Some(name) => name,
        None => match announced_remake_remote(root) {
            Some(name) => {
                info!("enabling special remote {name} in {}", root.display());
                Git::annex(root).args(["enableremote", name.as_str()]).run()?;
                name
            }
            None => {
                info!("creating special remote {AUTO_REMOTE_NAME} in {}", root.display());
                Git::annex(root)
                    .args([
                        "initremote",
                        AUTO_REMOTE_NAME,
                        "type=external",
                        &format!("externaltype={URL_SCHEME}"),
                        "encryption=none",
                        "autoenable=true",
                        "allow-untrusted-execution=false",
                    ])
                    .run()?;
                AUTO_REMOTE_NAME.to_owned()
            }
        },
    };
    Git::new(root)
        .args(["config", "--local"])
        .arg(format!("remote.{name}.annex-security-allow-unverified-downloads"))
        .arg(UNVERIFIED_DOWNLOADS)
        .run()?;
    Ok(name)
}

fn configured_remake_remote(root: &Path) -> Result<Option<String>> {
    let output = Git::new(root)
        .args(["config", "-z", "--get-regexp", r"^remote\..*\.annex-externaltype$"])
        .output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(split_nul(&text).into_iter().find_map(|record| {
        let (key, value) = record.split_once('\n')?;
        (value == URL_SCHEME).then_some(())?;
        key.strip_prefix("remote.")?
            .strip_suffix(".annex-externaltype")
            .map(str::to_owned)
    }))
}

fn announced_remake_remote(root: &Path) -> Option<String> {
    let log = Git::new(root)
        .args(["cat-file", "-p", "git-annex:remote.log"])
        .run()
        .ok()?;
    let marker = format!("externaltype={URL_SCHEME}");
    log.lines()
        .filter(|line| line.split_whitespace().any(|field| field == marker))
        .find_map(|line| {
            line.split_whitespace()
                .find_map(|field| field.strip_prefix("name="))
                .map(str::to_owned)
        })
}

/// Split `name=value` parameter arguments at the first `=`.
pub fn parse_parameters<S: AsRef<str>>(raw: &[S]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|item| {
            let item = item.as_ref();
            item.split_once('=')
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .ok_or_else(|| {
                    RemakeError::InvalidInput(format!("parameter {item:?} is not name=value"))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_split_at_first_equals() {
        let parsed = parse_parameters(&["name=Robert", "expr=a=b", "empty="]).unwrap();
        assert_eq!(parsed["name"], "Robert");
        assert_eq!(parsed["expr"], "a=b");
        assert_eq!(parsed["empty"], "");
        assert!(parse_parameters(&["novalue"]).is_err());
    }
}
