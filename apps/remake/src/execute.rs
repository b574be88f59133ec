// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run a method template inside a provisioned worktree.
// Author: Lukas Bower

//! Method template execution inside a provisioned worktree.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info};
use remake_spec::{MethodTemplate, PatternPath, TEMPLATE_DIR};

use crate::dataset::Dataset;
use crate::error::{describe_status, RemakeError, Result};
use crate::git::scrub_git_env;
use crate::glob::resolve_files;
use crate::trust::SignatureVerifier;

/// Dataset-relative location of a method template.
#[must_use]
pub fn template_path(method: &str) -> PathBuf {
    Path::new(TEMPLATE_DIR).join(method)
}

/// One computation to run in a worktree.
#[derive(Debug, Clone)]
pub struct Execution<'a> {
    /// Method template name.
    pub method: &'a str,
    /// Parameter bindings.
    pub parameters: &'a BTreeMap<String, String>,
    /// Declared output patterns.
    pub output_patterns: &'a [PatternPath],
    /// Optional stdout capture path.
    pub stdout: Option<&'a PatternPath>,
    /// Keys the template commit must be signed by; `None` skips verification.
    pub trusted_keys: Option<&'a [String]>,
}

/// Execute `execution` in `worktree`.
pub fn execute(
    worktree: &Dataset,
    execution: &Execution<'_>,
    verifier: &dyn SignatureVerifier,
) -> Result<()> {
    prepare_outputs(worktree, execution.output_patterns)?;

    let template_rel = template_path(execution.method);
    if let Some(keys) = execution.trusted_keys {
        verifier.verify(worktree.path(), None, &template_rel, keys)?;
    }
    let template_file = worktree.path().join(&template_rel);
    worktree.get(&[template_file.clone()])?;
    let text = fs::read_to_string(&template_file).map_err(|err| {
        RemakeError::Resolution(format!(
            "cannot read method template {}: {err}",
            template_rel.display()
        ))
    })?;
    let template = MethodTemplate::parse(&text)?;
    let root = worktree.path().to_string_lossy();
    let argv = template.render(execution.parameters, &root)?;

    let stdout = match execution.stdout {
        Some(path) => Some(create_stdout(&path.to_host_path(worktree.path()))?),
        None => None,
    };
    run_command(worktree.path(), &argv, template.use_shell, stdout)
}

fn prepare_outputs(worktree: &Dataset, patterns: &[PatternPath]) -> Result<()> {
    let existing: Vec<PathBuf> = resolve_files(worktree.path(), patterns)?
        .iter()
        .map(|path| path.to_host_path(worktree.path()))
        .collect();
    if existing.is_empty() {
        return Ok(());
    }
    debug!("preparing {} pre-existing output(s)", existing.len());
    if let Err(err) = worktree.get(&existing) {
        debug!("ignoring failed fetch of existing outputs: {err}");
    }
    worktree.unlock(&existing)
}

fn create_stdout(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| RemakeError::io(format!("create {}", parent.display()), err))?;
    }
    File::create(path).map_err(|err| RemakeError::io(format!("create {}", path.display()), err))
}

/// Run `argv` in `cwd`, through `sh -c` when `use_shell` is set.
pub fn run_command(cwd: &Path, argv: &[String], use_shell: bool, stdout: Option<File>) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Err(RemakeError::InvalidInput("command must not be empty".to_owned()));
    };
    let command_line = argv.join(" ");
    let mut cmd = if use_shell {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command_line);
        cmd
    } else {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    };
    scrub_git_env(&mut cmd);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(stdout.map_or_else(Stdio::null, Stdio::from))
        .stderr(Stdio::inherit());

    info!("executing {command_line:?} in {}", cwd.display());
    let status = cmd
        .status()
        .map_err(|err| RemakeError::io(format!("spawn {program}"), err))?;
    if status.success() {
        Ok(())
    } else {
        Err(RemakeError::Execution {
            command: command_line,
            status: describe_status(status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_owned()).collect()
    }

    #[test]
    fn shell_commands_see_redirections() {
        let dir = TempDir::new().unwrap();
        run_command(
            dir.path(),
            &strings(&["echo", "Hello Robert", "> a.txt"]),
            true,
            None,
        )
        .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "Hello Robert\n");
    }

    #[test]
    fn argv_commands_capture_stdout() {
        let dir = TempDir::new().unwrap();
        let out = create_stdout(&dir.path().join("logs/out.txt")).unwrap();
        run_command(dir.path(), &strings(&["echo", "a b"]), false, Some(out)).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("logs/out.txt")).unwrap(), "a b\n");
    }

    #[test]
    fn non_zero_exit_is_an_execution_error() {
        let dir = TempDir::new().unwrap();
        let err = run_command(dir.path(), &strings(&["exit 3"]), true, None).unwrap_err();
        match err {
            RemakeError::Execution { status, .. } => assert_eq!(status, "exited with code 3"),
            other => panic!("unexpected error {other}"),
        }
        assert!(run_command(dir.path(), &[], false, None).is_err());
    }

    #[test]
    fn template_paths_live_under_method_dir() {
        assert_eq!(
            template_path("echo"),
            PathBuf::from(".datalad/make/methods/echo")
        );
    }
}
