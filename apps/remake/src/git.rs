// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run git and git-annex subprocesses with captured output.
// Author: Lukas Bower

//! Thin builder around `git` and `git annex` invocations.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, Output, Stdio};

use log::debug;

use crate::error::{describe_status, RemakeError, Result};

/// Variables git-annex exports to special remotes that must not leak into
/// commands aimed at other repositories.
pub const GIT_ENV_OVERRIDES: [&str; 3] = ["GIT_DIR", "GIT_WORK_TREE", "GIT_INDEX_FILE"];

/// Strip repository-selecting variables from a child environment.
pub fn scrub_git_env(cmd: &mut Command) {
    for name in GIT_ENV_OVERRIDES {
        cmd.env_remove(name);
    }
}

/// A git invocation rooted at a working directory.
///
/// Children never see the caller's stdin, which may be the special remote
/// protocol channel.
#[derive(Debug)]
pub struct Git {
    cmd: Command,
    args: Vec<OsString>,
}

impl Git {
    /// Start a `git` command running in `cwd`.
    pub fn new(cwd: &Path) -> Self {
        let mut cmd = Command::new("git");
        cmd.current_dir(cwd).stdin(Stdio::null());
        scrub_git_env(&mut cmd);
        Self {
            cmd,
            args: Vec::new(),
        }
    }

    /// Start a `git annex` command running in `cwd`.
    pub fn annex(cwd: &Path) -> Self {
        Self::new(cwd).arg("annex")
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self.cmd.arg(arg);
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    fn describe(&self) -> String {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run and return the raw output regardless of exit status.
    pub fn output(mut self) -> Result<Output> {
        let described = self.describe();
        debug!("git {described}");
        self.cmd
            .output()
            .map_err(|err| RemakeError::io(format!("spawn git {described}"), err))
    }

    /// Run, failing on a non-zero exit, and return stdout.
    pub fn run(self) -> Result<String> {
        let described = self.describe();
        let output = self.output()?;
        if !output.status.success() {
            return Err(RemakeError::Git {
                args: described,
                status: describe_status(output.status),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run and return stdout trimmed to one line.
    pub fn oneline(self) -> Result<String> {
        Ok(self.run()?.trim().to_owned())
    }

    /// Run and report whether the command succeeded; failures are logged.
    pub fn success(self) -> bool {
        let described = self.describe();
        match self.output() {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                debug!(
                    "git {described} {}: {}",
                    describe_status(output.status),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(err) => {
                debug!("{err}");
                false
            }
        }
    }
}

/// Split NUL-terminated records, dropping the trailing empty entry.
#[must_use]
pub fn split_nul(text: &str) -> Vec<&str> {
    text.split('\0').filter(|entry| !entry.is_empty()).collect()
}
