// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared fixtures for remake integration tests.
// Author: Lukas Bower
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, Once};

use remake::remote::Annex;
use remake::{RemakeError, Result as RemakeResult, SignatureVerifier};

static IDENTITY: Once = Once::new();

/// Commit identity for fixture repositories and anything the pipeline commits.
pub fn init_identity() {
    IDENTITY.call_once(|| {
        env::set_var("GIT_AUTHOR_NAME", "Remake Test");
        env::set_var("GIT_AUTHOR_EMAIL", "remake@example.com");
        env::set_var("GIT_COMMITTER_NAME", "Remake Test");
        env::set_var("GIT_COMMITTER_EMAIL", "remake@example.com");
    });
}

fn tool_available(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// True when `git` can be run; prints a skip notice otherwise.
pub fn require_git() -> bool {
    if tool_available("git", &["--version"]) {
        init_identity();
        true
    } else {
        eprintln!("git not installed; skipping test");
        false
    }
}

/// True when `git annex` can be run; prints a skip notice otherwise.
pub fn require_annex() -> bool {
    if !require_git() {
        return false;
    }
    if tool_available("git", &["annex", "version"]) {
        true
    } else {
        eprintln!("git-annex not installed; skipping test");
        false
    }
}

/// True when git and `gpg` can be run; prints a skip notice otherwise.
pub fn require_gpg() -> bool {
    if !require_git() {
        return false;
    }
    if tool_available("gpg", &["--version"]) {
        true
    } else {
        eprintln!("gpg not installed; skipping test");
        false
    }
}

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "protocol.file.allow=always", "-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed in {}: {}",
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_owned()
}

/// Write `content` to `dir/relative`, creating parents.
pub fn write(dir: &Path, relative: &str, content: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, content).expect("write fixture file");
}

/// Fresh repository at `dir` with `files` committed.
pub fn init_repo(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
    fs::create_dir_all(dir).expect("create repository dir");
    git(dir, &["init", "-q"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    for (relative, content) in files {
        write(dir, relative, content);
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "--allow-empty", "-m", "initial"]);
    fs::canonicalize(dir).expect("canonical repository path")
}

/// Register `child` as nested dataset `path` of `parent` and commit.
pub fn add_subdataset(parent: &Path, child: &Path, path: &str) {
    let url = child.to_string_lossy().into_owned();
    git(parent, &["submodule", "add", "-q", url.as_str(), path]);
    git(parent, &["commit", "-q", "-m", &format!("add {path}")]);
}

/// Three-level hierarchy cloned without its nested datasets.
///
/// Layout: `a.txt`, `d1/b.txt`, `d1/d2/c.txt`. Returns the clone.
pub fn nested_clone(base: &Path) -> PathBuf {
    let leaf = init_repo(&base.join("leaf"), &[("c.txt", "c\n")]);
    let middle = init_repo(&base.join("middle"), &[("b.txt", "b\n")]);
    add_subdataset(&middle, &leaf, "d2");
    let top = init_repo(&base.join("top"), &[("a.txt", "a\n")]);
    add_subdataset(&top, &middle, "d1");
    let top_url = top.to_string_lossy().into_owned();
    let clone = base.join("clone");
    git(base, &["clone", "-q", top_url.as_str(), "clone"]);
    git(&clone, &["config", "commit.gpgsign", "false"]);
    fs::canonicalize(clone).expect("canonical clone path")
}

/// Dataset holding the greeting template and its configuration.
pub fn greeting_dataset(dir: &Path) -> PathBuf {
    init_repo(
        dir,
        &[
            (
                ".datalad/make/methods/greet",
                "parameters = [\"name\", \"file\"]\n\
                 command = [\"echo\", \"Hello {name}\", \"> {file}\"]\n\
                 use_shell = \"true\"\n",
            ),
            ("inputs/unused.txt", "unused\n"),
        ],
    )
}

/// Number of registered worktrees, the main one included.
pub fn worktree_count(dir: &Path) -> usize {
    git(dir, &["worktree", "list", "--porcelain"])
        .lines()
        .filter(|line| line.starts_with("worktree "))
        .count()
}

/// In-memory stand-in for git-annex's side of the protocol.
#[derive(Debug, Default)]
pub struct FakeAnnex {
    pub git_dir: PathBuf,
    pub urls: BTreeMap<String, Vec<String>>,
    pub debug: Vec<String>,
}

impl FakeAnnex {
    pub fn new(dataset: &Path) -> Self {
        Self {
            git_dir: dataset.join(".git"),
            ..Self::default()
        }
    }

    pub fn with_urls(mut self, key: &str, urls: Vec<String>) -> Self {
        self.urls.insert(key.to_owned(), urls);
        self
    }
}

impl Annex for FakeAnnex {
    fn get_urls(&mut self, key: &str, prefix: &str) -> RemakeResult<Vec<String>> {
        Ok(self
            .urls
            .get(key)
            .map(|urls| {
                urls.iter()
                    .filter(|url| url.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn git_dir(&mut self) -> RemakeResult<PathBuf> {
        Ok(self.git_dir.clone())
    }

    fn debug(&mut self, message: &str) {
        self.debug.push(message.to_owned());
    }
}

/// Verifier accepting files only when a configured key equals its signer.
#[derive(Clone, Debug, Default)]
pub struct FakeVerifier {
    pub signer: String,
    pub checked: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeVerifier {
    pub fn checked(&self) -> Vec<PathBuf> {
        self.checked.lock().expect("verifier log").clone()
    }

    pub fn signed_by(signer: &str) -> Self {
        Self {
            signer: signer.to_owned(),
            checked: Arc::default(),
        }
    }
}

impl SignatureVerifier for FakeVerifier {
    fn verify(
        &self,
        _repository: &Path,
        _revision: Option<&str>,
        file: &Path,
        trusted_keys: &[String],
    ) -> RemakeResult<()> {
        self.checked
            .lock()
            .expect("verifier log")
            .push(file.to_path_buf());
        if trusted_keys.iter().any(|key| *key == self.signer) {
            Ok(())
        } else {
            Err(RemakeError::Untrusted {
                path: file.to_path_buf(),
                reason: format!("signed by {}", self.signer),
            })
        }
    }
}
