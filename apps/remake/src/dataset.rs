// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Dataset operations on nested git/git-annex repositories.
// Author: Lukas Bower

//! Thin wrappers over the git and git-annex commands the pipeline relies on.
//!
//! A dataset is a git repository, optionally annex-initialised, whose nested
//! datasets are git submodules. Paths crossing this boundary are absolute host
//! paths unless noted otherwise.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{RemakeError, Result};
use crate::git::{split_nul, Git};

const GITLINK_MODE: &str = "160000";

/// A nested dataset registered in a parent repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subdataset {
    /// Absolute location of the nested dataset.
    pub path: PathBuf,
    /// Absolute location of the parent repository.
    pub parent: PathBuf,
    /// URL recorded in the parent's `.gitmodules`.
    pub url: Option<String>,
    /// True when a checkout exists at `path`.
    pub installed: bool,
}

impl Subdataset {
    /// Location relative to the parent repository.
    #[must_use]
    pub fn path_in_parent(&self) -> &Path {
        self.path.strip_prefix(&self.parent).unwrap_or(&self.path)
    }
}

/// Kind of uncommitted change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirtyState {
    /// Staged but never committed.
    Added,
    /// Content differs from HEAD.
    Modified,
    /// Tracked file missing from the work tree.
    Deleted,
    /// Not tracked at all.
    Untracked,
}

impl fmt::Display for DirtyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Untracked => "untracked",
        })
    }
}

/// One uncommitted file.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirtyEntry {
    /// Path relative to the dataset that was checked.
    pub path: PathBuf,
    /// Change kind.
    pub state: DirtyState,
}

/// A git repository used as a dataset root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
    path: PathBuf,
}

impl Dataset {
    /// Open the dataset rooted at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let path = fs::canonicalize(path)
            .map_err(|err| RemakeError::io(format!("resolve dataset {}", path.display()), err))?;
        if !path.join(".git").exists() {
            return Err(RemakeError::InvalidInput(format!(
                "{} is not the root of a git repository",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    /// Dataset root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commit id of `HEAD`.
    pub fn head(&self) -> Result<String> {
        Git::new(&self.path).args(["rev-parse", "HEAD"]).oneline()
    }

    /// Resolve a revision to a commit id.
    pub fn resolve_commit(&self, revision: &str) -> Result<String> {
        Git::new(&self.path)
            .args(["rev-parse", "--verify", "--end-of-options"])
            .arg(format!("{revision}^{{commit}}"))
            .oneline()
    }

    /// True when `commit` names a commit object in this repository.
    #[must_use]
    pub fn has_commit(&self, commit: &str) -> bool {
        Git::new(&self.path)
            .args(["cat-file", "-t", commit])
            .oneline()
            .is_ok_and(|kind| kind == "commit")
    }

    /// Nested datasets, optionally descending into installed ones.
    pub fn subdatasets(&self, recursive: bool) -> Result<Vec<Subdataset>> {
        let mut found = Vec::new();
        collect_subdatasets(&self.path, recursive, &mut found)?;
        Ok(found)
    }

    /// Absolute roots of this dataset and every installed nested dataset.
    pub fn repositories(&self) -> Result<Vec<PathBuf>> {
        let mut roots = vec![self.path.clone()];
        roots.extend(
            self.subdatasets(true)?
                .into_iter()
                .filter(|sub| sub.installed)
                .map(|sub| sub.path),
        );
        Ok(roots)
    }

    /// Uncommitted files across this dataset and installed nested datasets.
    pub fn dirty_entries(&self) -> Result<Vec<DirtyEntry>> {
        let mut entries = Vec::new();
        for root in self.repositories()? {
            let prefix = root.strip_prefix(&self.path).unwrap_or(Path::new(""));
            for entry in repository_status(&root)? {
                entries.push(DirtyEntry {
                    path: prefix.join(entry.path),
                    state: entry.state,
                });
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Fetch annexed content for `paths` (files or directories).
    pub fn get(&self, paths: &[PathBuf]) -> Result<()> {
        let roots = self.repositories()?;
        for (root, relative) in group_by_repository(&roots, paths) {
            if !is_annex_repo(&root) {
                continue;
            }
            info!("fetching {} path(s) in {}", relative.len(), root.display());
            Git::annex(&root).arg("get").arg("--").args(&relative).run()?;
        }
        Ok(())
    }

    /// Check out a registered nested dataset, annex-initialising it when its
    /// origin carries annex metadata. Installed datasets are left alone.
    pub fn install_subdataset(&self, sub: &Subdataset) -> Result<()> {
        if sub.path.join(".git").exists() {
            return Ok(());
        }
        info!("installing nested dataset {}", sub.path.display());
        Git::new(&sub.parent)
            .args(["-c", "protocol.file.allow=always", "submodule", "update", "--init", "--"])
            .arg(sub.path_in_parent())
            .run()?;
        let has_annex_branch = Git::new(&sub.path)
            .args(["rev-parse", "--verify", "-q", "refs/remotes/origin/git-annex"])
            .success();
        if has_annex_branch {
            Git::annex(&sub.path).arg("init").run()?;
        }
        Ok(())
    }

    /// Replace annexed symlinks with writable files.
    ///
    /// Present content is unlocked through git-annex. Dangling links become
    /// pointer files so they can be overwritten.
    pub fn unlock(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let Ok(meta) = fs::symlink_metadata(path) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                if fs::metadata(path).is_ok() {
                    let (root, relative) = containing_repository(path)?;
                    Git::annex(&root).args(["unlock", "--"]).arg(relative).run()?;
                } else {
                    write_pointer_file(path)?;
                }
            } else if meta.permissions().readonly() {
                make_owner_writable(path, &meta).map_err(|err| {
                    RemakeError::io(format!("make {} writable", path.display()), err)
                })?;
            }
        }
        Ok(())
    }

    /// Commit `paths` in the repositories that contain them, deepest first,
    /// recording updated nested datasets in their parents.
    pub fn save(&self, message: &str, paths: &[PathBuf]) -> Result<()> {
        let mut roots = self.repositories()?;
        roots.sort_by_key(|root| std::cmp::Reverse(root.components().count()));
        let mut pending: BTreeMap<PathBuf, Vec<PathBuf>> =
            group_by_repository(&roots, paths).into_iter().collect();

        for root in &roots {
            let Some(relative) = pending.remove(root) else {
                continue;
            };
            if commit_paths(root, message, &relative)? && *root != self.path {
                if let Some((parent, path_in_parent)) = parent_repository(&roots, root) {
                    pending.entry(parent).or_default().push(path_in_parent);
                }
            }
        }
        Ok(())
    }
}

/// Locate the repository containing `path` and the path relative to it.
pub fn containing_repository(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let (dir, name) = if path.is_dir() && !is_symlink(path) {
        (path.to_path_buf(), None)
    } else {
        let parent = path.parent().unwrap_or(Path::new("."));
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        (parent.to_path_buf(), path.file_name())
    };
    let dir = fs::canonicalize(&dir)
        .map_err(|err| RemakeError::io(format!("resolve {}", dir.display()), err))?;
    let top = Git::new(&dir)
        .args(["rev-parse", "--show-toplevel"])
        .oneline()?;
    let top = fs::canonicalize(&top)
        .map_err(|err| RemakeError::io(format!("resolve {top}"), err))?;
    let full = match name {
        Some(name) => dir.join(name),
        None => dir,
    };
    let relative = full
        .strip_prefix(&top)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    Ok((top, relative))
}

/// Key-carrying repository and relative path when `path` is annexed.
#[must_use]
pub fn annexed_location(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let (root, relative) = containing_repository(path).ok()?;
    Git::annex(&root)
        .args(["lookupkey", "--"])
        .arg(&relative)
        .success()
        .then_some((root, relative))
}

/// Move computed content into the annex object store for `relative`.
pub fn reinject(root: &Path, source: &Path, relative: &Path) -> bool {
    Git::annex(root)
        .arg("reinject")
        .arg(source)
        .arg(relative)
        .success()
}

/// Record `url` against the key of `relative`.
pub fn add_url(root: &Path, url: &str, relative: &Path, relaxed: bool) -> bool {
    let mut git = Git::annex(root).args(["addurl", url, "--file"]).arg(relative);
    if relaxed {
        git = git.arg("--relaxed");
    }
    git.success()
}

/// Point a nested dataset at a different source URL before installing it.
pub fn set_submodule_url(parent: &Path, path_in_parent: &Path, url: &str) -> Result<()> {
    Git::new(parent)
        .args(["submodule", "set-url", "--"])
        .arg(path_in_parent)
        .arg(url)
        .run()
        .map(|_| ())
}

/// Configured remote URLs of a repository, keyed by remote name.
pub fn remote_urls(root: &Path) -> Result<BTreeMap<String, String>> {
    let output = Git::new(root)
        .args(["config", "-z", "--get-regexp", r"^remote\..*\.url$"])
        .output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(split_nul(&text)
        .into_iter()
        .filter_map(|record| {
            let (key, value) = record.split_once('\n')?;
            let name = key.strip_prefix("remote.")?.strip_suffix(".url")?;
            Some((name.to_owned(), value.to_owned()))
        })
        .collect())
}

pub(crate) fn is_annex_repo(root: &Path) -> bool {
    Git::new(root)
        .args(["config", "--get", "annex.uuid"])
        .oneline()
        .is_ok_and(|uuid| !uuid.is_empty())
}

/// Add the owner write bit to a file or directory.
pub(crate) fn make_owner_writable(path: &Path, meta: &fs::Metadata) -> std::io::Result<()> {
    let mut permissions = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink())
}

fn write_pointer_file(path: &Path) -> Result<()> {
    let target = fs::read_link(path)
        .map_err(|err| RemakeError::io(format!("read link {}", path.display()), err))?;
    let key = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!("replacing dangling annex link {} by pointer file", path.display());
    fs::remove_file(path)
        .map_err(|err| RemakeError::io(format!("remove {}", path.display()), err))?;
    fs::write(path, format!("/annex/objects/{key}\n"))
        .map_err(|err| RemakeError::io(format!("write {}", path.display()), err))
}

fn collect_subdatasets(root: &Path, recursive: bool, found: &mut Vec<Subdataset>) -> Result<()> {
    let staged = Git::new(root)
        .args(["ls-files", "-z", "--stage"])
        .run()?;
    let gitlinks: Vec<&str> = split_nul(&staged)
        .into_iter()
        .filter_map(|record| {
            let (meta, path) = record.split_once('\t')?;
            meta.starts_with(GITLINK_MODE).then_some(path)
        })
        .collect();
    if gitlinks.is_empty() {
        return Ok(());
    }
    let urls = gitmodule_urls(root)?;
    for relative in gitlinks {
        let path = root.join(relative);
        let installed = path.join(".git").exists();
        found.push(Subdataset {
            path: path.clone(),
            parent: root.to_path_buf(),
            url: urls.get(relative).cloned(),
            installed,
        });
        if recursive && installed {
            collect_subdatasets(&path, true, found)?;
        }
    }
    Ok(())
}

fn gitmodule_urls(root: &Path) -> Result<BTreeMap<String, String>> {
    if !root.join(".gitmodules").exists() {
        return Ok(BTreeMap::new());
    }
    let output = Git::new(root)
        .args(["config", "-z", "-f", ".gitmodules", "--get-regexp"])
        .arg(r"^submodule\..*\.(path|url)$")
        .output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let mut paths = BTreeMap::new();
    let mut urls = BTreeMap::new();
    for record in split_nul(&text) {
        let Some((key, value)) = record.split_once('\n') else {
            continue;
        };
        let Some(rest) = key.strip_prefix("submodule.") else {
            continue;
        };
        if let Some(name) = rest.strip_suffix(".path") {
            paths.insert(name.to_owned(), value.to_owned());
        } else if let Some(name) = rest.strip_suffix(".url") {
            urls.insert(name.to_owned(), value.to_owned());
        }
    }
    Ok(paths
        .into_iter()
        .filter_map(|(name, path)| urls.remove(&name).map(|url| (path, url)))
        .collect())
}

fn repository_status(root: &Path) -> Result<Vec<DirtyEntry>> {
    let text = Git::new(root)
        .args([
            "status",
            "--porcelain=v1",
            "-z",
            "--untracked-files=all",
            "--ignore-submodules=all",
        ])
        .run()?;
    Ok(parse_porcelain(&text))
}

fn parse_porcelain(text: &str) -> Vec<DirtyEntry> {
    let mut entries = Vec::new();
    let mut records = split_nul(text).into_iter();
    while let Some(record) = records.next() {
        if record.len() < 4 {
            continue;
        }
        let (code, path) = record.split_at(3);
        let mut flags = code[..2].chars();
        let (index, worktree) = (flags.next().unwrap_or(' '), flags.next().unwrap_or(' '));
        if matches!(index, 'R' | 'C') {
            records.next();
        }
        if path.ends_with('/') {
            continue;
        }
        let state = match (index, worktree) {
            ('?', '?') => DirtyState::Untracked,
            ('A', _) => DirtyState::Added,
            (_, 'D') | ('D', _) => DirtyState::Deleted,
            ('!', '!') => continue,
            _ => DirtyState::Modified,
        };
        entries.push(DirtyEntry {
            path: PathBuf::from(path),
            state,
        });
    }
    entries
}

fn group_by_repository(roots: &[PathBuf], paths: &[PathBuf]) -> BTreeMap<PathBuf, Vec<PathBuf>> {
    let mut grouped: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for path in paths {
        let owner = roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count());
        let Some(owner) = owner else {
            debug!("{} is outside every known repository", path.display());
            continue;
        };
        let relative = path.strip_prefix(owner).unwrap_or(Path::new(""));
        let relative = if relative.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            relative.to_path_buf()
        };
        grouped.entry(owner.clone()).or_default().push(relative);
    }
    grouped
}

fn parent_repository(roots: &[PathBuf], child: &Path) -> Option<(PathBuf, PathBuf)> {
    let parent = roots
        .iter()
        .filter(|root| root.as_path() != child && child.starts_with(root))
        .max_by_key(|root| root.components().count())?;
    let relative = child.strip_prefix(parent).ok()?.to_path_buf();
    Some((parent.clone(), relative))
}

fn commit_paths(root: &Path, message: &str, relative: &[PathBuf]) -> Result<bool> {
    let unique: BTreeSet<&PathBuf> = relative.iter().collect();
    let files: Vec<&PathBuf> = unique
        .iter()
        .copied()
        .filter(|path| !root.join(path).join(".git").exists())
        .collect();
    if is_annex_repo(root) && !files.is_empty() {
        Git::annex(root).args(["add", "--"]).args(&files).run()?;
    }
    Git::new(root).args(["add", "-A", "--"]).args(&unique).run()?;
    let unchanged = Git::new(root)
        .args(["diff", "--cached", "--quiet", "--"])
        .args(&unique)
        .success();
    if unchanged {
        debug!("nothing to commit in {}", root.display());
        return Ok(false);
    }
    Git::new(root)
        .args(["commit", "--quiet", "-m", message, "--"])
        .args(&unique)
        .run()?;
    Ok(true)
}
