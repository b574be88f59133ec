// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve path patterns against nested datasets, installing them lazily.
// Author: Lukas Bower

//! Pattern resolution.
//!
//! Patterns are matched one segment at a time. Whenever a matching directory
//! is a nested dataset that is not yet installed, the [`SubdatasetInstaller`]
//! checks it out before descending, so only the datasets a pattern actually
//! reaches are installed. The set of uninstalled datasets is the only state
//! threaded through the recursion.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use log::{debug, warn};
use remake_spec::PatternPath;
use url::Url;

use crate::dataset::{remote_urls, set_submodule_url, Dataset, Subdataset};
use crate::error::{RemakeError, Result};

const RECURSIVE: &str = "**";

const SEGMENT_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// Installs nested datasets on demand during resolution.
pub trait SubdatasetInstaller {
    /// Nested datasets below the root that are currently not installed.
    fn uninstalled(&mut self) -> Result<BTreeSet<PatternPath>>;
    /// Install the nested dataset at `path`.
    fn install(&mut self, path: &PatternPath) -> Result<()>;
}

/// Installer for trees without nested datasets, or where none may be installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInstall;

impl SubdatasetInstaller for NoInstall {
    fn uninstalled(&mut self) -> Result<BTreeSet<PatternPath>> {
        Ok(BTreeSet::new())
    }

    fn install(&mut self, _path: &PatternPath) -> Result<()> {
        Ok(())
    }
}

/// Parse raw patterns, logging and skipping any that are absolute.
#[must_use]
pub fn parse_patterns<S: AsRef<str>>(raw: &[S]) -> Vec<PatternPath> {
    raw.iter()
        .filter_map(|pattern| match PatternPath::new(pattern.as_ref()) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("skipping pattern: {err}");
                None
            }
        })
        .collect()
}

/// Union of the matches of every pattern below `root`, directories included.
pub fn resolve_patterns(
    root: &Path,
    patterns: &[PatternPath],
    installer: &mut dyn SubdatasetInstaller,
) -> Result<BTreeSet<PatternPath>> {
    let mut uninstalled = installer.uninstalled()?;
    let mut matches = BTreeSet::new();
    for pattern in patterns {
        matches.extend(glob_pattern(
            root,
            &PatternPath::default(),
            pattern.parts(),
            &mut uninstalled,
            installer,
        )?);
    }
    Ok(matches)
}

/// Matching files below `root`, without installing anything.
pub fn resolve_files(root: &Path, patterns: &[PatternPath]) -> Result<BTreeSet<PatternPath>> {
    Ok(resolve_patterns(root, patterns, &mut NoInstall)?
        .into_iter()
        .filter(|path| !path.to_host_path(root).is_dir())
        .collect())
}

fn glob_pattern(
    root: &Path,
    position: &PatternPath,
    pattern: &[String],
    uninstalled: &mut BTreeSet<PatternPath>,
    installer: &mut dyn SubdatasetInstaller,
) -> Result<BTreeSet<PatternPath>> {
    let Some((head, tail)) = pattern.split_first() else {
        return Ok(BTreeSet::from([position.clone()]));
    };

    let mut result = BTreeSet::new();
    let (segment, remaining) = if head == RECURSIVE {
        result.extend(glob_pattern(root, position, tail, uninstalled, installer)?);
        ("*", pattern)
    } else {
        (head.as_str(), tail)
    };

    for name in match_segment(&position.to_host_path(root), segment)? {
        let candidate = position.child(&name);
        if uninstalled.contains(&candidate) && candidate.to_host_path(root).is_dir() {
            installer.install(&candidate)?;
            *uninstalled = installer.uninstalled()?;
            uninstalled.remove(&candidate);
        }
        result.extend(glob_pattern(
            root,
            &candidate,
            remaining,
            uninstalled,
            installer,
        )?);
    }
    Ok(result)
}

fn match_segment(dir: &Path, segment: &str) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    if !segment.contains(&['*', '?', '['][..]) {
        let exists = fs::symlink_metadata(dir.join(segment)).is_ok();
        return Ok(if exists {
            vec![segment.to_owned()]
        } else {
            Vec::new()
        });
    }
    let matcher = Pattern::new(segment).unwrap_or_else(|err| {
        debug!("treating {segment:?} literally: {err}");
        Pattern::new(&Pattern::escape(segment)).unwrap_or_default()
    });
    let entries = fs::read_dir(dir)
        .map_err(|err| RemakeError::io(format!("list {}", dir.display()), err))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| RemakeError::io(format!("list {}", dir.display()), err))?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            debug!("skipping non UTF-8 entry in {}", dir.display());
            continue;
        };
        if matcher.matches_with(&name, SEGMENT_OPTIONS) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Installs nested datasets of a provisioned worktree, pointing them at
/// copies already present next to the source dataset when possible.
#[derive(Debug)]
pub struct WorktreeInstaller<'a> {
    worktree: &'a Dataset,
    sources: BTreeMap<PatternPath, String>,
}

impl<'a> WorktreeInstaller<'a> {
    /// Prepare an installer for `worktree` provisioned from `source`.
    pub fn new(worktree: &'a Dataset, source: &Dataset) -> Result<Self> {
        Ok(Self {
            worktree,
            sources: locally_available_subdatasets(source)?,
        })
    }

    fn subdataset(&self, path: &PatternPath) -> Result<Subdataset> {
        let target = path.to_host_path(self.worktree.path());
        self.worktree
            .subdatasets(true)?
            .into_iter()
            .find(|sub| sub.path == target)
            .ok_or_else(|| {
                RemakeError::Resolution(format!("{path} is not a nested dataset of the worktree"))
            })
    }
}

impl SubdatasetInstaller for WorktreeInstaller<'_> {
    fn uninstalled(&mut self) -> Result<BTreeSet<PatternPath>> {
        relative_uninstalled(self.worktree)
    }

    fn install(&mut self, path: &PatternPath) -> Result<()> {
        let sub = self.subdataset(path)?;
        if let Some(url) = self.sources.get(path) {
            debug!("installing {path} from local source {url}");
            set_submodule_url(&sub.parent, sub.path_in_parent(), url)?;
        }
        self.worktree.install_subdataset(&sub)
    }
}

/// Uninstalled nested datasets of `dataset`, relative to its root.
pub fn relative_uninstalled(dataset: &Dataset) -> Result<BTreeSet<PatternPath>> {
    let mut paths = BTreeSet::new();
    for sub in dataset.subdatasets(true)? {
        if sub.installed {
            continue;
        }
        if let Ok(relative) = sub.path.strip_prefix(dataset.path()) {
            paths.insert(PatternPath::from_host_path(relative)?);
        }
    }
    Ok(paths)
}

/// Nested datasets of `source` that can be cloned without network access,
/// mapped to the URL to clone them from.
///
/// Installed datasets are cloned from their checkout. Absent datasets with a
/// relative submodule URL are resolved against the parent's file-based
/// remote, or the parent itself when it has none.
pub fn locally_available_subdatasets(source: &Dataset) -> Result<BTreeMap<PatternPath, String>> {
    let mut available = BTreeMap::new();
    for sub in source.subdatasets(true)? {
        let Ok(relative) = sub.path.strip_prefix(source.path()) else {
            continue;
        };
        let relative = PatternPath::from_host_path(relative)?;
        let location = if sub.installed {
            Some(sub.path.clone())
        } else {
            sub.url
                .as_deref()
                .filter(|url| is_relative_url(url))
                .and_then(|url| resolve_relative_url(&sub.parent, url))
        };
        if let Some(url) = location.and_then(|path| Url::from_file_path(path).ok()) {
            available.insert(relative, url.to_string());
        }
    }
    Ok(available)
}

fn is_relative_url(url: &str) -> bool {
    url.starts_with("./") || url.starts_with("../")
}

fn resolve_relative_url(parent: &Path, url: &str) -> Option<PathBuf> {
    let base = file_origin(parent).unwrap_or_else(|| parent.to_path_buf());
    fs::canonicalize(base.join(url)).ok()
}

fn file_origin(repository: &Path) -> Option<PathBuf> {
    let mut remotes = remote_urls(repository).ok()?;
    let preferred = remotes.remove("origin");
    preferred
        .into_iter()
        .chain(remotes.into_values())
        .find_map(|url| {
            if url.starts_with('/') {
                Some(PathBuf::from(url))
            } else if is_relative_url(&url) {
                Some(repository.join(url))
            } else if url.starts_with("file://") {
                Url::parse(&url).ok()?.to_file_path().ok()
            } else {
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Simulates nested datasets as directories populated on install.
    struct FakeInstaller {
        root: PathBuf,
        pending: BTreeMap<PatternPath, Vec<&'static str>>,
        installed: Vec<String>,
    }

    impl SubdatasetInstaller for FakeInstaller {
        fn uninstalled(&mut self) -> Result<BTreeSet<PatternPath>> {
            Ok(self
                .pending
                .keys()
                .filter(|path| path.to_host_path(&self.root).is_dir())
                .cloned()
                .collect())
        }

        fn install(&mut self, path: &PatternPath) -> Result<()> {
            let files = self.pending.remove(path).expect("known dataset");
            for file in files {
                let target = path.to_host_path(&self.root).join(file);
                if file.ends_with('/') {
                    fs::create_dir_all(&target).unwrap();
                } else {
                    fs::create_dir_all(target.parent().unwrap()).unwrap();
                    fs::write(target, file).unwrap();
                }
            }
            self.installed.push(path.to_string());
            Ok(())
        }
    }

    fn p(value: &str) -> PatternPath {
        PatternPath::new(value).unwrap()
    }

    fn names(paths: &BTreeSet<PatternPath>) -> Vec<String> {
        paths.iter().map(ToString::to_string).collect()
    }

    /// root: a.txt, b.txt, d1/ (uninstalled: d1/a.txt, d1/d2/)
    /// d1/d2 (uninstalled: d2/c.txt)
    fn nested_tree() -> (TempDir, FakeInstaller) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();
        fs::create_dir(root.join("d1")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        let mut pending = BTreeMap::new();
        pending.insert(p("d1"), vec!["a.txt", "d2/"]);
        pending.insert(p("d1/d2"), vec!["c.txt"]);
        let installer = FakeInstaller {
            root,
            pending,
            installed: Vec::new(),
        };
        (dir, installer)
    }

    #[test]
    fn top_level_glob_installs_nothing() {
        let (dir, mut installer) = nested_tree();
        let found = resolve_patterns(dir.path(), &[p("*.txt")], &mut installer).unwrap();
        assert_eq!(names(&found), ["a.txt", "b.txt"]);
        assert!(installer.installed.is_empty());
    }

    #[test]
    fn one_level_glob_installs_one_dataset() {
        let (dir, mut installer) = nested_tree();
        let found = resolve_patterns(dir.path(), &[p("d1/*.txt")], &mut installer).unwrap();
        assert_eq!(names(&found), ["d1/a.txt"]);
        assert_eq!(installer.installed, ["d1"]);
    }

    #[test]
    fn recursive_glob_installs_everything_reached() {
        let (dir, mut installer) = nested_tree();
        let found = resolve_patterns(dir.path(), &[p("**/*.txt")], &mut installer).unwrap();
        assert_eq!(
            names(&found),
            ["a.txt", "b.txt", "d1/a.txt", "d1/d2/c.txt"]
        );
        assert_eq!(installer.installed, ["d1", "d1/d2"]);
        assert!(installer.uninstalled().unwrap().is_empty());
    }

    #[test]
    fn hidden_entries_need_literal_dots() {
        let (dir, mut installer) = nested_tree();
        fs::create_dir_all(dir.path().join(".datalad/make")).unwrap();
        fs::write(dir.path().join(".datalad/make/m"), "m").unwrap();
        let found = resolve_patterns(dir.path(), &[p("*")], &mut installer).unwrap();
        assert_eq!(names(&found), ["a.txt", "b.txt", "d1"]);
        let found = resolve_patterns(dir.path(), &[p(".datalad/make/*")], &mut installer).unwrap();
        assert_eq!(names(&found), [".datalad/make/m"]);
    }

    #[test]
    fn resolve_files_drops_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("results/sub-01")).unwrap();
        fs::write(dir.path().join("results/sub-01/a.txt"), "a").unwrap();
        fs::write(dir.path().join("results/b.txt"), "b").unwrap();
        let found = resolve_files(dir.path(), &[p("results/**")]).unwrap();
        assert_eq!(names(&found), ["results/b.txt", "results/sub-01/a.txt"]);
        let found = resolve_files(dir.path(), &[p("missing/*.txt"), p("results/b.txt")]).unwrap();
        assert_eq!(names(&found), ["results/b.txt"]);
    }

    #[test]
    fn absolute_patterns_are_skipped() {
        let parsed = parse_patterns(&["a.txt", "/etc/passwd", "b/*"]);
        let parsed: Vec<String> = parsed.iter().map(ToString::to_string).collect();
        assert_eq!(parsed, ["a.txt", "b/*"]);
    }

    #[test]
    fn relative_urls_are_recognised() {
        assert!(is_relative_url("./sub"));
        assert!(is_relative_url("../sibling"));
        assert!(!is_relative_url("https://example.com/sub"));
        assert!(!is_relative_url("/abs/sub"));
    }
}
