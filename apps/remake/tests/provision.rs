// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Integration tests for worktree provisioning and teardown.
// Author: Lukas Bower

mod support;

use std::fs;
use std::path::PathBuf;

use remake::dataset::DirtyState;
use remake::glob::parse_patterns;
use remake::{provide, provide_context, remove, Dataset, ErrorClass, ProvisionOutcome};
use tempfile::TempDir;

use support::{git, init_repo, nested_clone, require_git, worktree_count, write};

fn provisioned(outcome: ProvisionOutcome) -> PathBuf {
    match outcome {
        ProvisionOutcome::Provisioned(path) => path,
        ProvisionOutcome::Dirty(entries) => panic!("unexpected dirty inputs {entries:?}"),
    }
}

#[test]
fn dirty_inputs_are_reported_one_by_one() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = init_repo(
        &dir.path().join("ds"),
        &[("a.txt", "a\n"), ("b.txt", "b\n"), ("other.dat", "x\n")],
    );
    write(&root, "a.txt", "changed\n");
    write(&root, "new.txt", "new\n");
    write(&root, "other.dat", "ignored by the patterns\n");
    let dataset = Dataset::open(&root).unwrap();

    let outcome = provide(&dataset, &parse_patterns(&["*.txt"]), None, None).unwrap();
    let ProvisionOutcome::Dirty(entries) = outcome else {
        panic!("dirty dataset was provisioned");
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path, PathBuf::from("a.txt"));
    assert_eq!(entries[0].state, DirtyState::Modified);
    assert_eq!(entries[1].path, PathBuf::from("new.txt"));
    assert_eq!(entries[1].state, DirtyState::Untracked);
    assert_eq!(worktree_count(&root), 1);

    let err = provide_context(&dataset, None, &parse_patterns(&["*.txt"])).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Precondition);
}

#[test]
fn clean_inputs_land_in_a_fresh_worktree() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = init_repo(&dir.path().join("ds"), &[("a.txt", "a\n"), ("data/b.csv", "b\n")]);
    write(&root, "scratch.log", "not an input\n");
    let dataset = Dataset::open(&root).unwrap();
    let target = dir.path().join("work");

    let worktree = provisioned(
        provide(
            &dataset,
            &parse_patterns(&["*.txt", "data/*.csv"]),
            None,
            Some(&target),
        )
        .unwrap(),
    );
    assert_eq!(worktree, fs::canonicalize(&target).unwrap());
    assert_eq!(fs::read_to_string(worktree.join("a.txt")).unwrap(), "a\n");
    assert_eq!(fs::read_to_string(worktree.join("data/b.csv")).unwrap(), "b\n");
    assert!(!worktree.join("scratch.log").exists());
    assert_eq!(worktree_count(&root), 2);

    remove(&dataset, &worktree).unwrap();
    assert_eq!(worktree_count(&root), 1);
}

#[test]
fn removal_is_idempotent() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = init_repo(&dir.path().join("ds"), &[("a.txt", "a\n")]);
    let dataset = Dataset::open(&root).unwrap();
    let worktree = provisioned(provide(&dataset, &[], None, None).unwrap());
    let branch = format!("remake/{}", worktree.file_name().unwrap().to_string_lossy());
    assert!(!git(&root, &["branch", "--list", &branch]).is_empty());

    remove(&dataset, &worktree).unwrap();
    assert!(!worktree.exists());
    assert!(git(&root, &["branch", "--list", &branch]).is_empty());
    remove(&dataset, &worktree).unwrap();
    assert_eq!(worktree_count(&root), 1);

    assert!(remove(&dataset, &root).is_err());
    assert!(root.join("a.txt").exists());
}

#[test]
fn user_branches_survive_provisioning() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = init_repo(&dir.path().join("ds"), &[("a.txt", "a\n")]);
    git(&root, &["branch", "feature"]);
    git(&root, &["checkout", "-q", "feature"]);
    write(&root, "feature.txt", "work in progress\n");
    git(&root, &["add", "feature.txt"]);
    git(&root, &["commit", "-q", "-m", "feature work"]);
    git(&root, &["checkout", "-q", "-"]);
    let feature = git(&root, &["rev-parse", "feature"]);
    let dataset = Dataset::open(&root).unwrap();

    let target = dir.path().join("feature");
    let worktree = provisioned(provide(&dataset, &[], None, Some(&target)).unwrap());
    assert_eq!(git(&root, &["rev-parse", "feature"]), feature);
    assert_eq!(git(&worktree, &["rev-parse", "--abbrev-ref", "HEAD"]), "remake/feature");
    assert!(!worktree.join("feature.txt").exists());

    remove(&dataset, &worktree).unwrap();
    assert_eq!(git(&root, &["rev-parse", "feature"]), feature);
    assert!(git(&root, &["branch", "--list", "remake/feature"]).is_empty());
}

#[test]
fn occupied_branch_names_are_refused() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = init_repo(&dir.path().join("ds"), &[("a.txt", "a\n")]);
    git(&root, &["branch", "remake/taken"]);
    let dataset = Dataset::open(&root).unwrap();
    let target = dir.path().join("taken");

    let err = provide(&dataset, &[], None, Some(&target)).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert!(!target.exists());
    assert!(!git(&root, &["branch", "--list", "remake/taken"]).is_empty());
    assert_eq!(worktree_count(&root), 1);

    let err = provide(&dataset, &[], Some("no-such-branch"), None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert_eq!(worktree_count(&root), 1);
}

#[test]
fn scope_guard_tears_down_on_drop() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = init_repo(&dir.path().join("ds"), &[("a.txt", "a\n")]);
    let dataset = Dataset::open(&root).unwrap();
    let path = {
        let guard = provide_context(&dataset, None, &parse_patterns(&["a.txt"])).unwrap();
        assert!(guard.path().join("a.txt").exists());
        guard.path().to_path_buf()
    };
    assert!(!path.exists());
    assert_eq!(worktree_count(&root), 1);
}

#[test]
fn only_reached_subdatasets_are_installed() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let clone = nested_clone(dir.path());
    let dataset = Dataset::open(&clone).unwrap();

    let worktree = provisioned(provide(&dataset, &parse_patterns(&["*.txt"]), None, None).unwrap());
    assert!(worktree.join("a.txt").exists());
    assert!(!worktree.join("d1/.git").exists());
    remove(&dataset, &worktree).unwrap();

    let worktree =
        provisioned(provide(&dataset, &parse_patterns(&["d1/*.txt"]), None, None).unwrap());
    assert_eq!(fs::read_to_string(worktree.join("d1/b.txt")).unwrap(), "b\n");
    assert!(!worktree.join("d1/d2/.git").exists());
    remove(&dataset, &worktree).unwrap();

    let worktree =
        provisioned(provide(&dataset, &parse_patterns(&["d1/**/c.txt"]), None, None).unwrap());
    assert_eq!(fs::read_to_string(worktree.join("d1/d2/c.txt")).unwrap(), "c\n");
    remove(&dataset, &worktree).unwrap();
    assert!(!clone.join("d1/.git").exists());
}
