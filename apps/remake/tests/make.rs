// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Integration tests for computation registration.
// Author: Lukas Bower

mod support;

use std::collections::BTreeMap;
use std::fs;

use remake::make::write_spec;
use remake::{make, ConfigStack, Dataset, ErrorClass, MakeRequest};
use remake_spec::{ComputeSpec, PatternPath, SPECIFICATION_DIR};
use tempfile::TempDir;

use support::{git, greeting_dataset, require_git, worktree_count, FakeVerifier};

fn greeting_spec(inputs: &[&str]) -> ComputeSpec {
    ComputeSpec::new(
        "greet",
        inputs.iter().map(|input| PatternPath::new(input).unwrap()),
        vec![PatternPath::new("a.txt").unwrap()],
        BTreeMap::from([
            ("name".to_owned(), "Robert".to_owned()),
            ("file".to_owned(), "a.txt".to_owned()),
        ]),
        None,
    )
}

#[test]
fn identical_registrations_share_one_specification() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = greeting_dataset(&dir.path().join("ds"));
    let dataset = Dataset::open(&root).unwrap();

    let first = write_spec(&dataset, &greeting_spec(&["inputs/unused.txt", "b.txt"])).unwrap();
    let head = dataset.head().unwrap();
    let second = write_spec(&dataset, &greeting_spec(&["b.txt", "inputs/unused.txt"])).unwrap();

    assert_eq!(first, second);
    assert_eq!(dataset.head().unwrap(), head);
    let stored: Vec<_> = fs::read_dir(root.join(SPECIFICATION_DIR))
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].to_string_lossy(), first);
    let message = git(&root, &["log", "-1", "--format=%B"]);
    assert!(message.starts_with("[DATALAD] saving computation spec"));
    assert!(message.ends_with(&format!("file name: {first}")));
}

#[test]
fn failed_registration_leaves_no_specification_commit() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = greeting_dataset(&dir.path().join("ds"));
    let dataset = Dataset::open(&root).unwrap();
    let before = dataset.head().unwrap();

    let request = MakeRequest {
        template: "missing".to_owned(),
        outputs: vec![PatternPath::new("out.txt").unwrap()],
        allow_untrusted_execution: true,
        ..MakeRequest::default()
    };
    let err = make(
        &dataset,
        &request,
        &ConfigStack::default(),
        &FakeVerifier::signed_by("nobody"),
    )
    .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Resolution);
    assert_eq!(dataset.head().unwrap(), before);
    let remaining = fs::read_dir(root.join(SPECIFICATION_DIR))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(remaining, 0);
    assert_eq!(worktree_count(&root), 1);
}

#[test]
fn registration_requires_outputs() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = greeting_dataset(&dir.path().join("ds"));
    let dataset = Dataset::open(&root).unwrap();
    let before = dataset.head().unwrap();

    let request = MakeRequest {
        template: "greet".to_owned(),
        ..MakeRequest::default()
    };
    let err = make(
        &dataset,
        &request,
        &ConfigStack::default(),
        &FakeVerifier::default(),
    )
    .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert_eq!(dataset.head().unwrap(), before);
}

#[test]
fn untrusted_templates_abort_registration() {
    if !require_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = greeting_dataset(&dir.path().join("ds"));
    let dataset = Dataset::open(&root).unwrap();
    let before = dataset.head().unwrap();

    let request = MakeRequest {
        template: "greet".to_owned(),
        outputs: vec![PatternPath::new("a.txt").unwrap()],
        parameters: BTreeMap::from([
            ("name".to_owned(), "Robert".to_owned()),
            ("file".to_owned(), "a.txt".to_owned()),
        ]),
        ..MakeRequest::default()
    };
    let err = make(
        &dataset,
        &request,
        &ConfigStack::default(),
        &FakeVerifier::signed_by("nobody"),
    )
    .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Trust);
    assert_eq!(dataset.head().unwrap(), before);
    assert!(!root.join("a.txt").exists());
}
