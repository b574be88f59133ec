// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end chained recomputation through git-annex.
// Author: Lukas Bower

mod support;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use remake::{make, ConfigStack, Dataset, GitSignatureVerifier, MakeRequest, Status};
use remake_spec::PatternPath;
use serial_test::serial;
use tempfile::TempDir;

use support::{git, init_repo, require_annex, write};

fn expose_remote_binary() {
    let binary = PathBuf::from(env!("CARGO_BIN_EXE_git-annex-remote-datalad-remake"));
    let Some(dir) = binary.parent() else {
        return;
    };
    let mut paths = vec![dir.to_path_buf()];
    if let Some(current) = env::var_os("PATH") {
        paths.extend(env::split_paths(&current));
    }
    if let Ok(joined) = env::join_paths(paths) {
        env::set_var("PATH", joined);
    }
}

fn append_dataset(dir: &Path) -> PathBuf {
    let root = init_repo(
        dir,
        &[(
            ".datalad/make/methods/append",
            "parameters = [\"input\", \"output\", \"line\"]\n\
             command = [\"cat {input} > {output} && echo {line} >> {output}\"]\n\
             use_shell = \"true\"\n",
        )],
    );
    git(&root, &["annex", "init", "-q", "chain-test"]);
    git(&root, &["config", "datalad.dataset.id", "chain-test"]);
    git(
        &root,
        &["config", "datalad.make.allow-untrusted-execution.d-chain-test", "true"],
    );
    write(&root, "a.txt", "a\n");
    git(&root, &["annex", "add", "-q", "a.txt"]);
    git(&root, &["commit", "-q", "-m", "add a.txt"]);
    root
}

fn append(dataset: &Dataset, input: &str, output: &str, line: &str) {
    let request = MakeRequest {
        template: "append".to_owned(),
        inputs: vec![PatternPath::new(input).unwrap()],
        outputs: vec![PatternPath::new(output).unwrap()],
        parameters: BTreeMap::from([
            ("input".to_owned(), input.to_owned()),
            ("output".to_owned(), output.to_owned()),
            ("line".to_owned(), line.to_owned()),
        ]),
        allow_untrusted_execution: true,
        ..MakeRequest::default()
    };
    let config = ConfigStack::load(dataset.path(), &BTreeMap::new()).unwrap();
    let records = make(dataset, &request, &config, &GitSignatureVerifier).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Status::Ok);
}

#[test]
#[serial]
fn dropped_outputs_are_recomputed_through_their_inputs() {
    if !require_annex() {
        return;
    }
    expose_remote_binary();
    let dir = TempDir::new().unwrap();
    let root = append_dataset(&dir.path().join("ds"));
    let dataset = Dataset::open(&root).unwrap();

    append(&dataset, "a.txt", "c1.txt", "line1");
    append(&dataset, "c1.txt", "c2.txt", "line2");
    assert_eq!(fs::read_to_string(root.join("c2.txt")).unwrap(), "a\nline1\nline2\n");

    git(&root, &["annex", "drop", "--force", "c1.txt", "c2.txt"]);
    assert!(fs::read_to_string(root.join("c2.txt")).is_err());

    git(&root, &["annex", "get", "c2.txt"]);
    assert_eq!(fs::read_to_string(root.join("c2.txt")).unwrap(), "a\nline1\nline2\n");
}
