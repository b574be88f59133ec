// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Canonical compute specification documents and their content address.
// Author: Lukas Bower

//! Compute specifications.
//!
//! A specification names the method template, the declared input and output
//! patterns, an optional stdout capture path and the parameter bindings. It is
//! stored under [`crate::SPECIFICATION_DIR`] using the hex SHA-256 of its
//! canonical JSON as the file name, so registering the same computation twice
//! resolves to the same file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{PatternPath, SpecError};

/// One registered computation.
///
/// Field order is alphabetical so the derived serialisation is the canonical
/// sorted-key form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeSpec {
    /// Input patterns, sorted.
    pub input: Vec<PatternPath>,
    /// Method template name.
    pub method: String,
    /// Output patterns, sorted.
    pub output: Vec<PatternPath>,
    /// Parameter bindings.
    #[serde(default)]
    pub parameter: BTreeMap<String, String>,
    /// Optional stdout capture path.
    #[serde(default)]
    pub stdout: Option<PatternPath>,
}

impl ComputeSpec {
    /// Build a specification, sorting and deduplicating the pattern lists.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        input: impl IntoIterator<Item = PatternPath>,
        output: impl IntoIterator<Item = PatternPath>,
        parameter: BTreeMap<String, String>,
        stdout: Option<PatternPath>,
    ) -> Self {
        Self {
            input: sorted(input),
            method: method.into(),
            output: sorted(output),
            parameter,
            stdout,
        }
    }

    /// Parse a stored specification.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SpecError> {
        serde_json::from_slice(bytes)
            .map_err(|err| SpecError::MalformedSpecification(err.to_string()))
    }

    /// Canonical JSON text.
    pub fn to_canonical_json(&self) -> Result<String, SpecError> {
        let mut canonical = self.clone();
        canonical.input = sorted(canonical.input);
        canonical.output = sorted(canonical.output);
        serde_json::to_string(&canonical)
            .map_err(|err| SpecError::MalformedSpecification(err.to_string()))
    }

    /// Hex SHA-256 of the canonical JSON; the specification id.
    pub fn digest(&self) -> Result<String, SpecError> {
        let canonical = self.to_canonical_json()?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }
}

fn sorted(paths: impl IntoIterator<Item = PatternPath>) -> Vec<PatternPath> {
    let mut keyed: Vec<(String, PatternPath)> = paths
        .into_iter()
        .map(|path| (path.to_string(), path))
        .collect();
    keyed.sort_by(|left, right| left.0.cmp(&right.0));
    keyed.dedup_by(|left, right| left.0 == right.0);
    keyed.into_iter().map(|(_, path)| path).collect()
}
