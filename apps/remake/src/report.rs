// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: JSON status records emitted by the remake CLI.
// Author: Lukas Bower

//! JSON-lines status records printed by the CLI.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::dataset::DirtyEntry;

/// Outcome of one reported item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Action completed.
    Ok,
    /// Nothing had to be done.
    NotNeeded,
    /// Action failed for this item.
    Error,
}

/// One line of command output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    /// Action that produced the record.
    pub action: &'static str,
    /// Outcome.
    pub status: Status,
    /// Path the record refers to.
    pub path: PathBuf,
    /// Dirty state for provisioning errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Human readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Pointer URL for registrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl StatusRecord {
    /// Record with the given outcome.
    #[must_use]
    pub fn new(action: &'static str, status: Status, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            status,
            path: path.into(),
            state: None,
            message: None,
            url: None,
        }
    }

    /// Error record describing a dirty input.
    #[must_use]
    pub fn dirty(dataset: &Path, entry: &DirtyEntry) -> Self {
        let mut record = Self::new("provision", Status::Error, dataset.join(&entry.path));
        record.state = Some(entry.state.to_string());
        record.message = Some(format!(
            "cannot provision {} input {} from dataset {}",
            entry.state,
            entry.path.display(),
            dataset.display()
        ));
        record
    }

    /// Attach a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a pointer URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Render as a single JSON line.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
