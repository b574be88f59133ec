// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Typed error conditions for the remake pipeline.
// Author: Lukas Bower

//! Error types shared by every remake component.

use std::fmt;
use std::io;
use std::path::PathBuf;

use remake_spec::SpecError;
use thiserror::Error;

use crate::dataset::DirtyEntry;

/// Result alias for remake operations.
pub type Result<T, E = RemakeError> = std::result::Result<T, E>;

/// Broad failure class, used by callers to tell conditions apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Dirty dataset, malformed or absolute pattern.
    Precondition,
    /// Dataset, specification or template could not be resolved.
    Resolution,
    /// Signature verification failed or was impossible.
    Trust,
    /// The computation exited unsuccessfully.
    Execution,
    /// Outputs could not be registered with the annex.
    Collection,
    /// A git or filesystem operation failed.
    Environment,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Precondition => "precondition",
            Self::Resolution => "resolution",
            Self::Trust => "trust",
            Self::Execution => "execution",
            Self::Collection => "collection",
            Self::Environment => "environment",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by provisioning, execution, collection and the remote.
#[derive(Debug, Error)]
pub enum RemakeError {
    /// Source dataset has uncommitted changes touching the inputs.
    #[error("dataset {} has {} unclean input file(s)", dataset.display(), entries.len())]
    DirtyDataset {
        /// Dataset that was checked.
        dataset: PathBuf,
        /// Offending files.
        entries: Vec<DirtyEntry>,
    },
    /// Caller supplied unusable arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Specification, template or pointer could not be resolved.
    #[error("could not resolve compute instruction: {0}")]
    Resolution(String),
    /// No repository above the start directory knows the commit.
    #[error("Could not find dataset with commit {commit}, starting from {}", start.display())]
    DatasetNotFound {
        /// Requested root version.
        commit: String,
        /// Directory the search began in.
        start: PathBuf,
    },
    /// Signature verification failed.
    #[error("Signature validation of {} failed: {reason}", path.display())]
    Untrusted {
        /// Dataset-relative file that was checked.
        path: PathBuf,
        /// Verifier output.
        reason: String,
    },
    /// Verification is required but no trusted key is configured.
    #[error("no trusted keys configured in {key}, refusing to execute {}", path.display())]
    NoTrustedKeys {
        /// Configuration key consulted.
        key: &'static str,
        /// File that would have been verified.
        path: PathBuf,
    },
    /// Computation exited unsuccessfully.
    #[error("command {command:?} {status}")]
    Execution {
        /// Rendered command line.
        command: String,
        /// Exit description.
        status: String,
    },
    /// Pointer registration failed.
    #[error("addurl failed: dataset_path: {} url: {url:?} file_path: {}", dataset.display(), path.display())]
    Integration {
        /// Dataset that owns the file.
        dataset: PathBuf,
        /// Pointer URL.
        url: String,
        /// Output file.
        path: PathBuf,
    },
    /// External git or git-annex command failed.
    #[error("git {args} failed ({status}): {stderr}")]
    Git {
        /// Arguments, space separated.
        args: String,
        /// Exit description.
        status: String,
        /// Captured stderr, trimmed.
        stderr: String,
    },
    /// git-annex sent something the special remote protocol does not allow.
    #[error("special remote protocol violation: {0}")]
    Protocol(String),
    /// Filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        /// Operation being performed.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Pattern, template, specification or pointer data was invalid.
    #[error(transparent)]
    Spec(#[from] SpecError),
}

impl RemakeError {
    /// Wrap an I/O error with the operation that failed.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Failure class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DirtyDataset { .. } | Self::InvalidInput(_) => ErrorClass::Precondition,
            Self::Spec(SpecError::InvalidPattern { .. }) => ErrorClass::Precondition,
            Self::Resolution(_) | Self::DatasetNotFound { .. } | Self::Spec(_) => {
                ErrorClass::Resolution
            }
            Self::Untrusted { .. } | Self::NoTrustedKeys { .. } => ErrorClass::Trust,
            Self::Execution { .. } => ErrorClass::Execution,
            Self::Integration { .. } => ErrorClass::Collection,
            Self::Git { .. } | Self::Protocol(_) | Self::Io { .. } => ErrorClass::Environment,
        }
    }
}

/// Describe a process exit status the way error messages expect.
#[must_use]
pub(crate) fn describe_status(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by signal".to_owned(),
    }
}
