// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared data model for remake compute instructions.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Data model shared by the remake registration command and special remote.
//!
//! Everything in this crate is free of process side effects: paths are
//! normalised, templates are parsed and rendered, specifications are
//! serialised to their canonical form and pointers are encoded, but nothing
//! here touches a repository.

pub mod list;
pub mod pattern;
pub mod pointer;
pub mod spec;
pub mod template;

use thiserror::Error;

pub use list::read_list;
pub use pattern::PatternPath;
pub use pointer::{claims_url, ComputePointer};
pub use spec::ComputeSpec;
pub use template::{get_substitutions, substitute_arguments, substitute_string, MethodTemplate};

/// URL scheme used for compute pointers.
pub const URL_SCHEME: &str = "datalad-remake";
/// Dataset-relative directory that holds method templates.
pub const TEMPLATE_DIR: &str = ".datalad/make/methods";
/// Dataset-relative directory that holds content-addressed specifications.
pub const SPECIFICATION_DIR: &str = ".datalad/make/specifications";
/// Configuration key listing trusted signing key identifiers.
pub const TRUSTED_KEYS_CONFIG_KEY: &str = "datalad.make.trusted-keys";
/// Configuration key prefix enabling untrusted execution for one dataset id.
pub const ALLOW_UNTRUSTED_EXECUTION_KEY: &str = "datalad.make.allow-untrusted-execution.d-";
/// Configuration key listing label priorities.
pub const PRIORITY_CONFIG_KEY: &str = "datalad.make.priority";
/// Name of the special remote created automatically by registration.
pub const AUTO_REMOTE_NAME: &str = "datalad-remake-auto";

/// Errors raised while validating compute instruction data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    /// Path was absolute or otherwise unusable as a pattern.
    #[error("invalid pattern path {path:?}: {reason}")]
    InvalidPattern {
        /// Offending input.
        path: String,
        /// Reason for rejection.
        reason: &'static str,
    },
    /// Template parameters and supplied arguments disagree.
    #[error("template parameters and arguments have {0}")]
    ParameterMismatch(&'static str),
    /// Template document could not be parsed.
    #[error("malformed method template: {0}")]
    MalformedTemplate(String),
    /// Specification document could not be parsed or serialised.
    #[error("malformed compute specification: {0}")]
    MalformedSpecification(String),
    /// Pointer URL could not be decoded.
    #[error("malformed compute pointer {url:?}: {reason}")]
    MalformedPointer {
        /// Offending URL.
        url: String,
        /// Reason for rejection.
        reason: String,
    },
}
