// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Normalised relative POSIX paths used for patterns and outputs.
// Author: Lukas Bower

//! Relative, forward-slash path type.
//!
//! Specifications, pointers and glob patterns are exchanged between hosts, so
//! they never carry host path conventions. A [`PatternPath`] is converted to a
//! host path only at the filesystem boundary via [`PatternPath::to_host_path`].

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::SpecError;

/// Normalised relative path with `/` separators.
///
/// The empty path denotes the current directory and renders as `.`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PatternPath {
    parts: Vec<String>,
}

impl PatternPath {
    /// Parse a path, rejecting absolute inputs and `..` segments.
    ///
    /// Backslashes are rewritten to `/` with a warning, repeated separators
    /// and `.` segments are dropped.
    pub fn new(path: &str) -> Result<Self, SpecError> {
        let normalised = if path.contains('\\') {
            warn!("pattern path {path:?} contains backslashes, treating them as '/'");
            path.replace('\\', "/")
        } else {
            path.to_owned()
        };
        if normalised.starts_with('/') {
            return Err(SpecError::InvalidPattern {
                path: path.to_owned(),
                reason: "absolute paths are not allowed",
            });
        }
        let parts: Vec<String> = normalised
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .map(str::to_owned)
            .collect();
        if parts.iter().any(|segment| segment == "..") {
            return Err(escapes_root(path));
        }
        Ok(Self { parts })
    }

    /// Build a path from several segments, each of which may contain `/`.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = Self::default();
        for segment in segments {
            path = path.join(&Self::new(segment.as_ref())?);
        }
        Ok(path)
    }

    /// Convert a relative host path, rejecting absolute, escaping or
    /// non-UTF-8 input.
    pub fn from_host_path(path: &Path) -> Result<Self, SpecError> {
        let display = path.display().to_string();
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| SpecError::InvalidPattern {
                        path: display.clone(),
                        reason: "path is not valid UTF-8",
                    })?;
                    parts.push(part.to_owned());
                }
                Component::CurDir => {}
                Component::ParentDir => return Err(escapes_root(&display)),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SpecError::InvalidPattern {
                        path: display,
                        reason: "absolute paths are not allowed",
                    })
                }
            }
        }
        Ok(Self { parts })
    }

    /// Path segments in order.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Final segment, if any.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.parts.last().map(String::as_str)
    }

    /// Append another relative path.
    #[must_use]
    pub fn join(&self, other: &PatternPath) -> PatternPath {
        let mut parts = self.parts.clone();
        parts.extend(other.parts.iter().cloned());
        Self { parts }
    }

    /// Append a single directory entry name without reinterpreting it.
    #[must_use]
    pub fn child(&self, name: &str) -> PatternPath {
        let mut parts = self.parts.clone();
        parts.push(name.to_owned());
        Self { parts }
    }

    /// Containing directory, or `None` for the empty path.
    #[must_use]
    pub fn parent(&self) -> Option<PatternPath> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    /// Proper, non-empty prefixes ordered from shortest to longest.
    #[must_use]
    pub fn prefixes(&self) -> Vec<PatternPath> {
        (1..self.parts.len())
            .map(|len| Self {
                parts: self.parts[..len].to_vec(),
            })
            .collect()
    }

    /// True when `base` is a (possibly equal) prefix of this path.
    #[must_use]
    pub fn starts_with(&self, base: &PatternPath) -> bool {
        self.parts.len() >= base.parts.len() && self.parts[..base.parts.len()] == base.parts[..]
    }

    /// Remainder of this path below `base`.
    #[must_use]
    pub fn relative_to(&self, base: &PatternPath) -> Option<PatternPath> {
        if !self.starts_with(base) {
            return None;
        }
        Some(Self {
            parts: self.parts[base.parts.len()..].to_vec(),
        })
    }

    /// Resolve against a host directory.
    #[must_use]
    pub fn to_host_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in &self.parts {
            path.push(part);
        }
        path
    }
}

fn escapes_root(path: &str) -> SpecError {
    SpecError::InvalidPattern {
        path: path.to_owned(),
        reason: "'..' segments are not allowed",
    }
}

impl fmt::Display for PatternPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            f.write_str(".")
        } else {
            f.write_str(&self.parts.join("/"))
        }
    }
}

impl FromStr for PatternPath {
    type Err = SpecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl TryFrom<String> for PatternPath {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PatternPath> for String {
    fn from(value: PatternPath) -> Self {
        value.to_string()
    }
}
