// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode compute pointer URLs recorded against annex keys.
// Author: Lukas Bower

//! Compute pointer URLs.
//!
//! Wire format:
//! `datalad-remake:///?label=<l>&root_version=<commit>&specification=<id>&this=<path>`
//! with every value percent-encoded.

use std::borrow::Cow;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{PatternPath, SpecError, URL_SCHEME};

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Decoded compute pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputePointer {
    /// Label used for priority selection.
    pub label: String,
    /// Commit containing the specification.
    pub root_version: String,
    /// Specification id (file name under the specification directory).
    pub specification: String,
    /// Output path this pointer produces.
    pub this: PatternPath,
}

impl ComputePointer {
    /// Pointer base shared by all outputs of one registration.
    #[must_use]
    pub fn base_url(label: &str, root_version: &str, specification: &str) -> String {
        format!(
            "{URL_SCHEME}:///?label={}&root_version={}&specification={}",
            quote(label),
            quote(root_version),
            quote(specification)
        )
    }

    /// Full pointer for a base and one output path.
    #[must_use]
    pub fn with_target(base_url: &str, this: &PatternPath) -> String {
        format!("{base_url}&this={}", quote(&this.to_string()))
    }

    /// Encode this pointer.
    #[must_use]
    pub fn encode(&self) -> String {
        Self::with_target(
            &Self::base_url(&self.label, &self.root_version, &self.specification),
            &self.this,
        )
    }

    /// Decode a pointer URL.
    pub fn decode(url: &str) -> Result<Self, SpecError> {
        let malformed = |reason: &str| SpecError::MalformedPointer {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };
        let rest = url
            .strip_prefix(URL_SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| malformed("unexpected scheme"))?;
        let (_, query) = rest
            .split_once('?')
            .ok_or_else(|| malformed("missing query"))?;

        let mut label = None;
        let mut root_version = None;
        let mut specification = None;
        let mut this = None;
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = unquote(value).map_err(|_| malformed("value is not UTF-8"))?;
            let slot = match key {
                "label" => &mut label,
                "root_version" => &mut root_version,
                "specification" => &mut specification,
                "this" => &mut this,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }

        let this = this.ok_or_else(|| malformed("missing this"))?;
        Ok(Self {
            label: label.ok_or_else(|| malformed("missing label"))?,
            root_version: root_version.ok_or_else(|| malformed("missing root_version"))?,
            specification: specification.ok_or_else(|| malformed("missing specification"))?,
            this: PatternPath::new(&this).map_err(|err| malformed(&err.to_string()))?,
        })
    }
}

/// True for URLs (or URL keys) handled by the compute remote.
#[must_use]
pub fn claims_url(url: &str) -> bool {
    let bare = url.strip_prefix("URL--").unwrap_or(url);
    bare.strip_prefix(URL_SCHEME)
        .is_some_and(|rest| rest.starts_with(':'))
}

fn quote(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

fn unquote(value: &str) -> Result<Cow<'_, str>, std::str::Utf8Error> {
    percent_decode_str(value).decode_utf8()
}
