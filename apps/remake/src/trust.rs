// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Verify commit signatures of specification and template files.
// Author: Lukas Bower

//! Signature verification.
//!
//! A file is trusted when the latest commit that touched it carries a valid
//! signature from one of the configured key identifiers.

use std::path::Path;

use log::{debug, info};
use remake_spec::TRUSTED_KEYS_CONFIG_KEY;

use crate::error::{RemakeError, Result};
use crate::git::Git;

/// Checks that a repository file was committed by a trusted signer.
pub trait SignatureVerifier {
    /// Verify `file` (relative to `repository`) as of `revision` (default
    /// `HEAD`) against `trusted_keys`.
    fn verify(
        &self,
        repository: &Path,
        revision: Option<&str>,
        file: &Path,
        trusted_keys: &[String],
    ) -> Result<()>;
}

const LONG_KEY_ID_LEN: usize = 16;
const FINGERPRINT_LEN: usize = 40;

/// Verifier backed by `git verify-commit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitSignatureVerifier;

impl SignatureVerifier for GitSignatureVerifier {
    fn verify(
        &self,
        repository: &Path,
        revision: Option<&str>,
        file: &Path,
        trusted_keys: &[String],
    ) -> Result<()> {
        if trusted_keys.is_empty() {
            return Err(RemakeError::NoTrustedKeys {
                key: TRUSTED_KEYS_CONFIG_KEY,
                path: file.to_path_buf(),
            });
        }
        let untrusted = |reason: String| RemakeError::Untrusted {
            path: file.to_path_buf(),
            reason,
        };

        let commit = Git::new(repository)
            .args(["log", "-1", "--follow", "--pretty=%H"])
            .arg(revision.unwrap_or("HEAD"))
            .arg("--")
            .arg(file)
            .oneline()
            .map_err(|err| untrusted(err.to_string()))?;
        if commit.is_empty() {
            return Err(untrusted("no commit records this file".to_owned()));
        }

        let output = Git::new(repository)
            .args(["verify-commit", "--raw", commit.as_str()])
            .output()?;
        let status = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(untrusted(format!(
                "commit {commit} has no valid signature: {}",
                status.trim()
            )));
        }

        let signers = signer_ids(&status);
        debug!("commit {commit} signed by {signers:?}");
        match signers
            .iter()
            .find(|signer| trusted_keys.iter().any(|key| key_matches(key, signer)))
        {
            Some(signer) => {
                info!("{} verified: commit {commit} signed by {signer}", file.display());
                Ok(())
            }
            None => Err(untrusted(format!(
                "commit {commit} is signed by {}, which is not a trusted key",
                signers.join(", ")
            ))),
        }
    }
}

/// Key ids and fingerprints reported as valid in GnuPG status output.
#[must_use]
pub fn signer_ids(status: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for line in status.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("[GNUPG:]") {
            continue;
        }
        match fields.next() {
            Some("GOODSIG") => ids.extend(fields.next().map(str::to_owned)),
            Some("VALIDSIG") => {
                let fields: Vec<&str> = fields.collect();
                ids.extend(fields.first().map(|fpr| (*fpr).to_owned()));
                // Primary key fingerprint is the tenth field when present.
                ids.extend(fields.get(9).map(|fpr| (*fpr).to_owned()));
            }
            _ => {}
        }
    }
    ids.dedup();
    ids
}

/// A configured key matches when it names the signer's 16-digit long key id
/// or its full 40-digit fingerprint. Shorter ids never match.
#[must_use]
pub fn key_matches(configured: &str, signer: &str) -> bool {
    let configured = normalize_key_id(configured);
    if !matches!(configured.len(), LONG_KEY_ID_LEN | FINGERPRINT_LEN)
        || !configured.bytes().all(|byte| byte.is_ascii_hexdigit())
    {
        debug!("ignoring trusted key {configured:?}, expected a long key id or fingerprint");
        return false;
    }
    configured == normalize_key_id(signer)
}

fn normalize_key_id(id: &str) -> String {
    let id = id.trim();
    let id = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    id.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
