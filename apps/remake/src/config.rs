// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Layered configuration lookup for priorities and trust settings.
// Author: Lukas Bower

//! Layered configuration.
//!
//! A [`ConfigStack`] is built once per request and handed to every component
//! that needs configuration. Layers are consulted in [`ConfigScope`] order.
//! Trust settings ignore the dataset-branch layer, which is authored by
//! whoever published the dataset.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;

use log::debug;
use remake_spec::{
    ALLOW_UNTRUSTED_EXECUTION_KEY, PRIORITY_CONFIG_KEY, TRUSTED_KEYS_CONFIG_KEY,
};

use crate::error::Result;
use crate::git::{split_nul, Git};

/// Key holding the dataset identity in `.datalad/config`.
pub const DATASET_ID_KEY: &str = "datalad.dataset.id";
/// Dataset-relative location of the committed configuration file.
pub const BRANCH_CONFIG_FILE: &str = ".datalad/config";

/// Configuration layer, in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigScope {
    /// Values supplied by the caller for this request.
    Override,
    /// `GIT_CONFIG_PARAMETERS` and `GIT_CONFIG_COUNT` environment.
    Command,
    /// Repository `.git/config`.
    Local,
    /// User configuration.
    Global,
    /// Configuration committed in the dataset.
    Branch,
}

impl ConfigScope {
    /// Whether values from this layer may influence trust decisions.
    #[must_use]
    pub fn protected(self) -> bool {
        self != Self::Branch
    }
}

/// Values from one scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigLayer {
    /// Scope the values came from.
    pub scope: ConfigScope,
    /// Normalised key to value.
    pub values: BTreeMap<String, String>,
}

impl ConfigLayer {
    /// Build a layer, normalising keys.
    pub fn new<I, K, V>(scope: ConfigScope, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            scope,
            values: values
                .into_iter()
                .map(|(key, value)| (normalize_key(key.as_ref()), value.into()))
                .collect(),
        }
    }
}

/// Ordered set of configuration layers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigStack {
    layers: Vec<ConfigLayer>,
}

impl ConfigStack {
    /// Assemble a stack from explicit layers.
    #[must_use]
    pub fn from_layers(mut layers: Vec<ConfigLayer>) -> Self {
        layers.sort_by_key(|layer| layer.scope);
        Self { layers }
    }

    /// Load every layer for the dataset at `dataset`.
    pub fn load(dataset: &Path, overrides: &BTreeMap<String, String>) -> Result<Self> {
        let layers = vec![
            ConfigLayer::new(ConfigScope::Override, overrides.clone()),
            ConfigLayer::new(
                ConfigScope::Command,
                command_environment(|name| std::env::var(name).ok()),
            ),
            ConfigLayer::new(ConfigScope::Local, read_git_config(dataset, &["--local"])?),
            ConfigLayer::new(ConfigScope::Global, read_git_config(dataset, &["--global"])?),
            ConfigLayer::new(ConfigScope::Branch, read_branch_config(dataset)?),
        ];
        Ok(Self::from_layers(layers))
    }

    /// Highest-precedence value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lookup(key, false)
    }

    /// Highest-precedence value for `key` from protected layers.
    #[must_use]
    pub fn get_protected(&self, key: &str) -> Option<&str> {
        self.lookup(key, true)
    }

    fn lookup(&self, key: &str, protected_only: bool) -> Option<&str> {
        let key = normalize_key(key);
        self.layers
            .iter()
            .filter(|layer| !protected_only || layer.scope.protected())
            .find_map(|layer| {
                layer.values.get(&key).map(|value| {
                    debug!("config {key} from {:?}", layer.scope);
                    value.as_str()
                })
            })
    }

    /// Label priority list.
    #[must_use]
    pub fn priorities(&self) -> Vec<String> {
        split_list(self.get(PRIORITY_CONFIG_KEY))
    }

    /// Trusted signing key identifiers.
    #[must_use]
    pub fn trusted_keys(&self) -> Vec<String> {
        split_list(self.get_protected(TRUSTED_KEYS_CONFIG_KEY))
    }

    /// Dataset identity, if recorded.
    #[must_use]
    pub fn dataset_id(&self) -> Option<&str> {
        self.get(DATASET_ID_KEY)
    }

    /// Whether untrusted execution is enabled for `dataset_id`.
    #[must_use]
    pub fn allows_untrusted_execution(&self, dataset_id: &str) -> bool {
        self.get_protected(&format!("{ALLOW_UNTRUSTED_EXECUTION_KEY}{dataset_id}"))
            .is_some_and(parse_bool)
    }
}

/// Lowercase section and variable name; keep subsection case.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    let (Some(first), Some(last)) = (key.find('.'), key.rfind('.')) else {
        return key.to_ascii_lowercase();
    };
    format!(
        "{}{}{}",
        key[..first].to_ascii_lowercase(),
        &key[first..=last],
        key[last + 1..].to_ascii_lowercase()
    )
}

/// Interpret a git boolean.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Configuration injected through the process environment.
pub fn command_environment<F>(var: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut values = var("GIT_CONFIG_PARAMETERS")
        .map(|text| parse_config_parameters(&text))
        .unwrap_or_default();
    let count = var("GIT_CONFIG_COUNT")
        .and_then(|count| count.trim().parse::<usize>().ok())
        .unwrap_or(0);
    for index in 0..count {
        if let Some(key) = var(&format!("GIT_CONFIG_KEY_{index}")) {
            let value = var(&format!("GIT_CONFIG_VALUE_{index}")).unwrap_or_default();
            values.push((key, value));
        }
    }
    values
}

/// Parse the single-quoted `GIT_CONFIG_PARAMETERS` format.
#[must_use]
pub fn parse_config_parameters(text: &str) -> Vec<(String, String)> {
    let mut values = Vec::new();
    let mut chars = text.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(token) = read_quoted(&mut chars) else {
            break;
        };
        if chars.next_if_eq(&'=').is_some() {
            values.push((token, read_quoted(&mut chars).unwrap_or_default()));
        } else if let Some((key, value)) = token.split_once('=') {
            values.push((key.to_owned(), value.to_owned()));
        } else {
            values.push((token, "true".to_owned()));
        }
    }
    values
}

fn read_quoted(chars: &mut Peekable<Chars<'_>>) -> Option<String> {
    chars.next_if_eq(&'\'')?;
    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c != '\'' {
            value.push(c);
            continue;
        }
        // `'\''` encodes a literal quote between two quoted runs.
        if chars.next_if_eq(&'\\').is_none() {
            break;
        }
        if let Some(escaped) = chars.next() {
            value.push(escaped);
        }
        if chars.next_if_eq(&'\'').is_none() {
            break;
        }
    }
    Some(value)
}

/// Parse `git config -z --list` output; later entries win.
#[must_use]
pub fn parse_config_list(text: &str) -> BTreeMap<String, String> {
    split_nul(text)
        .into_iter()
        .map(|record| match record.split_once('\n') {
            Some((key, value)) => (normalize_key(key), value.to_owned()),
            None => (normalize_key(record), "true".to_owned()),
        })
        .collect()
}

fn read_git_config(dataset: &Path, scope: &[&str]) -> Result<BTreeMap<String, String>> {
    let output = Git::new(dataset)
        .arg("config")
        .args(scope)
        .args(["-z", "--list"])
        .output()?;
    if !output.status.success() {
        return Ok(BTreeMap::new());
    }
    Ok(parse_config_list(&String::from_utf8_lossy(&output.stdout)))
}

fn read_branch_config(dataset: &Path) -> Result<BTreeMap<String, String>> {
    if !dataset.join(BRANCH_CONFIG_FILE).is_file() {
        return Ok(BTreeMap::new());
    }
    read_git_config(dataset, &["-f", BRANCH_CONFIG_FILE])
}
