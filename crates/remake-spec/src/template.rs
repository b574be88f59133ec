// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Parse method templates and substitute parameters into commands.
// Author: Lukas Bower

//! Method templates and parameter substitution.
//!
//! A template is a TOML document:
//!
//! ```toml
//! parameters = ["name", "file"]
//! command = ["echo", "Hello {name}", "> {file}"]
//! use_shell = "true"
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer};

use crate::SpecError;

/// Binding injected into every substitution map.
pub const ROOT_DIRECTORY_PARAMETER: &str = "root_directory";

/// Declarative description of a computation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MethodTemplate {
    /// Ordered parameter names.
    pub parameters: Vec<String>,
    /// Command vector containing `{name}` placeholders.
    pub command: Vec<String>,
    /// Join the command with spaces and run it through `sh -c`.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub use_shell: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ShellFlag {
    Bool(bool),
    Text(String),
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ShellFlag::deserialize(deserializer)? {
        ShellFlag::Bool(value) => value,
        ShellFlag::Text(value) => value.trim().eq_ignore_ascii_case("true"),
    })
}

impl MethodTemplate {
    /// Parse a template document.
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        let template: Self =
            toml::from_str(text).map_err(|err| SpecError::MalformedTemplate(err.to_string()))?;
        if template.command.is_empty() {
            return Err(SpecError::MalformedTemplate(
                "command must not be empty".to_owned(),
            ));
        }
        Ok(template)
    }

    /// Validate `arguments` and produce the final argument vector.
    pub fn render(
        &self,
        arguments: &BTreeMap<String, String>,
        root_directory: &str,
    ) -> Result<Vec<String>, SpecError> {
        let substitutions = get_substitutions(self, arguments, root_directory)?;
        substitute_arguments(self, &substitutions, "command")
    }

    fn list_field(&self, field: &str) -> Option<&[String]> {
        match field {
            "command" => Some(&self.command),
            "parameters" => Some(&self.parameters),
            _ => None,
        }
    }
}

/// Check that `arguments` binds exactly the template parameters and return
/// the substitution map, including `root_directory`.
pub fn get_substitutions(
    template: &MethodTemplate,
    arguments: &BTreeMap<String, String>,
    root_directory: &str,
) -> Result<BTreeMap<String, String>, SpecError> {
    if template.parameters.len() != arguments.len() {
        return Err(SpecError::ParameterMismatch("different lengths"));
    }
    if template
        .parameters
        .iter()
        .any(|name| !arguments.contains_key(name))
    {
        return Err(SpecError::ParameterMismatch("different names"));
    }
    let unique: BTreeSet<&String> = template.parameters.iter().collect();
    if unique.len() != template.parameters.len() {
        return Err(SpecError::ParameterMismatch("duplicate names"));
    }
    let mut substitutions = arguments.clone();
    substitutions.insert(
        ROOT_DIRECTORY_PARAMETER.to_owned(),
        root_directory.to_owned(),
    );
    Ok(substitutions)
}

/// Replace `{name}` for every name in `mapping`; other braces are kept.
///
/// Replacement is a single pass, values are never rescanned.
#[must_use]
pub fn substitute_string(text: &str, mapping: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open + 1..];
        let replaced = candidate.find('}').and_then(|close| {
            mapping
                .get(&candidate[..close])
                .map(|value| (value, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &candidate[close + 1..];
            }
            None => {
                out.push('{');
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Apply [`substitute_string`] to every element of a list field.
pub fn substitute_arguments(
    template: &MethodTemplate,
    mapping: &BTreeMap<String, String>,
    field: &str,
) -> Result<Vec<String>, SpecError> {
    let values = template
        .list_field(field)
        .ok_or_else(|| SpecError::MalformedTemplate(format!("unknown list field {field}")))?;
    Ok(values
        .iter()
        .map(|value| substitute_string(value, mapping))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    fn template(parameters: &[&str]) -> MethodTemplate {
        MethodTemplate {
            parameters: parameters.iter().map(|p| (*p).to_owned()).collect(),
            command: vec!["echo".to_owned(), "{name}".to_owned()],
            use_shell: false,
        }
    }

    #[test]
    fn substitutes_known_placeholders_only() {
        let mapping = args(&[("test", "string"), ("multiple", "2")]);
        assert_eq!(
            substitute_string("This is a {test} with {multiple} substitutions", &mapping),
            "This is a string with 2 substitutions"
        );
        assert_eq!(
            substitute_string("{unknown} and {test} and {", &mapping),
            "{unknown} and string and {"
        );
        assert_eq!(substitute_string("{{test}}", &mapping), "{string}");
    }

    #[test]
    fn values_are_not_rescanned() {
        let mapping = args(&[("a", "{b}"), ("b", "x")]);
        assert_eq!(substitute_string("{a}{b}", &mapping), "{b}x");
    }

    #[test]
    fn substitutions_require_exact_parameters() {
        let tpl = template(&["name", "file"]);
        let err = get_substitutions(&tpl, &args(&[("name", "a")]), "/r").unwrap_err();
        assert_eq!(err, SpecError::ParameterMismatch("different lengths"));
        let err =
            get_substitutions(&tpl, &args(&[("name", "a"), ("other", "b")]), "/r").unwrap_err();
        assert_eq!(err, SpecError::ParameterMismatch("different names"));
        let dup = template(&["name", "name"]);
        let err =
            get_substitutions(&dup, &args(&[("name", "a"), ("x", "b")]), "/r").unwrap_err();
        assert_eq!(err, SpecError::ParameterMismatch("duplicate names"));
    }

    #[test]
    fn root_directory_is_injected() {
        let tpl = template(&["name"]);
        let subs = get_substitutions(&tpl, &args(&[("name", "Robert")]), "/work").unwrap();
        assert_eq!(subs["root_directory"], "/work");
        assert_eq!(subs["name"], "Robert");
    }

    #[test]
    fn parses_and_renders_template() {
        let tpl = MethodTemplate::parse(
            r#"
parameters = ["name", "file"]
use_shell = "true"
command = ["echo", "Hello {name}", "> {file}"]
"#,
        )
        .unwrap();
        assert!(tpl.use_shell);
        let argv = tpl
            .render(&args(&[("name", "Robert"), ("file", "a.txt")]), "/w")
            .unwrap();
        assert_eq!(argv, ["echo", "Hello Robert", "> a.txt"]);
    }

    #[test]
    fn shell_flag_accepts_booleans_and_defaults_off() {
        let tpl = MethodTemplate::parse("parameters = []\ncommand = [\"true\"]\nuse_shell = true\n")
            .unwrap();
        assert!(tpl.use_shell);
        let tpl = MethodTemplate::parse("parameters = []\ncommand = [\"true\"]\n").unwrap();
        assert!(!tpl.use_shell);
        let tpl = MethodTemplate::parse(
            "parameters = []\ncommand = [\"true\"]\nuse_shell = \"false\"\n",
        )
        .unwrap();
        assert!(!tpl.use_shell);
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(matches!(
            MethodTemplate::parse("parameters = []\ncommand = []\n"),
            Err(SpecError::MalformedTemplate(_))
        ));
        assert!(MethodTemplate::parse("command = \"echo\"").is_err());
        let tpl = template(&[]);
        assert!(substitute_arguments(&tpl, &BTreeMap::new(), "nope").is_err());
    }
}
