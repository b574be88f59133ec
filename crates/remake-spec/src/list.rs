// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Read pattern and parameter list files.
// Author: Lukas Bower

//! Line-oriented list files: one entry per line, `#` starts a comment line.

use std::fs;
use std::io;
use std::path::Path;

/// Read entries from `path`, trimming whitespace and skipping blank and
/// comment lines. `None` yields an empty list.
pub fn read_list(path: Option<&Path>) -> io::Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let text = fs::read_to_string(path)?;
    Ok(parse_list(&text))
}

/// Parse list entries from text.
#[must_use]
pub fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}
