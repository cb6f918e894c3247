use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::{Source, SourceFormat};
use crate::error::ConfigError;

/// Parse a sources file into a deduplicated list of source locators.
///
/// Supported formats per line:
/// - locator only: `https://example.com/sub.yaml`
/// - locator and format hint: `https://example.com/live.m3u m3u`
/// - comments: everything after a `#` that starts a word is ignored
/// - whitespace and blank lines are ignored
pub fn parse_sources_str(s: &str) -> Result<Vec<Source>, ConfigError> {
    let mut out: Vec<Source> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let locator = parts.next().unwrap_or_default();
        let format = match parts.next() {
            Some(hint) => hint.parse::<SourceFormat>().map_err(|reason| {
                ConfigError::SourcesLine {
                    line: line_no,
                    reason,
                }
            })?,
            None => SourceFormat::Auto,
        };
        if let Some(extra) = parts.next() {
            return Err(ConfigError::SourcesLine {
                line: line_no,
                reason: format!("unexpected trailing token: {extra}"),
            });
        }

        if seen.insert(locator.to_string()) {
            out.push(Source::new(locator, format));
        }
    }

    Ok(out)
}

/// Load a sources list from a file path.
pub fn load_sources_from_path(path: impl AsRef<Path>) -> Result<Vec<Source>, ConfigError> {
    let content =
        fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::SourcesFile {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
    parse_sources_str(&content)
}

// URLs may carry `#fragment`, so only a `#` at a word start opens a comment.
fn strip_comment(line: &str) -> &str {
    let mut prev_ws = true;
    for (i, c) in line.char_indices() {
        if c == '#' && prev_ws {
            return &line[..i];
        }
        prev_ws = c.is_whitespace();
    }
    line
}
