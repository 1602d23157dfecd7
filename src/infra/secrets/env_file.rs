//! Conservative `.env` scrubbing after a migration.
//!
//! Removes a `KEY=VALUE` line only when the key is on the caller's
//! known-secret allow-list and the parsed value is exactly one of the
//! plaintext values that were migrated into the encrypted payload. Partial
//! or derived matches never remove a line.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static ENV_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*)$").unwrap()
});

/// Result of one scrub pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvScrubResult {
    pub contents: String,
    pub removed: usize,
}

/// Scrub `raw` env-file contents.
///
/// Lines are preserved verbatim (comments, blanks, quoting, `\r` line
/// endings) unless they are dropped outright. A trailing newline is kept
/// when the original had one; a result with no surviving lines is a single
/// newline.
pub fn scrub_env_contents(
    raw: &str,
    migrated_values: &HashSet<String>,
    allow_list: &[&str],
) -> EnvScrubResult {
    let had_trailing_newline = raw.ends_with('\n');
    let mut kept: Vec<&str> = Vec::new();
    let mut removed = 0;

    for segment in raw.split_inclusive('\n') {
        let line = segment.strip_suffix('\n').unwrap_or(segment);
        if should_remove_line(line, migrated_values, allow_list) {
            removed += 1;
        } else {
            kept.push(line);
        }
    }

    if removed == 0 {
        return EnvScrubResult {
            contents: raw.to_string(),
            removed: 0,
        };
    }

    if kept.iter().all(|line| line.is_empty()) && kept.len() <= 1 {
        return EnvScrubResult {
            contents: "\n".to_string(),
            removed,
        };
    }

    let mut contents = kept.join("\n");
    if had_trailing_newline {
        contents.push('\n');
    }
    EnvScrubResult { contents, removed }
}

fn should_remove_line(
    line: &str,
    migrated_values: &HashSet<String>,
    allow_list: &[&str],
) -> bool {
    let matchable = line.strip_suffix('\r').unwrap_or(line);
    let Some(caps) = ENV_LINE_RE.captures(matchable) else {
        return false;
    };
    let key = &caps[2];
    if !allow_list.contains(&key) {
        return false;
    }
    let value = parse_env_value(&caps[3]);
    migrated_values.contains(value)
}

/// Strip one matched pair of surrounding single or double quotes, trimming
/// whitespace around the raw value first.
fn parse_env_value(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 {
        let bytes = trimmed.as_bytes();
        let first = bytes[0];
        let last = bytes[trimmed.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}
