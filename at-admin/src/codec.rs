// Flat configuration file dialects

//! Readers and writers for the device's flat configuration files
//!
//! Three dialects are in use and each has its own parser, since their
//! quoting rules differ:
//!
//! - quoted (`KEY="value"`, comma-separated lists) for at-admin's settings
//! - shell (`KEY=value`, `'a b'` lists, `#! /bin/sh` header) for the bridge
//! - tagged (`PREFIX:value`, `PREFIX-SUBKEY:value`) for the firewall store
//!
//! All three skip lines starting with `#` or a space. Files are always
//! regenerated whole; [`publish`] puts them in place with a privileged copy.

use crate::exec::{self, CommandRunner, CP};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Multi-value fields keep at most this many values
pub const MAX_VALUES_PER_ROW: usize = 10;

/// Header written at the top of shell-dialect files
pub const SHELL_HEADER: &str = "#! /bin/sh\n\n";

fn is_data_line(line: &str) -> bool {
    !line.starts_with('#') && !line.starts_with(' ')
}

/// Read a config file, mapping a missing file to `None`
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write `content` to a private temp file, copy it over `target` with the
/// privilege helper, then drop the temp file
///
/// The target is never opened for writing, so an interrupted publish leaves
/// the previous file intact.
pub async fn publish(
    runner: &dyn CommandRunner,
    work_dir: &Path,
    target: &Path,
    content: &str,
) -> Result<()> {
    fs::create_dir_all(work_dir).context("Failed to create work directory")?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp = work_dir.join(format!(".{}.{}.tmp", name, std::process::id()));

    fs::write(&tmp, content).context("Failed to write temp file")?;

    let tmp_str = tmp.to_string_lossy().into_owned();
    let target_str = target.to_string_lossy().into_owned();
    let result = exec::sudo(runner, &[CP, tmp_str.as_str(), target_str.as_str()]).await;

    if let Err(e) = fs::remove_file(&tmp) {
        log::debug!("Failed to remove temp file {}: {}", tmp.display(), e);
    }

    result.with_context(|| format!("Failed to update {}", target.display()))?;
    log::debug!("Published {}", target.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Quoted dialect
// ---------------------------------------------------------------------------

/// Ordered `KEY="value"` document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotedDocument {
    entries: Vec<(String, String)>,
}

impl QuotedDocument {
    /// Parse `KEY="value"` lines, skipping comments and malformed lines
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();

        for line in text.lines().filter(|l| is_data_line(l)) {
            let Some((key, rest)) = line.split_once("=\"") else {
                log::debug!("Skipping malformed line: {:?}", line);
                continue;
            };
            // An unterminated value runs to the end of the line
            let value = rest.split_once('"').map_or(rest, |(v, _)| v);
            doc.set(key, value);
        }

        doc
    }

    /// Value of `key` with the quotes removed
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Values of a comma-separated field, see [`split_values`]
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(split_values)
    }

    /// Replace the value of `key`, or append it
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    /// Store a multi-value field joined with `, `
    pub fn set_list(&mut self, key: &str, values: &[String]) {
        self.set(key, &values.join(", "));
    }

    /// One `KEY="value"` line per entry followed by a blank line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(&format!("{}=\"{}\"\n", key, value));
        }
        out.push('\n');
        out
    }
}

/// Split `a, b,  c` into values
///
/// Spaces following a comma are dropped. Values past
/// [`MAX_VALUES_PER_ROW`] are discarded without error.
pub fn split_values(row: &str) -> Vec<String> {
    if row.is_empty() {
        return Vec::new();
    }

    let values: Vec<String> = row
        .split(',')
        .enumerate()
        .map(|(i, v)| {
            if i == 0 {
                v.to_string()
            } else {
                v.trim_start_matches(' ').to_string()
            }
        })
        .collect();

    if values.len() > MAX_VALUES_PER_ROW {
        log::warn!(
            "Row has {} values, keeping the first {}",
            values.len(),
            MAX_VALUES_PER_ROW
        );
    }

    values.into_iter().take(MAX_VALUES_PER_ROW).collect()
}

// ---------------------------------------------------------------------------
// Shell dialect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellLine {
    Assign(String, String),
    Blank,
}

/// Ordered `KEY=value` document sourced by shell scripts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellDocument {
    lines: Vec<ShellLine>,
}

impl ShellDocument {
    /// Parse `KEY=value` lines, keeping blank lines for rendering
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();

        for line in text.lines().filter(|l| is_data_line(l)) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            doc.set(key, value);
        }

        doc
    }

    /// All assignments in file order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|l| match l {
            ShellLine::Assign(k, v) => Some((k.as_str(), v.as_str())),
            ShellLine::Blank => None,
        })
    }

    /// Raw value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Flag stored as `0`/`1`; anything that is not a non-zero number is false
    pub fn get_flag(&self, key: &str) -> bool {
        self.get(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .is_some_and(|n| n != 0)
    }

    /// Words of a `'a b c'` value
    pub fn get_words(&self, key: &str) -> Vec<String> {
        self.get(key).map(split_words).unwrap_or_default()
    }

    /// Replace the value of `key`, or append it
    pub fn set(&mut self, key: &str, value: &str) {
        for line in &mut self.lines {
            if let ShellLine::Assign(k, v) = line {
                if k == key {
                    *v = value.to_string();
                    return;
                }
            }
        }
        self.lines
            .push(ShellLine::Assign(key.to_string(), value.to_string()));
    }

    /// Store a boolean as `1` or `0`
    pub fn set_flag(&mut self, key: &str, on: bool) {
        self.set(key, if on { "1" } else { "0" });
    }

    /// Store a space-separated list in single quotes
    pub fn set_words(&mut self, key: &str, words: &[String]) {
        self.set(key, &format!("'{}'", words.join(" ")));
    }

    /// Blank separator line, only meaningful when rendering
    pub fn push_blank(&mut self) {
        self.lines.push(ShellLine::Blank);
    }

    /// Render under the `#! /bin/sh` header
    pub fn render(&self) -> String {
        let mut out = String::from(SHELL_HEADER);
        for line in &self.lines {
            match line {
                ShellLine::Assign(k, v) => out.push_str(&format!("{}={}\n", k, v)),
                ShellLine::Blank => out.push('\n'),
            }
        }
        out
    }
}

/// Split a single-quoted, space-separated list
fn split_words(value: &str) -> Vec<String> {
    let inner = match (value.find('\''), value.rfind('\'')) {
        (Some(start), Some(end)) if end > start => &value[start + 1..end],
        (Some(start), _) => &value[start + 1..],
        _ => value,
    };
    inner.split_whitespace().map(str::to_string).collect()
}

// ---------------------------------------------------------------------------
// Tagged-line dialect
// ---------------------------------------------------------------------------

/// Data lines of a tagged document
pub fn tagged_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter(|l| is_data_line(l))
}

/// Value of a `PREFIX:value` line
pub fn tagged_value<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.strip_prefix(':')
}

/// Subkey and value of a `PREFIX-SUBKEY:value` line
pub fn tagged_pair<'a>(line: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    line.strip_prefix(prefix)?.strip_prefix('-')?.split_once(':')
}

/// Parse `<flag,value><flag,value>...`
///
/// Parsing stops at the first token that is not well formed; the pairs read
/// up to that point are kept.
pub fn parse_pairs(mut text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    while let Some(rest) = text.strip_prefix('<') {
        let Some((flag, rest)) = rest.split_once(',') else {
            break;
        };
        let Some((value, rest)) = rest.split_once('>') else {
            break;
        };
        pairs.push((flag.to_string(), value.to_string()));
        text = rest;
    }

    pairs
}

/// Render `(flag, value)` pairs as `<flag,value>` tokens
pub fn render_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(flag, value)| format!("<{},{}>", flag, value))
        .collect()
}
