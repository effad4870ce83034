//! Scanning and validation of fetched apply logs.
//!
//! `scan_logfile` extracts operator notices the manifests emit on purpose;
//! `validate_logfile` fails on the first line carrying an error marker that
//! is not on the ignore list, rewriting well-known messages into something
//! an operator can act on.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;

/// Lines that mark a failed apply.
static ERROR_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"err:|Syntax error at|^Duplicate definition:|^Invalid tag|",
        r"^No matching value for selector param|^Parameter name failed:|Error:|",
        r"^Invalid parameter|^Duplicate declaration:|^Could not find resource|",
        r"^Could not parse for|^/usr/bin/puppet:\d+: .+|.+\(LoadError\)|",
        r"^Could not autoload|^/usr/bin/env: jruby: No such file or directory|",
        r"failed to execute puppet"
    ))
    .expect("error marker pattern is valid")
});

/// Notices emitted through the `convoy_info` notify resource.
static NOTICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Notify\[convoy_info\]/message: defined 'message' as '(?P<message>.*)'")
        .expect("notice pattern is valid")
});

/// Error lines known to be harmless.
static IGNORED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // the volume group already exists from an earlier run
        r"Execution of '/usr/sbin/vgcreate cinder-volumes .*' returned 5",
        // sysctl keys for modules that are not loaded yet
        r"Sysctl::Value\[net\.bridge\.bridge-nf-call-ip6?tables\]",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("ignore pattern is valid"))
    .collect()
});

/// Known error lines rewritten into an operator-facing explanation.
static SURROGATES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"Sysctl::Value\[.*\]/Sysctl\[(?P<arg1>.*)\].*Field 'val' is required",
            "Cannot change value of $arg1 in /etc/sysctl.conf",
        ),
        (
            r"Package\[(?P<arg1>.*)\]/ensure: change from absent to present failed",
            "Package $arg1 could not be installed; check the configured repositories",
        ),
        (
            r"Could not retrieve catalog from remote server",
            "The manifest could not be compiled on the host",
        ),
    ]
    .iter()
    .map(|(pattern, text)| (Regex::new(pattern).expect("surrogate pattern is valid"), *text))
    .collect()
});

/// An apply log contained an error marker.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Error appeared during the apply run: {message}\nYou will find the full trace in log {}", .log_path.display())]
pub struct LogValidationError {
    pub message: String,
    pub log_path: PathBuf,
    /// 1-based line number of the offending line.
    pub line: usize,
}

/// Collect operator notices from the log at `path`.
pub fn scan_logfile(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = read_log(path)?;
    Ok(scan_log(&content))
}

pub fn scan_log(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| NOTICE.captures(line))
        .filter_map(|caps| caps.name("message").map(|m| m.as_str().to_string()))
        .collect()
}

/// Fail if the log at `path` shows the apply went wrong.
///
/// Read errors are reported through the outer `anyhow::Error`; a failed
/// validation carries a [`LogValidationError`].
pub fn validate_logfile(path: &Path) -> anyhow::Result<()> {
    let content = read_log(path)?;
    validate_log(&content, path)?;
    Ok(())
}

pub fn validate_log(content: &str, log_path: &Path) -> Result<(), LogValidationError> {
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if !ERROR_MARKERS.is_match(line) {
            continue;
        }
        if IGNORED.iter().any(|re| re.is_match(line)) {
            tracing::debug!(line = index + 1, "ignoring known harmless error: {}", line);
            continue;
        }
        return Err(LogValidationError {
            message: surrogate_message(line),
            log_path: log_path.to_path_buf(),
            line: index + 1,
        });
    }
    Ok(())
}

fn surrogate_message(line: &str) -> String {
    let mut message = line.to_string();
    for (re, template) in SURROGATES.iter() {
        if let Some(caps) = re.captures(line) {
            let mut expanded = String::new();
            caps.expand(template, &mut expanded);
            message = expanded;
        }
    }
    message
}

/// Read a log, replacing invalid UTF-8.
pub fn read_log(path: &Path) -> anyhow::Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read log: {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
