//! Rendered manifests and their marker ordering.
//!
//! A manifest is a file named `<host>_<name>` owned by exactly one host.
//! Each manifest carries a marker; consecutive manifests sharing a marker
//! form a wave that may apply concurrently, and a marker change is a
//! synchronization barrier between waves.

mod set;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use set::{ManifestSet, Wave};

/// Opaque batch identifier grouping manifests into waves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Marker(String);

impl Marker {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Marker {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Marker {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One manifest file and the host that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestUnit {
    /// File name, `<host>_<name>`.
    pub file_name: String,
    /// Owning host address.
    pub host: String,
    /// Synchronization marker.
    pub marker: Marker,
}

impl ManifestUnit {
    /// Whether the manifest file name ends with any of `suffixes`.
    pub fn has_suffix(&self, suffixes: &[String]) -> bool {
        suffixes
            .iter()
            .any(|suffix| self.file_name.ends_with(suffix.as_str()))
    }
}

/// File name for manifest `name` targeted at `host`.
pub fn manifest_file_name(host: &str, name: &str) -> String {
    format!("{host}_{name}")
}

/// Resolve which host a manifest file belongs to.
///
/// The owner is the host whose `<host>_` token prefixes the file name. When
/// several addresses qualify (one address is a prefix of another, e.g.
/// `node1` and `node10`) the longest match wins.
pub fn owning_host<'a, I>(file_name: &str, hosts: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    hosts
        .into_iter()
        .filter(|host| {
            file_name
                .strip_prefix(host)
                .is_some_and(|rest| rest.starts_with('_') && rest.len() > 1)
        })
        .max_by_key(|host| host.len())
}
