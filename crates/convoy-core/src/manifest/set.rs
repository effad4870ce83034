//! Ordered collection of rendered manifests.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{ManifestUnit, Marker, manifest_file_name};

/// Consecutive manifests sharing one marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave<'a> {
    pub marker: &'a Marker,
    pub units: Vec<&'a ManifestUnit>,
}

/// Manifests in application order, with their rendered content.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    units: Vec<ManifestUnit>,
    content: HashMap<String, String>,
}

impl ManifestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `content` to manifest `name` for `host`.
    ///
    /// The first append of a file fixes its position in the sequence and its
    /// marker; later appends only extend the content.
    pub fn append(
        &mut self,
        host: &str,
        name: &str,
        content: &str,
        marker: impl Into<Marker>,
    ) -> &ManifestUnit {
        let file_name = manifest_file_name(host, name);
        let data = self.content.entry(file_name.clone()).or_default();
        data.push('\n');
        data.push_str(content);

        let index = match self.units.iter().position(|u| u.file_name == file_name) {
            Some(index) => index,
            None => {
                self.units.push(ManifestUnit {
                    file_name,
                    host: host.to_string(),
                    marker: marker.into(),
                });
                self.units.len() - 1
            }
        };
        &self.units[index]
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[ManifestUnit] {
        &self.units
    }

    pub fn content(&self, file_name: &str) -> Option<&str> {
        self.content.get(file_name).map(String::as_str)
    }

    /// Ordered (manifest, marker) pairs.
    ///
    /// Each call starts a fresh pass over the sequence.
    pub fn sequence(&self) -> impl Iterator<Item = (&ManifestUnit, &Marker)> + '_ {
        self.units.iter().map(|unit| (unit, &unit.marker))
    }

    /// Group the sequence into waves at every marker change.
    pub fn waves(&self) -> Vec<Wave<'_>> {
        let mut waves: Vec<Wave<'_>> = Vec::new();
        for (unit, marker) in self.sequence() {
            match waves.last_mut() {
                Some(wave) if wave.marker == marker => wave.units.push(unit),
                _ => waves.push(Wave {
                    marker,
                    units: vec![unit],
                }),
            }
        }
        waves
    }

    /// Write every manifest into `dir`, readable only by the owner.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create manifest directory: {}", dir.display()))?;

        let mut written = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let path = dir.join(&unit.file_name);
            let data = self.content(&unit.file_name).unwrap_or_default();
            write_private(&path, data)
                .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
            written.push(path);
        }
        tracing::debug!(count = written.len(), dir = %dir.display(), "wrote manifests");
        Ok(written)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &str) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(data.as_bytes())
}
