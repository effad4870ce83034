//! Removal of manifests left behind by an earlier run.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Delete every `*pp` file directly inside `dir`.
///
/// A missing directory is not an error. Returns the removed paths.
pub fn remove_stale_manifests(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to read manifest directory: {}", dir.display()));
        }
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("pp"));
        if !is_manifest || !entry.file_type()?.is_file() {
            continue;
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove stale manifest: {}", path.display()))?;
        removed.push(path);
    }

    tracing::debug!(count = removed.len(), dir = %dir.display(), "removed stale manifests");
    Ok(removed)
}
