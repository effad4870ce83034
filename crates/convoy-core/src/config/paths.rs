//! Config path resolution helpers.

use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "convoy.toml";

/// Pick the config file: the working directory wins over the user config dir.
pub fn default_config_path(cwd: &Path, global_dir: Option<&Path>) -> Option<PathBuf> {
    let local = cwd.join(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    global_dir
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}
