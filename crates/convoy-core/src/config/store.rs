//! Config store for locating and loading convoy.toml.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{DeployConfig, parser, paths::default_config_path};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    /// Locate the config: `./convoy.toml` first, then the user config directory.
    pub fn discover() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("Could not determine current directory")?;
        let global_dir = dirs::config_dir().map(|dir| dir.join("convoy"));
        let config_path = default_config_path(&cwd, global_dir.as_deref())
            .ok_or_else(|| anyhow::anyhow!("No convoy.toml found in {} or the user config directory", cwd.display()))?;
        Ok(Self { config_path })
    }

    pub fn from_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory relative manifest sources are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Load, apply environment overrides, and validate.
    pub fn load(&self) -> anyhow::Result<DeployConfig> {
        if !self.config_path.exists() {
            anyhow::bail!("Config file not found: {}", self.config_path.display());
        }
        let mut config = parser::parse_convoy_toml(&self.config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, config: &DeployConfig) -> anyhow::Result<()> {
        let content = parser::to_toml(config).context("Failed to serialize config to TOML")?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&self.config_path, content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;
        Ok(())
    }
}
