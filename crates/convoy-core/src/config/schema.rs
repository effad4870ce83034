//! Configuration schema for convoy.toml
//!
//! Describes the host set, where manifests are staged locally, how
//! manifests are applied remotely, and the ordered manifest list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::manifest::{ManifestSet, owning_host};
use crate::remote::SshSettings;

/// Environment variable overriding `deploy.module_dir`.
pub const MODULE_DIR_ENV: &str = "CONVOY_MODULE_DIR";

/// Root configuration structure for convoy.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeployConfig {
    /// Local staging and distribution settings
    #[serde(default)]
    pub deploy: DeploySection,

    /// Remote manifest application settings
    #[serde(default)]
    pub apply: ApplySection,

    /// Remote-login settings
    #[serde(default)]
    pub ssh: SshSection,

    /// Target hosts, in distribution order
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Manifests, in application order
    #[serde(default)]
    pub manifests: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Local directory holding rendered manifests and fetched logs
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,

    /// Local directory containing the modules to distribute
    #[serde(default = "default_module_dir")]
    pub module_dir: PathBuf,

    /// Module names (subdirectories of `module_dir`) copied to every host.
    /// Empty copies the whole of `module_dir`.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Skip manifest application
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
            module_dir: default_module_dir(),
            modules: Vec::new(),
            dry_run: false,
        }
    }
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("/var/tmp/convoy/manifests")
}

fn default_module_dir() -> PathBuf {
    PathBuf::from("/usr/share/openstack-puppet/modules")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySection {
    /// Command applying a manifest on the host
    #[serde(default = "default_apply_command")]
    pub command: String,

    /// Pause after a poll finds a log not yet finished
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound on one drain cycle; 0 waits forever
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Run the apply command with --debug and log launch scripts
    #[serde(default)]
    pub debug: bool,

    /// Manifest suffixes that must not see the facts directory
    #[serde(default = "default_facts_excluded")]
    pub facts_excluded: Vec<String>,
}

impl Default for ApplySection {
    fn default() -> Self {
        Self {
            command: default_apply_command(),
            poll_interval_secs: default_poll_interval(),
            drain_timeout_secs: default_drain_timeout(),
            debug: false,
            facts_excluded: default_facts_excluded(),
        }
    }
}

impl ApplySection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        (self.drain_timeout_secs > 0).then(|| Duration::from_secs(self.drain_timeout_secs))
    }
}

fn default_apply_command() -> String {
    "puppet apply".to_string()
}

fn default_poll_interval() -> u64 {
    3
}

fn default_drain_timeout() -> u64 {
    3600
}

fn default_facts_excluded() -> Vec<String> {
    vec!["_horizon.pp".to_string(), "_nagios.pp".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSection {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// `-o` options passed to ssh and scp
    #[serde(default = "default_ssh_options")]
    pub options: Vec<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            options: default_ssh_options(),
        }
    }
}

impl From<&SshSection> for SshSettings {
    fn from(section: &SshSection) -> Self {
        SshSettings {
            user: section.user.clone(),
            options: section.options.clone(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_options() -> Vec<String> {
    SshSettings::default().options
}

/// A target host and its working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Address used for remote login; also the manifest file prefix
    pub address: String,

    /// Absolute working directory on the host
    pub workdir: String,

    /// Extra files copied to `<workdir>/resources/`
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

impl HostConfig {
    pub fn new(address: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            workdir: workdir.into(),
            resources: Vec::new(),
        }
    }

    pub fn manifests_dir(&self) -> String {
        format!("{}/manifests", self.workdir)
    }

    pub fn modules_dir(&self) -> String {
        format!("{}/modules", self.workdir)
    }

    pub fn resources_dir(&self) -> String {
        format!("{}/resources", self.workdir)
    }

    pub fn facts_dir(&self) -> String {
        format!("{}/facts", self.workdir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Local source file
    pub path: PathBuf,
    /// File name under the host's resources directory
    pub name: String,
}

/// A rendered manifest and its position in the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Owning host; resolved from the file name prefix when absent
    #[serde(default)]
    pub host: Option<String>,

    /// Full file name (`<host>_<name>`)
    #[serde(default)]
    pub file: Option<String>,

    /// Manifest name without the host prefix; requires `host`
    #[serde(default)]
    pub name: Option<String>,

    /// Synchronization marker
    #[serde(default)]
    pub marker: String,

    /// Rendered manifest content on the local machine
    pub source: PathBuf,
}

impl ManifestEntry {
    /// Resolve (owning host, manifest name without prefix).
    pub fn resolve<'a>(&self, hosts: &'a [HostConfig]) -> anyhow::Result<(&'a str, String)> {
        let addresses = move || hosts.iter().map(|h| h.address.as_str());

        match (&self.file, &self.name) {
            (Some(_), Some(_)) => {
                anyhow::bail!("Specify either 'file' or 'name', not both")
            }
            (None, None) => anyhow::bail!("Manifest needs a 'file' or a 'name'"),
            (None, Some(name)) => {
                let host = self
                    .host
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("Manifest '{}' needs a 'host'", name))?;
                let owner = addresses()
                    .find(|address| *address == host)
                    .ok_or_else(|| anyhow::anyhow!("Unknown host '{}' for manifest '{}'", host, name))?;
                Ok((owner, name.clone()))
            }
            (Some(file), None) => {
                let owner = match self.host.as_deref() {
                    Some(host) => addresses().find(|address| *address == host).ok_or_else(
                        || anyhow::anyhow!("Unknown host '{}' for manifest '{}'", host, file),
                    )?,
                    None => owning_host(file, addresses()).ok_or_else(|| {
                        anyhow::anyhow!("No configured host owns manifest '{}'", file)
                    })?,
                };
                let name = file
                    .strip_prefix(owner)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .filter(|rest| !rest.is_empty())
                    .ok_or_else(|| {
                        anyhow::anyhow!("Manifest '{}' is not prefixed with '{}_'", file, owner)
                    })?;
                Ok((owner, name.to_string()))
            }
        }
    }
}

impl DeployConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self, address: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.address == address)
    }

    pub fn host_addresses(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(|h| h.address.as_str())
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings::from(&self.ssh)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(MODULE_DIR_ENV).filter(|v| !v.is_empty()) {
            tracing::debug!(module_dir = %dir, "module directory overridden from environment");
            self.deploy.module_dir = PathBuf::from(dir);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hosts.is_empty() {
            anyhow::bail!("At least one [[hosts]] entry is required");
        }
        if self.apply.command.trim().is_empty() {
            anyhow::bail!("apply.command must not be empty");
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.address.trim().is_empty() {
                anyhow::bail!("Host address must not be empty");
            }
            if !seen.insert(host.address.as_str()) {
                anyhow::bail!("Duplicate host address: '{}'", host.address);
            }
            if !host.workdir.starts_with('/') {
                anyhow::bail!(
                    "Host '{}' workdir must be an absolute path, got '{}'",
                    host.address,
                    host.workdir
                );
            }
            for resource in &host.resources {
                if resource.name.is_empty() || resource.name.contains('/') {
                    anyhow::bail!(
                        "Invalid resource name '{}' for host '{}'",
                        resource.name,
                        host.address
                    );
                }
            }
        }

        for (index, entry) in self.manifests.iter().enumerate() {
            entry
                .resolve(&self.hosts)
                .with_context(|| format!("Invalid manifest entry #{}", index + 1))?;
        }

        Ok(())
    }

    /// Read every manifest source into an ordered set.
    ///
    /// Relative source paths are resolved against `base_dir`.
    pub fn build_manifest_set(&self, base_dir: &Path) -> anyhow::Result<ManifestSet> {
        let mut set = ManifestSet::new();
        for entry in &self.manifests {
            let (host, name) = entry.resolve(&self.hosts)?;
            let source = if entry.source.is_absolute() {
                entry.source.clone()
            } else {
                base_dir.join(&entry.source)
            };
            let content = std::fs::read_to_string(&source)
                .with_context(|| format!("Failed to read manifest source: {}", source.display()))?;
            set.append(host, &name, &content, entry.marker.as_str());
        }
        Ok(set)
    }
}
