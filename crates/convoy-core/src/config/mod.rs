//! Deployment configuration
//!
//! A single `convoy.toml` describes the host set, local staging
//! directories, remote apply settings and the ordered manifest list.

pub mod parser;
pub mod paths;
pub mod schema;
pub mod store;

pub use parser::{parse_convoy_toml, parse_convoy_toml_str, to_toml};
pub use paths::{CONFIG_FILE_NAME, default_config_path};
pub use schema::{
    ApplySection, DeployConfig, DeploySection, HostConfig, MODULE_DIR_ENV, ManifestEntry,
    ResourceEntry, SshSection,
};
pub use store::ConfigStore;
