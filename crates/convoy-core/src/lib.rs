//! Convoy Core Library
//!
//! Staged multi-host deployment: manifests and modules are pushed to every
//! host, applied asynchronously on the hosts in marker-ordered waves, and
//! polled until every host converges.

pub mod config;
pub mod context;
pub mod deploy;
pub mod logscan;
pub mod manifest;
pub mod progress;
pub mod remote;
pub mod report;
pub mod stages;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{ConfigStore, DeployConfig, HostConfig, ManifestEntry};

    // Run state
    pub use crate::context::{HostStatus, RunContext};
    pub use crate::deploy::Deployment;
    pub use crate::report::RunReport;

    // Manifests
    pub use crate::manifest::{ManifestSet, ManifestUnit, Marker};

    // Remote execution
    pub use crate::remote::{
        CommandOutput, FailureKind, RemoteExecutionError, ScriptRunner, SshTransport, Target,
        Transport,
    };

    // Presentation hooks
    pub use crate::progress::{ManifestOutcome, NullReporter, Reporter};
}
