//! Remote command execution over a remote-login transport.
//!
//! This module provides the pieces every stage uses to touch a host:
//! - `Target`: where a script runs (a host address, or the local machine)
//! - `Transport`: the seam over the ssh/scp primitives
//! - `ScriptRunner`: queues shell commands and executes them as one session
//! - `SshTransport`: production transport built on the `ssh` and `scp` clients
//! - `MockTransport`: recording test double with scripted outcomes

pub mod mock;
mod runner;
mod ssh;

use std::fmt;
use std::path::Path;

pub use mock::{FetchOutcome, MockTransport, TransportEvent};
pub use runner::ScriptRunner;
pub use ssh::SshTransport;

/// Where a script is executed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// The machine running convoy.
    Local,
    /// A remote host, addressed by its configured identifier.
    Host(String),
}

impl Target {
    pub fn host(address: impl Into<String>) -> Self {
        Target::Host(address.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "localhost"),
            Target::Host(address) => write!(f, "{address}"),
        }
    }
}

/// Result of a successful script execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Process exit status (always 0 on success).
    pub status: i32,
    /// Captured stdout followed by stderr.
    pub output: String,
}

/// Why a remote execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The script ran and exited non-zero.
    Script,
    /// The transport could not reach the host.
    Network,
    /// The local client process could not be started.
    Spawn,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Script => write!(f, "script failed"),
            FailureKind::Network => write!(f, "connection failed"),
            FailureKind::Spawn => write!(f, "could not start transport"),
        }
    }
}

/// A remote (or local) script exited unsuccessfully.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Error running script on {target}: {kind} (exit code {}): {}", display_code(.exit_code), .output.trim())]
pub struct RemoteExecutionError {
    pub target: Target,
    pub kind: FailureKind,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl RemoteExecutionError {
    pub fn new(target: Target, kind: FailureKind, exit_code: Option<i32>, output: String) -> Self {
        Self {
            target,
            kind,
            exit_code,
            output,
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind == FailureKind::Network
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Transport primitives consumed by the stages.
///
/// Implementations establish a fresh connection per call; no pooling is
/// assumed by callers.
pub trait Transport {
    /// Run `script` as a single shell session on `target`.
    fn execute(&self, target: &Target, script: &str)
    -> Result<CommandOutput, RemoteExecutionError>;

    /// Copy one file from `host` to `local_path`.
    ///
    /// Fails when the remote file does not exist (yet).
    fn fetch(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RemoteExecutionError>;
}

/// Quote `value` for a POSIX shell when it contains special characters.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Remote-login settings shared by ssh and scp invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub user: String,
    pub options: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            options: vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
        }
    }
}

impl SshSettings {
    /// `user@host` login string.
    pub fn login(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    /// `-o` flags as separate argv entries.
    pub fn option_args(&self) -> Vec<String> {
        self.options
            .iter()
            .flat_map(|opt| ["-o".to_string(), opt.clone()])
            .collect()
    }

    /// `ssh -o ... user@host` for use inside shell pipelines.
    pub fn ssh_command(&self, host: &str) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.option_args());
        parts.push(self.login(host));
        parts.join(" ")
    }

    /// `scp -o ... <local> user@host:<remote>` for use inside shell scripts.
    pub fn scp_upload_command(&self, local: &str, host: &str, remote: &str) -> String {
        let mut parts = vec!["scp".to_string()];
        parts.extend(self.option_args());
        parts.push(local.to_string());
        parts.push(format!("{}:{}", self.login(host), remote));
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_command_disables_host_key_checking() {
        let settings = SshSettings::default();
        assert_eq!(
            settings.ssh_command("10.0.0.1"),
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null root@10.0.0.1"
        );
    }

    #[test]
    fn scp_upload_targets_remote_path() {
        let settings = SshSettings {
            user: "deploy".to_string(),
            options: vec!["BatchMode=yes".to_string()],
        };
        assert_eq!(
            settings.scp_upload_command("/tmp/a.pem", "node1", "/var/tmp/w/resources/a.pem"),
            "scp -o BatchMode=yes /tmp/a.pem deploy@node1:/var/tmp/w/resources/a.pem"
        );
    }

    #[test]
    fn shell_quote_leaves_plain_paths_alone() {
        assert_eq!(shell_quote("/var/tmp/convoy-1/manifests"), "/var/tmp/convoy-1/manifests");
        assert_eq!(shell_quote("my dir"), "'my dir'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn error_message_names_target_and_code() {
        let err = RemoteExecutionError::new(
            Target::host("node1"),
            FailureKind::Script,
            Some(2),
            "boom\n".to_string(),
        );
        let msg = err.to_string();
        assert!(msg.contains("node1"));
        assert!(msg.contains("exit code 2"));
        assert!(msg.ends_with("boom"));
    }
}
