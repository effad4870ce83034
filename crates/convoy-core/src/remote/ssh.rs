//! Transport backed by the system `ssh` and `scp` clients.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use super::{CommandOutput, FailureKind, RemoteExecutionError, SshSettings, Target, Transport};

/// Exit status the ssh client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Pipes scripts into `bash -x`, remotely over ssh or on the local machine.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    settings: SshSettings,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn shell_command(&self, target: &Target) -> Command {
        match target {
            Target::Local => {
                let mut cmd = Command::new("bash");
                cmd.arg("-x");
                cmd
            }
            Target::Host(address) => {
                let mut cmd = Command::new("ssh");
                cmd.args(self.settings.option_args())
                    .arg(self.settings.login(address))
                    .arg("bash -x");
                cmd
            }
        }
    }
}

impl Transport for SshTransport {
    fn execute(
        &self,
        target: &Target,
        script: &str,
    ) -> Result<CommandOutput, RemoteExecutionError> {
        let mut child = self
            .shell_command(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(target, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| spawn_error(target, e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| spawn_error(target, e))?;
        check_output(target, output)
    }

    fn fetch(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RemoteExecutionError> {
        let target = Target::host(host);
        let output = Command::new("scp")
            .args(self.settings.option_args())
            .arg(format!("{}:{}", self.settings.login(host), remote_path))
            .arg(local_path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(&target, e))?;
        check_output(&target, output).map(|_| ())
    }
}

fn check_output(target: &Target, output: Output) -> Result<CommandOutput, RemoteExecutionError> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{stdout}{stderr}");

    match output.status.code() {
        Some(0) => Ok(CommandOutput {
            status: 0,
            output: combined,
        }),
        code => {
            let kind = classify_failure(target, code, &stderr);
            Err(RemoteExecutionError::new(
                target.clone(),
                kind,
                code,
                combined,
            ))
        }
    }
}

/// Distinguish an unreachable host from a script that ran and failed.
fn classify_failure(target: &Target, code: Option<i32>, stderr: &str) -> FailureKind {
    let ssh_complaint = stderr
        .lines()
        .any(|line| line.trim_start().starts_with("ssh:"));
    if ssh_complaint || (!target.is_local() && code == Some(SSH_CLIENT_FAILURE)) {
        FailureKind::Network
    } else {
        FailureKind::Script
    }
}

fn spawn_error(target: &Target, err: std::io::Error) -> RemoteExecutionError {
    RemoteExecutionError::new(target.clone(), FailureKind::Spawn, None, err.to_string())
}
