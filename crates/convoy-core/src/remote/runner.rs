//! Queue of shell commands executed as one session on a target.

use super::{CommandOutput, RemoteExecutionError, Target, Transport};

/// Prelude that aborts the session on the first failing command.
const ERR_TRAP: &str = "function t(){ exit $? ; }\ntrap t ERR";

/// Accumulates commands for a single target and runs them together.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    target: Target,
    commands: Vec<String>,
}

impl ScriptRunner {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            commands: Vec::new(),
        }
    }

    /// Runner for the machine convoy runs on.
    pub fn local() -> Self {
        Self::new(Target::Local)
    }

    /// Runner for a remote host.
    pub fn host(address: impl Into<String>) -> Self {
        Self::new(Target::host(address))
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queue a command.
    pub fn append(&mut self, command: impl Into<String>) -> &mut Self {
        self.commands.push(command.into());
        self
    }

    /// Drop queued commands without running them.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Full script text sent to the shell, including the error trap.
    pub fn script(&self) -> String {
        let mut script = String::from(ERR_TRAP);
        for command in &self.commands {
            script.push('\n');
            script.push_str(command);
        }
        script.push('\n');
        script
    }

    /// Execute all queued commands as one session.
    ///
    /// When `log` is set the script text and output are recorded at debug
    /// level. The queue is cleared afterwards, whether or not the script
    /// succeeded.
    pub fn execute(
        &mut self,
        transport: &dyn Transport,
        log: bool,
    ) -> Result<CommandOutput, RemoteExecutionError> {
        let script = self.script();
        if log {
            tracing::debug!(host = %self.target, "executing script:\n{}", script);
        }

        let result = transport.execute(&self.target, &script);
        self.commands.clear();

        match result {
            Ok(output) => {
                if log {
                    tracing::debug!(host = %self.target, "output:\n{}", output.output);
                }
                Ok(output)
            }
            Err(err) => {
                if log {
                    tracing::error!(host = %self.target, "script failed:\n{}", err.output);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{FailureKind, MockTransport, TransportEvent};

    #[test]
    fn script_starts_with_err_trap() {
        let mut runner = ScriptRunner::host("node1");
        runner.append("echo one").append("echo two");
        let script = runner.script();
        assert!(script.starts_with("function t(){ exit $? ; }\ntrap t ERR\n"));
        assert!(script.ends_with("echo one\necho two\n"));
    }

    #[test]
    fn execute_runs_single_session_and_clears_queue() {
        let transport = MockTransport::new();
        let mut runner = ScriptRunner::host("node1");
        runner.append("mkdir -p /tmp/a").append("touch /tmp/a/b");

        let output = runner.execute(&transport, false).unwrap();
        assert_eq!(output.status, 0);
        assert!(runner.is_empty());

        let events = transport.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TransportEvent::Execute { target, script } => {
                assert_eq!(target, &Target::host("node1"));
                assert!(script.contains("mkdir -p /tmp/a\ntouch /tmp/a/b"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn clear_discards_without_executing() {
        let transport = MockTransport::new();
        let mut runner = ScriptRunner::local();
        runner.append("rm -rf /");
        runner.clear();
        assert!(runner.is_empty());
        assert!(transport.events().is_empty());
    }

    #[test]
    fn failure_carries_exit_code_and_clears_queue() {
        let transport = MockTransport::new();
        transport.fail_execute("vgdisplay", FailureKind::Script, 5, "not found");
        let mut runner = ScriptRunner::host("node1");
        runner.append("vgdisplay cinder-volumes");

        let err = runner.execute(&transport, true).unwrap_err();
        assert_eq!(err.exit_code, Some(5));
        assert_eq!(err.kind, FailureKind::Script);
        assert_eq!(err.output, "not found");
        assert!(runner.is_empty());
    }
}
