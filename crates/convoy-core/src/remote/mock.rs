//! Recording transport for tests.
//!
//! `MockTransport` never spawns processes. Every call is appended to an
//! ordered event log so tests can assert on what ran where and in which
//! order; outcomes are scripted up front.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use super::{CommandOutput, FailureKind, RemoteExecutionError, Target, Transport};

/// One call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Execute {
        target: Target,
        script: String,
    },
    Fetch {
        host: String,
        remote_path: String,
        local_path: PathBuf,
        delivered: bool,
    },
}

/// Scripted result of a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Remote file does not exist yet.
    Missing,
    /// Host cannot be reached.
    Unreachable,
    /// File exists; its content is written to the local path.
    Deliver(String),
}

#[derive(Debug, Clone)]
struct ExecRule {
    pattern: String,
    target: Option<Target>,
    result: Result<String, (FailureKind, i32, String)>,
}

/// Test double implementing [`Transport`].
///
/// Fetches without a scripted plan deliver an empty (clean) log. Executions
/// succeed with empty output unless a rule matches the script text.
#[derive(Debug, Default)]
pub struct MockTransport {
    events: RefCell<Vec<TransportEvent>>,
    rules: RefCell<Vec<ExecRule>>,
    fetch_plans: RefCell<HashMap<(String, String), VecDeque<FetchOutcome>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any script containing `pattern`.
    pub fn fail_execute(&self, pattern: &str, kind: FailureKind, code: i32, output: &str) {
        self.rules.borrow_mut().push(ExecRule {
            pattern: pattern.to_string(),
            target: None,
            result: Err((kind, code, output.to_string())),
        });
    }

    /// Fail scripts containing `pattern` only when run on `target`.
    pub fn fail_execute_on(
        &self,
        target: Target,
        pattern: &str,
        kind: FailureKind,
        code: i32,
        output: &str,
    ) {
        self.rules.borrow_mut().push(ExecRule {
            pattern: pattern.to_string(),
            target: Some(target),
            result: Err((kind, code, output.to_string())),
        });
    }

    /// Answer scripts containing `pattern` on `target` with `output`.
    pub fn respond_on(&self, target: Target, pattern: &str, output: &str) {
        self.rules.borrow_mut().push(ExecRule {
            pattern: pattern.to_string(),
            target: Some(target),
            result: Ok(output.to_string()),
        });
    }

    /// Queue outcomes for successive fetches of `remote_path` from `host`.
    ///
    /// Once the queue is exhausted the last outcome repeats.
    pub fn plan_fetch(&self, host: &str, remote_path: &str, outcomes: Vec<FetchOutcome>) {
        self.fetch_plans
            .borrow_mut()
            .insert((host.to_string(), remote_path.to_string()), outcomes.into());
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.borrow().clone()
    }

    /// Scripts executed on `target`, in order.
    pub fn scripts_on(&self, target: &Target) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Execute { target: t, script } if t == target => {
                    Some(script.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Number of fetch attempts for `remote_path` on `host`.
    pub fn fetch_attempts(&self, host: &str, remote_path: &str) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| {
                matches!(event, TransportEvent::Fetch { host: h, remote_path: p, .. }
                    if h == host && p == remote_path)
            })
            .count()
    }

    fn next_fetch(&self, host: &str, remote_path: &str) -> FetchOutcome {
        let mut plans = self.fetch_plans.borrow_mut();
        let Some(queue) = plans.get_mut(&(host.to_string(), remote_path.to_string())) else {
            return FetchOutcome::Deliver(String::new());
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(FetchOutcome::Missing)
        } else {
            queue.front().cloned().unwrap_or(FetchOutcome::Missing)
        }
    }
}

impl Transport for MockTransport {
    fn execute(
        &self,
        target: &Target,
        script: &str,
    ) -> Result<CommandOutput, RemoteExecutionError> {
        self.events.borrow_mut().push(TransportEvent::Execute {
            target: target.clone(),
            script: script.to_string(),
        });

        let rules = self.rules.borrow();
        let rule = rules.iter().find(|rule| {
            script.contains(&rule.pattern) && rule.target.as_ref().is_none_or(|t| t == target)
        });

        match rule.map(|r| &r.result) {
            None => Ok(CommandOutput::default()),
            Some(Ok(output)) => Ok(CommandOutput {
                status: 0,
                output: output.clone(),
            }),
            Some(Err((kind, code, output))) => Err(RemoteExecutionError::new(
                target.clone(),
                *kind,
                Some(*code),
                output.clone(),
            )),
        }
    }

    fn fetch(
        &self,
        host: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RemoteExecutionError> {
        let outcome = self.next_fetch(host, remote_path);
        let delivered = matches!(outcome, FetchOutcome::Deliver(_));
        self.events.borrow_mut().push(TransportEvent::Fetch {
            host: host.to_string(),
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            delivered,
        });

        match outcome {
            FetchOutcome::Deliver(content) => {
                if let Some(parent) = local_path.parent() {
                    std::fs::create_dir_all(parent).map_err(local_write_error)?;
                }
                std::fs::write(local_path, content).map_err(local_write_error)
            }
            FetchOutcome::Missing => Err(RemoteExecutionError::new(
                Target::Local,
                FailureKind::Script,
                Some(1),
                format!("scp: {remote_path}: No such file or directory"),
            )),
            FetchOutcome::Unreachable => Err(RemoteExecutionError::new(
                Target::Local,
                FailureKind::Network,
                Some(255),
                format!("ssh: connect to host {host} port 22: No route to host"),
            )),
        }
    }
}

fn local_write_error(err: std::io::Error) -> RemoteExecutionError {
    RemoteExecutionError::new(Target::Local, FailureKind::Spawn, None, err.to_string())
}
