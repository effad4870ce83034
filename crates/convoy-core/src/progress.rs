//! Presentation hooks for a running deployment.
//!
//! The stages call these as work resolves so a frontend can show progress
//! per manifest rather than only at the end. None of them affect control
//! flow.

/// How a single manifest application ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    Done,
    Error(String),
}

/// Receives progress notifications from the stages.
pub trait Reporter {
    fn step_started(&mut self, _title: &str) {}

    fn step_finished(&mut self, _title: &str, _ok: bool) {}

    /// A step was not run (dry run).
    fn step_skipped(&mut self, _title: &str) {}

    /// A manifest was launched on its host.
    fn applying(&mut self, _host: &str, _manifest: &str) {}

    /// The drain loop is about to poll `log_name`; `pending` entries remain.
    fn waiting(&mut self, _log_name: &str, _pending: usize) {}

    fn manifest_finished(&mut self, _host: &str, _log_name: &str, _outcome: &ManifestOutcome) {}

    /// A manifest wave drained and the next marker may start.
    fn barrier(&mut self, _marker: &str) {}
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Reporter that keeps every notification, for tests and audits.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    pub events: Vec<String>,
}

impl Reporter for RecordingReporter {
    fn step_started(&mut self, title: &str) {
        self.events.push(format!("step:{title}"));
    }

    fn step_finished(&mut self, title: &str, ok: bool) {
        let state = if ok { "ok" } else { "failed" };
        self.events.push(format!("step-end:{title}:{state}"));
    }

    fn step_skipped(&mut self, title: &str) {
        self.events.push(format!("step-skip:{title}"));
    }

    fn applying(&mut self, host: &str, manifest: &str) {
        self.events.push(format!("apply:{host}:{manifest}"));
    }

    fn manifest_finished(&mut self, host: &str, log_name: &str, outcome: &ManifestOutcome) {
        let state = match outcome {
            ManifestOutcome::Done => "DONE",
            ManifestOutcome::Error(_) => "ERROR",
        };
        self.events.push(format!("finished:{host}:{log_name}:{state}"));
    }

    fn barrier(&mut self, marker: &str) {
        self.events.push(format!("barrier:{marker}"));
    }
}
