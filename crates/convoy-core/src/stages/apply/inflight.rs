//! Handles for manifest applications running on remote hosts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::remote::{FailureKind, RemoteExecutionError, Transport};

/// Suffix of the log written while the apply runs.
pub const RUNNING_SUFFIX: &str = ".running";
/// Suffix the log is renamed to once the apply process exits.
pub const FINISHED_SUFFIX: &str = ".finished";
/// Suffix of the local copy fetched for inspection.
pub const LOCAL_LOG_SUFFIX: &str = ".log";

/// Result of polling one in-flight application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    /// The finished log is not available yet.
    Pending(FailureKind),
    /// The finished log was copied to this local path.
    Finished(PathBuf),
}

/// One manifest application launched in the background on a host.
///
/// Keyed by (host, finished-log path). Completion is observed only by a
/// successful fetch of the finished log; nothing is assumed before that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub host: String,
    /// Manifest file name, also used as the display name of its log.
    pub manifest: String,
    pub marker: String,
    pub running_log: String,
    pub finished_log: String,
    pub launched_at: DateTime<Utc>,
}

impl InFlight {
    /// Handle for `manifest_path` (remote, absolute) launched on `host`.
    pub fn new(host: &str, manifest_path: &str, marker: &str) -> Self {
        let manifest = manifest_path
            .rsplit('/')
            .next()
            .unwrap_or(manifest_path)
            .to_string();
        Self {
            host: host.to_string(),
            manifest,
            marker: marker.to_string(),
            running_log: format!("{manifest_path}{RUNNING_SUFFIX}"),
            finished_log: format!("{manifest_path}{FINISHED_SUFFIX}"),
            launched_at: Utc::now(),
        }
    }

    pub fn log_name(&self) -> &str {
        &self.manifest
    }

    /// Where the fetched log is stored locally.
    pub fn local_log_path(&self, dir: &Path) -> PathBuf {
        dir.join(local_log_name(&self.finished_log))
    }

    /// Try to copy the finished log into `dir`.
    ///
    /// A missing file or an unreachable host is the expected answer while
    /// the apply is still running and is reported as `Pending`. Only a
    /// transport that cannot be started at all is an error.
    pub fn poll(
        &self,
        transport: &dyn Transport,
        dir: &Path,
    ) -> Result<PollState, RemoteExecutionError> {
        let local = self.local_log_path(dir);
        match transport.fetch(&self.host, &self.finished_log, &local) {
            Ok(()) => Ok(PollState::Finished(local)),
            Err(err) if err.kind == FailureKind::Spawn => Err(err),
            Err(err) => {
                tracing::trace!(host = %self.host, log = %self.finished_log, "not finished yet: {}", err);
                Ok(PollState::Pending(err.kind))
            }
        }
    }

    fn matches(&self, host: &str, finished_log: &str) -> bool {
        self.host == host && self.finished_log == finished_log
    }
}

/// Local log file name for a remote finished log:
/// `<basename without .finished>.log`.
pub fn local_log_name(finished_log: &str) -> String {
    let base = finished_log.rsplit('/').next().unwrap_or(finished_log);
    let stem = base.strip_suffix(FINISHED_SUFFIX).unwrap_or(base);
    format!("{stem}{LOCAL_LOG_SUFFIX}")
}

/// Applications launched and not yet fetched, in launch order.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    entries: Vec<InFlight>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: InFlight) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[InFlight] {
        &self.entries
    }

    pub fn contains(&self, host: &str, finished_log: &str) -> bool {
        self.entries.iter().any(|e| e.matches(host, finished_log))
    }

    /// Whether any application on `host` is still outstanding.
    pub fn has_host(&self, host: &str) -> bool {
        self.entries.iter().any(|e| e.host == host)
    }

    /// Remove the entry for (host, finished log).
    ///
    /// Returns `None` when it was already removed.
    pub fn complete(&mut self, host: &str, finished_log: &str) -> Option<InFlight> {
        let index = self
            .entries
            .iter()
            .position(|e| e.matches(host, finished_log))?;
        Some(self.entries.remove(index))
    }

    /// Copy of the current entries for one sweep.
    pub fn snapshot(&self) -> Vec<InFlight> {
        self.entries.clone()
    }
}
