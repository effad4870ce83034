//! Run context passed to every deployment stage.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{DeployConfig, HostConfig};
use crate::remote::Transport;
use crate::report::RunReport;

/// Where a host is in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Pending,
    Applying,
    Done,
    Failed,
}

/// Lifecycle of one manifest application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestState {
    Launched,
    Done,
    Failed,
}

/// What happened to one manifest during the run.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestRecord {
    pub host: String,
    pub manifest: String,
    pub marker: String,
    pub state: ManifestState,
    pub log: Option<PathBuf>,
    pub launched_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// State shared by the stages of a single run.
///
/// Owns the configuration, the collected operator messages and per-host
/// progress. Stages borrow it mutably in turn; nothing here is global.
pub struct RunContext<'t> {
    config: DeployConfig,
    transport: &'t dyn Transport,
    messages: Vec<String>,
    host_status: BTreeMap<String, HostStatus>,
    records: Vec<ManifestRecord>,
    started_at: DateTime<Utc>,
}

impl<'t> RunContext<'t> {
    pub fn new(config: DeployConfig, transport: &'t dyn Transport) -> Self {
        let host_status = config
            .hosts
            .iter()
            .map(|h| (h.address.clone(), HostStatus::Pending))
            .collect();
        Self {
            config,
            transport,
            messages: Vec::new(),
            host_status,
            records: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn transport(&self) -> &'t dyn Transport {
        self.transport
    }

    pub fn hosts(&self) -> &[HostConfig] {
        &self.config.hosts
    }

    /// Collected operator messages, in the order they were added.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn push_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn extend_messages(&mut self, messages: impl IntoIterator<Item = String>) {
        self.messages.extend(messages);
    }

    pub fn host_status(&self, address: &str) -> Option<HostStatus> {
        self.host_status.get(address).copied()
    }

    /// Update a host's status. `Failed` is final for the run.
    pub fn set_host_status(&mut self, address: &str, status: HostStatus) {
        let entry = self
            .host_status
            .entry(address.to_string())
            .or_insert(HostStatus::Pending);
        if *entry != HostStatus::Failed {
            *entry = status;
        }
    }

    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    pub fn record_launch(&mut self, host: &str, manifest: &str, marker: &str) {
        self.records.push(ManifestRecord {
            host: host.to_string(),
            manifest: manifest.to_string(),
            marker: marker.to_string(),
            state: ManifestState::Launched,
            log: None,
            launched_at: Utc::now(),
            finished_at: None,
        });
    }

    pub fn record_finish(
        &mut self,
        host: &str,
        manifest: &str,
        state: ManifestState,
        log: Option<PathBuf>,
    ) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.host == host && r.manifest == manifest)
        {
            record.state = state;
            record.log = log;
            record.finished_at = Some(Utc::now());
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Snapshot of the run so far.
    pub fn report(&self, dry_run: bool) -> RunReport {
        RunReport::from_context(self, dry_run)
    }

    pub(crate) fn host_statuses(&self) -> &BTreeMap<String, HostStatus> {
        &self.host_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockTransport;

    fn context(transport: &MockTransport) -> RunContext<'_> {
        let mut config = DeployConfig::new();
        config.hosts = vec![
            HostConfig::new("a", "/var/tmp/a"),
            HostConfig::new("b", "/var/tmp/b"),
        ];
        RunContext::new(config, transport)
    }

    #[test]
    fn hosts_start_pending() {
        let transport = MockTransport::new();
        let ctx = context(&transport);
        assert_eq!(ctx.host_status("a"), Some(HostStatus::Pending));
        assert_eq!(ctx.host_status("b"), Some(HostStatus::Pending));
        assert_eq!(ctx.host_status("c"), None);
    }

    #[test]
    fn failed_status_is_sticky() {
        let transport = MockTransport::new();
        let mut ctx = context(&transport);
        ctx.set_host_status("a", HostStatus::Failed);
        ctx.set_host_status("a", HostStatus::Done);
        assert_eq!(ctx.host_status("a"), Some(HostStatus::Failed));
    }

    #[test]
    fn messages_keep_insertion_order() {
        let transport = MockTransport::new();
        let mut ctx = context(&transport);
        ctx.push_message("first");
        ctx.extend_messages(vec!["second".to_string(), "third".to_string()]);
        assert_eq!(ctx.messages(), ["first", "second", "third"]);
    }

    #[test]
    fn record_finish_updates_latest_launch() {
        let transport = MockTransport::new();
        let mut ctx = context(&transport);
        ctx.record_launch("a", "a_x.pp", "m1");
        ctx.record_finish("a", "a_x.pp", ManifestState::Done, None);
        assert_eq!(ctx.records()[0].state, ManifestState::Done);
        assert!(ctx.records()[0].finished_at.is_some());
    }
}
