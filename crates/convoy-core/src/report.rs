//! Serializable summary of a deployment run.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::{HostStatus, ManifestRecord, RunContext};

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub address: String,
    pub status: HostStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub hosts: Vec<HostReport>,
    pub manifests: Vec<ManifestRecord>,
    pub messages: Vec<String>,
    /// Set when the run stopped on a fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
}

impl RunReport {
    pub(crate) fn from_context(ctx: &RunContext<'_>, dry_run: bool) -> Self {
        let statuses = ctx.host_statuses();
        let hosts = ctx
            .hosts()
            .iter()
            .map(|h| HostReport {
                address: h.address.clone(),
                status: statuses
                    .get(&h.address)
                    .copied()
                    .unwrap_or(HostStatus::Pending),
            })
            .collect();

        Self {
            started_at: ctx.started_at(),
            finished_at: Utc::now(),
            dry_run,
            hosts,
            manifests: ctx.records().to_vec(),
            messages: ctx.messages().to_vec(),
            error: None,
            failed_step: None,
        }
    }

    pub fn with_error(mut self, error: &anyhow::Error) -> Self {
        self.error = Some(format!("{error:#}"));
        self
    }

    pub fn with_failed_step(mut self, step: &str) -> Self {
        self.failed_step = Some(step.to_string());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
