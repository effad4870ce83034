//! Apply-and-poll stage.
//!
//! Manifests are launched in the background on their owning host in
//! sequence order. Whenever the marker changes, and once more at the end,
//! the stage blocks until every launched application has produced its
//! finished log and that log validated cleanly.

mod inflight;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::config::{DeployConfig, HostConfig};
use crate::context::{HostStatus, ManifestState, RunContext};
use crate::logscan::{self, LogValidationError};
use crate::manifest::{ManifestSet, ManifestUnit, owning_host};
use crate::progress::{ManifestOutcome, Reporter};
use crate::remote::{ScriptRunner, shell_quote};

pub use inflight::{
    FINISHED_SUFFIX, InFlight, InFlightSet, LOCAL_LOG_SUFFIX, PollState, RUNNING_SUFFIX,
    local_log_name,
};

/// Environment variable pointing the apply run at the host's working directory.
pub const VAR_DIR_ENV: &str = "CONVOY_VAR_DIR";

/// Lock file (inside the host workdir) serializing applies on one host.
pub const LOCK_FILE_NAME: &str = "apply.lock";

/// Fatal outcomes of the apply stage.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Manifest {log_name} failed on {host}")]
    Validation {
        host: String,
        log_name: String,
        log_path: PathBuf,
        #[source]
        source: LogValidationError,
    },

    #[error(
        "Timed out after {}s waiting for {} manifest application(s): {}",
        .timeout.as_secs(),
        .pending.len(),
        format_pending(.pending)
    )]
    DrainTimeout {
        timeout: Duration,
        /// (host, finished-log path) pairs still outstanding.
        pending: Vec<(String, String)>,
    },
}

fn format_pending(pending: &[(String, String)]) -> String {
    pending
        .iter()
        .map(|(host, log)| format!("{host}:{log}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// What the apply stage did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub launched: usize,
    /// Drains performed, including the final one.
    pub barriers: usize,
    /// Manifests whose owner is not in the active host set.
    pub skipped: usize,
}

/// Launch every manifest in `manifests` and wait for all of them.
///
/// Stops at the first manifest whose log fails validation; applications
/// already running on other hosts are left to finish on their own.
pub fn apply_manifests(
    ctx: &mut RunContext<'_>,
    manifests: &ManifestSet,
    reporter: &mut dyn Reporter,
) -> anyhow::Result<ApplySummary> {
    let mut summary = ApplySummary::default();
    let mut inflight = InFlightSet::new();
    let mut last_marker: Option<&str> = None;

    for (unit, marker) in manifests.sequence() {
        match last_marker {
            Some(previous) if previous != marker.as_str() => {
                barrier(ctx, &mut inflight, reporter, previous, &mut summary)?;
            }
            _ => {}
        }
        last_marker = Some(marker.as_str());

        let Some(host) = resolve_owner(ctx.config(), unit) else {
            tracing::warn!(manifest = %unit.file_name, "no active host owns manifest, skipping");
            summary.skipped += 1;
            continue;
        };

        let entry = launch(ctx, &host, unit)?;
        reporter.applying(&host.address, &unit.file_name);
        inflight.push(entry);
        summary.launched += 1;
    }

    if let Some(last) = last_marker {
        barrier(ctx, &mut inflight, reporter, last, &mut summary)?;
    }

    tracing::info!(
        launched = summary.launched,
        barriers = summary.barriers,
        skipped = summary.skipped,
        "all manifests applied"
    );
    Ok(summary)
}

fn barrier(
    ctx: &mut RunContext<'_>,
    inflight: &mut InFlightSet,
    reporter: &mut dyn Reporter,
    marker: &str,
    summary: &mut ApplySummary,
) -> anyhow::Result<()> {
    tracing::info!(marker, pending = inflight.len(), "waiting for wave to finish");
    drain(ctx, inflight, reporter)?;
    summary.barriers += 1;
    reporter.barrier(marker);
    Ok(())
}

/// The configured host that owns `unit`.
///
/// The explicit owner recorded on the unit wins; otherwise the host is
/// recovered from the file name.
fn resolve_owner(config: &DeployConfig, unit: &ManifestUnit) -> Option<HostConfig> {
    if let Some(host) = config.host(&unit.host) {
        return Some(host.clone());
    }
    let address = owning_host(&unit.file_name, config.host_addresses())?;
    config.host(address).cloned()
}

/// Shell commands that start `unit` in the background on `host`.
///
/// The final command detaches, so executing the script returns as soon
/// as the apply process has been started.
pub fn launch_commands(config: &DeployConfig, host: &HostConfig, unit: &ManifestUnit) -> Vec<String> {
    let manifest_path = format!("{}/{}", host.manifests_dir(), unit.file_name);
    let running = format!("{manifest_path}{RUNNING_SUFFIX}");
    let finished = format!("{manifest_path}{FINISHED_SUFFIX}");

    let mut commands = Vec::new();
    if !unit.has_suffix(&config.apply.facts_excluded) {
        commands.push(format!(
            "export FACTERLIB=$FACTERLIB:{}",
            shell_quote(&host.facts_dir())
        ));
    }
    commands.push(format!(
        "rm -f {} {}",
        shell_quote(&running),
        shell_quote(&finished)
    ));
    commands.push(format!("touch {}", shell_quote(&running)));
    commands.push(format!("chmod 600 {}", shell_quote(&running)));
    commands.push(format!("export {VAR_DIR_ENV}={}", shell_quote(&host.workdir)));

    let debug = if config.apply.debug { " --debug" } else { "" };
    let lock = format!("{}/{LOCK_FILE_NAME}", host.workdir);
    commands.push(format!(
        "( flock {lock} {cmd}{debug} --modulepath {modules} {manifest} > {running} 2>&1 < /dev/null ; mv {running} {finished} ) > /dev/null 2>&1 < /dev/null &",
        lock = shell_quote(&lock),
        cmd = config.apply.command,
        modules = shell_quote(&host.modules_dir()),
        manifest = shell_quote(&manifest_path),
        running = shell_quote(&running),
        finished = shell_quote(&finished),
    ));
    commands
}

fn launch(
    ctx: &mut RunContext<'_>,
    host: &HostConfig,
    unit: &ManifestUnit,
) -> anyhow::Result<InFlight> {
    let mut runner = ScriptRunner::host(&host.address);
    for command in launch_commands(ctx.config(), host, unit) {
        runner.append(command);
    }
    runner
        .execute(ctx.transport(), ctx.config().apply.debug)
        .with_context(|| format!("Failed to launch {} on {}", unit.file_name, host.address))?;

    tracing::info!(host = %host.address, manifest = %unit.file_name, marker = %unit.marker, "applying");
    ctx.set_host_status(&host.address, HostStatus::Applying);
    ctx.record_launch(&host.address, &unit.file_name, unit.marker.as_str());

    let manifest_path = format!("{}/{}", host.manifests_dir(), unit.file_name);
    Ok(InFlight::new(&host.address, &manifest_path, unit.marker.as_str()))
}

/// Poll until `inflight` is empty.
///
/// Each sweep tries every outstanding entry once; an entry whose log is
/// not there yet costs one poll interval. Finished logs are copied into the
/// local manifest directory, scanned for notices and validated.
pub fn drain(
    ctx: &mut RunContext<'_>,
    inflight: &mut InFlightSet,
    reporter: &mut dyn Reporter,
) -> anyhow::Result<()> {
    let transport = ctx.transport();
    let log_dir = ctx.config().deploy.manifest_dir.clone();
    let interval = ctx.config().apply.poll_interval();
    let timeout = ctx.config().apply.drain_timeout();
    let started = Instant::now();

    while !inflight.is_empty() {
        for entry in inflight.snapshot() {
            check_timeout(started, timeout, inflight)?;
            reporter.waiting(entry.log_name(), inflight.len());

            let state = entry
                .poll(transport, &log_dir)
                .with_context(|| format!("Failed to poll {} on {}", entry.finished_log, entry.host))?;
            match state {
                PollState::Pending(_) => std::thread::sleep(interval),
                PollState::Finished(local) => {
                    if inflight.complete(&entry.host, &entry.finished_log).is_some() {
                        let host_idle = !inflight.has_host(&entry.host);
                        finish(ctx, &entry, &local, host_idle, reporter)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn check_timeout(
    started: Instant,
    timeout: Option<Duration>,
    inflight: &InFlightSet,
) -> Result<(), ApplyError> {
    match timeout {
        Some(limit) if started.elapsed() >= limit => Err(ApplyError::DrainTimeout {
            timeout: limit,
            pending: inflight
                .entries()
                .iter()
                .map(|e| (e.host.clone(), e.finished_log.clone()))
                .collect(),
        }),
        _ => Ok(()),
    }
}

fn finish(
    ctx: &mut RunContext<'_>,
    entry: &InFlight,
    local: &Path,
    host_idle: bool,
    reporter: &mut dyn Reporter,
) -> anyhow::Result<()> {
    let content = logscan::read_log(local)?;
    ctx.extend_messages(logscan::scan_log(&content));

    match logscan::validate_log(&content, local) {
        Ok(()) => {
            tracing::info!(host = %entry.host, manifest = %entry.manifest, "manifest applied");
            if host_idle {
                ctx.set_host_status(&entry.host, HostStatus::Done);
            }
            ctx.record_finish(
                &entry.host,
                &entry.manifest,
                ManifestState::Done,
                Some(local.to_path_buf()),
            );
            reporter.manifest_finished(&entry.host, entry.log_name(), &ManifestOutcome::Done);
            Ok(())
        }
        Err(source) => {
            tracing::error!(host = %entry.host, manifest = %entry.manifest, "{}", source.message);
            ctx.set_host_status(&entry.host, HostStatus::Failed);
            ctx.record_finish(
                &entry.host,
                &entry.manifest,
                ManifestState::Failed,
                Some(local.to_path_buf()),
            );
            reporter.manifest_finished(
                &entry.host,
                entry.log_name(),
                &ManifestOutcome::Error(source.message.clone()),
            );
            Err(ApplyError::Validation {
                host: entry.host.clone(),
                log_name: entry.log_name().to_string(),
                log_path: local.to_path_buf(),
                source,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Marker;

    fn config() -> DeployConfig {
        let mut config = DeployConfig::new();
        config.hosts = vec![HostConfig::new("10.0.0.1", "/var/tmp/w")];
        config
    }

    fn unit(file_name: &str) -> ManifestUnit {
        ManifestUnit {
            file_name: file_name.to_string(),
            host: "10.0.0.1".to_string(),
            marker: Marker::new("m"),
        }
    }

    #[test]
    fn launch_commands_detach_under_lock() {
        let config = config();
        let commands = launch_commands(&config, &config.hosts[0], &unit("10.0.0.1_nova.pp"));

        assert_eq!(commands[0], "export FACTERLIB=$FACTERLIB:/var/tmp/w/facts");
        assert_eq!(
            commands[1],
            "rm -f /var/tmp/w/manifests/10.0.0.1_nova.pp.running \
             /var/tmp/w/manifests/10.0.0.1_nova.pp.finished"
        );
        assert_eq!(commands[2], "touch /var/tmp/w/manifests/10.0.0.1_nova.pp.running");
        assert_eq!(commands[3], "chmod 600 /var/tmp/w/manifests/10.0.0.1_nova.pp.running");
        assert_eq!(commands[4], "export CONVOY_VAR_DIR=/var/tmp/w");
        assert_eq!(
            commands[5],
            "( flock /var/tmp/w/apply.lock puppet apply --modulepath /var/tmp/w/modules \
             /var/tmp/w/manifests/10.0.0.1_nova.pp > /var/tmp/w/manifests/10.0.0.1_nova.pp.running 2>&1 < /dev/null ; \
             mv /var/tmp/w/manifests/10.0.0.1_nova.pp.running /var/tmp/w/manifests/10.0.0.1_nova.pp.finished ) \
             > /dev/null 2>&1 < /dev/null &"
        );
    }

    #[test]
    fn excluded_manifests_skip_facts_export() {
        let config = config();
        let commands = launch_commands(&config, &config.hosts[0], &unit("10.0.0.1_horizon.pp"));
        assert!(commands.iter().all(|c| !c.contains("FACTERLIB")));
        assert!(commands[0].starts_with("rm -f "));
    }

    #[test]
    fn debug_flag_reaches_apply_command() {
        let mut config = config();
        config.apply.debug = true;
        let commands = launch_commands(&config, &config.hosts[0], &unit("10.0.0.1_nova.pp"));
        assert!(commands.last().unwrap().contains("puppet apply --debug --modulepath"));
    }

    #[test]
    fn owner_falls_back_to_file_name_prefix() {
        let mut config = config();
        config.hosts.push(HostConfig::new("10.0.0.10", "/var/tmp/w10"));
        let stray = ManifestUnit {
            file_name: "10.0.0.10_api.pp".to_string(),
            host: "retired".to_string(),
            marker: Marker::new("m"),
        };
        let host = resolve_owner(&config, &stray).unwrap();
        assert_eq!(host.address, "10.0.0.10");

        let orphan = ManifestUnit {
            file_name: "other_api.pp".to_string(),
            host: "other".to_string(),
            marker: Marker::new("m"),
        };
        assert!(resolve_owner(&config, &orphan).is_none());
    }

    #[test]
    fn timeout_error_lists_pending_entries() {
        let err = ApplyError::DrainTimeout {
            timeout: Duration::from_secs(5),
            pending: vec![("h".to_string(), "/w/manifests/h_a.pp.finished".to_string())],
        };
        let msg = err.to_string();
        assert!(msg.contains("5s"));
        assert!(msg.contains("h:/w/manifests/h_a.pp.finished"));
    }
}
