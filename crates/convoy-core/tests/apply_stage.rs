//! Tests for the apply-and-poll stage
//!
//! Covers:
//! - Wave barriers and their ordering against launches
//! - Host routing of manifests
//! - Transient fetch failures, validation failures and timeouts

use convoy_core::config::{DeployConfig, HostConfig};
use convoy_core::context::{HostStatus, ManifestState, RunContext};
use convoy_core::manifest::ManifestSet;
use convoy_core::progress::{NullReporter, RecordingReporter, Reporter};
use convoy_core::remote::{
    FailureKind, FetchOutcome, MockTransport, RemoteExecutionError, Target, TransportEvent,
};
use convoy_core::stages::{ApplyError, apply_manifests};
use tempfile::TempDir;

/// Config with one host per address, no poll delay and no timeout.
fn setup(hosts: &[&str]) -> (TempDir, DeployConfig) {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let mut config = DeployConfig::new();
    config.deploy.manifest_dir = temp.path().join("manifests");
    config.apply.poll_interval_secs = 0;
    config.apply.drain_timeout_secs = 0;
    config.hosts = hosts
        .iter()
        .map(|h| HostConfig::new(*h, format!("/var/tmp/{h}")))
        .collect();
    (temp, config)
}

fn finished(host: &str, name: &str) -> String {
    format!("/var/tmp/{host}/manifests/{host}_{name}.finished")
}

fn position(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("missing event {event} in {events:?}"))
}

/// Records the in-flight count seen on every poll.
#[derive(Default)]
struct PendingCounts {
    pending: Vec<usize>,
}

impl Reporter for PendingCounts {
    fn waiting(&mut self, _log_name: &str, pending: usize) {
        self.pending.push(pending);
    }
}

// =========================================================================
// Scenarios
// =========================================================================

#[test]
fn single_manifest_clean_log_completes() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["node1"]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("node1", "prescript.pp", "class { 'prescript': }", "M1");

    let summary = apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();

    assert_eq!(summary.launched, 1);
    assert_eq!(summary.barriers, 1);
    assert_eq!(transport.fetch_attempts("node1", &finished("node1", "prescript.pp")), 1);
    assert_eq!(ctx.host_status("node1"), Some(HostStatus::Done));
    assert_eq!(ctx.records()[0].state, ManifestState::Done);
}

#[test]
fn error_marker_after_transient_misses_aborts_run() {
    let transport = MockTransport::new();
    let (temp, config) = setup(&["node1"]);
    let log = finished("node1", "nova.pp");
    transport.plan_fetch(
        "node1",
        &log,
        vec![
            FetchOutcome::Missing,
            FetchOutcome::Missing,
            FetchOutcome::Deliver("Error: Could not find class ::nova for node1\n".into()),
        ],
    );
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("node1", "nova.pp", "class { 'nova': }", "M1");
    let mut counts = PendingCounts::default();

    let err = apply_manifests(&mut ctx, &set, &mut counts).unwrap_err();

    match err.downcast_ref::<ApplyError>() {
        Some(ApplyError::Validation {
            host,
            log_name,
            log_path,
            source,
        }) => {
            assert_eq!(host, "node1");
            assert_eq!(log_name, "node1_nova.pp");
            assert_eq!(log_path, &temp.path().join("manifests/node1_nova.pp.log"));
            assert!(source.message.contains("Could not find class ::nova"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(transport.fetch_attempts("node1", &log), 3);
    assert_eq!(counts.pending, vec![1, 1, 1]);
    assert_eq!(ctx.host_status("node1"), Some(HostStatus::Failed));
}

#[test]
fn shared_marker_launches_all_before_draining() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a", "b"]);
    transport.plan_fetch(
        "a",
        &finished("a", "api.pp"),
        vec![FetchOutcome::Missing, FetchOutcome::Deliver(String::new())],
    );
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "api.pp", "", "M1");
    set.append("b", "api.pp", "", "M1");
    let mut reporter = RecordingReporter::default();

    apply_manifests(&mut ctx, &set, &mut reporter).unwrap();

    let events = transport.events();
    let first_fetch = events
        .iter()
        .position(|e| matches!(e, TransportEvent::Fetch { .. }))
        .unwrap();
    let launches: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, TransportEvent::Execute { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(launches.len(), 2);
    assert!(launches.iter().all(|&i| i < first_fetch));

    assert_eq!(transport.fetch_attempts("a", &finished("a", "api.pp")), 2);
    assert_eq!(transport.fetch_attempts("b", &finished("b", "api.pp")), 1);

    let barrier = position(&reporter.events, "barrier:M1");
    assert!(position(&reporter.events, "finished:a:a_api.pp:DONE") < barrier);
    assert!(position(&reporter.events, "finished:b:b_api.pp:DONE") < barrier);
}

// =========================================================================
// Barriers
// =========================================================================

#[test]
fn single_marker_drains_once_at_end() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a", "b"]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "only");
    set.append("b", "x.pp", "", "only");
    set.append("a", "y.pp", "", "only");
    let mut reporter = RecordingReporter::default();

    let summary = apply_manifests(&mut ctx, &set, &mut reporter).unwrap();

    assert_eq!(summary.barriers, 1);
    let barriers: Vec<&String> = reporter
        .events
        .iter()
        .filter(|e| e.starts_with("barrier:"))
        .collect();
    assert_eq!(barriers, ["barrier:only"]);
    assert_eq!(reporter.events.last().unwrap(), "barrier:only");
}

#[test]
fn marker_change_drains_before_next_wave_launches() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a", "b"]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "mysql.pp", "", "m1");
    set.append("b", "mysql.pp", "", "m1");
    set.append("a", "keystone.pp", "", "m2");
    set.append("b", "keystone.pp", "", "m2");
    let mut reporter = RecordingReporter::default();

    let summary = apply_manifests(&mut ctx, &set, &mut reporter).unwrap();
    assert_eq!(summary.barriers, 2);

    let events = &reporter.events;
    let barrier = position(events, "barrier:m1");
    assert!(position(events, "apply:a:a_mysql.pp") < barrier);
    assert!(position(events, "apply:b:b_mysql.pp") < barrier);
    assert!(position(events, "finished:b:b_mysql.pp:DONE") < barrier);
    assert!(barrier < position(events, "apply:a:a_keystone.pp"));
    assert!(barrier < position(events, "apply:b:b_keystone.pp"));

    // Both m1 logs were fetched before any m2 launch reached the wire.
    let wire = transport.events();
    let last_m1_fetch = wire
        .iter()
        .rposition(|e| matches!(e, TransportEvent::Fetch { remote_path, .. } if remote_path.contains("mysql")))
        .unwrap();
    let first_m2_launch = wire
        .iter()
        .position(|e| matches!(e, TransportEvent::Execute { script, .. } if script.contains("keystone")))
        .unwrap();
    assert!(last_m1_fetch < first_m2_launch);
}

// =========================================================================
// Routing
// =========================================================================

#[test]
fn manifests_launch_only_on_their_host() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["10.0.0.1", "10.0.0.10", "10.0.0.2"]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("10.0.0.1", "api.pp", "", "m");
    set.append("10.0.0.10", "api.pp", "", "m");

    apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();

    let on_1 = transport.scripts_on(&Target::host("10.0.0.1"));
    assert_eq!(on_1.len(), 1);
    assert!(on_1[0].contains("/var/tmp/10.0.0.1/manifests/10.0.0.1_api.pp"));
    assert!(!on_1[0].contains("10.0.0.10_api.pp"));

    let on_10 = transport.scripts_on(&Target::host("10.0.0.10"));
    assert_eq!(on_10.len(), 1);
    assert!(on_10[0].contains("10.0.0.10_api.pp"));

    assert!(transport.scripts_on(&Target::host("10.0.0.2")).is_empty());
    assert_eq!(ctx.host_status("10.0.0.2"), Some(HostStatus::Pending));
}

#[test]
fn manifest_for_unknown_host_is_skipped() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a"]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("retired", "api.pp", "", "m");
    set.append("a", "api.pp", "", "m");

    let summary = apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.launched, 1);
    assert!(transport.scripts_on(&Target::host("retired")).is_empty());
}

// =========================================================================
// Launch script
// =========================================================================

#[test]
fn leftover_logs_are_removed_before_launch() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a"]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "m");

    apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();

    let script = &transport.scripts_on(&Target::host("a"))[0];
    let removal = script
        .find("rm -f /var/tmp/a/manifests/a_x.pp.running /var/tmp/a/manifests/a_x.pp.finished")
        .expect("stale logs are not removed");
    let touch = script.find("touch /var/tmp/a/manifests/a_x.pp.running").unwrap();
    let launch = script.find("flock").unwrap();
    assert!(removal < touch);
    assert!(touch < launch);
}

// =========================================================================
// Polling
// =========================================================================

#[test]
fn finished_entry_is_fetched_exactly_once() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a"]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "m1");
    set.append("a", "y.pp", "", "m2");

    apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();

    assert_eq!(transport.fetch_attempts("a", &finished("a", "x.pp")), 1);
    assert_eq!(transport.fetch_attempts("a", &finished("a", "y.pp")), 1);
}

#[test]
fn unreachable_host_keeps_polling() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a"]);
    let log = finished("a", "x.pp");
    transport.plan_fetch(
        "a",
        &log,
        vec![FetchOutcome::Unreachable, FetchOutcome::Deliver(String::new())],
    );
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "m");

    apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();
    assert_eq!(transport.fetch_attempts("a", &log), 2);
}

#[test]
fn notices_from_logs_are_collected() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a"]);
    transport.plan_fetch(
        "a",
        &finished("a", "horizon.pp"),
        vec![FetchOutcome::Deliver(
            "Notice: /Stage[main]/Main/Notify[convoy_info]/message: defined 'message' as 'Dashboard is at http://a/dashboard'\n"
                .into(),
        )],
    );
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "horizon.pp", "", "m");

    apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();
    assert_eq!(ctx.messages(), ["Dashboard is at http://a/dashboard"]);
}

#[test]
fn drain_times_out_when_log_never_appears() {
    let transport = MockTransport::new();
    let (_temp, mut config) = setup(&["a"]);
    config.apply.poll_interval_secs = 1;
    config.apply.drain_timeout_secs = 1;
    let log = finished("a", "x.pp");
    transport.plan_fetch("a", &log, vec![FetchOutcome::Missing]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "m");

    let err = apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap_err();

    match err.downcast_ref::<ApplyError>() {
        Some(ApplyError::DrainTimeout { pending, .. }) => {
            assert_eq!(pending, &vec![("a".to_string(), log.clone())]);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn host_is_not_done_while_another_manifest_runs_there() {
    let transport = MockTransport::new();
    let (_temp, mut config) = setup(&["a"]);
    config.apply.poll_interval_secs = 1;
    config.apply.drain_timeout_secs = 1;
    let slow = finished("a", "y.pp");
    transport.plan_fetch("a", &slow, vec![FetchOutcome::Missing]);
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "m");
    set.append("a", "y.pp", "", "m");

    let err = apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap_err();

    match err.downcast_ref::<ApplyError>() {
        Some(ApplyError::DrainTimeout { pending, .. }) => {
            assert_eq!(pending, &vec![("a".to_string(), slow.clone())]);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    let x = ctx.records().iter().find(|r| r.manifest == "a_x.pp").unwrap();
    assert_eq!(x.state, ManifestState::Done);
    assert_eq!(ctx.host_status("a"), Some(HostStatus::Applying));
}

#[test]
fn host_is_done_once_its_last_manifest_finishes() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a"]);
    transport.plan_fetch(
        "a",
        &finished("a", "y.pp"),
        vec![FetchOutcome::Missing, FetchOutcome::Deliver(String::new())],
    );
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "m");
    set.append("a", "y.pp", "", "m");

    apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap();

    assert_eq!(ctx.host_status("a"), Some(HostStatus::Done));
}

// =========================================================================
// Launch failures
// =========================================================================

#[test]
fn launch_failure_propagates_remote_error() {
    let transport = MockTransport::new();
    let (_temp, config) = setup(&["a", "b"]);
    transport.fail_execute_on(
        Target::host("b"),
        "flock",
        FailureKind::Network,
        255,
        "ssh: connect to host b port 22: Connection refused",
    );
    let mut ctx = RunContext::new(config, &transport);
    let mut set = ManifestSet::new();
    set.append("a", "x.pp", "", "m");
    set.append("b", "x.pp", "", "m");

    let err = apply_manifests(&mut ctx, &set, &mut NullReporter).unwrap_err();

    let remote = err.downcast_ref::<RemoteExecutionError>().unwrap();
    assert!(remote.is_network());
    assert!(format!("{err:#}").contains("Failed to launch b_x.pp on b"));
    // No drain happened for the wave that failed to launch.
    assert_eq!(transport.fetch_attempts("a", &finished("a", "x.pp")), 0);
}
