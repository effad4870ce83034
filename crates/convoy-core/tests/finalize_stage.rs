use convoy_core::config::{DeployConfig, HostConfig};
use convoy_core::context::RunContext;
use convoy_core::remote::{FailureKind, MockTransport, Target};
use convoy_core::stages::check_reboot;
use convoy_core::stages::finalize::reboot_notice;

fn config(hosts: &[&str]) -> DeployConfig {
    let mut config = DeployConfig::new();
    config.hosts = hosts
        .iter()
        .map(|h| HostConfig::new(*h, format!("/var/tmp/{h}")))
        .collect();
    config
}

#[test]
fn kernel_mismatch_adds_one_reboot_notice() {
    let transport = MockTransport::new();
    transport.respond_on(
        Target::host("node1"),
        "uname -r",
        "3.10.0-1160.el7.x86_64\n3.10.0-957.el7.x86_64\n",
    );
    let mut ctx = RunContext::new(config(&["node1"]), &transport);

    let flagged = check_reboot(&mut ctx);

    assert_eq!(flagged, ["node1"]);
    assert_eq!(ctx.messages(), [reboot_notice("node1")]);
}

#[test]
fn matching_kernel_adds_nothing() {
    let transport = MockTransport::new();
    transport.respond_on(Target::host("node1"), "uname -r", "5.14.0\n5.14.0\n");
    let mut ctx = RunContext::new(config(&["node1"]), &transport);

    assert!(check_reboot(&mut ctx).is_empty());
    assert!(ctx.messages().is_empty());
}

#[test]
fn transport_error_skips_host_without_failing() {
    let transport = MockTransport::new();
    transport.fail_execute_on(
        Target::host("node1"),
        "uname -r",
        FailureKind::Network,
        255,
        "ssh: connect to host node1 port 22: No route to host",
    );
    transport.respond_on(Target::host("node2"), "uname -r", "4.18.0-2\n4.18.0-1\n");
    let mut ctx = RunContext::new(config(&["node1", "node2"]), &transport);

    let flagged = check_reboot(&mut ctx);

    assert_eq!(flagged, ["node2"]);
    assert_eq!(ctx.messages(), [reboot_notice("node2")]);
}

#[test]
fn only_failure_produces_no_notice() {
    let transport = MockTransport::new();
    transport.fail_execute("uname -r", FailureKind::Script, 127, "rpm: command not found");
    let mut ctx = RunContext::new(config(&["node1"]), &transport);

    assert!(check_reboot(&mut ctx).is_empty());
    assert!(ctx.messages().is_empty());
}

#[test]
fn check_runs_once_per_host() {
    let transport = MockTransport::new();
    let mut ctx = RunContext::new(config(&["a", "b"]), &transport);

    check_reboot(&mut ctx);

    for host in ["a", "b"] {
        let scripts = transport.scripts_on(&Target::host(host));
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("rpm -q kernel --last"));
        assert!(scripts[0].starts_with("function t(){ exit $? ; }\ntrap t ERR\n"));
    }
}
