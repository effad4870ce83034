//! Post-run host checks.

use crate::context::RunContext;
use crate::remote::ScriptRunner;

/// Prints the newest installed kernel and the running kernel, one per line.
pub const KERNEL_CHECK: [&str; 3] = [
    r"installed=$(rpm -q kernel --last | head -n1 | sed 's/kernel-\([a-z0-9\.\_\-]*\).*/\1/g')",
    "loaded=$(uname -r | head -n1)",
    r#"printf '%s\n%s\n' "$installed" "$loaded""#,
];

/// Notice added for a host whose running kernel is not the newest installed.
pub fn reboot_notice(host: &str) -> String {
    format!("Because of the kernel update the host {host} requires reboot.")
}

/// Compare the two lines printed by [`KERNEL_CHECK`].
///
/// `None` when the output does not hold two versions.
pub fn needs_reboot(output: &str) -> Option<bool> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let installed = lines.next()?;
    let loaded = lines.next()?;
    Some(installed != loaded)
}

/// Run the kernel check on every host and note the ones needing a reboot.
///
/// Failures are logged and skip the host; this check never fails the run.
/// Returns the hosts that need a reboot.
pub fn check_reboot(ctx: &mut RunContext<'_>) -> Vec<String> {
    let transport = ctx.transport();
    let addresses: Vec<String> = ctx.hosts().iter().map(|h| h.address.clone()).collect();

    let mut flagged = Vec::new();
    for address in addresses {
        let mut runner = ScriptRunner::host(&address);
        for line in KERNEL_CHECK {
            runner.append(line);
        }
        let output = match runner.execute(transport, false) {
            Ok(output) => output.output,
            Err(err) => {
                tracing::warn!(host = %address, "kernel check skipped: {}", err);
                continue;
            }
        };
        match needs_reboot(&output) {
            Some(true) => {
                tracing::info!(host = %address, "host requires reboot");
                ctx.push_message(reboot_notice(&address));
                flagged.push(address);
            }
            Some(false) => tracing::debug!(host = %address, "kernel is current"),
            None => tracing::warn!(host = %address, "kernel check skipped: unexpected output"),
        }
    }
    flagged
}
