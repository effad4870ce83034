//! Host preparation and transfer of manifests, resources and modules.

use anyhow::Context;

use crate::config::{DeployConfig, HostConfig};
use crate::context::RunContext;
use crate::remote::{ScriptRunner, shell_quote};

/// Create the working directory layout on every host.
pub fn prepare_hosts(ctx: &RunContext<'_>) -> anyhow::Result<()> {
    for host in ctx.hosts() {
        let mut runner = ScriptRunner::host(&host.address);
        runner.append(format!(
            "mkdir -p {} {} {} {}",
            shell_quote(&host.manifests_dir()),
            shell_quote(&host.resources_dir()),
            shell_quote(&host.modules_dir()),
            shell_quote(&host.facts_dir()),
        ));
        runner
            .execute(ctx.transport(), false)
            .with_context(|| format!("Failed to prepare host {}", host.address))?;
        tracing::debug!(host = %host.address, workdir = %host.workdir, "prepared working directory");
    }
    Ok(())
}

/// Local commands that push everything `host` needs into its workdir.
pub fn transfer_commands(config: &DeployConfig, host: &HostConfig) -> Vec<String> {
    let ssh = config.ssh_settings();
    let login = ssh.ssh_command(&host.address);
    let mut commands = vec![
        format!(
            "cd {}",
            shell_quote(&config.deploy.manifest_dir.to_string_lossy())
        ),
        format!(
            "tar --dereference -cpzf - . | {login} tar -C {} -xpzf -",
            shell_quote(&host.manifests_dir())
        ),
    ];

    for resource in &host.resources {
        let remote = format!("{}/{}", host.resources_dir(), resource.name);
        commands.push(ssh.scp_upload_command(
            &shell_quote(&resource.path.to_string_lossy()),
            &host.address,
            &shell_quote(&remote),
        ));
    }

    // An empty module list ships the whole module directory.
    let modules = if config.deploy.modules.is_empty() {
        ".".to_string()
    } else {
        config
            .deploy
            .modules
            .iter()
            .map(|m| shell_quote(m))
            .collect::<Vec<_>>()
            .join(" ")
    };
    commands.push(format!(
        "cd {}",
        shell_quote(&config.deploy.module_dir.to_string_lossy())
    ));
    commands.push(format!(
        "tar --dereference -cpzf - {modules} | {login} tar -C {} -xpzf -",
        shell_quote(&host.modules_dir())
    ));
    commands
}

/// Copy manifests, per-host resources and the shared modules to every host.
///
/// The first failing transfer aborts the stage.
pub fn distribute(ctx: &RunContext<'_>) -> anyhow::Result<()> {
    for host in ctx.hosts() {
        let mut runner = ScriptRunner::local();
        for command in transfer_commands(ctx.config(), host) {
            runner.append(command);
        }
        runner
            .execute(ctx.transport(), false)
            .with_context(|| format!("Failed to copy modules and manifests to {}", host.address))?;
        tracing::info!(host = %host.address, "copied modules and manifests");
    }
    Ok(())
}
