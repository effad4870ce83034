//! Convoy - staged multi-host deployment
//!
//! Usage:
//!   convoy deploy              # Push, apply and verify every manifest
//!   convoy deploy --dry-run    # Everything except applying
//!   convoy plan                # Show waves and owners
//!   convoy check-reboot        # Only run the kernel check

mod reporter;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy_core::config::ConfigStore;
use convoy_core::context::RunContext;
use convoy_core::deploy::Deployment;
use convoy_core::remote::SshTransport;
use convoy_core::report::RunReport;
use convoy_core::stages;

use crate::reporter::TerminalReporter;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Staged multi-host deployment", long_about = None)]
struct Cli {
    /// Path to convoy.toml (default: ./convoy.toml, then the user config directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log debug output from convoy
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Distribute and apply all manifests
    Deploy {
        /// Run every step except applying manifests
        #[arg(long)]
        dry_run: bool,

        /// Pass --debug to the apply command and log remote command text
        #[arg(long)]
        debug: bool,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show the waves a deployment would apply, without touching hosts
    Plan {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Check which hosts need a reboot for a kernel update
    CheckReboot {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "convoy=debug,convoy_core=debug"
    } else {
        "convoy=info,convoy_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = match cli.config {
        Some(path) => ConfigStore::from_path(path),
        None => ConfigStore::discover()?,
    };

    match cli.command {
        Commands::Deploy {
            dry_run,
            debug,
            format,
        } => run_deploy(&store, dry_run, debug, format),
        Commands::Plan { format } => run_plan(&store, format),
        Commands::CheckReboot { format } => run_check_reboot(&store, format),
    }
}

fn run_deploy(store: &ConfigStore, dry_run: bool, debug: bool, format: OutputFormat) -> Result<()> {
    let mut config = store.load()?;
    config.deploy.dry_run |= dry_run;
    config.apply.debug |= debug;

    let deployment = Deployment::from_config(&config, &store.base_dir())?;
    let transport = SshTransport::new(config.ssh_settings());
    let mut ctx = RunContext::new(config, &transport);

    let report = match format {
        OutputFormat::Table => {
            let mut reporter = TerminalReporter::new();
            deployment.run(&mut ctx, &mut reporter)
        }
        OutputFormat::Json => deployment.run(&mut ctx, &mut convoy_core::progress::NullReporter),
    };

    match format {
        OutputFormat::Table => print_report(&report),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    if let Some(error) = &report.error {
        let step = report.failed_step.as_deref().unwrap_or("deployment");
        println!("{} {}", style(format!("{step} failed:")).red().bold(), error);
    } else if report.dry_run {
        println!("{}", style("Dry run completed, no manifests were applied.").green());
    } else {
        println!("{}", style("Deployment completed successfully.").green().bold());
    }

    if !report.hosts.is_empty() {
        println!();
        println!("  {:<30} Status", "Host");
        println!("  {}", "-".repeat(40));
        for host in &report.hosts {
            let status = format!("{:?}", host.status).to_lowercase();
            println!("  {:<30} {}", truncate(&host.address, 30), status);
        }
    }

    if !report.messages.is_empty() {
        println!();
        println!("{}", style("Additional information:").bold());
        for message in &report.messages {
            println!(" * {message}");
        }
    }
}

fn run_plan(store: &ConfigStore, format: OutputFormat) -> Result<()> {
    let config = store.load()?;
    let deployment = Deployment::from_config(&config, &store.base_dir())?;
    let waves = deployment.plan();

    match format {
        OutputFormat::Json => {
            let output: Vec<serde_json::Value> = waves
                .iter()
                .map(|wave| {
                    serde_json::json!({
                        "marker": wave.marker.as_str(),
                        "manifests": wave.units.iter().map(|unit| serde_json::json!({
                            "host": unit.host,
                            "file": unit.file_name,
                        })).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if waves.is_empty() {
                println!("No manifests configured.");
                return Ok(());
            }
            for (index, wave) in waves.iter().enumerate() {
                println!(
                    "Wave {} ({})",
                    index + 1,
                    style(wave.marker.as_str()).cyan()
                );
                for unit in &wave.units {
                    println!("  {:<20} {}", truncate(&unit.host, 20), unit.file_name);
                }
            }
        }
    }
    Ok(())
}

fn run_check_reboot(store: &ConfigStore, format: OutputFormat) -> Result<()> {
    let config = store.load()?;
    let transport = SshTransport::new(config.ssh_settings());
    let mut ctx = RunContext::new(config, &transport);

    let flagged = stages::check_reboot(&mut ctx);

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "reboot_required": flagged,
                "messages": ctx.messages(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if flagged.is_empty() {
                println!("No host requires a reboot.");
            }
            for message in ctx.messages() {
                println!(" * {message}");
            }
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
