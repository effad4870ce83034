//! The deployment pipeline.
//!
//! A run walks a fixed list of steps and stops at the first one that
//! fails. Each step borrows the run context in turn.

use std::fmt;
use std::path::Path;

use anyhow::Context;

use crate::config::DeployConfig;
use crate::context::RunContext;
use crate::manifest::{ManifestSet, Wave};
use crate::progress::Reporter;
use crate::report::RunReport;
use crate::stages;

/// One step of a deployment run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CleanUp,
    WriteManifests,
    PrepareHosts,
    Distribute,
    Apply,
    Finalize,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::CleanUp,
        Step::WriteManifests,
        Step::PrepareHosts,
        Step::Distribute,
        Step::Apply,
        Step::Finalize,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Step::CleanUp => "Clean Up",
            Step::WriteManifests => "Writing manifests",
            Step::PrepareHosts => "Preparing hosts",
            Step::Distribute => "Copying modules and manifests",
            Step::Apply => "Applying manifests",
            Step::Finalize => "Finalizing",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// A run failed at `step`.
#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    pub error: anyhow::Error,
}

/// A manifest set ready to be deployed.
#[derive(Debug, Clone)]
pub struct Deployment {
    manifests: ManifestSet,
}

impl Deployment {
    pub fn new(manifests: ManifestSet) -> Self {
        Self { manifests }
    }

    /// Read the manifest sources listed in `config`.
    ///
    /// Relative sources resolve against `base_dir`.
    pub fn from_config(config: &DeployConfig, base_dir: &Path) -> anyhow::Result<Self> {
        let manifests = config
            .build_manifest_set(base_dir)
            .context("Failed to load manifests")?;
        Ok(Self::new(manifests))
    }

    /// Waves in the order they will be applied.
    pub fn plan(&self) -> Vec<Wave<'_>> {
        self.manifests.waves()
    }

    /// Run every step and summarize the outcome.
    ///
    /// A failing step ends the run; the report carries its error.
    pub fn run(&self, ctx: &mut RunContext<'_>, reporter: &mut dyn Reporter) -> RunReport {
        let dry_run = ctx.config().deploy.dry_run;
        match self.execute(ctx, reporter) {
            Ok(()) => ctx.report(dry_run),
            Err(failure) => {
                tracing::error!(step = %failure.step, "deployment failed: {:#}", failure.error);
                ctx.report(dry_run)
                    .with_error(&failure.error)
                    .with_failed_step(failure.step.title())
            }
        }
    }

    /// Run every step, stopping at the first failure.
    pub fn execute(
        &self,
        ctx: &mut RunContext<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), StepFailure> {
        let dry_run = ctx.config().deploy.dry_run;
        for step in Step::ALL {
            if step == Step::Apply && dry_run {
                tracing::info!("dry run, not applying manifests");
                reporter.step_skipped(step.title());
                continue;
            }

            reporter.step_started(step.title());
            let result = self.run_step(step, ctx, reporter);
            reporter.step_finished(step.title(), result.is_ok());
            result.map_err(|error| StepFailure { step, error })?;
        }
        Ok(())
    }

    fn run_step(
        &self,
        step: Step,
        ctx: &mut RunContext<'_>,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Result<()> {
        let manifest_dir = ctx.config().deploy.manifest_dir.clone();
        match step {
            Step::CleanUp => {
                stages::remove_stale_manifests(&manifest_dir)?;
            }
            Step::WriteManifests => {
                self.manifests.write_to(&manifest_dir)?;
            }
            Step::PrepareHosts => stages::prepare_hosts(ctx)?,
            Step::Distribute => stages::distribute(ctx)?,
            Step::Apply => {
                stages::apply_manifests(ctx, &self.manifests, reporter)?;
            }
            Step::Finalize => {
                stages::check_reboot(ctx);
            }
        }
        Ok(())
    }
}
