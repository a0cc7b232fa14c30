//! `burrow setup` — Change a container's execution mode, GPU access or link form.

use std::path::Path;

use anyhow::Context;
use burrow_common::config::BurrowConfig;
use burrow_common::types::{ContainerId, ExecMode};
use burrow_core::guard::SafePrefixSet;
use burrow_runtime::gpu;
use burrow_runtime::store::{self, ContainerStore, ExecModeStore, LinkMode};
use clap::{Args, ValueEnum};

/// Link forms accepted by `--links`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LinkForm {
    /// Absolute targets point at the container root on the host.
    Host,
    /// Absolute targets are relative to the container root.
    Container,
}

impl From<LinkForm> for LinkMode {
    fn from(form: LinkForm) -> Self {
        match form {
            LinkForm::Host => Self::Host,
            LinkForm::Container => Self::Container,
        }
    }
}

/// Arguments for the `setup` command.
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Container to configure.
    pub container: String,

    /// Execution mode (P1, P2, R1, R2, R3).
    #[arg(long)]
    pub execmode: Option<ExecMode>,

    /// Expose GPU devices on every run.
    #[arg(long, conflicts_with = "no_gpu")]
    pub gpu: bool,

    /// Stop exposing GPU devices.
    #[arg(long)]
    pub no_gpu: bool,

    /// Rewrite absolute symlinks inside the container root.
    #[arg(long, value_enum)]
    pub links: Option<LinkForm>,

    /// Convert links even inside read-only directories.
    #[arg(long)]
    pub force: bool,
}

/// Executes the `setup` command.
///
/// Without options the current settings are logged.
///
/// # Errors
///
/// Returns an error if the container does not exist or a setting cannot be
/// applied.
pub fn execute(config: &BurrowConfig, args: &SetupArgs) -> anyhow::Result<()> {
    let id = ContainerId::parse(args.container.as_str())?;
    let container_dir = ContainerStore::new(config).container_dir(&id)?;
    let guard = SafePrefixSet::new();
    guard.register(&container_dir);
    let modes = ExecModeStore::new(&guard, &container_dir, config.default_execmode);

    if let Some(mode) = args.execmode {
        modes
            .set(mode, &config.tmpdir)
            .with_context(|| format!("setting execution mode {mode} on {id}"))?;
    }
    if args.gpu || args.no_gpu {
        gpu::set_enabled(&container_dir, args.gpu).context("updating GPU access")?;
    }
    if let Some(form) = args.links {
        let changed = store::set_link_mode(&guard, &container_dir, form.into(), args.force)
            .context("converting links")?;
        tracing::info!(%id, changed, "links rewritten");
    }

    summarize(&id, &container_dir, modes.get());
    Ok(())
}

fn summarize(id: &ContainerId, container_dir: &Path, mode: ExecMode) {
    tracing::info!(%id, execmode = %mode, gpu = gpu::is_enabled(container_dir), "container settings");
}
