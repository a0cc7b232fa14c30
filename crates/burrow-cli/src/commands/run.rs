//! `burrow run` — Run a command inside a container.

use anyhow::Context;
use burrow_common::config::BurrowConfig;
use burrow_common::types::{ContainerId, DeviceRequest, RunOptions, VolumeBind};
use burrow_core::guard::SafePrefixSet;
use burrow_runtime::engine::{RunContext, engine_for};
use burrow_runtime::error::RunError;
use burrow_runtime::store::{ContainerStore, ExecModeStore};
use clap::Args;

/// Arguments for the `run` command.
#[allow(clippy::struct_excessive_bools)]
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container to run.
    pub container: String,

    /// Command and arguments; defaults to the image command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,

    /// Bind a host path into the container.
    #[arg(short = 'v', long = "volume", value_name = "HOST[:CONT]")]
    pub volumes: Vec<VolumeBind>,

    /// Expose a host device node.
    #[arg(long = "device", value_name = "HOST[:CONT][:MODE]")]
    pub devices: Vec<DeviceRequest>,

    /// Set an environment variable; a bare name copies the host value.
    #[arg(short = 'e', long = "env", value_name = "KEY[=VALUE]")]
    pub env: Vec<String>,

    /// Start from the host environment.
    #[arg(long)]
    pub hostenv: bool,

    /// Container hostname.
    #[arg(long, default_value = "")]
    pub hostname: String,

    /// Working directory inside the container.
    #[arg(short = 'w', long, default_value = "")]
    pub workdir: String,

    /// User inside the container.
    #[arg(short = 'u', long, default_value = "")]
    pub user: String,

    /// CPUs the container may run on.
    #[arg(long = "cpuset-cpus", default_value = "")]
    pub cpuset: String,

    /// Mount the container root read-only.
    #[arg(long)]
    pub readonly: bool,

    /// Publish a port (not supported, warned about).
    #[arg(short = 'p', long = "publish")]
    pub ports: Vec<String>,

    /// Publish all ports (not supported, warned about).
    #[arg(short = 'P', long = "publish-all")]
    pub netcoop: bool,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        Self {
            cmd: args.cmd,
            env: args.env,
            hostenv: args.hostenv,
            volumes: args.volumes,
            devices: args.devices,
            hostname: args.hostname,
            cwd: args.workdir,
            user: args.user,
            cpuset: args.cpuset,
            readonly: args.readonly,
            ports: args.ports,
            netcoop: args.netcoop,
        }
    }
}

/// Executes the `run` command and returns the container's exit status.
///
/// Failures of a run stage are reported and mapped to their exit code;
/// only errors before the run starts surface as `Err`.
///
/// # Errors
///
/// Returns an error if the container ID is invalid or the container cannot
/// be opened.
pub fn execute(config: &BurrowConfig, args: RunArgs) -> anyhow::Result<i32> {
    let id = ContainerId::parse(args.container.as_str())?;
    let guard = SafePrefixSet::new();
    let container_dir = ContainerStore::new(config).container_dir(&id)?;
    let mode = ExecModeStore::new(&guard, &container_dir, config.default_execmode).get();

    let ctx = RunContext::open(config, &guard, id, mode).context("opening container")?;
    let mut engine = engine_for(ctx);
    let opts = RunOptions::from(args);
    Ok(engine.run(&opts).unwrap_or_else(|e| report(&e)))
}

fn report(error: &RunError) -> i32 {
    let code = error.exit_code();
    tracing::error!(code, "{error}");
    code
}
