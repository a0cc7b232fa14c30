//! Namespace runtime engine (runc/crun, modes R1–R3).

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Command;

use burrow_common::constants::EMULATOR_NO_SECCOMP_ENV;
use burrow_common::error::Result;
use burrow_common::types::RunOptions;
use burrow_core::host::HostIdentity;

use super::{ExecutionEngine, RunContext, banner, cpu_affinity, select_executable};
use crate::error::RunError;
use crate::filebind::HostFileBind;
use crate::gpu;
use crate::spec::SpecBuilder;
use crate::spec::builder::ProcessSettings;
use crate::supervisor;

/// Runtime executables tried in order.
pub const RUNTIME_NAMES: [&str; 2] = ["runc", "crun"];

/// Runs containers through an OCI runtime in a rootless user namespace.
#[derive(Debug)]
pub struct NamespaceEngine<'a> {
    ctx: RunContext<'a>,
}

impl<'a> NamespaceEngine<'a> {
    /// Creates the engine for an opened container.
    #[must_use]
    pub const fn new(ctx: RunContext<'a>) -> Self {
        Self { ctx }
    }

    fn uid_check(user: &str) {
        if !matches!(user, "" | "0" | "root") {
            tracing::warn!(user, "this engine only supports execution as root");
        }
    }
}

impl ExecutionEngine for NamespaceEngine<'_> {
    fn select_runtime(&mut self) -> Result<PathBuf> {
        let config = self.ctx.config;
        select_executable(&config.runtime, &RUNTIME_NAMES, &config.bin_dir())
    }

    fn run(&mut self, opts: &RunOptions) -> std::result::Result<i32, RunError> {
        let prepared = self.ctx.prepare(opts)?;
        let ctx = &self.ctx;
        let config = ctx.config;

        let mut binding = HostFileBind::new(ctx.guard, &ctx.container_dir, &ctx.container_root, &config.tmpdir);
        binding.setup().map_err(RunError::Init)?;

        let runtime = self.select_runtime().map_err(RunError::RuntimeNotFound)?;
        let ctx = &self.ctx;
        let mut builder = SpecBuilder::load_or_create(ctx.guard, &runtime, &ctx.container_dir, true)
            .map_err(RunError::Spec)?;

        Self::uid_check(&prepared.user);
        let env = ctx.environment(opts, &prepared)?;

        builder.set_process(&ProcessSettings {
            root: ctx.container_root.clone(),
            readonly: opts.readonly,
            hostname: prepared.hostname.clone(),
            cwd: prepared.cwd.clone(),
            terminal: std::io::stdout().is_terminal(),
            env: env.to_vec(),
            args: prepared.cmd.clone(),
        });
        let me = HostIdentity::current();
        builder.set_id_mappings(me.uid, me.gid);
        if builder.drop_mqueue(config.no_mqueue, &config.mqueue_min_kernel) {
            tracing::debug!("mqueue mount removed");
        }
        builder
            .add_volume_bindings(&mut binding, &opts.volumes, &config.sysdirs, &config.mountpoint_prefixes)
            .map_err(RunError::Init)?;
        let gpu_devices = if gpu::is_enabled(&ctx.container_dir) {
            gpu::devices()
        } else {
            Vec::new()
        };
        let _ = builder.add_devices(&opts.devices, &gpu_devices, me);
        builder.add_capabilities(&config.runtime_capabilities);
        let _ = builder.set_shm_size(&config.shm_size);
        if ctx.mode.overlays_emulator() {
            let emulator = select_executable(&config.emulator, &super::emulation::EMULATOR_NAMES, &config.bin_dir())
                .map_err(RunError::RuntimeNotFound)?;
            let no_seccomp = config.emulator_no_seccomp || std::env::var_os(EMULATOR_NO_SECCOMP_ENV).is_some();
            builder
                .emulator_overlay(&mut binding, &emulator, ctx.mode, no_seccomp)
                .map_err(RunError::Init)?;
        }
        builder.persist().map_err(RunError::Spec)?;

        let debug = tracing::enabled!(tracing::Level::DEBUG);
        if debug {
            match builder.dump() {
                Ok(json) => tracing::debug!(spec = %json, "execution spec"),
                Err(e) => tracing::debug!(error = %e, "execution spec not printable"),
            }
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let argv = runtime_argv(
            cpu_affinity(&config.cpu_affinity_tools, &opts.cpuset),
            &runtime,
            &ctx.container_dir,
            &execution_id,
            debug,
        );
        tracing::info!(id = %ctx.id, mode = %ctx.mode, cmd = ?argv, "starting runtime");
        let mut cmd = Command::new(&argv[0]);
        let _ = cmd.args(&argv[1..]);
        banner(&ctx.id, &prepared.cmd[0], '%');
        supervisor::supervise(&mut cmd, Some(&mut binding))
    }
}

/// Builds `[affinity…] runtime [--debug] --root <bundle> run --bundle <bundle> <id>`.
#[must_use]
pub fn runtime_argv(
    affinity: Vec<String>,
    runtime: &Path,
    bundle: &Path,
    execution_id: &str,
    debug: bool,
) -> Vec<String> {
    let bundle = bundle.to_string_lossy().into_owned();
    let mut argv = affinity;
    argv.push(runtime.to_string_lossy().into_owned());
    if debug {
        argv.push("--debug".to_owned());
    }
    argv.extend([
        "--root".to_owned(),
        bundle.clone(),
        "run".to_owned(),
        "--bundle".to_owned(),
        bundle,
        execution_id.to_owned(),
    ]);
    argv
}
