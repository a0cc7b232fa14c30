//! Syscall-emulation engine (`PRoot`, modes P1/P2).

use std::path::{Path, PathBuf};
use std::process::Command;

use burrow_common::constants::EMULATOR_NO_SECCOMP_ENV;
use burrow_common::error::Result;
use burrow_common::types::{RunOptions, VolumeBind};

use super::{ExecutionEngine, PreparedRun, RunContext, banner, cpu_affinity, select_executable};
use crate::error::RunError;
use crate::supervisor;

/// Emulator executables tried in order.
pub const EMULATOR_NAMES: [&str; 1] = ["proot"];

/// Runs containers under `PRoot` without any namespace support.
#[derive(Debug)]
pub struct EmulationEngine<'a> {
    ctx: RunContext<'a>,
}

impl<'a> EmulationEngine<'a> {
    /// Creates the engine for an opened container.
    #[must_use]
    pub const fn new(ctx: RunContext<'a>) -> Self {
        Self { ctx }
    }
}

impl ExecutionEngine for EmulationEngine<'_> {
    fn select_runtime(&mut self) -> Result<PathBuf> {
        let config = self.ctx.config;
        select_executable(&config.emulator, &EMULATOR_NAMES, &config.bin_dir())
    }

    fn run(&mut self, opts: &RunOptions) -> std::result::Result<i32, RunError> {
        let prepared = self.ctx.prepare(opts)?;
        let emulator = self.select_runtime().map_err(RunError::RuntimeNotFound)?;
        let ctx = &self.ctx;
        let config = ctx.config;

        let mut env = ctx.environment(opts, &prepared)?;
        if ctx.mode.disables_seccomp() || config.emulator_no_seccomp {
            env.set(EMULATOR_NO_SECCOMP_ENV, "1");
        }
        let system_files: Vec<PathBuf> = config.sysdirs.iter().filter(|f| f.is_file()).cloned().collect();
        let argv = emulator_argv(
            cpu_affinity(&config.cpu_affinity_tools, &opts.cpuset),
            &emulator,
            &ctx.container_root,
            &prepared,
            &opts.volumes,
            &system_files,
        );
        tracing::info!(id = %ctx.id, mode = %ctx.mode, cmd = ?argv, "starting emulator");
        let mut cmd = Command::new(&argv[0]);
        let _ = cmd.args(&argv[1..]).env_clear().envs(env.iter());
        banner(&ctx.id, &prepared.cmd[0], '#');
        supervisor::supervise(&mut cmd, None)
    }
}

/// Builds `[affinity…] proot [-0] -r <root> -w <cwd> -b <bind>… <cmd…>`.
#[must_use]
pub fn emulator_argv(
    affinity: Vec<String>,
    emulator: &Path,
    root: &Path,
    prepared: &PreparedRun,
    volumes: &[VolumeBind],
    system_files: &[PathBuf],
) -> Vec<String> {
    let mut argv = affinity;
    argv.push(emulator.to_string_lossy().into_owned());
    if matches!(prepared.user.as_str(), "" | "0" | "root") {
        argv.push("-0".to_owned());
    }
    argv.extend([
        "-r".to_owned(),
        root.to_string_lossy().into_owned(),
        "-w".to_owned(),
        prepared.cwd.clone(),
    ]);
    for volume in volumes {
        argv.push("-b".to_owned());
        argv.push(format!("{}:{}", volume.host.display(), volume.container.display()));
    }
    for file in system_files {
        argv.push("-b".to_owned());
        argv.push(file.to_string_lossy().into_owned());
    }
    argv.extend(prepared.cmd.iter().cloned());
    argv
}
